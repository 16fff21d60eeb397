//! Download flow-control throttle.
//!
//! A single-producer/single-consumer token bucket coupling order arrival to
//! send-side progress. The receive half of a download `produce`s the delta of
//! each verified order; the send half `consume_or_wait`s before emitting a
//! chunk. `fail` wakes the consumer so the sender exits cleanly when the
//! uplink stops sending orders.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// The producer failed the throttle; no more tokens will ever arrive.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("throttle closed")]
pub struct ThrottleClosed;

#[derive(Debug, Default)]
struct Inner {
    available: u64,
    failed: bool,
}

#[derive(Debug, Default)]
pub struct Throttle {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` tokens. A zero amount (an order equal to the previous
    /// one) is accepted and wakes nobody.
    pub fn produce(&self, amount: u64) -> Result<(), ThrottleClosed> {
        let mut inner = self.inner.lock();
        if inner.failed {
            return Err(ThrottleClosed);
        }
        if amount == 0 {
            return Ok(());
        }
        inner.available = inner.available.saturating_add(amount);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wake all waiters with failure. Idempotent.
    pub fn fail(&self) {
        self.inner.lock().failed = true;
        self.notify.notify_waiters();
    }

    /// Take up to `max` tokens, waiting until at least one is available.
    ///
    /// Returns gracefully with [`ThrottleClosed`] after [`Throttle::fail`],
    /// once any already-granted tokens are drained.
    pub async fn consume_or_wait(&self, max: u64) -> Result<u64, ThrottleClosed> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a produce/fail
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.available > 0 {
                    let take = inner.available.min(max);
                    inner.available -= take;
                    return Ok(take);
                }
                if inner.failed {
                    return Err(ThrottleClosed);
                }
            }

            notified.await;
        }
    }
}
