//! Coordinator control protocol handler.
//!
//! Handles unary messages from coordinators: batch piece deletion, retain
//! (bloom-filter garbage collection), and trash restoration. One JSON
//! message per stream in each direction.
//!
//! Authorization is by transport identity: the remote peer's key must be in
//! the trust set. There are no order limits on this protocol; a coordinator
//! speaks for itself.

use crate::error::RpcError;
use crate::p2p::LiveRequestGuard;
use crate::retain::{RetainRequest, RetainStatus};
use crate::state::AppState;
use common::bloom::BloomFilter;
use common::frames::send_response;
use common::{CoordinatorControlMessage, MAX_COORDINATOR_MESSAGE_SIZE};
use iroh::endpoint::{Connection, SendStream};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Protocol handler for the `pebble/coordinator-control` ALPN.
pub struct CoordinatorControlHandler {
    state: Arc<AppState>,
}

impl CoordinatorControlHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        CoordinatorControlHandler { state }
    }
}

impl std::fmt::Debug for CoordinatorControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorControlHandler").finish()
    }
}

impl iroh::protocol::ProtocolHandler for CoordinatorControlHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl futures::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let state = self.state.clone();
        async move {
            handle_coordinator_control(conn, state)
                .await
                .map_err(|e| iroh::protocol::AcceptError::from_err(std::io::Error::other(e)))
        }
    }
}

/// Accept streams on one connection; each stream is a single request.
async fn handle_coordinator_control(conn: Connection, state: Arc<AppState>) -> anyhow::Result<()> {
    let remote = conn.remote_id();
    debug!(remote = %remote, "Coordinator control connection accepted");

    loop {
        let (mut send, mut recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!(remote = %remote, error = %e, "Coordinator connection closed");
                break;
            }
        };

        let buf = match tokio::time::timeout(
            state.config.stream_timeout(),
            recv.read_to_end(MAX_COORDINATOR_MESSAGE_SIZE),
        )
        .await
        {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                debug!(remote = %remote, error = %e, "Failed to read coordinator message");
                continue;
            }
            Err(_) => {
                warn!(remote = %remote, "Coordinator message read timed out");
                continue;
            }
        };

        if let Err(e) = handle_single_message(&mut send, &buf, &remote, &state).await {
            warn!(remote = %remote, error = %e, "Error handling coordinator message");
        }
    }

    Ok(())
}

async fn handle_single_message(
    send: &mut SendStream,
    buf: &[u8],
    remote: &iroh::PublicKey,
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    let _guard = LiveRequestGuard::enter(state.clone());

    let message: CoordinatorControlMessage = match serde_json::from_slice(buf) {
        Ok(message) => message,
        Err(e) => {
            let error = RpcError::invalid_argument(format!("malformed message: {}", e));
            return respond(send, &CoordinatorControlMessage::Error(error.to_remote())).await;
        }
    };

    // Transport identity is the authorization here: only trusted
    // coordinators may direct deletion or garbage collection.
    if !state.trust.is_trusted(remote) {
        let error = RpcError::permission_denied(format!("called with untrusted ID {}", remote));
        warn!(remote = %remote, "Coordinator operation rejected: untrusted");
        return respond(send, &CoordinatorControlMessage::Error(error.to_remote())).await;
    }

    match message {
        CoordinatorControlMessage::DeletePieces { piece_ids } => {
            handle_delete_pieces(send, remote, piece_ids, state).await
        }
        CoordinatorControlMessage::Retain {
            created_before,
            filter,
        } => handle_retain(send, remote, created_before, &filter, state).await,
        CoordinatorControlMessage::RestoreTrash => handle_restore_trash(send, remote, state).await,
        CoordinatorControlMessage::DeletePiecesResponse { .. }
        | CoordinatorControlMessage::Ack { .. }
        | CoordinatorControlMessage::Error(_) => {
            warn!(remote = %remote, "Received unexpected response message from coordinator");
            let error = RpcError::invalid_argument("expected a request message");
            respond(send, &CoordinatorControlMessage::Error(error.to_remote())).await
        }
    }
}

async fn handle_delete_pieces(
    send: &mut SendStream,
    remote: &iroh::PublicKey,
    piece_ids: Vec<common::PieceId>,
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    let requested = piece_ids.len();
    let unhandled = state.deleter.enqueue(*remote, piece_ids);
    if unhandled > 0 {
        state.metrics.delete_queue_dropped.inc_by(unhandled);
        warn!(remote = %remote, requested, unhandled, "Delete queue full, dropping entries");
    } else {
        debug!(remote = %remote, requested, "Queued pieces for deletion");
    }
    respond(
        send,
        &CoordinatorControlMessage::DeletePiecesResponse {
            unhandled_count: unhandled,
        },
    )
    .await
}

async fn handle_retain(
    send: &mut SendStream,
    remote: &iroh::PublicKey,
    created_before: u64,
    filter_bytes: &[u8],
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    if state.retain.status() == RetainStatus::Disabled {
        return respond(
            send,
            &CoordinatorControlMessage::Ack {
                success: true,
                message: Some("retain disabled".to_string()),
            },
        )
        .await;
    }

    let filter = match BloomFilter::from_bytes(filter_bytes) {
        Ok(filter) => filter,
        Err(e) => {
            let error = RpcError::invalid_argument(format!("bad bloom filter: {}", e));
            return respond(send, &CoordinatorControlMessage::Error(error.to_remote())).await;
        }
    };

    // Absorb coordinator clock skew: only pieces comfortably older than the
    // claimed cutoff are candidates.
    let created_before =
        created_before.saturating_sub(state.config.retain_time_buffer_secs);

    let queued = state.retain.queue(RetainRequest {
        coordinator: *remote,
        created_before,
        filter,
    });
    if !queued {
        debug!(coordinator = %remote, "Retain job not queued");
    } else {
        info!(coordinator = %remote, created_before, "Retain job queued");
    }

    // Queue-full and duplicate are not the coordinator's problem; it will
    // send a fresh filter next cycle anyway
    respond(
        send,
        &CoordinatorControlMessage::Ack {
            success: true,
            message: None,
        },
    )
    .await
}

async fn handle_restore_trash(
    send: &mut SendStream,
    remote: &iroh::PublicKey,
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    match state.store.restore_trash(remote) {
        Ok((restored, bytes)) => {
            state.monitor.add_used(bytes);
            info!(coordinator = %remote, restored, bytes, "Restored trash");
            respond(
                send,
                &CoordinatorControlMessage::Ack {
                    success: true,
                    message: Some(format!("restored {} pieces", restored)),
                },
            )
            .await
        }
        Err(e) => {
            warn!(coordinator = %remote, error = %e, "Restore trash failed");
            let error = RpcError::internal(e.to_string());
            respond(send, &CoordinatorControlMessage::Error(error.to_remote())).await
        }
    }
}

async fn respond(
    send: &mut SendStream,
    message: &CoordinatorControlMessage,
) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(message)?;
    send_response(send, &bytes).await?;
    Ok(())
}
