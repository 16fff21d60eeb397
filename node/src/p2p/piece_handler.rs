//! Uplink piece operations: upload, download, and single-piece delete.
//!
//! Each operation is one bidirectional QUIC stream. The first frame selects
//! the operation and carries its order limit; the rest of the stream follows
//! that operation's state machine.
//!
//! Two guarantees shape the control flow here:
//! - the largest verified order of a session is persisted on every exit
//!   path, including cancellation, so bandwidth can always be settled;
//! - the piece writer is either committed or canceled, never leaked, so a
//!   torn upload can never become a visible piece.

use crate::error::{HandlerError, RpcError};
use crate::p2p::{LiveRequestGuard, with_timeout};
use crate::pieces::StoreError;
use crate::state::AppState;
use crate::throttle::Throttle;
use crate::verification::{verify_order, verify_order_limit, verify_piece_hash};
use common::frames::{
    finish_stream, read_data, read_frame, write_frame, write_frame_with_data,
};
use common::{
    DeleteResponse, DownloadResponse, MAX_CHUNK_SIZE, MAX_CONTROL_FRAME_SIZE, Order, OrderLimit,
    PieceAction, PieceHash, PieceHeader, PieceRequest, UploadFrame, UploadResponse, now_secs,
};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

use crate::constants::MAX_CONCURRENT_STREAM_HANDLERS;
use crate::metrics::Outcome;

/// Protocol handler for the `pebble/piece-store` ALPN.
pub struct PieceStoreHandler {
    state: Arc<AppState>,
    stream_limiter: Arc<Semaphore>,
}

impl PieceStoreHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        PieceStoreHandler {
            state,
            stream_limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_STREAM_HANDLERS)),
        }
    }
}

impl std::fmt::Debug for PieceStoreHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStoreHandler").finish()
    }
}

impl iroh::protocol::ProtocolHandler for PieceStoreHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl futures::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let state = self.state.clone();
        let limiter = self.stream_limiter.clone();
        async move {
            handle_piece_store(conn, state, limiter)
                .await
                .map_err(|e| iroh::protocol::AcceptError::from_err(std::io::Error::other(e)))
        }
    }
}

/// Accept streams on one connection, spawning a task per stream so an uplink
/// can multiplex transfers over a single connection.
async fn handle_piece_store(
    conn: Connection,
    state: Arc<AppState>,
    limiter: Arc<Semaphore>,
) -> anyhow::Result<()> {
    let remote = conn.remote_id();
    trace!(remote = %remote, "Accepted piece-store connection");

    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                trace!(remote = %remote, error = %e, "Piece-store connection closed");
                break;
            }
        };

        // Backpressure: bound concurrent handlers so a connection flood
        // cannot spawn unbounded tasks
        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(remote = %remote, limit = MAX_CONCURRENT_STREAM_HANDLERS, "Stream handler limit reached, dropping stream");
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_piece_stream(send, recv, state).await {
                debug!(remote = %remote, error = %e, "Piece stream handler error");
            }
        });
    }

    Ok(())
}

async fn handle_piece_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    state: Arc<AppState>,
) -> anyhow::Result<()> {
    let guard = LiveRequestGuard::enter(state.clone());
    let timeout = state.config.stream_timeout();

    let request = match with_timeout(
        timeout,
        read_frame::<PieceRequest>(&mut recv, MAX_CONTROL_FRAME_SIZE),
    )
    .await
    {
        Ok(Ok(request)) => request,
        // Opened and closed without a request: nothing to answer
        Ok(Err(e)) if e.is_peer_gone() => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
        Err(timed_out) => return Err(anyhow::anyhow!(timed_out)),
    };

    match request {
        PieceRequest::Upload { limit } => {
            handle_upload(&mut send, &mut recv, limit, guard.entered_at, &state).await;
        }
        PieceRequest::Download {
            limit,
            offset,
            length,
        } => {
            handle_download(&mut send, &mut recv, limit, offset, length, &state).await;
        }
        PieceRequest::Delete { limit } => {
            handle_delete(&mut send, limit, &state).await;
        }
    }
    Ok(())
}

// ============================================================================
// Upload
// ============================================================================

async fn handle_upload(
    send: &mut SendStream,
    recv: &mut RecvStream,
    limit: OrderLimit,
    live_requests: i32,
    state: &Arc<AppState>,
) {
    let started = Instant::now();
    let mut uploaded: u64 = 0;
    let result = upload(send, recv, &limit, live_requests, state, &mut uploaded).await;

    match result {
        Ok(()) => {
            state
                .metrics
                .record_op("upload", Outcome::Ok, uploaded, started);
            info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, size = uploaded, "uploaded");
        }
        Err(HandlerError::Canceled) => {
            state
                .metrics
                .record_op("upload", Outcome::Canceled, uploaded, started);
            info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, "upload canceled");
        }
        Err(HandlerError::Status(e)) => {
            state
                .metrics
                .record_op("upload", Outcome::Failed, uploaded, started);
            error!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, error = %e, "upload failed");
            let _ = with_timeout(
                state.config.stream_timeout(),
                write_frame(send, &UploadResponse::Error(e.to_remote())),
            )
            .await;
            let _ = finish_stream(send).await;
        }
    }
}

async fn upload(
    send: &mut SendStream,
    recv: &mut RecvStream,
    limit: &OrderLimit,
    live_requests: i32,
    state: &Arc<AppState>,
    uploaded: &mut u64,
) -> Result<(), HandlerError> {
    let config = &state.config;
    if config.max_concurrent_requests > 0 && live_requests > config.max_concurrent_requests as i32 {
        error!(
            live_requests,
            request_limit = config.max_concurrent_requests,
            "upload rejected, too many requests"
        );
        return Err(RpcError::unavailable(format!(
            "storage node overloaded, request limit: {}",
            config.max_concurrent_requests
        ))
        .into());
    }

    if !limit.action.is_put() {
        return Err(RpcError::invalid_argument(format!(
            "expected put or put repair action got {}",
            limit.action
        ))
        .into());
    }

    verify_order_limit(state, limit, now_secs()).map_err(|e| {
        state.metrics.orderlimit_failures.inc();
        e
    })?;

    let mut available_space = state
        .monitor
        .available_space()
        .map_err(|e| RpcError::internal(e.to_string()))?
        .min(i64::MAX as u64) as i64;

    let mut writer: Option<crate::pieces::PieceWriter> = None;
    let mut largest_order: Option<Order> = None;
    let mut order_saved = false;

    let result = upload_session(
        send,
        recv,
        limit,
        state,
        &mut writer,
        &mut largest_order,
        &mut order_saved,
        &mut available_space,
        uploaded,
    )
    .await;

    // Deferred work that must run on every exit path, success or not:
    // persist the order so bandwidth can be settled, cancel the writer if it
    // was not committed, and report capacity if this upload ate the margin.
    if !order_saved {
        state.save_order(limit, largest_order.as_ref());
    }
    if let Some(writer) = writer.take() {
        writer.cancel();
    }
    if available_space < config.report_capacity_threshold_bytes as i64 {
        state.monitor.notify_low_disk();
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn upload_session(
    send: &mut SendStream,
    recv: &mut RecvStream,
    limit: &OrderLimit,
    state: &Arc<AppState>,
    writer: &mut Option<crate::pieces::PieceWriter>,
    largest_order: &mut Option<Order>,
    order_saved: &mut bool,
    available_space: &mut i64,
    uploaded: &mut u64,
) -> Result<(), HandlerError> {
    let timeout = state.config.stream_timeout();

    // Double-check that the disk itself can hold the full authorized size
    let status = state
        .store
        .storage_status()
        .map_err(|e| RpcError::internal(e.to_string()))?;
    if status.disk_free < limit.byte_limit {
        return Err(RpcError::aborted(format!(
            "not enough available disk space, have: {}, need: {}",
            status.disk_free, limit.byte_limit
        ))
        .into());
    }

    info!(
        piece = %limit.piece_id,
        coordinator = %limit.coordinator_id,
        action = %limit.action,
        available_space = *available_space,
        "upload started"
    );

    *writer = Some(
        state
            .store
            .writer(&limit.coordinator_id, &limit.piece_id)
            .map_err(|e| RpcError::internal(e.to_string()))?,
    );

    loop {
        let frame = with_timeout(
            timeout,
            read_frame::<UploadFrame>(recv, MAX_CONTROL_FRAME_SIZE),
        )
        .await?
        .map_err(HandlerError::from_upload_frame)?;

        match frame {
            UploadFrame::Order(order) => {
                let prev = largest_order.as_ref().map(|o| o.amount).unwrap_or(0);
                verify_order(limit, &order, prev)?;
                *largest_order = Some(order);
            }

            UploadFrame::Chunk { offset, len } => {
                if len as usize > MAX_CHUNK_SIZE {
                    return Err(RpcError::invalid_argument(format!(
                        "chunk of {} bytes exceeds limit of {}",
                        len, MAX_CHUNK_SIZE
                    ))
                    .into());
                }
                let data = with_timeout(timeout, read_data(recv, len as usize))
                    .await?
                    .map_err(HandlerError::from_upload_frame)?;

                let writer = writer
                    .as_mut()
                    .ok_or_else(|| RpcError::internal("piece writer already closed"))?;

                if offset != writer.size() {
                    return Err(RpcError::invalid_argument("chunk out of order").into());
                }

                let allocated = largest_order.as_ref().map(|o| o.amount).unwrap_or(0);
                let writing = writer.size() + data.len() as u64;
                if allocated < writing {
                    return Err(RpcError::invalid_argument(format!(
                        "not enough allocated, allocated={} writing={}",
                        allocated, writing
                    ))
                    .into());
                }

                *available_space -= data.len() as i64;
                if *available_space < 0 {
                    return Err(RpcError::internal("out of space").into());
                }

                writer
                    .write(&data)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                *uploaded = writer.size();
            }

            UploadFrame::Done(done) => {
                // Take the writer: from here it is committed or dropped
                // (drop cancels), never both.
                let writer = writer
                    .take()
                    .ok_or_else(|| RpcError::internal("piece writer already closed"))?;
                let computed = writer.hash();
                verify_piece_hash(limit, &done, &computed)?;
                if done.piece_size != writer.size() {
                    return Err(RpcError::invalid_argument(format!(
                        "size of finished piece does not match size declared by uplink: {} != {}",
                        done.piece_size,
                        writer.size()
                    ))
                    .into());
                }

                let piece_size = writer.size();
                let header = PieceHeader {
                    hash: computed,
                    creation_time: done.timestamp,
                    uplink_signature: done.signature.clone(),
                    order_limit: limit.clone(),
                };
                writer
                    .commit(&header)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                state.monitor.add_used(piece_size);

                if limit.piece_expiration != 0 {
                    state
                        .store
                        .set_expiration(&limit.coordinator_id, &limit.piece_id, limit.piece_expiration)
                        .map_err(|e| RpcError::internal(e.to_string()))?;
                }

                let receipt = PieceHash {
                    piece_id: limit.piece_id,
                    hash: computed,
                    piece_size,
                    timestamp: now_secs(),
                    signature: Vec::new(),
                }
                .signed(&state.signer);

                // Save before answering so the deferred save does not
                // double-write
                *order_saved = true;
                state.save_order(limit, largest_order.as_ref());

                match with_timeout(timeout, write_frame(send, &UploadResponse::Done { receipt }))
                    .await?
                {
                    Ok(()) => {}
                    // The piece is durable and the order saved; a receipt
                    // lost to a closing peer does not fail the upload
                    Err(e) if e.is_peer_gone() => return Ok(()),
                    Err(e) => return Err(RpcError::internal(e.to_string()).into()),
                }
                let _ = finish_stream(send).await;
                return Ok(());
            }
        }
    }
}

// ============================================================================
// Download
// ============================================================================

async fn handle_download(
    send: &mut SendStream,
    recv: &mut RecvStream,
    limit: OrderLimit,
    offset: u64,
    length: u64,
    state: &Arc<AppState>,
) {
    let started = Instant::now();
    let mut downloaded: u64 = 0;
    let result = download(send, recv, &limit, offset, length, state, &mut downloaded).await;

    match result {
        Ok(()) => {
            // A clean end with bytes still unsent means the uplink walked
            // away satisfied early or hung up; that is a cancellation, not
            // a served download.
            if downloaded == length {
                state
                    .metrics
                    .record_op("download", Outcome::Ok, downloaded, started);
                info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, size = downloaded, "downloaded");
            } else {
                state
                    .metrics
                    .record_op("download", Outcome::Canceled, downloaded, started);
                info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, sent = downloaded, requested = length, "download canceled");
            }
        }
        Err(HandlerError::Canceled) => {
            state
                .metrics
                .record_op("download", Outcome::Canceled, downloaded, started);
            info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, "download canceled");
        }
        Err(HandlerError::Status(e)) => {
            state
                .metrics
                .record_op("download", Outcome::Failed, downloaded, started);
            error!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, error = %e, "download failed");
            let _ = with_timeout(
                state.config.stream_timeout(),
                write_frame(send, &DownloadResponse::Error(e.to_remote())),
            )
            .await;
            let _ = finish_stream(send).await;
        }
    }
}

async fn download(
    send: &mut SendStream,
    recv: &mut RecvStream,
    limit: &OrderLimit,
    offset: u64,
    length: u64,
    state: &Arc<AppState>,
    downloaded: &mut u64,
) -> Result<(), HandlerError> {
    let timeout = state.config.stream_timeout();

    if !limit.action.is_get() {
        return Err(RpcError::invalid_argument(format!(
            "expected get or get repair or audit action got {}",
            limit.action
        ))
        .into());
    }
    if length > limit.byte_limit {
        return Err(RpcError::invalid_argument(format!(
            "requested more than order limit allows, limit={} requested={}",
            limit.byte_limit, length
        ))
        .into());
    }

    verify_order_limit(state, limit, now_secs()).map_err(|e| {
        state.metrics.orderlimit_failures.inc();
        e
    })?;

    info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, action = %limit.action, "download started");

    let mut reader = match state.store.reader(&limit.coordinator_id, &limit.piece_id) {
        Ok(reader) => reader,
        Err(StoreError::NotFound) => {
            return Err(RpcError::not_found(format!("piece {} not found", limit.piece_id)).into());
        }
        Err(e) => return Err(RpcError::internal(e.to_string()).into()),
    };

    // Repair workers get the stored header hash and original limit first so
    // they can validate the piece against the coordinator's records
    if limit.action == PieceAction::GetRepair {
        let header = reader.header().clone();
        let stored_hash = PieceHash {
            piece_id: limit.piece_id,
            hash: header.hash,
            piece_size: reader.size(),
            timestamp: header.creation_time,
            signature: header.uplink_signature.clone(),
        };
        with_timeout(
            timeout,
            write_frame(
                send,
                &DownloadResponse::Repair {
                    hash: stored_hash,
                    limit: header.order_limit,
                },
            ),
        )
        .await?
        .map_err(HandlerError::from_frame)?;
    }

    if offset.saturating_add(length) > reader.size() {
        return Err(RpcError::invalid_argument(format!(
            "requested more data than available, requesting={} available={}",
            offset + length,
            reader.size()
        ))
        .into());
    }

    let throttle = Throttle::new();

    // Send half: push chunks as the throttle grants tokens
    let send_half = async {
        let mut current = offset;
        let mut unsent = length;
        while unsent > 0 {
            let want = unsent.min(MAX_CHUNK_SIZE as u64);
            let granted = match throttle.consume_or_wait(want).await {
                Ok(granted) => granted,
                // Receive half failed the throttle: uplink is done
                Err(_) => return Ok(()),
            };

            let data = reader
                .read_at(current, granted as usize)
                .map_err(|e| HandlerError::Status(RpcError::internal(e.to_string())))?;

            match with_timeout(
                timeout,
                write_frame_with_data(
                    send,
                    &DownloadResponse::Chunk {
                        offset: current,
                        len: granted as u32,
                    },
                    &data,
                ),
            )
            .await
            {
                Ok(Ok(())) => {}
                // Uplink asked for the piece but stopped reading; no need
                // to propagate
                Ok(Err(e)) if e.is_peer_gone() => return Ok(()),
                Ok(Err(e)) => {
                    return Err(HandlerError::Status(RpcError::internal(e.to_string())));
                }
                Err(timed_out) => return Err(HandlerError::Status(timed_out)),
            }

            current += granted;
            unsent -= granted;
            *downloaded += granted;
        }
        Ok(())
    };

    // Receive half: verify orders, feed the throttle, and always persist the
    // largest order on the way out
    let recv_half = async {
        let mut largest_order: Option<Order> = None;
        let result = loop {
            let order = match with_timeout(
                timeout,
                read_frame::<Order>(recv, MAX_CONTROL_FRAME_SIZE),
            )
            .await
            {
                Ok(Ok(order)) => order,
                // Uplink closed the stream: normal end of a download
                Ok(Err(e)) if e.is_peer_gone() => break Ok(()),
                Ok(Err(e)) => {
                    break Err(HandlerError::Status(RpcError::invalid_argument(
                        e.to_string(),
                    )));
                }
                Err(timed_out) => break Err(HandlerError::Status(timed_out)),
            };

            let prev = largest_order.as_ref().map(|o| o.amount).unwrap_or(0);
            if let Err(e) = verify_order(limit, &order, prev) {
                break Err(e.into());
            }
            let delta = order.amount - prev;
            if throttle.produce(delta).is_err() {
                // Only this task fails the throttle, so this cannot happen
                break Err(HandlerError::Status(RpcError::internal(
                    "throttle closed unexpectedly",
                )));
            }
            largest_order = Some(order);
        };

        // Terminate the send half, then persist bandwidth
        throttle.fail();
        state.save_order(limit, largest_order.as_ref());
        result
    };

    let (send_result, recv_result) = tokio::join!(send_half, recv_half);
    let _ = finish_stream(send).await;
    send_result.and(recv_result)
}

// ============================================================================
// Delete (deprecated single-piece)
// ============================================================================

async fn handle_delete(send: &mut SendStream, limit: OrderLimit, state: &Arc<AppState>) {
    let started = Instant::now();
    let result = delete_piece(&limit, state).await;

    match result {
        Ok(()) => {
            state.metrics.record_op("delete", Outcome::Ok, 0, started);
            let _ = with_timeout(
                state.config.stream_timeout(),
                write_frame(send, &DeleteResponse::Done),
            )
            .await;
        }
        Err(e) => {
            state.metrics.record_op("delete", Outcome::Failed, 0, started);
            error!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, error = %e, "delete failed");
            let _ = with_timeout(
                state.config.stream_timeout(),
                write_frame(send, &DeleteResponse::Error(e.to_remote())),
            )
            .await;
        }
    }
    let _ = finish_stream(send).await;
}

async fn delete_piece(limit: &OrderLimit, state: &Arc<AppState>) -> Result<(), RpcError> {
    if limit.action != PieceAction::Delete {
        return Err(RpcError::invalid_argument(format!(
            "expected delete action got {}",
            limit.action
        )));
    }

    verify_order_limit(state, limit, now_secs())
        .map_err(|e| RpcError::unauthenticated(e.message))?;

    match state.store.delete(&limit.coordinator_id, &limit.piece_id) {
        Ok(freed) => {
            state.monitor.sub_used(freed);
            info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, "deleted");
        }
        Err(StoreError::NotFound) => {
            // Garbage collection may have beaten the uplink to it; still a
            // successful outcome for the caller
            info!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, "delete failed: piece not found");
        }
        Err(e) => {
            error!(piece = %limit.piece_id, coordinator = %limit.coordinator_id, error = %e, "delete failed");
        }
    }
    Ok(())
}
