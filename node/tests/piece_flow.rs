//! End-to-end piece flow over in-process Iroh endpoints.
//!
//! Spins up a storage node with real collaborators on temp directories, then
//! drives uploads, downloads, and coordinator control operations from client
//! endpoints exactly the way uplinks and coordinators do on the wire.

use common::frames::{FrameError, read_data, read_frame, write_frame, write_frame_with_data};
use common::{
    COORDINATOR_CONTROL_ALPN, CoordinatorControlMessage, DownloadResponse, MAX_CONTROL_FRAME_SIZE,
    Order, OrderLimit, PIECE_STORE_ALPN, PieceAction, PieceHash, PieceId, PieceRequest,
    SerialNumber, StatusCode, UploadFrame, UploadResponse, now_secs,
};
use ed25519_dalek::SigningKey;
use node::config::PieceStoreConfig;
use node::deleter::Deleter;
use node::metrics::Metrics;
use node::monitor::SpaceMonitor;
use node::orders::OrdersDb;
use node::p2p::{CoordinatorControlHandler, PieceStoreHandler};
use node::pieces::PieceStore;
use node::ping_stats::PingStats;
use node::retain::{RetainService, RetainStatus};
use node::state::AppState;
use node::trust::TrustSet;
use node::used_serials::UsedSerials;
use std::sync::Arc;
use std::sync::atomic::AtomicI32;

const COORDINATOR_SEED: [u8; 32] = [1u8; 32];
const UPLINK_SEED: [u8; 32] = [2u8; 32];
const NODE_SEED: [u8; 32] = [3u8; 32];

struct TestCluster {
    state: Arc<AppState>,
    server_addr: iroh::EndpointAddr,
    uplink: iroh::Endpoint,
    coordinator: iroh::Endpoint,
    coordinator_key: SigningKey,
    uplink_key: SigningKey,
    _router: iroh::protocol::Router,
    _dir: tempfile::TempDir,
}

fn public(key: &SigningKey) -> iroh::PublicKey {
    iroh::PublicKey::from_bytes(&key.verifying_key().to_bytes()).unwrap()
}

async fn bind_endpoint(secret: iroh::SecretKey) -> iroh::Endpoint {
    iroh::Endpoint::builder()
        .secret_key(secret)
        .relay_mode(iroh::endpoint::RelayMode::Disabled)
        .bind_addr(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::LOCALHOST,
            0,
        ))
        .expect("valid bind addr")
        .bind()
        .await
        .expect("bind endpoint")
}

async fn setup() -> TestCluster {
    let dir = tempfile::tempdir().unwrap();
    let coordinator_key = SigningKey::from_bytes(&COORDINATOR_SEED);
    let uplink_key = SigningKey::from_bytes(&UPLINK_SEED);
    let node_secret = iroh::SecretKey::from_bytes(&NODE_SEED);
    let node_signer = SigningKey::from_bytes(&NODE_SEED);

    let config = PieceStoreConfig::default();
    let store = Arc::new(
        PieceStore::open(dir.path().join("store"), &dir.path().join("exp.redb")).unwrap(),
    );
    let orders = Arc::new(OrdersDb::open(&dir.path().join("orders.redb")).unwrap());
    let monitor = Arc::new(SpaceMonitor::new(u64::MAX, dir.path(), &store));
    let metrics = Metrics::new();
    let deleter = Deleter::new(store.clone(), monitor.clone(), metrics.clone(), 1, 100);
    let retain = RetainService::new(RetainStatus::Enabled);
    tokio::spawn(
        retain
            .clone()
            .run(store.clone(), monitor.clone(), metrics.clone()),
    );

    let state = Arc::new(AppState {
        node_id: node_secret.public(),
        signer: node_signer,
        trust: TrustSet::new(vec![public(&coordinator_key)]),
        store,
        orders,
        monitor,
        deleter,
        retain,
        used_serials: UsedSerials::new(config.max_used_serials_bytes),
        ping_stats: PingStats::new(),
        live_requests: AtomicI32::new(0),
        metrics,
        config,
    });

    let server = bind_endpoint(node_secret).await;
    let router = iroh::protocol::Router::builder(server.clone())
        .accept(PIECE_STORE_ALPN, PieceStoreHandler::new(state.clone()))
        .accept(
            COORDINATOR_CONTROL_ALPN,
            CoordinatorControlHandler::new(state.clone()),
        )
        .spawn();

    let socket = *server
        .bound_sockets()
        .first()
        .expect("server bound to a socket");
    let server_addr = iroh::EndpointAddr::new(server.secret_key().public())
        .with_addrs(vec![iroh::TransportAddr::Ip(socket)]);

    let uplink = bind_endpoint(iroh::SecretKey::from_bytes(&UPLINK_SEED)).await;
    let coordinator = bind_endpoint(iroh::SecretKey::from_bytes(&COORDINATOR_SEED)).await;

    TestCluster {
        state,
        server_addr,
        uplink,
        coordinator,
        coordinator_key,
        uplink_key,
        _router: router,
        _dir: dir,
    }
}

impl TestCluster {
    fn limit(&self, action: PieceAction, piece: [u8; 32], serial: [u8; 16]) -> OrderLimit {
        let now = now_secs();
        OrderLimit {
            coordinator_id: public(&self.coordinator_key),
            uplink_key: public(&self.uplink_key),
            node_id: self.state.node_id,
            piece_id: PieceId(piece),
            action,
            byte_limit: 8 * 1024 * 1024,
            serial: SerialNumber(serial),
            issued_at: now,
            order_expiration: now + 3600,
            piece_expiration: 0,
            signature: Vec::new(),
        }
        .signed(&self.coordinator_key)
    }

    fn order(&self, serial: [u8; 16], amount: u64) -> Order {
        Order {
            serial: SerialNumber(serial),
            amount,
            signature: Vec::new(),
        }
        .signed(&self.uplink_key)
    }

    fn done_hash(&self, piece: PieceId, data: &[u8]) -> PieceHash {
        PieceHash {
            piece_id: piece,
            hash: *blake3::hash(data).as_bytes(),
            piece_size: data.len() as u64,
            timestamp: now_secs(),
            signature: Vec::new(),
        }
        .signed(&self.uplink_key)
    }

    async fn piece_store_conn(&self) -> iroh::endpoint::Connection {
        self.uplink
            .connect(self.server_addr.clone(), PIECE_STORE_ALPN)
            .await
            .expect("connect piece-store")
    }

    /// Drive a full upload session. Frames mirror what a real uplink sends;
    /// write errors are tolerated so rejection paths can still read the
    /// node's error response.
    async fn upload(&self, limit: &OrderLimit, data: &[u8]) -> UploadResponse {
        let conn = self.piece_store_conn().await;
        let (mut send, mut recv) = conn.open_bi().await.expect("open upload stream");

        let _ = write_frame(
            &mut send,
            &PieceRequest::Upload {
                limit: limit.clone(),
            },
        )
        .await;
        let _ = write_frame(
            &mut send,
            &UploadFrame::Order(self.order(limit.serial.0, data.len() as u64)),
        )
        .await;
        let mut offset = 0u64;
        for chunk in data.chunks(16 * 1024) {
            let _ = write_frame_with_data(
                &mut send,
                &UploadFrame::Chunk {
                    offset,
                    len: chunk.len() as u32,
                },
                chunk,
            )
            .await;
            offset += chunk.len() as u64;
        }
        let _ = write_frame(
            &mut send,
            &UploadFrame::Done(self.done_hash(limit.piece_id, data)),
        )
        .await;
        let _ = send.finish();

        read_frame::<UploadResponse>(&mut recv, MAX_CONTROL_FRAME_SIZE)
            .await
            .expect("upload response")
    }

    /// Drive a download, paying with one up-front order.
    async fn download(
        &self,
        limit: &OrderLimit,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, common::RemoteError> {
        let conn = self.piece_store_conn().await;
        let (mut send, mut recv) = conn.open_bi().await.expect("open download stream");

        write_frame(
            &mut send,
            &PieceRequest::Download {
                limit: limit.clone(),
                offset,
                length,
            },
        )
        .await
        .expect("send download request");
        write_frame(&mut send, &self.order(limit.serial.0, length))
            .await
            .expect("send order");

        let mut collected = Vec::new();
        loop {
            match read_frame::<DownloadResponse>(&mut recv, MAX_CONTROL_FRAME_SIZE).await {
                Ok(DownloadResponse::Chunk {
                    offset: chunk_offset,
                    len,
                }) => {
                    assert_eq!(
                        chunk_offset,
                        offset + collected.len() as u64,
                        "chunks must arrive in offset order"
                    );
                    let data = read_data(&mut recv, len as usize).await.expect("chunk data");
                    collected.extend_from_slice(&data);
                    if collected.len() as u64 == length {
                        break;
                    }
                }
                Ok(DownloadResponse::Repair { .. }) => continue,
                Ok(DownloadResponse::Error(e)) => return Err(e),
                Err(FrameError::Closed) => break,
                Err(e) => panic!("download frame error: {e}"),
            }
        }
        // Closing our side lets the node persist the session's order
        let _ = send.finish();
        Ok(collected)
    }

    async fn coordinator_request(
        &self,
        message: &CoordinatorControlMessage,
    ) -> CoordinatorControlMessage {
        self.control_request(&self.coordinator, message).await
    }

    async fn control_request(
        &self,
        from: &iroh::Endpoint,
        message: &CoordinatorControlMessage,
    ) -> CoordinatorControlMessage {
        let conn = from
            .connect(self.server_addr.clone(), COORDINATOR_CONTROL_ALPN)
            .await
            .expect("connect coordinator-control");
        let (mut send, mut recv) = conn.open_bi().await.expect("open control stream");
        send.write_all(&serde_json::to_vec(message).unwrap())
            .await
            .expect("send control message");
        send.finish().expect("finish control stream");
        let buf = recv
            .read_to_end(common::MAX_COORDINATOR_MESSAGE_SIZE)
            .await
            .expect("control response");
        serde_json::from_slice(&buf).expect("parse control response")
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let cluster = setup().await;
    let data = test_data(100 * 1024);
    let limit = cluster.limit(PieceAction::Put, [7u8; 32], [1u8; 16]);

    let response = cluster.upload(&limit, &data).await;
    let receipt = match response {
        UploadResponse::Done { receipt } => receipt,
        UploadResponse::Error(e) => panic!("upload failed: {e}"),
    };
    assert_eq!(receipt.piece_id, limit.piece_id);
    assert_eq!(receipt.piece_size, data.len() as u64);
    assert_eq!(receipt.hash, *blake3::hash(&data).as_bytes());
    // The receipt is signed by the node itself
    let node_vk = common::signing::verifying_key(&cluster.state.node_id).unwrap();
    assert!(receipt.verify_signature(&node_vk));

    // The session's largest order is settled exactly once
    assert_eq!(cluster.state.orders.unsent_count().unwrap(), 1);

    let get_limit = cluster.limit(PieceAction::Get, [7u8; 32], [2u8; 16]);
    let fetched = cluster
        .download(&get_limit, 0, data.len() as u64)
        .await
        .expect("download");
    assert_eq!(fetched, data);

    // Partial range read
    let range_limit = cluster.limit(PieceAction::Get, [7u8; 32], [3u8; 16]);
    let fetched = cluster.download(&range_limit, 1000, 500).await.unwrap();
    assert_eq!(fetched, data[1000..1500]);
}

#[tokio::test]
async fn download_saves_bandwidth_order() {
    let cluster = setup().await;
    let data = test_data(10 * 1024);
    let limit = cluster.limit(PieceAction::Put, [8u8; 32], [1u8; 16]);
    cluster.upload(&limit, &data).await;

    let get_limit = cluster.limit(PieceAction::Get, [8u8; 32], [2u8; 16]);
    cluster
        .download(&get_limit, 0, data.len() as u64)
        .await
        .unwrap();

    // Both sessions settle: one upload order, one download order
    for _ in 0..100 {
        if cluster.state.orders.unsent_count().unwrap() == 2 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("download order was not persisted");
}

#[tokio::test]
async fn replayed_serial_is_rejected() {
    let cluster = setup().await;
    let data = test_data(1024);
    let limit = cluster.limit(PieceAction::Put, [9u8; 32], [5u8; 16]);

    match cluster.upload(&limit, &data).await {
        UploadResponse::Done { .. } => {}
        UploadResponse::Error(e) => panic!("first upload failed: {e}"),
    }

    // Same limit again: replay
    match cluster.upload(&limit, &data).await {
        UploadResponse::Done { .. } => panic!("replay accepted"),
        UploadResponse::Error(e) => assert_eq!(e.code, StatusCode::AlreadyExists),
    }
}

#[tokio::test]
async fn upload_without_allocation_is_rejected() {
    let cluster = setup().await;
    let limit = cluster.limit(PieceAction::Put, [10u8; 32], [6u8; 16]);
    let conn = cluster.piece_store_conn().await;
    let (mut send, mut recv) = conn.open_bi().await.unwrap();

    let _ = write_frame(
        &mut send,
        &PieceRequest::Upload {
            limit: limit.clone(),
        },
    )
    .await;
    // Order covers 100 bytes, chunk brings 200
    let _ = write_frame(&mut send, &UploadFrame::Order(cluster.order([6u8; 16], 100))).await;
    let data = test_data(200);
    let _ = write_frame_with_data(
        &mut send,
        &UploadFrame::Chunk {
            offset: 0,
            len: 200,
        },
        &data,
    )
    .await;
    let _ = send.finish();

    match read_frame::<UploadResponse>(&mut recv, MAX_CONTROL_FRAME_SIZE)
        .await
        .expect("response")
    {
        UploadResponse::Error(e) => {
            assert_eq!(e.code, StatusCode::InvalidArgument);
            assert!(e.message.contains("not enough allocated"), "{}", e.message);
        }
        UploadResponse::Done { .. } => panic!("over-allocation accepted"),
    }
    // No piece becomes visible
    assert!(
        !cluster
            .state
            .store
            .contains(&public(&cluster.coordinator_key), &limit.piece_id)
    );
}

#[tokio::test]
async fn out_of_order_chunk_is_rejected() {
    let cluster = setup().await;
    let limit = cluster.limit(PieceAction::Put, [11u8; 32], [7u8; 16]);
    let conn = cluster.piece_store_conn().await;
    let (mut send, mut recv) = conn.open_bi().await.unwrap();

    let _ = write_frame(
        &mut send,
        &PieceRequest::Upload {
            limit: limit.clone(),
        },
    )
    .await;
    let _ = write_frame(
        &mut send,
        &UploadFrame::Order(cluster.order([7u8; 16], 1 << 20)),
    )
    .await;
    let data = test_data(1024);
    let _ = write_frame_with_data(
        &mut send,
        &UploadFrame::Chunk {
            offset: 0,
            len: 1024,
        },
        &data,
    )
    .await;
    // Gap: writer is at 1024, chunk claims 2048
    let _ = write_frame_with_data(
        &mut send,
        &UploadFrame::Chunk {
            offset: 2048,
            len: 1024,
        },
        &data,
    )
    .await;
    let _ = send.finish();

    match read_frame::<UploadResponse>(&mut recv, MAX_CONTROL_FRAME_SIZE)
        .await
        .expect("response")
    {
        UploadResponse::Error(e) => {
            assert_eq!(e.code, StatusCode::InvalidArgument);
            assert!(e.message.contains("chunk out of order"), "{}", e.message);
        }
        UploadResponse::Done { .. } => panic!("gap accepted"),
    }
}

#[tokio::test]
async fn canceled_upload_still_persists_order() {
    let cluster = setup().await;
    let limit = cluster.limit(PieceAction::Put, [12u8; 32], [8u8; 16]);
    let conn = cluster.piece_store_conn().await;
    let (mut send, _recv) = conn.open_bi().await.unwrap();

    write_frame(
        &mut send,
        &PieceRequest::Upload {
            limit: limit.clone(),
        },
    )
    .await
    .unwrap();
    write_frame(
        &mut send,
        &UploadFrame::Order(cluster.order([8u8; 16], 4096)),
    )
    .await
    .unwrap();
    let data = test_data(2048);
    write_frame_with_data(
        &mut send,
        &UploadFrame::Chunk {
            offset: 0,
            len: 2048,
        },
        &data,
    )
    .await
    .unwrap();
    // Let the frames land, then walk away mid-upload by resetting the
    // stream. The connection stays up so the reset is delivered promptly.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    drop(send);

    // The node must persist the largest order it saw even though the
    // session was never completed
    for _ in 0..200 {
        if cluster.state.orders.unsent_count().unwrap() == 1 {
            // And the torn piece must not be visible
            assert!(
                !cluster
                    .state
                    .store
                    .contains(&public(&cluster.coordinator_key), &limit.piece_id)
            );
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("order from canceled upload was not persisted");
}

#[tokio::test]
async fn download_of_missing_piece_is_not_found() {
    let cluster = setup().await;
    let limit = cluster.limit(PieceAction::Get, [42u8; 32], [9u8; 16]);
    match cluster.download(&limit, 0, 100).await {
        Err(e) => assert_eq!(e.code, StatusCode::NotFound),
        Ok(_) => panic!("download of missing piece succeeded"),
    }
}

#[tokio::test]
async fn download_beyond_piece_size_is_rejected() {
    let cluster = setup().await;
    let data = test_data(1000);
    let put = cluster.limit(PieceAction::Put, [13u8; 32], [10u8; 16]);
    cluster.upload(&put, &data).await;

    let get = cluster.limit(PieceAction::Get, [13u8; 32], [11u8; 16]);
    match cluster.download(&get, 600, 600).await {
        Err(e) => {
            assert_eq!(e.code, StatusCode::InvalidArgument);
            assert!(e.message.contains("more data than available"), "{}", e.message);
        }
        Ok(_) => panic!("read past end succeeded"),
    }
}

#[tokio::test]
async fn repair_download_leads_with_header() {
    let cluster = setup().await;
    let data = test_data(5000);
    let put = cluster.limit(PieceAction::Put, [14u8; 32], [12u8; 16]);
    cluster.upload(&put, &data).await;

    let repair = cluster.limit(PieceAction::GetRepair, [14u8; 32], [13u8; 16]);
    let conn = cluster.piece_store_conn().await;
    let (mut send, mut recv) = conn.open_bi().await.unwrap();
    write_frame(
        &mut send,
        &PieceRequest::Download {
            limit: repair.clone(),
            offset: 0,
            length: data.len() as u64,
        },
    )
    .await
    .unwrap();
    write_frame(&mut send, &cluster.order([13u8; 16], data.len() as u64))
        .await
        .unwrap();

    // First frame must be the stored header hash and original limit
    match read_frame::<DownloadResponse>(&mut recv, MAX_CONTROL_FRAME_SIZE)
        .await
        .expect("repair frame")
    {
        DownloadResponse::Repair { hash, limit } => {
            assert_eq!(hash.hash, *blake3::hash(&data).as_bytes());
            assert_eq!(hash.piece_size, data.len() as u64);
            assert_eq!(limit.serial, put.serial);
            assert_eq!(limit.action, PieceAction::Put);
        }
        other => panic!("expected repair header, got {other:?}"),
    }

    // Then data in offset order
    let mut collected = Vec::new();
    while collected.len() < data.len() {
        match read_frame::<DownloadResponse>(&mut recv, MAX_CONTROL_FRAME_SIZE)
            .await
            .expect("chunk frame")
        {
            DownloadResponse::Chunk { offset, len } => {
                assert_eq!(offset, collected.len() as u64);
                collected.extend(read_data(&mut recv, len as usize).await.unwrap());
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }
    assert_eq!(collected, data);
    let _ = send.finish();
}

#[tokio::test]
async fn coordinator_batch_delete() {
    let cluster = setup().await;
    let data = test_data(512);
    for (piece, serial) in [([20u8; 32], [20u8; 16]), ([21u8; 32], [21u8; 16])] {
        let limit = cluster.limit(PieceAction::Put, piece, serial);
        cluster.upload(&limit, &data).await;
    }

    let response = cluster
        .coordinator_request(&CoordinatorControlMessage::DeletePieces {
            piece_ids: vec![PieceId([20u8; 32]), PieceId([21u8; 32])],
        })
        .await;
    match response {
        CoordinatorControlMessage::DeletePiecesResponse { unhandled_count } => {
            assert_eq!(unhandled_count, 0)
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let coordinator_id = public(&cluster.coordinator_key);
    for _ in 0..200 {
        let gone = !cluster
            .state
            .store
            .contains(&coordinator_id, &PieceId([20u8; 32]))
            && !cluster
                .state
                .store
                .contains(&coordinator_id, &PieceId([21u8; 32]));
        if gone {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("queued deletes did not run");
}

#[tokio::test]
async fn untrusted_peer_cannot_use_coordinator_ops() {
    let cluster = setup().await;
    // The uplink's identity is not in the trust set
    let response = cluster
        .control_request(
            &cluster.uplink,
            &CoordinatorControlMessage::DeletePieces {
                piece_ids: vec![PieceId([1u8; 32])],
            },
        )
        .await;
    match response {
        CoordinatorControlMessage::Error(e) => {
            assert_eq!(e.code, StatusCode::PermissionDenied)
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn retain_trashes_unlisted_pieces() {
    let cluster = setup().await;
    let data = test_data(256);
    let keep = PieceId([30u8; 32]);
    let collect = PieceId([31u8; 32]);
    for (piece, serial) in [(keep, [30u8; 16]), (collect, [31u8; 16])] {
        let limit = cluster.limit(PieceAction::Put, piece.0, serial);
        cluster.upload(&limit, &data).await;
    }

    let mut filter = common::bloom::BloomFilter::new(16, 0.01);
    filter.insert(&keep);
    let response = cluster
        .coordinator_request(&CoordinatorControlMessage::Retain {
            // Cutoff far in the future, minus nothing the buffer cannot eat:
            // push it past the buffer so fresh pieces qualify
            created_before: now_secs()
                + cluster.state.config.retain_time_buffer_secs
                + 3600,
            filter: filter.to_bytes(),
        })
        .await;
    match response {
        CoordinatorControlMessage::Ack { success, .. } => assert!(success),
        other => panic!("unexpected response: {other:?}"),
    }

    let coordinator_id = public(&cluster.coordinator_key);
    for _ in 0..200 {
        if !cluster.state.store.contains(&coordinator_id, &collect) {
            assert!(cluster.state.store.contains(&coordinator_id, &keep));
            // RestoreTrash brings the collected piece back
            let response = cluster
                .coordinator_request(&CoordinatorControlMessage::RestoreTrash)
                .await;
            match response {
                CoordinatorControlMessage::Ack { success, .. } => assert!(success),
                other => panic!("unexpected response: {other:?}"),
            }
            assert!(cluster.state.store.contains(&coordinator_id, &collect));
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("retain did not collect the unlisted piece");
}
