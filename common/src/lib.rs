//! Common types and protocol messages for the Pebble storage network.
//!
//! This crate provides shared functionality used across Pebble components:
//! - **Core identifiers**: piece ids, order serial numbers, piece actions
//! - **Authorization envelopes**: coordinator-signed order limits, uplink-signed
//!   orders and piece hashes, durable piece headers
//! - **Protocol messages**: P2P communication between uplinks, coordinators,
//!   and storage nodes
//! - **Wire framing**: length-prefixed frames with raw byte payloads over
//!   Iroh QUIC streams
//! - **Bloom filters**: compact piece-id sets for coordinator-driven garbage
//!   collection
//!
//! # Authorization Model
//!
//! Every piece operation is authorized by an [`OrderLimit`]: a coordinator-signed
//! envelope naming the uplink, the target storage node, the piece, the action,
//! and a byte budget. During a transfer session the uplink signs incremental
//! [`Order`]s whose `amount` is a running total of bandwidth it agrees to pay
//! for. The storage node persists the largest verified order per session for
//! later settlement with the coordinator.
//!
//! Signatures are Ed25519 over domain-separated SCALE-encoded tuples; see
//! [`signing`].

pub mod bloom;
pub mod frames;
pub mod signing;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Protocol Constants
// ============================================================================

/// ALPN for uplink-originated piece operations (upload, download, delete).
pub const PIECE_STORE_ALPN: &[u8] = b"pebble/piece-store";

/// ALPN for coordinator-originated control operations (batch delete, retain,
/// restore-trash).
pub const COORDINATOR_CONTROL_ALPN: &[u8] = b"pebble/coordinator-control";

/// Maximum size for control frames (order limits, orders, receipts).
pub const MAX_CONTROL_FRAME_SIZE: usize = 256 * 1024;

/// Maximum piece data carried by a single chunk frame (1 MiB).
/// Downloads never send more than this per frame; uploads exceeding it are
/// rejected as malformed.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Maximum size for a coordinator control message. Larger than the control
/// frame cap because retain requests carry bloom filters sized to the
/// coordinator's piece count.
pub const MAX_COORDINATOR_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Returns the current Unix timestamp in seconds, or 0 on clock error.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Core Identifiers
// ============================================================================

/// Content-independent identifier of a stored piece (32 opaque bytes).
///
/// Piece ids are assigned by the coordinator; the storage node treats them as
/// opaque. The all-zero id is reserved and rejected during verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation used for on-disk paths and logging.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", self.to_hex())
    }
}

impl FromStr for PieceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("piece id must be 32 bytes"))?;
        Ok(PieceId(arr))
    }
}

/// Unique serial number of an order limit (16 opaque bytes).
///
/// A storage node refuses to serve two sessions with the same
/// (coordinator, serial) pair until the order expiration has passed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialNumber(pub [u8; 16]);

impl SerialNumber {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({})", hex::encode(self.0))
    }
}

/// Operation authorized by an order limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceAction {
    Put,
    PutRepair,
    Get,
    GetRepair,
    GetAudit,
    Delete,
}

impl PieceAction {
    /// Stable numeric tag used in canonical signing bytes and ledger keys.
    pub fn as_u8(&self) -> u8 {
        match self {
            PieceAction::Put => 0,
            PieceAction::PutRepair => 1,
            PieceAction::Get => 2,
            PieceAction::GetRepair => 3,
            PieceAction::GetAudit => 4,
            PieceAction::Delete => 5,
        }
    }

    pub fn is_put(&self) -> bool {
        matches!(self, PieceAction::Put | PieceAction::PutRepair)
    }

    pub fn is_get(&self) -> bool {
        matches!(
            self,
            PieceAction::Get | PieceAction::GetRepair | PieceAction::GetAudit
        )
    }
}

impl fmt::Display for PieceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PieceAction::Put => "PUT",
            PieceAction::PutRepair => "PUT_REPAIR",
            PieceAction::Get => "GET",
            PieceAction::GetRepair => "GET_REPAIR",
            PieceAction::GetAudit => "GET_AUDIT",
            PieceAction::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Authorization Envelopes
// ============================================================================

/// Coordinator-signed authorization for a single operation on a single piece.
///
/// The envelope names the issuing coordinator, the uplink key that signs
/// in-session orders, the target storage node, and the byte budget. All
/// timestamps are Unix seconds. `piece_expiration == 0` means the piece never
/// expires.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderLimit {
    /// Coordinator that issued and signed this limit.
    pub coordinator_id: iroh::PublicKey,
    /// Uplink key that signs orders and the upload done-hash for this session.
    pub uplink_key: iroh::PublicKey,
    /// Storage node this limit is addressed to.
    pub node_id: iroh::PublicKey,
    /// Piece the operation targets.
    pub piece_id: PieceId,
    /// Operation being authorized.
    pub action: PieceAction,
    /// Maximum bytes the uplink may claim with orders in this session.
    pub byte_limit: u64,
    /// Unique serial number; replay-protected until `order_expiration`.
    pub serial: SerialNumber,
    /// When the coordinator issued the limit.
    pub issued_at: u64,
    /// Limit is unusable after this time; also bounds serial retention.
    pub order_expiration: u64,
    /// Requested piece expiration, 0 for none.
    pub piece_expiration: u64,
    /// Coordinator Ed25519 signature over the canonical bytes.
    pub signature: Vec<u8>,
}

/// Uplink-signed running bandwidth claim within one session.
///
/// `amount` is a running total, never a delta, and must be non-decreasing
/// across a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    /// Must equal the serial of the session's order limit.
    pub serial: SerialNumber,
    /// Total bytes claimed so far, bounded by the limit's `byte_limit`.
    pub amount: u64,
    /// Uplink Ed25519 signature over the canonical bytes.
    pub signature: Vec<u8>,
}

/// Signed statement that a piece with the given content hash and size exists.
///
/// Used in two directions: the uplink signs one as the terminal `Done` message
/// of an upload, and the storage node signs one as the upload receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceHash {
    pub piece_id: PieceId,
    /// BLAKE3 hash of the piece content.
    pub hash: [u8; 32],
    pub piece_size: u64,
    pub timestamp: u64,
    /// Ed25519 signature over the canonical bytes (uplink or storage node).
    pub signature: Vec<u8>,
}

/// Durable header committed atomically with the piece bytes.
///
/// Stored in the reserved prologue of the piece file and returned to repair
/// workers on GET_REPAIR so they can validate provenance end to end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PieceHeader {
    /// BLAKE3 hash computed by the storage node while streaming the upload.
    pub hash: [u8; 32],
    /// Creation timestamp declared by the uplink in the done-hash.
    pub creation_time: u64,
    /// Uplink signature from the done-hash.
    pub uplink_signature: Vec<u8>,
    /// The original order limit that authorized the upload.
    pub order_limit: OrderLimit,
}

// ============================================================================
// Status Codes
// ============================================================================

/// Wire-visible failure taxonomy for piece operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Aborted,
    Unavailable,
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Unauthenticated => "unauthenticated",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::NotFound => "not found",
            StatusCode::AlreadyExists => "already exists",
            StatusCode::Aborted => "aborted",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Failure reported to the remote peer on a piece-store or control stream.
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: StatusCode,
    pub message: String,
}

// ============================================================================
// P2P Protocol Messages
// ============================================================================

/// First frame on every `pebble/piece-store` stream, selecting the operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PieceRequest {
    /// Begin an upload session. Subsequent frames are [`UploadFrame`]s.
    Upload { limit: OrderLimit },
    /// Begin a download of `length` bytes starting at `offset`. Subsequent
    /// inbound frames are bare [`Order`]s; responses are [`DownloadResponse`]s.
    Download {
        limit: OrderLimit,
        offset: u64,
        length: u64,
    },
    /// Delete a single piece. Deprecated in favor of the coordinator batch
    /// delete; kept for old uplinks.
    Delete { limit: OrderLimit },
}

/// Uplink frames following an upload request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UploadFrame {
    /// A fresh (larger or equal) bandwidth order for the session.
    Order(Order),
    /// Header for `len` raw piece bytes that follow this frame on the stream.
    Chunk { offset: u64, len: u32 },
    /// Terminal message carrying the uplink-signed piece hash.
    Done(PieceHash),
}

/// Storage node's single response frame to an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UploadResponse {
    /// Upload committed; the receipt is signed by the storage node.
    Done { receipt: PieceHash },
    Error(RemoteError),
}

/// Storage node frames on a download stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DownloadResponse {
    /// Sent first on GET_REPAIR: the stored header hash and original limit so
    /// the repair worker can validate the piece independently.
    Repair { hash: PieceHash, limit: OrderLimit },
    /// Header for `len` raw piece bytes that follow this frame on the stream.
    Chunk { offset: u64, len: u32 },
    Error(RemoteError),
}

/// Storage node's response to the deprecated single-piece delete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DeleteResponse {
    Done,
    Error(RemoteError),
}

/// Messages on the `pebble/coordinator-control` protocol.
///
/// One JSON message per stream in each direction. The storage node checks the
/// remote peer identity against its trust set before acting on any of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorControlMessage {
    /// Queue a batch of pieces for asynchronous deletion.
    DeletePieces { piece_ids: Vec<PieceId> },
    /// Garbage-collect: keep only pieces in `filter` among those created
    /// before `created_before` (Unix seconds). `filter` is a serialized
    /// [`bloom::BloomFilter`].
    Retain { created_before: u64, filter: Vec<u8> },
    /// Restore all pieces previously trashed for the calling coordinator.
    RestoreTrash,

    // Responses (storage node → coordinator)
    /// How many pieces were dropped because the delete queue was full.
    DeletePiecesResponse { unhandled_count: u64 },
    Ack {
        success: bool,
        message: Option<String>,
    },
    Error(RemoteError),
}
