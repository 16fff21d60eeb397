//! Tuning constants for the storage node.
//!
//! Operational limits that rarely need changing live here; anything an
//! operator is expected to tune has a `[piecestore]` config field instead.

/// Reserved prologue at the start of every piece file. Holds the serialized
/// piece header; the piece bytes start at this offset.
pub const PIECE_HEADER_RESERVED: usize = 2048;

/// Maximum concurrent piece-store stream handlers per node.
/// Bounds task spawning to prevent OOM from connection floods; the
/// `max_concurrent_requests` config gate is the operator-facing limit.
pub const MAX_CONCURRENT_STREAM_HANDLERS: usize = 1000;

/// Accounted bytes per used-serial entry (coordinator id + serial + expiry
/// plus map overhead). The config cap in bytes divides by this to get the
/// entry cap.
pub const USED_SERIAL_ENTRY_SIZE: usize = 64;

/// How often the expiration sweeper scans for expired pieces.
pub const EXPIRATION_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Cooldown between low-disk notifications.
pub const LOW_DISK_NOTIFY_COOLDOWN_SECS: u64 = 600;

/// Maximum pending retain requests (one per coordinator).
pub const MAX_RETAIN_QUEUE: usize = 8;
