//! Status errors returned to remote peers.
//!
//! [`RpcError`] carries the wire-visible status taxonomy. [`HandlerError`]
//! additionally distinguishes the peer walking away mid-stream, which is a
//! logged-and-metered cancellation, never a failure status.

use common::frames::FrameError;
use common::{RemoteError, StatusCode};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
}

impl RpcError {
    fn new(code: StatusCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Aborted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            code: self.code,
            message: self.message.clone(),
        }
    }
}

/// Outcome of a streaming piece operation, before metrics classification.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The peer closed or reset the stream; not an error at the RPC level.
    #[error("peer closed the stream")]
    Canceled,
    #[error(transparent)]
    Status(#[from] RpcError),
}

impl HandlerError {
    /// Frame errors on a stream where the protocol allows the peer to stop:
    /// peer-gone maps to cancellation, anything else is a malformed stream.
    pub fn from_frame(err: FrameError) -> Self {
        if err.is_peer_gone() {
            HandlerError::Canceled
        } else {
            HandlerError::Status(RpcError::invalid_argument(err.to_string()))
        }
    }

    /// Frame errors mid-upload, where a clean finish without a `Done` message
    /// is a protocol violation (matching the unexpected-EOF behavior of the
    /// receive loop) but a reset still counts as the peer walking away.
    pub fn from_upload_frame(err: FrameError) -> Self {
        match err {
            FrameError::Closed | FrameError::Truncated => {
                HandlerError::Status(RpcError::invalid_argument("unexpected EOF"))
            }
            FrameError::Reset(_) => HandlerError::Canceled,
            other => HandlerError::Status(RpcError::invalid_argument(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_peer_gone_becomes_cancel() {
        assert!(matches!(
            HandlerError::from_frame(FrameError::Closed),
            HandlerError::Canceled
        ));
        assert!(matches!(
            HandlerError::from_frame(FrameError::Reset("gone".into())),
            HandlerError::Canceled
        ));
    }

    #[test]
    fn upload_eof_is_invalid_argument() {
        match HandlerError::from_upload_frame(FrameError::Closed) {
            HandlerError::Status(e) => {
                assert_eq!(e.code, StatusCode::InvalidArgument);
                assert!(e.message.contains("unexpected EOF"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn upload_reset_is_cancel() {
        assert!(matches!(
            HandlerError::from_upload_frame(FrameError::Reset("gone".into())),
            HandlerError::Canceled
        ));
    }
}
