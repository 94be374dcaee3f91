//! Peer mesh error types.
//!
//! None of these errors terminates a room session. Transport errors are turned
//! into FAILED transitions for the one participant they concern, decode errors
//! are logged and skipped, and stale signals are dropped.

use common::error::MeshCommonError;
use thiserror::Error;

/// Mesh client error type.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The actor mailbox or a reply channel is gone (session ended).
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A signaling frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Returns a short, bounded label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::ChannelClosed(_) => "channel_closed",
            MeshError::Decode(_) => "decode",
            MeshError::Internal(_) => "internal",
        }
    }

    /// Whether the session can keep running after this error.
    ///
    /// Only a closed mailbox means the session is gone.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MeshError::ChannelClosed(_))
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Decode(err.to_string())
    }
}

/// An unusable identifier inside a frame is a decode failure.
impl From<MeshCommonError> for MeshError {
    fn from(err: MeshCommonError) -> Self {
        MeshError::Decode(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            MeshError::ChannelClosed("mailbox".to_string()).kind(),
            "channel_closed"
        );
        assert_eq!(MeshError::Decode("eof".to_string()).kind(), "decode");
        assert_eq!(MeshError::Internal("x".to_string()).kind(), "internal");
    }

    #[test]
    fn test_only_closed_channel_is_unrecoverable() {
        assert!(!MeshError::ChannelClosed("gone".to_string()).is_recoverable());
        assert!(MeshError::Decode("bad".to_string()).is_recoverable());
        assert!(MeshError::Internal("dup".to_string()).is_recoverable());
    }

    #[test]
    fn test_serde_error_converts_to_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let mesh_err: MeshError = err.into();
        assert!(matches!(mesh_err, MeshError::Decode(_)));
    }

    #[test]
    fn test_invalid_id_converts_to_decode() {
        let err: MeshError = MeshCommonError::InvalidId("participant id is empty".to_string()).into();
        assert!(matches!(err, MeshError::Decode(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", MeshError::Decode("unexpected eof".to_string())),
            "Decode error: unexpected eof"
        );
        assert_eq!(
            format!("{}", MeshError::ChannelClosed("mailbox".to_string())),
            "Channel closed: mailbox"
        );
    }
}
