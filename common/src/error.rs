use std::io;

use thiserror::Error;

/// Errors raised by the transport, framing, codec and handshake layers.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The address does not have a recognised shape, or its family is not
    /// available on this platform.
    #[error("address error: {0}")]
    Address(String),

    /// A configuration value could not be understood.
    #[error("configuration error: {0}")]
    Config(String),

    /// The challenge-response handshake failed; the connection is unusable.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The peer closed its end while a frame was expected.
    #[error("connection closed by peer")]
    Eof,

    /// The local handle has already been closed.
    #[error("connection handle is closed")]
    Closed,

    /// The operation needs a direction this end of a one-way pipe lacks.
    #[error("connection is not {0}")]
    BadMode(&'static str),

    /// A frame announced more bytes than the receiver accepts.
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge {
        /// Announced length
        len: u64,
        /// Configured maximum
        max: usize,
    },

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// The payload tag does not name a registered codec.
    #[error("unknown codec tag {0:#04x}")]
    UnknownCodec(u8),

    /// Starting, joining or signalling a child worker failed.
    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IpcError {
    /// True when the error means the other side has gone away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            IpcError::Eof => true,
            IpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result alias used throughout the common crate.
pub type Result<T, E = IpcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_kinds_are_recognised() {
        assert!(IpcError::Eof.is_disconnect());
        assert!(IpcError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(!IpcError::Closed.is_disconnect());
        assert!(!IpcError::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
    }

    #[test]
    fn frame_too_large_message_names_both_sizes() {
        let err = IpcError::FrameTooLarge { len: 10, max: 4 };
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds the limit of 4 bytes");
    }
}
