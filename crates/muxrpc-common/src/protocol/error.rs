use thiserror::Error;

/// Errors produced by the muxrpc runtime.
///
/// Handshake errors ([`RpcError::InvalidMagic`], [`RpcError::UnknownCodec`])
/// are terminal for the connection and never answered on the wire.
/// Protocol errors (ill-formed method names, unknown services or methods,
/// body decode failures) are per-request: the server answers them in the
/// response header and keeps serving. I/O errors tear the connection down.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The client is closing or has already shut down. A constant value,
    /// distinguishable by variant identity.
    #[error("connection is shut down")]
    Shutdown,

    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("unknown codec {0}")]
    UnknownCodec(String),

    #[error("service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    #[error("can't find service {0}")]
    UnknownService(String),

    #[error("can't find method {0}")]
    UnknownMethod(String),

    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("invalid service definition: {0}")]
    InvalidService(String),

    /// Error text a dispatched method returned; the server forwards it in
    /// the response header.
    #[error("{0}")]
    Method(String),

    /// Error text reported by the remote side in a response header.
    #[error("{0}")]
    Remote(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// True when the error poisons the whole connection rather than a
    /// single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_) | RpcError::Connection(_) | RpcError::Shutdown
        )
    }

    /// True when the value is the shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RpcError::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RpcError::Shutdown.is_fatal());
        assert!(RpcError::Connection("reset".to_string()).is_fatal());
        assert!(RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof"
        ))
        .is_fatal());

        assert!(!RpcError::UnknownMethod("Bogus".to_string()).is_fatal());
        assert!(!RpcError::IllFormedServiceMethod("Foobar".to_string()).is_fatal());
        assert!(!RpcError::Remote("boom".to_string()).is_fatal());
    }

    #[test]
    fn test_shutdown_identity() {
        assert!(RpcError::Shutdown.is_shutdown());
        assert!(!RpcError::Connection("reset".to_string()).is_shutdown());
    }

    #[test]
    fn test_error_text_is_bare() {
        // Lookup errors travel in response headers; their text must match
        // what callers grep for.
        let err = RpcError::UnknownMethod("Bogus".to_string());
        assert_eq!(err.to_string(), "can't find method Bogus");

        let err = RpcError::IllFormedServiceMethod("Foobar".to_string());
        assert!(err.to_string().contains("ill-formed"));
    }
}
