use serde::{Deserialize, Serialize};

/// Sequence number correlating a response frame to the call that produced
/// it. Assigned by the client, monotonically increasing from 1, never
/// reused within a connection.
pub type Seq = u64;

/// Per-frame header, sent in both directions ahead of its body.
///
/// Client to server the body carries the call arguments; server to client
/// it carries the reply. An empty `error` means success; a non-empty
/// `error` means the body is a null placeholder and the text explains the
/// failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: Seq,
    pub error: String,
}

impl Header {
    /// Builds a request header for `service_method` under `seq`.
    pub fn request(service_method: impl Into<String>, seq: Seq) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
