use serde::{Deserialize, Serialize};

use crate::codec;

/// Magic tag identifying the muxrpc wire protocol. A connection whose
/// handshake carries any other value is dropped without a response.
pub const MAGIC: u32 = 0x3bef5c;

/// Per-connection negotiation options, exchanged exactly once before any
/// framed traffic.
///
/// The options travel in the fixed bootstrap encoding (one line of JSON)
/// regardless of which codec they select, so both sides can parse them
/// without prior agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub magic: u32,
    pub codec: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            magic: MAGIC,
            codec: codec::MSGPACK_ID.to_string(),
        }
    }
}

impl ConnectOptions {
    /// Options selecting `codec`, with the protocol magic filled in.
    pub fn with_codec(codec: impl Into<String>) -> Self {
        ConnectOptions {
            magic: MAGIC,
            codec: codec.into(),
        }
    }

    /// Applies caller overrides. The magic tag is always forced to the
    /// protocol constant and an empty codec id falls back to the default,
    /// so a half-filled override still produces a valid handshake.
    pub fn normalize(options: Option<ConnectOptions>) -> ConnectOptions {
        let mut options = options.unwrap_or_default();
        options.magic = MAGIC;
        if options.codec.is_empty() {
            options.codec = codec::MSGPACK_ID.to_string();
        }
        options
    }
}
