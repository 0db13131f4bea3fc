//! Framed codecs over a byte stream.
//!
//! A codec owns an already-connected stream and reads/writes
//! (header, body) frame pairs in its own encoding. Two codecs are built
//! in, keyed by string id:
//!
//! - [`MSGPACK_ID`]: length-prefixed MessagePack records (the default)
//! - [`JSON_ID`]: newline-delimited JSON records
//!
//! Additional codecs can be installed under fresh ids with
//! [`register_codec`]; the handshake treats unknown ids as a failure.
//! The handshake itself never goes through a codec — it uses the fixed
//! bootstrap encoding implemented on [`Connection`].

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::protocol::{ConnectOptions, Header, Result, RpcError};

/// Codec id of the compact binary codec (the default).
pub const MSGPACK_ID: &str = "application/msgpack";
/// Codec id of the textual codec.
pub const JSON_ID: &str = "application/json";

/// Byte streams a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Buffered read half of a connection.
pub type ConnectionReader = BufReader<ReadHalf<BoxedStream>>;
/// Write half of a connection.
pub type ConnectionWriter = WriteHalf<BoxedStream>;

/// A connected byte stream split into a buffered read half and a write
/// half.
///
/// Created before the handshake so the bootstrap exchange and the
/// negotiated codec share one read buffer: bytes that arrive right behind
/// the options line are waiting in the buffer, not lost.
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(Box::new(stream) as BoxedStream);
        Connection {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Reads the bootstrap options line.
    pub async fn read_options(&mut self) -> Result<ConnectOptions> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RpcError::Connection(
                "connection closed during handshake".to_string(),
            ));
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Writes the bootstrap options line and flushes it.
    pub async fn write_options(&mut self, options: &ConnectOptions) -> Result<()> {
        let mut line = serde_json::to_vec(options)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Splits the connection into its halves, for codec construction.
    pub fn into_parts(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

/// Framed serialization of (header, body) pairs over a connected stream.
///
/// `write` emits the header and its body as one frame under an internal
/// writer lock and flushes before returning, so concurrent writers
/// produce whole frames on the wire. On a write failure the underlying
/// stream is shut down before the error is surfaced. The read side is
/// meant for a single owner, the connection's receive loop.
#[async_trait]
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Reads the next frame's header.
    async fn read_header(&self) -> Result<Header>;

    /// Reads the body belonging to the most recently read header. Callers
    /// that need to skip a body read it and drop the value.
    async fn read_body(&self) -> Result<Value>;

    /// Emits `header` followed by `body` as one frame and flushes.
    async fn write(&self, header: &Header, body: &Value) -> Result<()>;

    /// Releases the stream.
    async fn close(&self) -> Result<()>;
}

/// Constructor installed in the codec registry.
pub type CodecFactory = Arc<dyn Fn(Connection) -> Box<dyn Codec> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, CodecFactory>>> = Lazy::new(|| {
    let mut codecs: HashMap<String, CodecFactory> = HashMap::new();
    let msgpack: CodecFactory = Arc::new(|conn| -> Box<dyn Codec> { Box::new(MsgpackCodec::new(conn)) });
    let json: CodecFactory = Arc::new(|conn| -> Box<dyn Codec> { Box::new(JsonCodec::new(conn)) });
    codecs.insert(MSGPACK_ID.to_string(), msgpack);
    codecs.insert(JSON_ID.to_string(), json);
    RwLock::new(codecs)
});

/// Installs a codec factory under `id`, replacing any previous entry.
pub fn register_codec(id: impl Into<String>, factory: CodecFactory) {
    REGISTRY.write().insert(id.into(), factory);
}

/// True when `id` names a registered codec.
pub fn is_registered(id: &str) -> bool {
    REGISTRY.read().contains_key(id)
}

/// Instantiates the codec registered under `id` over `conn`.
pub fn instantiate(id: &str, conn: Connection) -> Result<Box<dyn Codec>> {
    let factory = REGISTRY
        .read()
        .get(id)
        .cloned()
        .ok_or_else(|| RpcError::UnknownCodec(id.to_string()))?;
    Ok(factory(conn))
}
