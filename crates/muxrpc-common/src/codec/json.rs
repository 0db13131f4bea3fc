use serde::de::DeserializeOwned;
use serde_json::Value;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Codec, Connection, ConnectionReader, ConnectionWriter};
use crate::protocol::{Header, Result, RpcError};

/// Newline-delimited JSON codec.
///
/// Every header and every body is one JSON record terminated by `\n`,
/// streamed back to back. JSON string escaping guarantees a record never
/// contains a raw newline, so records are self-delimiting.
pub struct JsonCodec {
    reader: Mutex<ConnectionReader>,
    writer: Mutex<ConnectionWriter>,
}

impl std::fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec").finish_non_exhaustive()
    }
}

impl JsonCodec {
    pub fn new(conn: Connection) -> Self {
        let (reader, writer) = conn.into_parts();
        JsonCodec {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    async fn read_record<T: DeserializeOwned>(&self) -> Result<T> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        Ok(serde_json::from_str(&line)?)
    }
}

#[async_trait]
impl Codec for JsonCodec {
    async fn read_header(&self) -> Result<Header> {
        self.read_record().await
    }

    async fn read_body(&self) -> Result<Value> {
        self.read_record().await
    }

    async fn write(&self, header: &Header, body: &Value) -> Result<()> {
        let mut frame = serde_json::to_vec(header)?;
        frame.push(b'\n');
        frame.append(&mut serde_json::to_vec(body)?);
        frame.push(b'\n');

        let mut writer = self.writer.lock().await;
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!("json codec write failed, shutting down stream: {err}");
            let _ = writer.shutdown().await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

async fn write_frame(writer: &mut ConnectionWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
