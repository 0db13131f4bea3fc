use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Codec, Connection, ConnectionReader, ConnectionWriter};
use crate::protocol::{Header, Result, RpcError};

/// Refuse length prefixes beyond this to avoid unbounded allocations from
/// a corrupt or hostile peer.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Compact binary codec.
///
/// Wire format per record: `[4-byte length as u32 big-endian]` followed
/// by the MessagePack payload. A frame is the header record immediately
/// followed by the body record.
pub struct MsgpackCodec {
    reader: Mutex<ConnectionReader>,
    writer: Mutex<ConnectionWriter>,
}

impl std::fmt::Debug for MsgpackCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgpackCodec").finish_non_exhaustive()
    }
}

impl MsgpackCodec {
    pub fn new(conn: Connection) -> Self {
        let (reader, writer) = conn.into_parts();
        MsgpackCodec {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    async fn read_record<T: DeserializeOwned>(&self) -> Result<T> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::Connection(format!(
                "record too large: {len} bytes (max {MAX_FRAME_LEN})"
            )));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(rmp_serde::from_slice(&payload)?)
    }

    fn append_record<T: Serialize>(frame: &mut Vec<u8>, record: &T) -> Result<()> {
        let payload = rmp_serde::to_vec(record)?;
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(())
    }
}

#[async_trait]
impl Codec for MsgpackCodec {
    async fn read_header(&self) -> Result<Header> {
        self.read_record().await
    }

    async fn read_body(&self) -> Result<Value> {
        self.read_record().await
    }

    async fn write(&self, header: &Header, body: &Value) -> Result<()> {
        let mut frame = Vec::new();
        Self::append_record(&mut frame, header)?;
        Self::append_record(&mut frame, body)?;

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            debug!("msgpack codec write failed, shutting down stream: {err}");
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec_pair() -> (MsgpackCodec, MsgpackCodec) {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        (
            MsgpackCodec::new(Connection::new(local)),
            MsgpackCodec::new(Connection::new(remote)),
        )
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (writer, reader) = codec_pair();
        let header = Header::request("Arith.Sum", 42);
        let body = json!({"nested": {"xs": [1, 2, 3]}, "flag": true, "name": "sum"});

        writer.write(&header, &body).await.unwrap();

        assert_eq!(reader.read_header().await.unwrap(), header);
        assert_eq!(reader.read_body().await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_large_seq_survives() {
        let (writer, reader) = codec_pair();
        let header = Header::request("Arith.Sum", u64::MAX - 1);

        writer.write(&header, &Value::Null).await.unwrap();

        assert_eq!(reader.read_header().await.unwrap().seq, u64::MAX - 1);
    }

    #[tokio::test]
    async fn test_read_after_peer_drop_is_eof() {
        let (writer, reader) = codec_pair();
        drop(writer);

        let err = reader.read_header().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let (local, remote) = tokio::io::duplex(1024);
        let reader = MsgpackCodec::new(Connection::new(remote));

        let mut local = local;
        let bogus_len = (MAX_FRAME_LEN as u32) + 1;
        local.write_all(&bogus_len.to_be_bytes()).await.unwrap();

        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }
}
