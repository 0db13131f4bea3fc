//! The multiplexing call engine: submission, correlation, teardown.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use muxrpc_common::codec::{self, Codec, Connection};
use muxrpc_common::{ConnectOptions, Header, Result, RpcError, Seq};

use crate::call::{Call, DONE_BUFFER};

/// State guarded by the client's state mutex: the pending table and the
/// lifecycle flags. Never held across I/O.
struct State {
    /// Next sequence number to assign; starts at 1 and never reuses.
    seq: Seq,
    pending: HashMap<Seq, Arc<Call>>,
    /// The user has called [`Client::close`].
    closing: bool,
    /// The receive loop has terminated.
    shutdown: bool,
}

struct Inner {
    codec: Box<dyn Codec>,
    /// Serializes registration + frame emission, so sequence order on the
    /// wire matches registration order.
    sending: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    closed_tx: watch::Sender<bool>,
}

/// RPC client over one connection.
///
/// Cheap to clone; all clones share the connection, the pending table,
/// and the receive loop. Any number of tasks may submit concurrently —
/// responses are correlated back by sequence number.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dials `addr` over TCP and performs the handshake.
    pub async fn dial(addr: impl ToSocketAddrs, options: Option<ConnectOptions>) -> Result<Client> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| RpcError::Connection(format!("failed to connect: {err}")))?;
        Self::new_client(stream, options).await
    }

    /// Performs the handshake over an established stream and starts the
    /// receive loop.
    ///
    /// The options are normalized first: the magic tag is forced to the
    /// protocol constant and an empty codec id falls back to the default.
    /// On any failure the stream is released before the error returns.
    pub async fn new_client<S>(stream: S, options: Option<ConnectOptions>) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = ConnectOptions::normalize(options);
        if !codec::is_registered(&options.codec) {
            return Err(RpcError::UnknownCodec(options.codec));
        }

        let mut conn = Connection::new(stream);
        conn.write_options(&options).await?;
        let codec = codec::instantiate(&options.codec, conn)?;
        Ok(Self::with_codec(codec))
    }

    /// Wraps an already-negotiated codec and starts the receive loop.
    pub fn with_codec(codec: Box<dyn Codec>) -> Client {
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            codec,
            sending: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed_tx,
        });
        tokio::spawn(receive(Arc::clone(&inner), closed_rx));
        Client { inner }
    }

    /// Submits a call asynchronously and returns its handle. Completion
    /// is delivered on `done` exactly once. The channel must be buffered;
    /// a zero-capacity tokio channel cannot be constructed, so an
    /// unbuffered `done` is unrepresentable.
    pub fn go(
        &self,
        service_method: impl Into<String>,
        args: Value,
        done: mpsc::Sender<Arc<Call>>,
    ) -> Arc<Call> {
        let call = Call::new(service_method.into(), args, done);
        tokio::spawn(send(Arc::clone(&self.inner), Arc::clone(&call)));
        call
    }

    /// Submits a call and waits for its single completion.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let (done_tx, mut done_rx) = mpsc::channel(DONE_BUFFER);
        let call = self.go(service_method, args, done_tx);
        // The call holds the only sender, so this resolves exactly when
        // the call is delivered.
        let _ = done_rx.recv().await;
        call.result()
    }

    /// Closes the connection. In-flight calls are failed by the receive
    /// loop's teardown; a second close returns the shutdown error.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        let _ = self.inner.closed_tx.send(true);
        self.inner.codec.close().await
    }

    /// True while the client can still submit calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !(state.closing || state.shutdown)
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

/// The send path for one call. Runs on its own task; the sending mutex
/// orders registration with emission across concurrent submitters.
async fn send(inner: Arc<Inner>, call: Arc<Call>) {
    let _sending = inner.sending.lock().await;

    let seq = {
        let mut state = inner.state.lock();
        if state.closing || state.shutdown {
            None
        } else {
            let seq = state.seq;
            state.seq += 1;
            call.set_seq(seq);
            state.pending.insert(seq, Arc::clone(&call));
            Some(seq)
        }
    };
    let Some(seq) = seq else {
        call.fail(RpcError::Shutdown);
        return;
    };

    let header = Header::request(call.service_method.clone(), seq);
    if let Err(err) = inner.codec.write(&header, &call.args).await {
        // The receive loop may have raced us and completed it already.
        if let Some(call) = remove_call(&inner, seq) {
            call.fail(err);
        }
    }
}

fn remove_call(inner: &Inner, seq: Seq) -> Option<Arc<Call>> {
    inner.state.lock().pending.remove(&seq)
}

/// The receive loop: correlates response frames to pending calls until
/// the connection fails or the client closes, then tears down.
async fn receive(inner: Arc<Inner>, mut closed_rx: watch::Receiver<bool>) {
    let err = loop {
        let header = tokio::select! {
            read = inner.codec.read_header() => match read {
                Ok(header) => header,
                Err(err) => break err,
            },
            _ = closed_rx.changed() => break RpcError::Shutdown,
        };

        match remove_call(&inner, header.seq) {
            // No pending call under this seq: a stray frame. Consume its
            // body and keep going.
            None => {
                if let Err(err) = inner.codec.read_body().await {
                    break err;
                }
            }
            Some(call) if header.is_error() => {
                call.set_error(RpcError::Remote(header.error));
                if let Err(err) = inner.codec.read_body().await {
                    call.complete();
                    break err;
                }
                call.complete();
            }
            Some(call) => match inner.codec.read_body().await {
                Ok(reply) => {
                    call.set_reply(reply);
                    call.complete();
                }
                Err(err) => {
                    let failure = RpcError::Connection(format!("read body: {err}"));
                    call.fail(failure);
                    break err;
                }
            },
        }
    };
    terminate(&inner, err).await;
}

/// Fails every pending call with the terminal error. Runs exactly once,
/// when the receive loop exits.
async fn terminate(inner: &Inner, err: RpcError) {
    let _sending = inner.sending.lock().await;
    let (drained, closing) = {
        let mut state = inner.state.lock();
        state.shutdown = true;
        let drained: Vec<Arc<Call>> = state.pending.drain().map(|(_, call)| call).collect();
        (drained, state.closing)
    };

    if !drained.is_empty() {
        debug!("terminating {} pending calls: {err}", drained.len());
    }
    for call in drained {
        if closing {
            call.fail(RpcError::Shutdown);
        } else {
            call.fail(RpcError::Connection(err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxrpc_common::codec::{JsonCodec, JSON_ID};
    use serde_json::json;
    use std::time::Duration;

    /// A client over one end of an in-memory duplex; the other end is
    /// returned raw so tests can play the server.
    async fn duplex_client() -> (Client, JsonCodec) {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let client = Client::new_client(local, Some(ConnectOptions::with_codec(JSON_ID)))
            .await
            .unwrap();

        let mut server_side = Connection::new(remote);
        let options = server_side.read_options().await.unwrap();
        assert_eq!(options.codec, JSON_ID);
        (client, JsonCodec::new(server_side))
    }

    #[tokio::test]
    async fn test_unknown_codec_rejected_before_io() {
        let (local, _remote) = tokio::io::duplex(64);
        let err = Client::new_client(local, Some(ConnectOptions::with_codec("application/bogus")))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownCodec(_)));
    }

    #[tokio::test]
    async fn test_call_round_trip_over_duplex() {
        let (client, server) = duplex_client().await;

        // Echo server for one request.
        tokio::spawn(async move {
            let header = server.read_header().await.unwrap();
            let body = server.read_body().await.unwrap();
            server.write(&header, &body).await.unwrap();
        });

        let reply: i64 = client.call("Echo.Same", &7).await.unwrap();
        assert_eq!(reply, 7);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_seq_assignment_is_dense_from_one() {
        let (client, server) = duplex_client().await;

        tokio::spawn(async move {
            for _ in 0..3 {
                let header = server.read_header().await.unwrap();
                let body = server.read_body().await.unwrap();
                server.write(&header, &body).await.unwrap();
            }
        });

        let mut seqs = Vec::new();
        for n in 0..3 {
            let (done_tx, mut done_rx) = mpsc::channel(DONE_BUFFER);
            let call = client.go("Echo.Same", json!(n), done_tx);
            let _ = done_rx.recv().await;
            seqs.push(call.seq());
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_header_error_surfaces_on_call() {
        let (client, server) = duplex_client().await;

        tokio::spawn(async move {
            let mut header = server.read_header().await.unwrap();
            let _ = server.read_body().await.unwrap();
            header.error = "can't find method Bogus".to_string();
            server.write(&header, &Value::Null).await.unwrap();
        });

        let err = client.call::<_, i64>("Foo.Bogus", &1).await.unwrap_err();
        assert!(err.to_string().contains("can't find method Bogus"));
    }

    #[tokio::test]
    async fn test_close_is_single_shot() {
        let (client, _server) = duplex_client().await;
        assert!(client.is_available());

        client.close().await.unwrap();
        assert!(!client.is_available());

        let err = client.close().await.unwrap_err();
        assert!(err.is_shutdown());
    }

    #[tokio::test]
    async fn test_submit_after_close_fails_with_shutdown() {
        let (client, _server) = duplex_client().await;
        client.close().await.unwrap();

        let err = client.call::<_, i64>("Echo.Same", &1).await.unwrap_err();
        assert!(err.is_shutdown());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_server_disappearing_terminates_pending() {
        let (client, server) = duplex_client().await;

        // Swallow one request, then drop the connection.
        tokio::spawn(async move {
            let _ = server.read_header().await.unwrap();
            let _ = server.read_body().await.unwrap();
            drop(server);
        });

        let err = client.call::<_, i64>("Echo.Same", &1).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_shutdown());
        assert_eq!(client.pending_calls(), 0);

        // The engine is shut down for good.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_stray_response_is_discarded() {
        let (client, server) = duplex_client().await;

        tokio::spawn(async move {
            // A response nobody asked for, then the real one.
            server
                .write(&Header::request("Echo.Same", 999), &json!("stray"))
                .await
                .unwrap();
            let header = server.read_header().await.unwrap();
            let body = server.read_body().await.unwrap();
            server.write(&header, &body).await.unwrap();
        });

        let reply: i64 = client.call("Echo.Same", &5).await.unwrap();
        assert_eq!(reply, 5);
    }
}
