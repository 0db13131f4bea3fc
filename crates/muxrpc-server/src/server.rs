//! Connection serving: handshake, request intake, dispatch workers, and
//! the shared response path.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use muxrpc_common::codec::{self, Codec, Connection};
use muxrpc_common::{Result, RpcError, MAGIC};

use crate::service::Service;

/// RPC server: a registry of services plus per-connection serving.
///
/// The server is shared behind an `Arc`: the accept loop clones it into
/// one task per connection, and each connection clones its codec into one
/// worker per request. Responses for a connection all funnel through the
/// codec's single write path, so frames never interleave.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Server {
            services: RwLock::new(HashMap::new()),
        })
    }

    /// Registers `service`. The first registration of a name wins;
    /// a duplicate fails without touching the registry.
    ///
    /// The returned handle can be kept to observe per-method invocation
    /// counters.
    pub fn register(&self, service: Service) -> Result<Arc<Service>> {
        let mut services = self.services.write();
        match services.entry(service.name().to_string()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateService(service.name().to_string())),
            Entry::Vacant(slot) => {
                let service = Arc::new(service);
                slot.insert(Arc::clone(&service));
                debug!(service = service.name(), "registered service");
                Ok(service)
            }
        }
    }

    /// Resolves a `"Service.Method"` address, splitting on the last dot.
    /// A missing dot, an unknown service, and an unknown method are three
    /// distinct errors.
    fn lookup(&self, service_method: &str) -> Result<(Arc<Service>, String)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::IllFormedServiceMethod(service_method.to_string()))?;

        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownService(service_name.to_string()))?;
        if !service.has_method(method_name) {
            return Err(RpcError::UnknownMethod(method_name.to_string()));
        }
        Ok((service, method_name.to_string()))
    }

    /// Accept loop: serves every connection from `listener`, one task
    /// per connection. Accept failures are logged and do not stop the
    /// loop.
    pub async fn accept(self: &Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let server = Arc::clone(self);
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
                Err(err) => error!("accept error: {err}"),
            }
        }
    }

    /// Serves one connection: reads the bootstrap handshake, negotiates
    /// the codec, then runs the framed request loop. Handshake failures
    /// drop the connection without a response.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut conn = Connection::new(stream);
        let options = match conn.read_options().await {
            Ok(options) => options,
            Err(err) => {
                debug!("handshake read failed: {err}");
                return;
            }
        };
        if options.magic != MAGIC {
            warn!("invalid magic number {:#x}", options.magic);
            return;
        }
        let codec = match codec::instantiate(&options.codec, conn) {
            Ok(codec) => codec,
            Err(err) => {
                warn!("handshake rejected: {err}");
                return;
            }
        };
        self.serve_codec(codec).await;
    }

    /// The per-connection loop. Requests are read in order; well-formed
    /// ones are handled concurrently, each on its own worker. When intake
    /// stops (any read failure, including clean EOF) the loop drains the
    /// in-flight workers and only then releases the stream.
    async fn serve_codec(self: Arc<Self>, codec: Box<dyn Codec>) {
        let codec: Arc<dyn Codec> = Arc::from(codec);
        let mut workers = JoinSet::new();

        loop {
            let mut header = match codec.read_header().await {
                Ok(header) => header,
                Err(err) => {
                    debug!("request intake stopped: {err}");
                    break;
                }
            };

            // Resolve before touching the body so decode targets the
            // right argument type. The body record is consumed even when
            // resolution fails, to keep the stream aligned for the next
            // header.
            let resolved = self.lookup(&header.service_method);
            let body = match codec.read_body().await {
                Ok(body) => Ok(body),
                Err(err) if err.is_fatal() => {
                    debug!("request intake stopped: {err}");
                    break;
                }
                Err(err) => Err(err),
            };

            let request = resolved.and_then(|(service, method)| {
                let arg = service.new_arg(&method, body?)?;
                Ok((service, method, arg))
            });

            match request {
                Err(err) => {
                    // The header was readable: answer with the error text
                    // and a placeholder body, then keep reading.
                    header.error = err.to_string();
                    if let Err(write_err) = codec.write(&header, &Value::Null).await {
                        error!("failed to send error response: {write_err}");
                    }
                }
                Ok((service, method, arg)) => {
                    let codec = Arc::clone(&codec);
                    workers.spawn(async move {
                        let mut header = header;
                        let handler_service = Arc::clone(&service);
                        let handler_method = method.clone();
                        let outcome = tokio::task::spawn_blocking(move || {
                            handler_service.call(&handler_method, arg)
                        })
                        .await;

                        let body = match outcome {
                            Ok(Ok(reply)) => reply,
                            Ok(Err(err)) => {
                                header.error = err.to_string();
                                Value::Null
                            }
                            Err(join_err) => {
                                header.error = format!("method {method} panicked: {join_err}");
                                Value::Null
                            }
                        };
                        if let Err(err) = codec.write(&header, &body).await {
                            error!("failed to send response: {err}");
                        }
                    });
                }
            }
        }

        while workers.join_next().await.is_some() {}
        if let Err(err) = codec.close().await {
            debug!("codec close failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxrpc_common::codec::{JsonCodec, JSON_ID};
    use muxrpc_common::{ConnectOptions, Header};
    use serde_json::json;

    use crate::service::MethodError;

    #[derive(Default)]
    struct Arith;

    fn arith_server() -> Arc<Server> {
        let server = Server::new();
        server
            .register(
                Service::build("Arith", Arith::default())
                    .method("Double", |_arith: &Arith, n: i64, reply: &mut i64| {
                        *reply = n * 2;
                        Ok(())
                    })
                    .method("Fail", |_arith: &Arith, _n: i64, _reply: &mut i64| {
                        Err(MethodError::new("intentional failure"))
                    })
                    .finish()
                    .unwrap(),
            )
            .unwrap();
        server
    }

    /// Drives a served duplex connection with raw frames.
    async fn raw_session(server: Arc<Server>) -> JsonCodec {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        tokio::spawn(server.serve_conn(remote));

        let mut conn = Connection::new(local);
        conn.write_options(&ConnectOptions::with_codec(JSON_ID))
            .await
            .unwrap();
        JsonCodec::new(conn)
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let server = arith_server();
        let err = server
            .register(
                Service::build("Arith", Arith::default())
                    .method("Double", |_arith: &Arith, n: i64, reply: &mut i64| {
                        *reply = n * 3;
                        Ok(())
                    })
                    .finish()
                    .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateService(_)));

        // The original registration is untouched.
        let (service, method) = server.lookup("Arith.Double").unwrap();
        let arg = service.new_arg(&method, json!(2)).unwrap();
        assert_eq!(service.call(&method, arg).unwrap(), json!(4));
    }

    #[test]
    fn test_lookup_errors_are_distinct() {
        let server = arith_server();
        assert!(matches!(
            server.lookup("Foobar").unwrap_err(),
            RpcError::IllFormedServiceMethod(_)
        ));
        assert!(matches!(
            server.lookup("Nope.Double").unwrap_err(),
            RpcError::UnknownService(_)
        ));
        assert!(matches!(
            server.lookup("Arith.Bogus").unwrap_err(),
            RpcError::UnknownMethod(_)
        ));
    }

    #[test]
    fn test_lookup_splits_on_last_dot() {
        let server = Server::new();
        // "a.b.C" addresses method C on a service named "a.b", which can
        // never be registered; the point is the split position.
        assert!(matches!(
            server.lookup("a.b.C").unwrap_err(),
            RpcError::UnknownService(_)
        ));
    }

    #[tokio::test]
    async fn test_serve_conn_happy_path() {
        let codec = raw_session(arith_server()).await;

        codec
            .write(&Header::request("Arith.Double", 1), &json!(21))
            .await
            .unwrap();

        let header = codec.read_header().await.unwrap();
        assert_eq!(header.seq, 1);
        assert!(!header.is_error());
        assert_eq!(codec.read_body().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_serve_conn_unknown_method() {
        let codec = raw_session(arith_server()).await;

        codec
            .write(&Header::request("Arith.Bogus", 7), &json!(1))
            .await
            .unwrap();

        let header = codec.read_header().await.unwrap();
        assert_eq!(header.seq, 7);
        assert!(header.error.contains("can't find method Bogus"));
        assert_eq!(codec.read_body().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_serve_conn_stays_aligned_after_bad_request() {
        let codec = raw_session(arith_server()).await;

        // Body that fails to decode as i64, then a well-formed request.
        codec
            .write(&Header::request("Arith.Double", 1), &json!("oops"))
            .await
            .unwrap();
        codec
            .write(&Header::request("Arith.Double", 2), &json!(5))
            .await
            .unwrap();

        let first = codec.read_header().await.unwrap();
        assert_eq!(first.seq, 1);
        assert!(first.is_error());
        let _ = codec.read_body().await.unwrap();

        let second = codec.read_header().await.unwrap();
        assert_eq!(second.seq, 2);
        assert!(!second.is_error());
        assert_eq!(codec.read_body().await.unwrap(), json!(10));
    }

    #[tokio::test]
    async fn test_serve_conn_method_error_in_header() {
        let codec = raw_session(arith_server()).await;

        codec
            .write(&Header::request("Arith.Fail", 3), &json!(1))
            .await
            .unwrap();

        let header = codec.read_header().await.unwrap();
        assert!(header.error.contains("intentional failure"));
        assert_eq!(codec.read_body().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_bad_magic_drops_connection() {
        let server = arith_server();
        let (local, remote) = tokio::io::duplex(1024);
        tokio::spawn(server.serve_conn(remote));

        let mut conn = Connection::new(local);
        conn.write_options(&ConnectOptions {
            magic: 0,
            codec: JSON_ID.to_string(),
        })
        .await
        .unwrap();

        // The server closes without answering; the next read sees EOF.
        let codec = JsonCodec::new(conn);
        assert!(codec.read_header().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_codec_drops_connection() {
        let server = arith_server();
        let (local, remote) = tokio::io::duplex(1024);
        tokio::spawn(server.serve_conn(remote));

        let mut conn = Connection::new(local);
        conn.write_options(&ConnectOptions::with_codec("application/bogus"))
            .await
            .unwrap();

        let codec = JsonCodec::new(conn);
        assert!(codec.read_header().await.is_err());
    }
}
