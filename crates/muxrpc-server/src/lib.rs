//! muxrpc Server
//!
//! The server half of the muxrpc runtime: a registry of named services
//! with explicitly registered methods, and a per-connection loop that
//! reads framed requests in order, dispatches each on its own worker, and
//! writes responses back through a shared send path.
//!
//! # Example
//!
//! ```no_run
//! use muxrpc_server::{Server, Service};
//!
//! # #[tokio::main]
//! # async fn main() -> muxrpc_common::Result<()> {
//! struct Arith;
//!
//! let service = Service::build("Arith", Arith)
//!     .method("Double", |_arith: &Arith, n: i64, reply: &mut i64| {
//!         *reply = n * 2;
//!         Ok(())
//!     })
//!     .finish()?;
//!
//! let server = Server::new();
//! server.register(service)?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! server.accept(listener).await;
//! # Ok(())
//! # }
//! ```

pub mod server;
pub mod service;

pub use server::Server;
pub use service::{MethodError, Service, ServiceBuilder};
