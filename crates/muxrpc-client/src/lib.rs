//! muxrpc Client
//!
//! The client half of the muxrpc runtime. One connection carries many
//! concurrent calls: submissions are assigned monotonically increasing
//! sequence numbers, responses are correlated back through a pending
//! table, and teardown fails every outstanding call exactly once.
//!
//! # Example
//!
//! ```no_run
//! use muxrpc_client::Client;
//!
//! # #[tokio::main]
//! # async fn main() -> muxrpc_common::Result<()> {
//! let client = Client::dial("127.0.0.1:7000", None).await?;
//! let doubled: i64 = client.call("Arith.Double", &21).await?;
//! assert_eq!(doubled, 42);
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;

pub use call::Call;
pub use client::Client;
