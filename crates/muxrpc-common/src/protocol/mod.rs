//! Core protocol types: the per-frame header, the handshake options, and
//! the error type shared by every muxrpc crate.

pub mod error;
pub mod handshake;
pub mod header;

pub use error::{Result, RpcError};
pub use handshake::{ConnectOptions, MAGIC};
pub use header::{Header, Seq};
