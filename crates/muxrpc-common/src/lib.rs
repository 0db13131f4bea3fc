//! muxrpc Common Types and Codecs
//!
//! This crate provides the shared protocol definitions and the framed
//! codec layer for the muxrpc runtime: a client/server pair that
//! multiplexes many concurrent method invocations over a single
//! byte-stream connection.
//!
//! # Wire Protocol
//!
//! Per connection, in order:
//!
//! 1. One bootstrap line: the [`ConnectOptions`] handshake, encoded as a
//!    single line of JSON so both sides can parse it before a codec has
//!    been negotiated.
//! 2. Zero or more framed messages in the negotiated codec. Each message
//!    is a [`Header`] record immediately followed by its body record.
//!
//! # Components
//!
//! - [`protocol`] - Header, handshake options, and the error type
//! - [`codec`] - The [`Codec`] trait, both built-in codecs, and the
//!   process-wide codec registry

pub mod codec;
pub mod protocol;

pub use codec::{register_codec, Codec, CodecFactory, Connection};
pub use protocol::{ConnectOptions, Header, Result, RpcError, Seq, MAGIC};
