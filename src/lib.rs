//! # tcpline
//!
//! Framing and dispatch for length-prefixed request/response TCP
//! services.
//!
//! Every message is a 32-bit big-endian header followed by payload bytes;
//! a negative header carries a pipelined batch of length-prefixed
//! sub-frames. On top of that wire format this crate provides:
//!
//! - a [`Server`] that accepts many concurrent clients and fans pipelined
//!   sub-requests out to parallel workers, reassembling the responses in
//!   request order,
//! - a [`Client`] with a lazy connection pool, bounded retries, and a
//!   buffered [`Pipeline`] for batched requests,
//! - a per-request [`Span`] that accumulates timings, counters, and
//!   attributes and delivers them to a pluggable [`StatsRecorder`],
//! - a [`TypedService`] adapter for MsgPack-typed request/response
//!   handlers.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tcpline::{handler_fn, Client, Server};
//!
//! #[tokio::main]
//! async fn main() -> tcpline::Result<()> {
//!     let server = Arc::new(Server::bind("127.0.0.1:2001", handler_fn(|req, span| {
//!         span.attr("command", "PING");
//!         Ok(req.to_vec())
//!     })).await?);
//!     tokio::spawn({
//!         let server = server.clone();
//!         async move { server.serve().await }
//!     });
//!
//!     let client = Client::connect(
//!         vec!["127.0.0.1:2001".into()],
//!         3,
//!         Duration::from_secs(3),
//!     ).await?;
//!     let pong = client.send_recv(b"PING").await?;
//!     assert_eq!(pong, b"PING");
//!     server.close()
//! }
//! ```

pub mod codec;
pub mod error;
pub mod pool;
pub mod span;
pub mod stats;
pub mod typed;
pub mod wire;

mod client;
mod server;

pub use client::{Client, Pipeline, DEFAULT_IO_TIMEOUT, DEFAULT_RETRIES};
pub use error::{Result, TcplineError};
pub use pool::ConnectionPool;
pub use server::{handler_fn, BoxFuture, Handler, Server, ServerBuilder, READ_DEADLINE};
pub use span::{default_id_generator, IdGenerator, Span, SubSpan};
pub use stats::{DebugStatsRecorder, StatsRecorder, StatsdRecorder};
pub use typed::TypedService;
