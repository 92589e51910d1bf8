//! Network Module Implementation
//!
//! Everything between an accepted socket and a decoded protocol unit.
//!
//! # Components
//!
//! - `ConnectionPool` / `PoolPermit`: admission control, one slot per served connection
//! - `ProtocolDetector` / `ProtocolRegistry`: sniff the first bytes of a stream and pick
//!   http, a registered binary protocol, or the default handler
//! - `Rewind`: puts the sniffed bytes back in front of the stream
//! - `Connection`: buffered reads with a per-read timeout, http request and websocket
//!   frame decoding, atomic response writes

pub use connection::Connection;
pub use detector::{
    is_http_prefix, CustomProtocolHandler, HandlerFuture, Protocol, ProtocolDetector,
    ProtocolRegistry, PEEK_SIZE,
};
pub use pool::{ConnectionPool, PoolPermit};
pub use rewind::{BoxedStream, IoStream, Rewind};

mod connection;
mod detector;
mod pool;
mod rewind;
