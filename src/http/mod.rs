//! HTTP/2 client engine
//!
//! # Architecture
//!
//! The engine is layered leaf-first:
//!
//! - `SessionOps` abstracts over plain TCP and TLS byte streams
//! - `transport` builds a session (direct TCP or proxy CONNECT tunnel, then
//!   optional TLS with the `h2` ALPN identifier)
//! - `h2::engine` is a pure bytes-in/events-out adapter around the frame codec
//! - `h2::registry` maps stream identifiers to in-flight exchanges
//! - `h2::connection` owns the session, the read loop and the idle watchdog
//! - `client` is the dispatch/join coordinator exposed to applications
//!
//! # Examples
//!
//! ```no_run
//! use h2mux::{Client, ClientOptions, Method, RequestOptions};
//! use std::time::Duration;
//!
//! let client = Client::with_options(
//!     "https://example.com",
//!     ClientOptions::new().idle_timeout(Duration::from_secs(30)),
//! )
//! .unwrap();
//!
//! let exchange = client.prepare_request(Method::Get, "/", RequestOptions::new());
//! exchange.on_body_chunk(|chunk| println!("{} bytes", chunk.len()));
//! client.call_async(&exchange).unwrap();
//! client.join(Some(Duration::from_secs(5))).unwrap();
//! ```

pub mod client;
pub mod events;
pub mod h2;
pub mod headers;
pub mod message;
pub mod proxy;
pub mod session;
pub mod tls;
pub mod transport;

pub use client::{Client, ClientOptions, RequestOptions, Response};
pub use headers::Headers;
pub use message::Method;
pub use proxy::ProxyConfig;
pub use session::{FdSessionOps, PollEvents, SessionOps};

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which bounded wait ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No bytes were read from the peer within the idle window
    Idle,
    /// A caller-side wait (`join`, synchronous `call`) elapsed
    Exceeded,
}

impl TimeoutKind {
    /// Message carried by the timeout error
    pub fn message(&self) -> &'static str {
        match self {
            TimeoutKind::Idle => "Connection was idle",
            TimeoutKind::Exceeded => "Exceeded timeout",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Client errors
///
/// Errors are `Clone` because one connection failure is delivered to every
/// exchange that was open on it as well as to the join channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(Arc<io::Error>),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Timeout(TimeoutKind),

    #[error("Connection closed")]
    Closed,

    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

impl Error {
    /// Peer went away without a protocol-level goodbye
    pub fn remotely_closed() -> Self {
        Error::Transport(Arc::new(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Socket was remotely closed",
        )))
    }

    /// True for both idle and wait timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True for socket and TLS level failures
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Tls(_))
    }

    /// The timeout flavour, if this is a timeout
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            Error::Timeout(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<tls::TlsError> for Error {
    fn from(err: tls::TlsError) -> Self {
        Error::Tls(err.to_string())
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Default plain-text port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default TLS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
