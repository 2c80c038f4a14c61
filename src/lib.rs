//! h2mux - blocking, multiplexed HTTP/2 client engine
//!
//! This crate drives many concurrent request/response exchanges over a
//! single HTTP/2 connection (plain TCP or TLS, optionally tunneled through an
//! HTTP proxy). A background read loop owns the wire protocol; callers submit
//! exchanges synchronously or asynchronously and `join` on them.

pub mod http;

pub use http::client::{Client, ClientOptions, RequestOptions, Response};
pub use http::h2::exchange::Exchange;
pub use http::{Error, Headers, Method, Result, TimeoutKind};
