//! TLS support for HTTP/2 connections
//!
//! # Architecture
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` defines client TLS settings (versions, ciphers, trust)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. The connection manager is unchanged - it transparently uses TLS operations
//!
//! Every session advertises `h2` through ALPN, including sessions built from
//! a caller-supplied OpenSSL context.

pub mod config;
pub mod session;

pub use config::{ClientConfigBuilder, TlsConfig, TlsError, TlsVersion, H2_ALPN};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
