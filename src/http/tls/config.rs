//! TLS configuration
//!
//! This module provides the client TLS configuration builder. Whatever the
//! caller configures, sessions created from a `TlsConfig` always advertise
//! the `h2` application protocol.

use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use std::path::Path;

/// ALPN identifier for HTTP/2 over TLS
pub const H2_ALPN: &str = "h2";

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Encode protocol names in ALPN wire format (length-prefixed)
pub fn encode_alpn(protocols: &[&str]) -> Vec<u8> {
    let mut alpn_bytes = Vec::new();
    for proto in protocols {
        alpn_bytes.push(proto.len() as u8);
        alpn_bytes.extend_from_slice(proto.as_bytes());
    }
    alpn_bytes
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) verify_peer: bool,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    /// Wrap an existing OpenSSL context
    ///
    /// The `h2` ALPN identifier is still advertised on every session.
    pub fn from_context(ctx: SslContext, verify_peer: bool) -> Self {
        TlsConfig { ctx, verify_peer }
    }

    /// Default configuration: system trust store, peer verification on
    pub fn default_client() -> Result<Self, TlsError> {
        Self::client()?.build()
    }

    /// Whether the peer certificate is verified
    pub fn verifies_peer(&self) -> bool {
        self.verify_peer
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_default_verify_paths()?;
        ctx_builder.set_verify(SslVerifyMode::PEER);
        ctx_builder.set_alpn_protos(&encode_alpn(&[H2_ALPN]))?;

        Ok(ClientConfigBuilder {
            ctx_builder,
            verify_peer: true,
        })
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        self.ctx_builder
            .set_min_proto_version(Some(min.to_openssl_version()))?;
        self.ctx_builder
            .set_max_proto_version(Some(max.to_openssl_version()))?;
        Ok(self)
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: &str) -> Result<Self, TlsError> {
        self.ctx_builder.set_cipher_list(ciphers)?;
        Ok(self)
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        if verify {
            self.ctx_builder.set_verify(SslVerifyMode::PEER);
        } else {
            self.ctx_builder.set_verify(SslVerifyMode::NONE);
        }
        self
    }

    /// Trust an additional CA bundle (PEM)
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        self.ctx_builder.set_ca_file(path.as_ref())?;
        Ok(self)
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            verify_peer: self.verify_peer,
        })
    }
}
