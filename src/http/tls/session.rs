//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{encode_alpn, TlsConfig, TlsError, H2_ALPN};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result};
use openssl::ssl::{Ssl, SslStream};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// TLS session operations
///
/// Wraps an OpenSSL SslStream and provides poll/read/write/close operations.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Create a client TLS connection (perform handshake)
    ///
    /// `servername` is sent as SNI and, when peer verification is enabled,
    /// checked against the presented certificate.
    pub fn connect(
        tcp_stream: TcpStream,
        config: &TlsConfig,
        servername: &str,
    ) -> std::result::Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        ssl.set_hostname(servername)?;
        if config.verify_peer {
            ssl.param_mut().set_host(servername)?;
        }

        // A caller-supplied context may not carry ALPN; set it per session
        ssl.set_alpn_protos(&encode_alpn(&[H2_ALPN]))?;

        // Blocking handshake; the read loop starts only afterwards
        let stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// Check if TLS failed
    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        // Decrypted bytes may already be buffered inside OpenSSL
        if (events == PollEvents::Read || events == PollEvents::Both)
            && self.stream.ssl().pending() > 0
        {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::from(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::from(e))
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::from(e)
        })
    }

    fn close(&mut self) -> Result<()> {
        // Perform SSL shutdown if not failed
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        use std::net::Shutdown;
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn socket(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.stream.ssl().selected_alpn_protocol().map(|p| p.to_vec())
    }
}
