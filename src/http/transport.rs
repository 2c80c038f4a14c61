//! Transport establishment
//!
//! Resolves the target, optionally tunnels through an HTTP proxy, optionally
//! wraps the socket in TLS, and hands back a ready `SessionOps`. There is no
//! retry here; the connection manager decides when to rebuild.

use super::proxy::{self, ProxyConfig};
use super::session::{FdSessionOps, SessionOps};
use super::tls::{TlsConfig, TlsSessionOps, H2_ALPN};
use super::{Error, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Where the client connects to, derived from its URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `http` or `https`
    pub scheme: String,
    /// Host name or address literal
    pub host: String,
    /// Port, defaulted from the scheme
    pub port: u16,
}

impl Target {
    /// Parse a target URI such as `https://example.com:8443`
    pub fn parse(uri: &str) -> Result<Self> {
        let parsed = url::Url::parse(uri).map_err(|e| Error::InvalidUri(format!("{}: {}", uri, e)))?;

        let scheme = parsed.scheme().to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" => DEFAULT_HTTP_PORT,
            "https" => DEFAULT_HTTPS_PORT,
            other => {
                return Err(Error::InvalidUri(format!("unsupported scheme: {}", other)));
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidUri(format!("missing host: {}", uri)))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();

        Ok(Target {
            scheme,
            host,
            port: parsed.port().unwrap_or(default_port),
        })
    }

    /// Whether the scheme requires TLS
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// `host:port`, as used for `:authority`
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Builds one connected session per call
pub struct TransportBuilder<'a> {
    target: &'a Target,
    tls: Option<&'a TlsConfig>,
    proxy: Option<&'a ProxyConfig>,
    connect_timeout: Duration,
}

impl<'a> TransportBuilder<'a> {
    /// Builder for a target with no proxy and default TLS
    pub fn new(target: &'a Target, connect_timeout: Duration) -> Self {
        TransportBuilder {
            target,
            tls: None,
            proxy: None,
            connect_timeout,
        }
    }

    /// Use this TLS context instead of the default one
    pub fn tls(mut self, tls: Option<&'a TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// Tunnel through this proxy
    pub fn proxy(mut self, proxy: Option<&'a ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Open the transport
    ///
    /// The proxy exchange and the TLS handshake are each bounded by the
    /// connect timeout; the returned session blocks without a timeout.
    pub fn connect(&self) -> Result<Box<dyn SessionOps>> {
        let session = self.handshake()?;
        session.socket().set_read_timeout(None)?;
        session.socket().set_write_timeout(None)?;
        Ok(session)
    }

    fn handshake(&self) -> Result<Box<dyn SessionOps>> {
        let (mut tcp, proxy_host) = match self.proxy {
            Some(proxy) => {
                let proxy_host = proxy.host()?;
                let tcp = tcp_connect(&proxy_host, proxy.port_or_default(), self.connect_timeout)?;
                (tcp, Some(proxy_host))
            }
            None => (
                tcp_connect(&self.target.host, self.target.port, self.connect_timeout)?,
                None,
            ),
        };
        tcp.set_read_timeout(Some(self.connect_timeout))?;
        tcp.set_write_timeout(Some(self.connect_timeout))?;

        if let Some(proxy) = self.proxy {
            proxy::establish_tunnel(&mut tcp, &self.target.authority(), proxy)?;
        }

        if !self.target.is_tls() {
            tracing::debug!(authority = %self.target.authority(), "plain transport ready");
            return Ok(Box::new(FdSessionOps::new(tcp)));
        }

        let default_tls;
        let tls = match self.tls {
            Some(tls) => tls,
            None => {
                default_tls = TlsConfig::default_client()?;
                &default_tls
            }
        };

        // Through a tunnel the certificate belongs to the tunnel endpoint
        let servername = proxy_host.as_deref().unwrap_or(&self.target.host);
        let session = TlsSessionOps::connect(tcp, tls, servername)?;

        match session.alpn_protocol() {
            Some(proto) if proto == H2_ALPN.as_bytes() => {
                tracing::debug!(servername, "TLS transport ready, h2 negotiated");
            }
            other => {
                tracing::warn!(
                    servername,
                    negotiated = ?other.map(|p| String::from_utf8_lossy(&p).into_owned()),
                    "peer did not select h2 via ALPN"
                );
            }
        }

        Ok(Box::new(session))
    }
}

/// Connect a TCP socket with a bound on the handshake
pub fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs = (host, port).to_socket_addrs()?;

    let mut last_err = None;
    for addr in addrs {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        match socket.connect_timeout(&addr.into(), timeout) {
            Ok(()) => {
                socket.set_nodelay(true)?;
                socket.set_keepalive(true)?;
                return Ok(socket.into());
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(Error::from(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}:{}", host, port),
        )
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_target_parse_defaults() {
        let target = Target::parse("http://localhost").unwrap();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 80);
        assert!(!target.is_tls());

        let target = Target::parse("https://example.com").unwrap();
        assert_eq!(target.port, 443);
        assert!(target.is_tls());
        assert_eq!(target.authority(), "example.com:443");
    }

    #[test]
    fn test_target_parse_explicit_port() {
        let target = Target::parse("https://bigbrother.com:9999").unwrap();
        assert_eq!(target.port, 9999);
        assert_eq!(target.authority(), "bigbrother.com:9999");
    }

    #[test]
    fn test_target_parse_rejects() {
        assert!(matches!(Target::parse("ftp://host"), Err(Error::InvalidUri(_))));
        assert!(matches!(Target::parse("not a uri"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn test_target_ipv6_authority() {
        let target = Target::parse("http://[::1]:8080").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.authority(), "[::1]:8080");
    }

    #[test]
    fn test_tcp_connect_refused() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = tcp_connect("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_plain_transport_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = Target::parse(&format!("http://127.0.0.1:{}", port)).unwrap();

        let session = TransportBuilder::new(&target, Duration::from_secs(1))
            .connect()
            .unwrap();
        assert!(session.alpn_protocol().is_none());
        assert_eq!(session.socket().peer_addr().unwrap().port(), port);
    }
}
