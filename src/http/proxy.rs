//! HTTP CONNECT tunnel establishment
//!
//! Opens a raw byte tunnel through an HTTP proxy before any TLS or HTTP/2
//! bytes are exchanged with the real target.

use super::{Error, Result, CRLF, DEFAULT_HTTP_PORT};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use std::io::{Read, Write};

/// Upper bound on the proxy's response head
const MAX_RESPONSE_HEAD: usize = 8192;

/// Proxy settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy address, either a bare host or a URI such as `http://proxy.local`
    pub addr: String,
    /// Proxy port
    pub port: u16,
    /// Username for Basic proxy authentication
    pub user: Option<String>,
    /// Password for Basic proxy authentication
    pub pass: Option<String>,
}

impl ProxyConfig {
    /// Proxy without credentials
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        ProxyConfig {
            addr: addr.into(),
            port,
            user: None,
            pass: None,
        }
    }

    /// Attach Basic credentials
    pub fn credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Host part of the proxy address
    pub fn host(&self) -> Result<String> {
        if self.addr.contains("://") {
            let parsed = url::Url::parse(&self.addr)
                .map_err(|e| Error::InvalidUri(format!("{}: {}", self.addr, e)))?;
            parsed
                .host_str()
                .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
                .ok_or_else(|| Error::InvalidUri(format!("proxy address has no host: {}", self.addr)))
        } else if self.addr.is_empty() {
            Err(Error::InvalidUri("empty proxy address".to_string()))
        } else {
            Ok(self.addr.clone())
        }
    }

    /// Port to dial, falling back to 80 when unset
    pub fn port_or_default(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_HTTP_PORT
        } else {
            self.port
        }
    }

    /// `Basic` credential token, when a user is configured
    pub fn basic_auth(&self) -> Option<String> {
        self.user.as_ref().map(|user| {
            let pass = self.pass.as_deref().unwrap_or("");
            BASE64_STANDARD.encode(format!("{}:{}", user, pass))
        })
    }
}

/// Build the CONNECT request head for `authority` (`host:port`, IPv6
/// literals bracketed)
pub fn connect_request(authority: &str, basic_auth: Option<&str>) -> String {
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1{CRLF}Host: {authority}{CRLF}",
        authority = authority,
        CRLF = CRLF
    );
    if let Some(token) = basic_auth {
        request.push_str(&format!("Proxy-Authorization: Basic {}{}", token, CRLF));
    }
    request.push_str(CRLF);
    request
}

/// Establish an HTTP CONNECT tunnel over an already-open proxy stream
///
/// Reads the proxy's response head byte by byte so that nothing past the
/// terminating blank line is consumed from the tunnel.
pub fn establish_tunnel<S: Read + Write>(
    stream: &mut S,
    authority: &str,
    proxy: &ProxyConfig,
) -> Result<()> {
    let request = connect_request(authority, proxy.basic_auth().as_deref());
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let head = read_response_head(stream)?;
    let status_line = head.lines().next().unwrap_or("").trim();

    if !is_success_status(status_line) {
        return Err(Error::Proxy(format!("CONNECT failed: {}", status_line)));
    }

    tracing::debug!(authority, "proxy tunnel established");
    Ok(())
}

fn read_response_head<S: Read>(stream: &mut S) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(Error::Proxy(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);

        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Proxy("CONNECT response head too large".to_string()));
        }
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// `HTTP/1.x 2xx ...`
fn is_success_status(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    version.starts_with("HTTP/1.") && code.len() == 3 && code.starts_with('2')
}
