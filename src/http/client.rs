//! HTTP/2 client
//!
//! `Client` multiplexes exchanges over one lazily built connection. Requests
//! are either awaited synchronously with `call`, or dispatched with
//! `call_async` and collected with `join`. A failed connection is replaced
//! transparently on the next dispatch.
//!
//! Failures detected off the caller's thread (read loop, idle watchdog) go
//! to the exchange's own `error` subscriber, then to the client's `error`
//! subscriber; if neither exists they are raised by the next `join`.

use super::events::{Emitter, Event};
use super::h2::connection::{ConnectionConfig, ConnectionManager, ConnectionObserver};
use super::h2::exchange::{Exchange, SettleObserver};
use super::h2::settings::{RemoteSettings, Settings};
use super::proxy::ProxyConfig;
use super::tls::TlsConfig;
use super::transport::Target;
use super::{lock, Error, Headers, Method, Result, TimeoutKind};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default bound on establishing the TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on a synchronous call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection-wide options
#[derive(Clone)]
pub struct ClientOptions {
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    tls: Option<TlsConfig>,
    proxy: Option<ProxyConfig>,
    settings: Settings,
}

impl ClientOptions {
    pub fn new() -> Self {
        ClientOptions {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            tls: None,
            proxy: None,
            settings: Settings::client_defaults(),
        }
    }

    /// Bound on the TCP handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Fail the connection after this long without reading from the peer
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// TLS context for `https` targets; `h2` is always offered via ALPN
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Tunnel through an HTTP proxy with CONNECT
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// SETTINGS advertised in the connection preface
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request options for `prepare_request` and `call`
#[derive(Debug, Clone)]
pub struct RequestOptions {
    headers: Headers,
    body: Option<Bytes>,
    params: Vec<(String, String)>,
    timeout: Duration,
}

impl RequestOptions {
    pub fn new() -> Self {
        RequestOptions {
            headers: Headers::new(),
            body: None,
            params: Vec::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Add a request header; the name is lower-cased
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add every header from `headers`
    pub fn headers(mut self, headers: &Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Request body; sets `content-length`
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Query parameter, form-urlencoded into the path
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Bound on a synchronous call
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A completed response
#[derive(Debug, Clone)]
pub struct Response {
    headers: Headers,
    body: Bytes,
}

impl Response {
    pub(crate) fn new(headers: Headers, body: Bytes) -> Self {
        Response { headers, body }
    }

    /// Response headers, pseudo-headers included
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Numeric `:status`
    pub fn status(&self) -> Option<u16> {
        self.headers.get(":status")?.parse().ok()
    }

    /// True for a 2xx status
    pub fn is_ok(&self) -> bool {
        matches!(self.status(), Some(200..=299))
    }
}

/// Kinds a client subscriber can listen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Error,
}

/// Payload handed to client subscribers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A failure that left the connection or an unhandled exchange
    Error(Error),
}

impl Event for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::Error(_) => ClientEventKind::Error,
        }
    }
}

struct JoinState {
    /// Keys of dispatched exchanges still in flight
    pending: HashSet<u64>,
    /// Failure waiting to be raised by `join`
    error: Option<Error>,
}

/// Pending set plus the client-level error channel
struct Dispatcher {
    state: Mutex<JoinState>,
    changed: Condvar,
    events: Emitter<ClientEvent>,
}

impl Dispatcher {
    fn new() -> Self {
        Dispatcher {
            state: Mutex::new(JoinState {
                pending: HashSet::new(),
                error: None,
            }),
            changed: Condvar::new(),
            events: Emitter::new(),
        }
    }

    fn track(&self, key: u64) {
        lock(&self.state).pending.insert(key);
    }

    /// Hand a failure to the client subscriber, or keep it for `join`
    fn report(&self, err: &Error, store: bool) {
        if self.events.emit(&ClientEvent::Error(err.clone())) > 0 {
            return;
        }
        if store {
            lock(&self.state).error = Some(err.clone());
            self.changed.notify_all();
        }
    }

    fn join(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.state);

        loop {
            if let Some(err) = state.error.take() {
                return Err(err);
            }
            if state.pending.is_empty() {
                return Ok(());
            }

            state = match deadline {
                None => self.changed.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(TimeoutKind::Exceeded));
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

impl SettleObserver for Dispatcher {
    fn settled(&self, key: u64) {
        lock(&self.state).pending.remove(&key);
        self.changed.notify_all();
    }
}

impl ConnectionObserver for Dispatcher {
    fn connection_failed(&self, cause: &Error, unhandled: bool) {
        self.report(cause, unhandled);
    }

    fn exchange_failed(&self, err: &Error) {
        self.report(err, true);
    }
}

/// HTTP/2 client for one origin
pub struct Client {
    uri: String,
    target: Target,
    manager: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    /// Client with default options; nothing is connected yet
    pub fn new(uri: &str) -> Result<Self> {
        Self::with_options(uri, ClientOptions::default())
    }

    pub fn with_options(uri: &str, options: ClientOptions) -> Result<Self> {
        let target = Target::parse(uri)?;
        let dispatcher = Arc::new(Dispatcher::new());

        let config = ConnectionConfig {
            target: target.clone(),
            connect_timeout: options.connect_timeout,
            idle_timeout: options.idle_timeout,
            tls: options.tls,
            proxy: options.proxy,
            settings: options.settings,
        };
        let observer: Arc<dyn ConnectionObserver> = dispatcher.clone();

        Ok(Client {
            uri: uri.to_string(),
            target,
            manager: ConnectionManager::new(config, observer),
            dispatcher,
        })
    }

    /// Target URI as given
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether the target is reached over TLS
    pub fn is_ssl(&self) -> bool {
        self.target.is_tls()
    }

    /// Subscribe to failures no exchange handled
    ///
    /// With a subscriber registered, `join` no longer raises them.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.dispatcher.events.on(ClientEventKind::Error, move |event| {
            let ClientEvent::Error(err) = event;
            handler(err);
        });
    }

    /// Build an exchange without sending it
    pub fn prepare_request(&self, method: Method, path: &str, options: RequestOptions) -> Exchange {
        let RequestOptions {
            headers: user_headers,
            body,
            params,
            timeout,
        } = options;

        let mut headers = Headers::new();
        headers.insert(":scheme", self.target.scheme.as_str());
        headers.insert(":method", method.as_str());
        headers.insert(":path", path_with_params(path, &params));
        let authority = user_headers
            .get(":authority")
            .map(str::to_string)
            .unwrap_or_else(|| self.target.authority());
        headers.insert(":authority", authority);

        for (name, value) in user_headers.iter().filter(|(name, _)| !name.starts_with(':')) {
            headers.insert(name, value);
        }

        match &body {
            Some(body) => headers.set("content-length", body.len().to_string()),
            None => {
                headers.remove("content-length");
            }
        }

        Exchange::new(method, headers, body, timeout)
    }

    /// Send a request and wait for the response
    ///
    /// Failures are returned here and never reach `join` or the client's
    /// `error` subscriber.
    pub fn call(&self, method: Method, path: &str, options: RequestOptions) -> Result<Response> {
        let exchange = self.prepare_request(method, path, options);
        exchange.begin_dispatch(None, true)?;

        if let Err(err) = self.manager.submit(&exchange) {
            exchange.fail(err.clone());
            return Err(err);
        }
        exchange.wait(exchange.timeout())
    }

    /// Send a prepared exchange without waiting
    ///
    /// Connection build and write failures are returned directly; the
    /// exchange is failed and does not stay pending.
    pub fn call_async(&self, exchange: &Exchange) -> Result<()> {
        let observer: Arc<dyn SettleObserver> = self.dispatcher.clone();
        exchange.begin_dispatch(Some(observer), false)?;
        self.dispatcher.track(exchange.key());

        if let Err(err) = self.manager.submit(exchange) {
            exchange.fail(err.clone());
            exchange.settle();
            return Err(err);
        }
        Ok(())
    }

    /// Wait until every dispatched exchange has finished
    ///
    /// Raises the latest failure nobody handled. An elapsed `timeout`
    /// yields `Error::Timeout(TimeoutKind::Exceeded)` and leaves the
    /// exchanges running.
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        self.dispatcher.join(timeout)
    }

    /// The peer's settings, or protocol defaults before any were received
    pub fn remote_settings(&self) -> RemoteSettings {
        self.manager.remote_settings()
    }

    /// Exchanges in flight on the live connection
    pub fn stream_count(&self) -> usize {
        self.manager.stream_count()
    }

    /// Tear down the connection; open exchanges fail with `Error::Closed`
    pub fn close(&self) {
        self.manager.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn path_with_params(path: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{}{}{}", path, separator, query)
}
