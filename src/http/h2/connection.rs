//! Connection management
//!
//! A `Connection` is one live transport carrying an HTTP/2 session. It owns
//! the protocol engine, the stream registry, a background read loop and
//! the optional idle watchdog. A connection never recovers: once failed it
//! stays failed, and the `ConnectionManager` builds a fresh one on the next
//! submit.
//!
//! Lock order is engine, then registry, then session. Subscribers are
//! never invoked while any of these locks is held.

use super::engine::{EngineEvent, FrameRequest, ProtocolEngine};
use super::error::{protocol_error, ErrorCode};
use super::exchange::Exchange;
use super::registry::StreamRegistry;
use super::settings::{RemoteSettings, Settings};
use super::stream::StreamId;
use super::watchdog::Watchdog;
use crate::http::proxy::ProxyConfig;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::tls::TlsConfig;
use crate::http::transport::{Target, TransportBuilder};
use crate::http::{lock, Error, Result, TimeoutKind};
use bytes::BytesMut;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on one blocking poll; the loop re-checks for teardown
const POLL_TICK: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// Who hears about a teardown besides the exchanges it fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escalation {
    /// Nobody; the cause is explicit or already returned to a caller
    Silent,
    /// The observer, if an asynchronous exchange was swept along
    Swept,
    /// The observer, unless only synchronous calls were in flight
    Background,
}

/// Receives failures that leave the connection
pub(crate) trait ConnectionObserver: Send + Sync {
    /// The connection was torn down by `cause`
    ///
    /// `unhandled` is set when at least one exchange failed with no local
    /// handler for it.
    fn connection_failed(&self, cause: &Error, unhandled: bool);

    /// A single exchange failed with no local handler
    fn exchange_failed(&self, err: &Error);
}

/// Everything needed to build a connection
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub target: Target,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub tls: Option<TlsConfig>,
    pub proxy: Option<ProxyConfig>,
    pub settings: Settings,
}

/// One HTTP/2 connection and its read loop
pub struct Connection {
    id: usize,
    session: Mutex<Box<dyn SessionOps>>,
    /// Clone of the socket used to unblock the reader on teardown
    shutdown_handle: TcpStream,
    fd: RawFd,
    engine: Mutex<ProtocolEngine>,
    registry: Mutex<StreamRegistry>,
    failure: Mutex<Option<Error>>,
    remote_settings: RwLock<RemoteSettings>,
    watchdog: Mutex<Option<Watchdog>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    observer: Arc<dyn ConnectionObserver>,
}

impl Connection {
    /// Send the preface over a fresh session and start the read loop
    pub(crate) fn establish(
        session: Box<dyn SessionOps>,
        settings: Settings,
        idle_timeout: Option<Duration>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<Self>> {
        let shutdown_handle = session.socket().try_clone()?;
        let fd = shutdown_handle.as_raw_fd();
        let engine = ProtocolEngine::new(settings);
        let preface = engine.preface();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let conn = Arc::new(Connection {
            id,
            session: Mutex::new(session),
            shutdown_handle,
            fd,
            engine: Mutex::new(engine),
            registry: Mutex::new(StreamRegistry::new()),
            failure: Mutex::new(None),
            remote_settings: RwLock::new(RemoteSettings::default()),
            watchdog: Mutex::new(None),
            reader: Mutex::new(None),
            observer,
        });

        lock(&conn.session).write_all(&preface)?;

        if let Some(timeout) = idle_timeout {
            let weak = Arc::downgrade(&conn);
            let watchdog = Watchdog::start(timeout, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.fail(Error::Timeout(TimeoutKind::Idle), Escalation::Background);
                }
            })?;
            *lock(&conn.watchdog) = Some(watchdog);
        }

        let reader = Arc::clone(&conn);
        let handle = thread::Builder::new()
            .name(format!("h2mux-reader-{}", id))
            .spawn(move || reader.read_loop());
        match handle {
            Ok(handle) => *lock(&conn.reader) = Some(handle),
            Err(e) => {
                let err = Error::from(e);
                conn.fail(err.clone(), Escalation::Silent);
                return Err(err);
            }
        }

        tracing::debug!(connection = id, "HTTP/2 connection established");
        Ok(conn)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the connection can take new exchanges
    pub fn is_open(&self) -> bool {
        lock(&self.failure).is_none()
    }

    /// The cause the connection was torn down with
    pub fn failure(&self) -> Option<Error> {
        lock(&self.failure).clone()
    }

    /// Exchanges currently in flight
    pub fn stream_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Latest settings snapshot from the peer
    pub fn remote_settings(&self) -> RemoteSettings {
        *self.remote_settings.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Assign a stream and write the request
    ///
    /// A write failure tears the connection down; the submitted exchange
    /// is not failed here, the error is returned to the caller instead.
    /// Other asynchronous exchanges failing with it still reach the
    /// observer.
    pub(crate) fn submit(&self, exchange: &Exchange) -> Result<StreamId> {
        let mut engine = lock(&self.engine);
        if let Some(cause) = self.failure() {
            return Err(cause);
        }

        let stream_id = lock(&self.registry).open(exchange)?;
        let written = Self::write_request(&mut engine, &self.session, stream_id, exchange);

        match written {
            Ok(()) => {
                exchange.request_sent();
                tracing::trace!(
                    connection = self.id,
                    stream_id,
                    method = %exchange.method(),
                    path = exchange.path(),
                    "request submitted"
                );
                Ok(stream_id)
            }
            Err(err) => {
                engine.release_stream(stream_id);
                lock(&self.registry).close(stream_id);
                drop(engine);
                self.fail(err.clone(), Escalation::Swept);
                Err(err)
            }
        }
    }

    fn write_request(
        engine: &mut ProtocolEngine,
        session: &Mutex<Box<dyn SessionOps>>,
        stream_id: StreamId,
        exchange: &Exchange,
    ) -> Result<()> {
        let body = exchange.request_body();
        let mut out = BytesMut::new();

        out.extend_from_slice(&engine.send(FrameRequest::Headers {
            stream_id,
            headers: exchange.request_headers().clone(),
            end_stream: body.is_none(),
        })?);

        if let Some(body) = body {
            out.extend_from_slice(&engine.send(FrameRequest::Data {
                stream_id,
                data: body.clone(),
                end_stream: true,
            })?);
        }

        lock(session).write_all(&out)
    }

    /// Explicit shutdown: open exchanges fail with `Error::Closed`
    ///
    /// The cause is claimed before GOAWAY goes out, so a peer hanging up
    /// in response cannot replace it.
    pub(crate) fn close(&self) {
        if self.claim(&Error::Closed) {
            let goodbye = lock(&self.engine).send(FrameRequest::GoAway {
                last_stream_id: 0,
                code: ErrorCode::NoError,
                debug: bytes::Bytes::new(),
            });
            if let Ok(bytes) = goodbye {
                let _ = lock(&self.session).write_all(&bytes);
            }
            self.teardown(Error::Closed, Escalation::Silent);
        }

        let reader = lock(&self.reader).take();
        if let Some(handle) = reader {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let _ = lock(&self.session).close();
    }

    /// Tear down with `cause`; only the first cause takes effect
    ///
    /// Every live exchange fails with the cause. `escalation` decides
    /// whether the observer is told so it can route the failure to the
    /// client.
    pub(crate) fn fail(&self, cause: Error, escalation: Escalation) {
        if self.claim(&cause) {
            self.teardown(cause, escalation);
        }
    }

    /// Record the cause and disarm the watchdog; false if another cause
    /// got there first
    fn claim(&self, cause: &Error) -> bool {
        {
            let mut failure = lock(&self.failure);
            if failure.is_some() {
                return false;
            }
            *failure = Some(cause.clone());
        }
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.cancel();
        }
        true
    }

    fn teardown(&self, cause: Error, escalation: Escalation) {
        tracing::debug!(connection = self.id, cause = %cause, "tearing down connection");
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);

        let exchanges = lock(&self.registry).shutdown(cause.clone());
        let mut failed = 0;
        let mut failed_async = 0;
        let mut unhandled = false;
        for exchange in &exchanges {
            let awaited = exchange.is_awaited();
            if let Some(handled) = exchange.fail(cause.clone()) {
                failed += 1;
                if !awaited {
                    failed_async += 1;
                }
                unhandled |= !handled;
            }
        }

        let escalate = match escalation {
            Escalation::Silent => false,
            Escalation::Swept => failed_async > 0,
            Escalation::Background => failed == 0 || failed_async > 0,
        };
        if escalate {
            self.observer.connection_failed(&cause, unhandled);
        }

        for exchange in &exchanges {
            exchange.settle();
        }
    }

    fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let cause = loop {
            if !self.is_open() {
                break None;
            }

            // Checks bytes already decrypted by TLS as well as the socket
            let ready = lock(&self.session).poll(PollEvents::Read, Some(Duration::ZERO));
            match ready {
                Ok(true) => {}
                Ok(false) => match poll_fd(self.fd, PollEvents::Read, Some(POLL_TICK)) {
                    Ok(_) => continue,
                    Err(e) => break Some(e),
                },
                Err(e) => break Some(e),
            }

            let read = lock(&self.session).read(&mut buf);
            let n = match read {
                Ok(0) => break Some(Error::remotely_closed()),
                Ok(n) => n,
                Err(e) => break Some(e),
            };

            if let Some(watchdog) = lock(&self.watchdog).as_ref() {
                watchdog.reset();
            }

            if let Err(e) = self.process(&buf[..n]) {
                break Some(e);
            }
        };

        if let Some(cause) = cause {
            if self.is_open() {
                tracing::debug!(connection = self.id, error = %cause, "read loop failed");
            }
            self.fail(cause, Escalation::Background);
        }
        tracing::trace!(connection = self.id, "read loop exited");
    }

    /// Feed one read batch through the engine and route the events
    fn process(&self, bytes: &[u8]) -> Result<()> {
        let events = {
            let mut engine = lock(&self.engine);
            let events = engine.feed(bytes);
            let finished = events
                .iter()
                .filter(|event| event.is_stream_terminal())
                .filter_map(EngineEvent::stream_id);
            for stream_id in finished {
                engine.release_stream(stream_id);
            }
            if let Some(outbound) = engine.take_outbound() {
                lock(&self.session).write_all(&outbound)?;
            }
            events
        };

        for event in events {
            self.route(event)?;
        }
        Ok(())
    }

    fn route(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::SettingsUpdate(snapshot) => {
                *self.remote_settings.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
                lock(&self.registry).set_max_concurrent_streams(Some(snapshot.max_concurrent_streams));
                tracing::trace!(connection = self.id, ?snapshot, "peer settings applied");
                Ok(())
            }
            EngineEvent::GoAway {
                last_stream_id,
                code,
                debug: debug_data,
            } => {
                let description = ErrorCode::describe(code);
                tracing::debug!(
                    connection = self.id,
                    last_stream_id,
                    code = %description,
                    debug = %String::from_utf8_lossy(&debug_data),
                    "GOAWAY received"
                );

                let idle = lock(&self.registry).is_empty();
                if code == ErrorCode::NoError.as_u32() && idle {
                    self.fail(protocol_error("connection closed by peer (GOAWAY)"), Escalation::Silent);
                    Ok(())
                } else {
                    Err(protocol_error(format!(
                        "GOAWAY received: {} (last stream {})",
                        description, last_stream_id
                    )))
                }
            }
            EngineEvent::ProtocolError(err) => Err(err),
            stream_event => {
                let exchange = lock(&self.registry).route(&stream_event);
                let exchange = match exchange {
                    Some(exchange) => exchange,
                    None => {
                        tracing::trace!(
                            connection = self.id,
                            stream_id = ?stream_event.stream_id(),
                            "event for unknown stream dropped"
                        );
                        return Ok(());
                    }
                };
                self.deliver(&exchange, stream_event);
                Ok(())
            }
        }
    }

    fn deliver(&self, exchange: &Exchange, event: EngineEvent) {
        match event {
            EngineEvent::Headers { headers, .. } => exchange.deliver_headers(headers),
            EngineEvent::Data { data, .. } => exchange.deliver_data(data),
            EngineEvent::StreamEnd { .. } => {
                exchange.complete();
                exchange.settle();
            }
            EngineEvent::Reset { stream_id, code } => {
                let description = ErrorCode::describe(code);
                tracing::debug!(connection = self.id, stream_id, code = %description, "stream reset by peer");

                let err = protocol_error(format!("Stream {} reset by peer: {}", stream_id, description));
                if exchange.fail(err.clone()) == Some(false) {
                    self.observer.exchange_failed(&err);
                }
                exchange.settle();
            }
            _ => {}
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.cancel();
        }
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
    }
}

/// Holds the live connection and rebuilds it on demand
pub(crate) struct ConnectionManager {
    config: ConnectionConfig,
    observer: Arc<dyn ConnectionObserver>,
    slot: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    pub(crate) fn new(config: ConnectionConfig, observer: Arc<dyn ConnectionObserver>) -> Self {
        ConnectionManager {
            config,
            observer,
            slot: Mutex::new(None),
        }
    }

    /// The open connection, building a new one if there is none or the
    /// previous one failed
    pub(crate) fn ensure_connected(&self) -> Result<Arc<Connection>> {
        let mut slot = lock(&self.slot);
        if let Some(conn) = slot.as_ref() {
            if conn.is_open() {
                return Ok(Arc::clone(conn));
            }
            tracing::debug!(connection = conn.id(), "replacing failed connection");
        }

        let session = TransportBuilder::new(&self.config.target, self.config.connect_timeout)
            .tls(self.config.tls.as_ref())
            .proxy(self.config.proxy.as_ref())
            .connect()?;

        let conn = Connection::establish(
            session,
            self.config.settings.clone(),
            self.config.idle_timeout,
            Arc::clone(&self.observer),
        )?;
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Send an exchange on the open connection
    pub(crate) fn submit(&self, exchange: &Exchange) -> Result<StreamId> {
        self.ensure_connected()?.submit(exchange)
    }

    /// Close and forget the live connection, if any
    pub(crate) fn shutdown(&self) {
        let conn = lock(&self.slot).take();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// The connection currently held, open or not
    pub(crate) fn current(&self) -> Option<Arc<Connection>> {
        lock(&self.slot).clone()
    }

    /// Exchanges in flight on the live connection
    pub(crate) fn stream_count(&self) -> usize {
        match self.current() {
            Some(conn) if conn.is_open() => conn.stream_count(),
            _ => 0,
        }
    }

    /// Peer settings of the live connection, or protocol defaults
    pub(crate) fn remote_settings(&self) -> RemoteSettings {
        self.current()
            .map(|conn| conn.remote_settings())
            .unwrap_or_default()
    }
}
