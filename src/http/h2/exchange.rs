//! Request/response exchanges
//!
//! An `Exchange` is the caller's handle on one request multiplexed over the
//! connection. It carries the request descriptor, accumulates the response,
//! and fans protocol events out to the caller's subscribers. Exactly one of
//! `close` or `error` fires per exchange.

use super::stream::{StreamId, StreamState};
use crate::http::client::Response;
use crate::http::events::{Emitter, Event};
use crate::http::{lock, Error, Headers, Method, Result, TimeoutKind};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Kinds an exchange subscriber can listen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeEventKind {
    Headers,
    BodyChunk,
    Close,
    Error,
}

/// Payload handed to exchange subscribers
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    /// One decoded header block
    Headers(Headers),
    /// Body bytes received since the previous chunk
    BodyChunk(Bytes),
    /// The response completed
    Close,
    /// The exchange failed
    Error(Error),
}

impl Event for ExchangeEvent {
    type Kind = ExchangeEventKind;

    fn kind(&self) -> ExchangeEventKind {
        match self {
            ExchangeEvent::Headers(_) => ExchangeEventKind::Headers,
            ExchangeEvent::BodyChunk(_) => ExchangeEventKind::BodyChunk,
            ExchangeEvent::Close => ExchangeEventKind::Close,
            ExchangeEvent::Error(_) => ExchangeEventKind::Error,
        }
    }
}

/// Told when a dispatched exchange reaches a terminal state
pub(crate) trait SettleObserver: Send + Sync {
    fn settled(&self, key: u64);
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

enum Outcome {
    Completed,
    Failed(Error),
}

struct State {
    stream: StreamState,
    stream_id: Option<StreamId>,
    dispatched: bool,
    /// A synchronous caller is blocked on this exchange
    awaited: bool,
    response_headers: Headers,
    body: BytesMut,
    outcome: Option<Outcome>,
    observer: Option<Arc<dyn SettleObserver>>,
}

/// Serializes event delivery per exchange
///
/// Re-entrant for the delivering thread, so a subscriber may trigger
/// further delivery on its own exchange (for example by closing the
/// client from a body callback).
struct DeliveryGate {
    owner: Mutex<(Option<ThreadId>, usize)>,
    released: Condvar,
}

struct GateGuard<'a> {
    gate: &'a DeliveryGate,
}

impl DeliveryGate {
    fn new() -> Self {
        DeliveryGate {
            owner: Mutex::new((None, 0)),
            released: Condvar::new(),
        }
    }

    fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut owner = lock(&self.owner);
        loop {
            match owner.0 {
                None => {
                    *owner = (Some(me), 1);
                    break;
                }
                Some(id) if id == me => {
                    owner.1 += 1;
                    break;
                }
                Some(_) => {
                    owner = self.released.wait(owner).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        GateGuard { gate: self }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut owner = lock(&self.gate.owner);
        owner.1 -= 1;
        if owner.1 == 0 {
            owner.0 = None;
            self.gate.released.notify_all();
        }
    }
}

struct Inner {
    key: u64,
    method: Method,
    headers: Headers,
    body: Option<Bytes>,
    timeout: Duration,
    events: Emitter<ExchangeEvent>,
    gate: DeliveryGate,
    state: Mutex<State>,
    finished: Condvar,
}

/// One request/response pair
///
/// Cloning yields another handle to the same exchange.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

impl Exchange {
    /// Exchange for a fully prepared request header list
    pub(crate) fn new(method: Method, headers: Headers, body: Option<Bytes>, timeout: Duration) -> Self {
        Exchange {
            inner: Arc::new(Inner {
                key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
                method,
                headers,
                body,
                timeout,
                events: Emitter::new(),
                gate: DeliveryGate::new(),
                state: Mutex::new(State {
                    stream: StreamState::Idle,
                    stream_id: None,
                    dispatched: false,
                    awaited: false,
                    response_headers: Headers::new(),
                    body: BytesMut::new(),
                    outcome: None,
                    observer: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    /// Subscribe to response header blocks
    pub fn on_headers<F>(&self, handler: F)
    where
        F: Fn(&Headers) + Send + Sync + 'static,
    {
        self.inner.events.on(ExchangeEventKind::Headers, move |event| {
            if let ExchangeEvent::Headers(headers) = event {
                handler(headers);
            }
        });
    }

    /// Subscribe to body bytes as they arrive
    pub fn on_body_chunk<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.events.on(ExchangeEventKind::BodyChunk, move |event| {
            if let ExchangeEvent::BodyChunk(chunk) = event {
                handler(chunk);
            }
        });
    }

    /// Subscribe to successful completion
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.on(ExchangeEventKind::Close, move |event| {
            if let ExchangeEvent::Close = event {
                handler();
            }
        });
    }

    /// Subscribe to failure
    ///
    /// A failure observed by an exchange-level subscriber is not raised
    /// from `Client::join`.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.events.on(ExchangeEventKind::Error, move |event| {
            if let ExchangeEvent::Error(err) = event {
                handler(err);
            }
        });
    }

    /// Process-unique identity of this exchange
    pub fn key(&self) -> u64 {
        self.inner.key
    }

    /// Request method
    pub fn method(&self) -> Method {
        self.inner.method
    }

    /// Request path, including any query string
    pub fn path(&self) -> &str {
        self.inner.headers.get(":path").unwrap_or("/")
    }

    /// Full request header list, pseudo-headers first
    pub fn request_headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Request body, if any
    pub fn request_body(&self) -> Option<&Bytes> {
        self.inner.body.as_ref()
    }

    /// Bound on a synchronous wait for this exchange
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Stream identifier, once the exchange has been sent
    pub fn stream_id(&self) -> Option<StreamId> {
        lock(&self.inner.state).stream_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        lock(&self.inner.state).stream
    }

    /// Whether `close` or `error` has fired
    pub fn is_finished(&self) -> bool {
        lock(&self.inner.state).outcome.is_some()
    }

    /// Response headers received so far
    pub fn response_headers(&self) -> Headers {
        lock(&self.inner.state).response_headers.clone()
    }

    /// Response body received so far
    pub fn response_body(&self) -> Bytes {
        Bytes::copy_from_slice(&lock(&self.inner.state).body)
    }

    /// The failure cause, if the exchange failed
    pub fn error(&self) -> Option<Error> {
        match &lock(&self.inner.state).outcome {
            Some(Outcome::Failed(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Block until the exchange finishes or `timeout` elapses
    ///
    /// Elapsing does not cancel the exchange.
    pub fn wait(&self, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);

        loop {
            match &state.outcome {
                Some(Outcome::Completed) => {
                    return Ok(Response::new(
                        state.response_headers.clone(),
                        Bytes::copy_from_slice(&state.body),
                    ));
                }
                Some(Outcome::Failed(err)) => return Err(err.clone()),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(TimeoutKind::Exceeded));
            }

            state = self
                .inner
                .finished
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Claim the exchange for dispatch; an exchange is sent at most once
    pub(crate) fn begin_dispatch(
        &self,
        observer: Option<Arc<dyn SettleObserver>>,
        awaited: bool,
    ) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.dispatched {
            return Err(Error::Protocol(format!(
                "exchange {} {} was already dispatched",
                self.inner.method,
                self.path()
            )));
        }
        state.dispatched = true;
        state.awaited = awaited;
        state.observer = observer;
        Ok(())
    }

    /// Whether a synchronous caller is blocked on this exchange
    pub(crate) fn is_awaited(&self) -> bool {
        lock(&self.inner.state).awaited
    }

    /// Bind to a stream; called under the registry lock
    pub(crate) fn attach(&self, stream_id: StreamId) -> Result<()> {
        let mut state = lock(&self.inner.state);
        state.stream = state.stream.send_headers(self.inner.body.is_none())?;
        state.stream_id = Some(stream_id);
        Ok(())
    }

    /// The request body has been handed to the engine
    pub(crate) fn request_sent(&self) {
        let mut state = lock(&self.inner.state);
        if state.stream.can_send() {
            if let Ok(next) = state.stream.send_end() {
                state.stream = next;
            }
        }
    }

    pub(crate) fn deliver_headers(&self, headers: Headers) {
        let _gate = self.inner.gate.enter();
        {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_some() || !state.stream.can_receive() {
                return;
            }
            state.response_headers.extend(&headers);
        }
        self.inner.events.emit(&ExchangeEvent::Headers(headers));
    }

    pub(crate) fn deliver_data(&self, data: Bytes) {
        let _gate = self.inner.gate.enter();
        {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_some() || !state.stream.can_receive() {
                return;
            }
            state.body.extend_from_slice(&data);
        }
        self.inner.events.emit(&ExchangeEvent::BodyChunk(data));
    }

    /// Mark the response complete and fire `close`
    ///
    /// Returns false if the exchange had already finished.
    pub(crate) fn complete(&self) -> bool {
        let _gate = self.inner.gate.enter();
        {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_some() {
                return false;
            }
            state.stream = state.stream.recv_end();
            state.outcome = Some(Outcome::Completed);
        }
        self.inner.finished.notify_all();
        self.inner.events.emit(&ExchangeEvent::Close);
        true
    }

    /// Mark the exchange failed and fire `error`
    ///
    /// Returns `None` if the exchange had already finished, otherwise
    /// whether the failure was handled locally: by an `error` subscriber
    /// or by a synchronous caller waiting on the exchange.
    pub(crate) fn fail(&self, err: Error) -> Option<bool> {
        let _gate = self.inner.gate.enter();
        let handled = {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_some() {
                return None;
            }
            state.stream = StreamState::Failed;
            state.outcome = Some(Outcome::Failed(err.clone()));
            state.awaited || self.inner.events.has_subscribers(ExchangeEventKind::Error)
        };
        self.inner.finished.notify_all();
        self.inner.events.emit(&ExchangeEvent::Error(err));
        Some(handled)
    }

    /// Leave the dispatcher's pending set; idempotent
    pub(crate) fn settle(&self) {
        let observer = lock(&self.inner.state).observer.take();
        if let Some(observer) = observer {
            observer.settled(self.inner.key);
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Exchange")
            .field("key", &self.inner.key)
            .field("method", &self.inner.method)
            .field("path", &self.path())
            .field("stream_id", &state.stream_id)
            .field("state", &state.stream)
            .finish()
    }
}
