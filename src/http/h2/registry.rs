//! Stream registry
//!
//! Assigns client stream identifiers and routes inbound protocol events to
//! the exchange that owns the stream. Entries are removed when their
//! stream ends or resets, and all at once when the connection is torn down.

use super::engine::EngineEvent;
use super::exchange::Exchange;
use super::stream::StreamId;
use super::MAX_STREAM_ID;
use crate::http::{Error, Result};
use std::collections::HashMap;

/// Live exchanges of one connection, keyed by stream identifier
pub struct StreamRegistry {
    streams: HashMap<StreamId, Exchange>,
    next_stream_id: StreamId,
    max_concurrent_streams: Option<u32>,
    closed: Option<Error>,
}

impl StreamRegistry {
    /// Empty registry; the first stream will be 1
    pub fn new() -> Self {
        StreamRegistry {
            streams: HashMap::new(),
            next_stream_id: 1,
            max_concurrent_streams: None,
            closed: None,
        }
    }

    /// Apply the peer's SETTINGS_MAX_CONCURRENT_STREAMS
    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    /// Assign the next odd stream identifier to `exchange`
    ///
    /// Fails once the registry has been shut down, when the peer's
    /// concurrency limit is reached, or when identifiers are exhausted.
    pub fn open(&mut self, exchange: &Exchange) -> Result<StreamId> {
        if let Some(cause) = &self.closed {
            return Err(cause.clone());
        }

        if let Some(max) = self.max_concurrent_streams {
            if self.streams.len() >= max as usize {
                return Err(Error::Protocol(format!(
                    "peer allows at most {} concurrent streams",
                    max
                )));
            }
        }

        let stream_id = self.next_stream_id;
        if stream_id > MAX_STREAM_ID {
            return Err(Error::Protocol("stream identifiers exhausted".to_string()));
        }

        exchange.attach(stream_id)?;
        self.next_stream_id += 2;
        self.streams.insert(stream_id, exchange.clone());
        Ok(stream_id)
    }

    /// Exchange an inbound event belongs to
    ///
    /// A terminal event retires the entry. Events for unknown streams
    /// (already finished, or never ours) yield `None`.
    pub fn route(&mut self, event: &EngineEvent) -> Option<Exchange> {
        let stream_id = event.stream_id()?;
        if event.is_stream_terminal() {
            self.streams.remove(&stream_id)
        } else {
            self.streams.get(&stream_id).cloned()
        }
    }

    /// Drop one entry without notifying it
    pub fn close(&mut self, stream_id: StreamId) -> Option<Exchange> {
        self.streams.remove(&stream_id)
    }

    /// Refuse further streams and hand back every live exchange
    ///
    /// Exchanges come back in stream order.
    pub fn shutdown(&mut self, cause: Error) -> Vec<Exchange> {
        if self.closed.is_none() {
            self.closed = Some(cause);
        }

        let mut drained: Vec<(StreamId, Exchange)> = self.streams.drain().collect();
        drained.sort_by_key(|(stream_id, _)| *stream_id);
        drained.into_iter().map(|(_, exchange)| exchange).collect()
    }

    /// Number of live exchanges
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Method};
    use bytes::Bytes;
    use std::time::Duration;

    fn exchange() -> Exchange {
        let headers: Headers = vec![(":method", "GET"), (":path", "/")].into_iter().collect();
        Exchange::new(Method::Get, headers, None, Duration::from_secs(1))
    }

    #[test]
    fn test_stream_ids_are_odd_and_increasing() {
        let mut registry = StreamRegistry::new();
        assert_eq!(registry.open(&exchange()).unwrap(), 1);
        assert_eq!(registry.open(&exchange()).unwrap(), 3);
        assert_eq!(registry.open(&exchange()).unwrap(), 5);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_route_retires_on_terminal_event() {
        let mut registry = StreamRegistry::new();
        let first = exchange();
        let id = registry.open(&first).unwrap();

        let data = EngineEvent::Data {
            stream_id: id,
            data: Bytes::from("x"),
        };
        assert_eq!(registry.route(&data).unwrap().key(), first.key());
        assert_eq!(registry.len(), 1);

        let end = EngineEvent::StreamEnd { stream_id: id };
        assert_eq!(registry.route(&end).unwrap().key(), first.key());
        assert!(registry.is_empty());

        // Late frames for a finished stream go nowhere
        assert!(registry.route(&data).is_none());
    }

    #[test]
    fn test_route_ignores_connection_events() {
        let mut registry = StreamRegistry::new();
        registry.open(&exchange()).unwrap();
        let goaway = EngineEvent::GoAway {
            last_stream_id: 0,
            code: 0,
            debug: Bytes::new(),
        };
        assert!(registry.route(&goaway).is_none());
    }

    #[test]
    fn test_concurrency_limit() {
        let mut registry = StreamRegistry::new();
        registry.set_max_concurrent_streams(Some(1));
        registry.open(&exchange()).unwrap();
        assert!(matches!(registry.open(&exchange()), Err(Error::Protocol(_))));

        registry.close(1);
        assert_eq!(registry.open(&exchange()).unwrap(), 3);
    }

    #[test]
    fn test_shutdown_drains_in_order_and_refuses() {
        let mut registry = StreamRegistry::new();
        let exchanges: Vec<Exchange> = (0..3).map(|_| exchange()).collect();
        for exchange in &exchanges {
            registry.open(exchange).unwrap();
        }

        let drained = registry.shutdown(Error::remotely_closed());
        let keys: Vec<u64> = drained.iter().map(|e| e.key()).collect();
        let expected: Vec<u64> = exchanges.iter().map(|e| e.key()).collect();
        assert_eq!(keys, expected);
        assert!(registry.is_empty());
        assert!(registry.is_closed());

        let err = registry.open(&exchange()).unwrap_err();
        assert!(err.is_transport());
    }
}
