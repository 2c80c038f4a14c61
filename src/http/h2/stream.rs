//! HTTP/2 stream states
//!
//! The per-exchange lifecycle from RFC 7540 Section 5.1, restricted to what a
//! client that never accepts pushed streams can observe, plus a terminal
//! `Failed` state for exchanges torn down by a transport or protocol error.

use crate::http::{Error, Result};
use std::fmt;

/// Stream ID type
pub type StreamId = u32;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not yet on the wire
    Idle,
    /// HEADERS sent, request body still to come
    Open,
    /// Request fully sent, waiting for the response
    HalfClosedLocal,
    /// Response finished while the request body is still being sent
    HalfClosedRemote,
    /// Both sides finished
    Closed,
    /// Torn down by an error
    Failed,
}

impl StreamState {
    /// Check if the exchange reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed)
    }

    /// Check if the request side may still send
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if the response side may still deliver
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// State after sending HEADERS
    pub fn send_headers(self, end_stream: bool) -> Result<StreamState> {
        match self {
            StreamState::Idle if end_stream => Ok(StreamState::HalfClosedLocal),
            StreamState::Idle => Ok(StreamState::Open),
            other => Err(Error::Protocol(format!("cannot send HEADERS in state {}", other))),
        }
    }

    /// State after the last request DATA frame is queued
    pub fn send_end(self) -> Result<StreamState> {
        match self {
            StreamState::Open => Ok(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => Ok(StreamState::Closed),
            other => Err(Error::Protocol(format!("cannot end request in state {}", other))),
        }
    }

    /// State after the peer sets END_STREAM
    pub fn recv_end(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Open => "open",
            StreamState::HalfClosedLocal => "half-closed (local)",
            StreamState::HalfClosedRemote => "half-closed (remote)",
            StreamState::Closed => "closed",
            StreamState::Failed => "failed",
        };
        f.write_str(name)
    }
}
