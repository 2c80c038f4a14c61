//! HTTP/2 client internals
//!
//! # Architecture
//!
//! - `frames`, `codec`, `settings`, `flow_control`: the RFC 7540 wire model
//! - `engine`: bytes in, events out; bytes out for frame requests
//! - `stream` and `exchange`: per-request lifecycle and event delivery
//! - `registry`: stream identifier assignment and event routing
//! - `connection`: one live transport, its read loop and its watchdog
//! - `watchdog`: the idle timer
//!
//! ## Features
//!
//! - **HPACK**: header compression via the `hpack` crate, with header blocks
//!   split into and reassembled from CONTINUATION frames
//! - **Flow control**: connection and stream windows in both directions
//! - **Settings exchange**: the peer's settings are tracked and exposed
//! - **Padding**: DATA and HEADERS padding is stripped
//! - **Server push**: refused; a PUSH_PROMISE is a protocol error

pub mod codec;
pub mod connection;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod flow_control;
pub mod frames;
pub mod registry;
pub mod settings;
pub mod stream;
pub mod watchdog;

pub use codec::FrameCodec;
pub use engine::{EngineEvent, FrameRequest, ProtocolEngine};
pub use error::ErrorCode;
pub use exchange::Exchange;
pub use frames::{Frame, FrameFlags, FrameType};
pub use settings::{RemoteSettings, Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Largest flow-control window and stream ID value (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFFFFFF;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
