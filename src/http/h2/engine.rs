//! Protocol engine adapter
//!
//! A pure transform between wire bytes and protocol events. `feed` decodes
//! inbound bytes into events in receipt order; `send` serializes outbound
//! frame requests into bytes. The engine never touches a socket: frames it
//! must emit on its own (SETTINGS/PING acknowledgements, WINDOW_UPDATEs,
//! request DATA released by a window update, GOAWAY on a violation) are
//! collected and handed out by `take_outbound`.

use super::codec::FrameCodec;
use super::error::{protocol_error, ErrorCode};
use super::flow_control::FlowControl;
use super::frames::*;
use super::settings::{RemoteSettings, Settings};
use super::stream::StreamId;
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::http::{Error, Headers, Result};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

/// Outbound frame request
#[derive(Debug, Clone)]
pub enum FrameRequest {
    /// Request headers; the block is split into CONTINUATIONs as needed
    Headers {
        stream_id: StreamId,
        headers: Headers,
        end_stream: bool,
    },
    /// Request body; split by frame size and held back by flow control
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// Abort one stream
    RstStream { stream_id: StreamId, code: ErrorCode },
    /// Liveness probe
    Ping { data: [u8; 8] },
    /// Connection shutdown notice
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug: Bytes,
    },
}

/// Decoded inbound event
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A complete header block
    Headers { stream_id: StreamId, headers: Headers },
    /// Body bytes with padding removed
    Data { stream_id: StreamId, data: Bytes },
    /// The peer set END_STREAM
    StreamEnd { stream_id: StreamId },
    /// The peer reset a stream
    Reset { stream_id: StreamId, code: u32 },
    /// The peer changed its settings; carries the merged snapshot
    SettingsUpdate(RemoteSettings),
    /// The peer is shutting the connection down
    GoAway {
        last_stream_id: StreamId,
        code: u32,
        debug: Bytes,
    },
    /// The peer violated the protocol; always the last event
    ProtocolError(Error),
}

impl EngineEvent {
    /// Stream the event belongs to, if it is stream scoped
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            EngineEvent::Headers { stream_id, .. }
            | EngineEvent::Data { stream_id, .. }
            | EngineEvent::StreamEnd { stream_id }
            | EngineEvent::Reset { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Whether the event ends its stream
    pub fn is_stream_terminal(&self) -> bool {
        matches!(self, EngineEvent::StreamEnd { .. } | EngineEvent::Reset { .. })
    }
}

/// Send-side state of one open stream
struct SendStream {
    flow: FlowControl,
    /// DATA waiting for window
    queue: VecDeque<(Bytes, bool)>,
}

/// Header block spread over HEADERS + CONTINUATION frames
struct PendingHeaderBlock {
    stream_id: StreamId,
    block: BytesMut,
    end_stream: bool,
}

/// Client-side HTTP/2 protocol engine
pub struct ProtocolEngine {
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    local_settings: Settings,
    remote_settings: Settings,
    connection_flow: FlowControl,
    streams: HashMap<StreamId, SendStream>,
    continuation: Option<PendingHeaderBlock>,
    outbound: BytesMut,
    failed: Option<Error>,
}

impl ProtocolEngine {
    /// Engine that will advertise `local_settings`
    pub fn new(local_settings: Settings) -> Self {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(local_settings.get_max_frame_size());

        ProtocolEngine {
            codec,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            local_settings,
            remote_settings: Settings::new(),
            // Connection windows always start at the protocol default
            connection_flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            streams: HashMap::new(),
            continuation: None,
            outbound: BytesMut::new(),
            failed: None,
        }
    }

    /// Connection preface followed by our SETTINGS
    pub fn preface(&self) -> Bytes {
        let mut buf = BytesMut::from(CONNECTION_PREFACE);
        buf.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(
            self.local_settings.clone(),
        )));
        buf.freeze()
    }

    /// Settings we advertise
    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    /// Snapshot of what the peer advertised so far
    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings::from_settings(&self.remote_settings)
    }

    /// The violation that stopped decoding, if any
    pub fn failure(&self) -> Option<&Error> {
        self.failed.as_ref()
    }

    /// Streams with send-side state
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Request bytes still waiting for flow-control window
    pub fn queued_bytes(&self, stream_id: StreamId) -> usize {
        self.streams
            .get(&stream_id)
            .map_or(0, |s| s.queue.iter().map(|(data, _)| data.len()).sum())
    }

    /// Decode inbound bytes into events
    ///
    /// After a protocol violation the engine stops decoding; the violation
    /// is reported once as the final `ProtocolError` event and a GOAWAY is
    /// queued for the peer.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.failed.is_some() {
            return events;
        }

        self.codec.push(bytes);
        loop {
            let result = match self.codec.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame, &mut events),
                Ok(None) => break,
                Err(e) => Err(e),
            };

            if let Err(err) = result {
                tracing::debug!(error = %err, "protocol violation, sending GOAWAY");
                let goaway = GoawayFrame::new(
                    CONNECTION_STREAM_ID,
                    ErrorCode::ProtocolError,
                    Bytes::from(err.to_string()),
                );
                self.outbound
                    .extend_from_slice(&FrameCodec::encode_goaway_frame(&goaway));
                self.failed = Some(err.clone());
                events.push(EngineEvent::ProtocolError(err));
                break;
            }
        }

        events
    }

    /// Serialize an outbound frame request
    pub fn send(&mut self, request: FrameRequest) -> Result<Bytes> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        match request {
            FrameRequest::Headers {
                stream_id,
                headers,
                end_stream,
            } => Ok(self.encode_headers(stream_id, &headers, end_stream)),
            FrameRequest::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let stream = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or_else(|| protocol_error(format!("DATA for unopened stream {}", stream_id)))?;
                stream.queue.push_back((data, end_stream));

                let mut out = BytesMut::new();
                self.flush_stream(stream_id, &mut out);
                Ok(out.freeze())
            }
            FrameRequest::RstStream { stream_id, code } => {
                self.streams.remove(&stream_id);
                Ok(FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(stream_id, code)))
            }
            FrameRequest::Ping { data } => Ok(FrameCodec::encode_ping_frame(&PingFrame::new(data))),
            FrameRequest::GoAway {
                last_stream_id,
                code,
                debug,
            } => Ok(FrameCodec::encode_goaway_frame(&GoawayFrame::new(
                last_stream_id,
                code,
                debug,
            ))),
        }
    }

    /// Frames the engine produced on its own since the last call
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Forget a finished stream, dropping any request data still queued
    pub fn release_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    fn encode_headers(&mut self, stream_id: StreamId, headers: &Headers, end_stream: bool) -> Bytes {
        self.streams.insert(
            stream_id,
            SendStream {
                flow: FlowControl::new(
                    self.remote_settings.get_initial_window_size(),
                    self.local_settings.get_initial_window_size(),
                ),
                queue: VecDeque::new(),
            },
        );

        let block = Bytes::from(
            self.encoder
                .encode(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))),
        );
        let max = self.remote_settings.get_max_frame_size() as usize;

        let mut out = BytesMut::new();
        let first_end = block.len().min(max);
        out.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            block.slice(..first_end),
            end_stream,
            first_end == block.len(),
        )));

        let mut offset = first_end;
        while offset < block.len() {
            let end = (offset + max).min(block.len());
            out.extend_from_slice(&FrameCodec::encode_continuation_frame(&ContinuationFrame::new(
                stream_id,
                block.slice(offset..end),
                end == block.len(),
            )));
            offset = end;
        }

        out.freeze()
    }

    /// Move as much queued DATA for a stream onto the wire as windows allow
    fn flush_stream(&mut self, stream_id: StreamId, out: &mut BytesMut) {
        let max_frame = self.remote_settings.get_max_frame_size() as usize;
        let connection_flow = &mut self.connection_flow;
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        while let Some((data, end_stream)) = stream.queue.pop_front() {
            if data.is_empty() {
                out.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
                    stream_id, data, end_stream,
                )));
                continue;
            }

            let allowed = data
                .len()
                .min(max_frame)
                .min(connection_flow.send_window().available())
                .min(stream.flow.send_window().available());
            if allowed == 0 {
                stream.queue.push_front((data, end_stream));
                break;
            }

            connection_flow.send_window_mut().consume(allowed);
            stream.flow.send_window_mut().consume(allowed);

            let rest = data.slice(allowed..);
            out.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
                stream_id,
                data.slice(..allowed),
                end_stream && rest.is_empty(),
            )));

            if !rest.is_empty() {
                stream.queue.push_front((rest, end_stream));
            }
        }
    }

    fn flush_all_streams(&mut self) {
        let mut ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.queue.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        let mut out = BytesMut::new();
        for id in ids {
            self.flush_stream(id, &mut out);
        }
        self.outbound.extend_from_slice(&out);
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        if let Some(pending) = &self.continuation {
            if frame.frame_type != Some(FrameType::Continuation) || frame.stream_id != pending.stream_id {
                return Err(protocol_error(format!(
                    "expected CONTINUATION for stream {}",
                    pending.stream_id
                )));
            }
        }

        let frame_type = match frame.frame_type {
            Some(frame_type) => frame_type,
            None => {
                tracing::trace!(stream_id = frame.stream_id, "ignoring extension frame");
                return Ok(());
            }
        };

        match frame_type {
            FrameType::Data => self.on_data(frame, events),
            FrameType::Headers => self.on_headers(frame, events),
            FrameType::Continuation => self.on_continuation(frame, events),
            FrameType::Settings => self.on_settings(frame, events),
            FrameType::Ping => self.on_ping(frame),
            FrameType::Goaway => self.on_goaway(frame, events),
            FrameType::RstStream => self.on_rst_stream(frame, events),
            FrameType::WindowUpdate => self.on_window_update(frame),
            FrameType::PushPromise => Err(protocol_error("PUSH_PROMISE received with push disabled")),
            FrameType::Priority => Ok(()),
        }
    }

    fn on_data(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        let stream_id = require_stream(&frame)?;
        let end_stream = frame.flags.is_end_stream();
        let flow_len = frame.payload_len();

        // Padding counts against the windows too
        self.connection_flow.consume_recv_window(flow_len)?;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.flow.consume_recv_window(flow_len)?;
            if !end_stream {
                if let Some(increment) = stream.flow.take_window_update() {
                    self.queue_window_update(stream_id, increment);
                }
            }
        }
        if let Some(increment) = self.connection_flow.take_window_update() {
            self.queue_window_update(CONNECTION_STREAM_ID, increment);
        }

        let data = FrameCodec::strip_padding(frame.flags, frame.payload)?;
        if !data.is_empty() {
            events.push(EngineEvent::Data { stream_id, data });
        }
        if end_stream {
            events.push(EngineEvent::StreamEnd { stream_id });
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        let stream_id = require_stream(&frame)?;
        let mut payload = FrameCodec::strip_padding(frame.flags, frame.payload)?;

        if frame.flags.is_priority() {
            if payload.len() < 5 {
                return Err(protocol_error("HEADERS priority block truncated"));
            }
            payload = payload.slice(5..);
        }

        let end_stream = frame.flags.is_end_stream();
        if frame.flags.is_end_headers() {
            self.emit_header_block(stream_id, &payload, end_stream, events)
        } else {
            self.continuation = Some(PendingHeaderBlock {
                stream_id,
                block: BytesMut::from(&payload[..]),
                end_stream,
            });
            Ok(())
        }
    }

    fn on_continuation(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        let mut pending = self
            .continuation
            .take()
            .ok_or_else(|| protocol_error("CONTINUATION without preceding HEADERS"))?;
        pending.block.extend_from_slice(&frame.payload);

        if frame.flags.is_end_headers() {
            self.emit_header_block(pending.stream_id, &pending.block, pending.end_stream, events)
        } else {
            self.continuation = Some(pending);
            Ok(())
        }
    }

    fn emit_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let decoded = self
            .decoder
            .decode(block)
            .map_err(|e| protocol_error(format!("HPACK decode error: {:?}", e)))?;

        let headers: Headers = decoded
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        events.push(EngineEvent::Headers { stream_id, headers });
        if end_stream {
            events.push(EngineEvent::StreamEnd { stream_id });
        }
        Ok(())
    }

    fn on_settings(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        if frame.stream_id != CONNECTION_STREAM_ID {
            return Err(protocol_error("SETTINGS on a stream"));
        }
        if frame.flags.is_ack() {
            if frame.payload_len() != 0 {
                return Err(protocol_error("SETTINGS ACK with payload"));
            }
            return Ok(());
        }

        let update = FrameCodec::parse_settings(&frame.payload)?;
        if let Some(size) = update.initial_window_size {
            for stream in self.streams.values_mut() {
                stream.flow.send_window_mut().update_initial_size(size)?;
            }
        }
        self.remote_settings.merge(&update);

        self.outbound
            .extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
        self.flush_all_streams();

        events.push(EngineEvent::SettingsUpdate(self.remote_settings()));
        Ok(())
    }

    fn on_ping(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id != CONNECTION_STREAM_ID {
            return Err(protocol_error("PING on a stream"));
        }
        let data = FrameCodec::parse_ping(&frame.payload)?;
        if !frame.flags.is_ack() {
            self.outbound
                .extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::ack(data)));
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        if frame.stream_id != CONNECTION_STREAM_ID {
            return Err(protocol_error("GOAWAY on a stream"));
        }
        let goaway = FrameCodec::parse_goaway(&frame.payload)?;
        events.push(EngineEvent::GoAway {
            last_stream_id: goaway.last_stream_id,
            code: goaway.error_code,
            debug: goaway.debug_data,
        });
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: Frame, events: &mut Vec<EngineEvent>) -> Result<()> {
        let stream_id = require_stream(&frame)?;
        let rst = FrameCodec::parse_rst_stream(stream_id, &frame.payload)?;
        self.streams.remove(&stream_id);
        events.push(EngineEvent::Reset {
            stream_id,
            code: rst.error_code,
        });
        Ok(())
    }

    fn on_window_update(&mut self, frame: Frame) -> Result<()> {
        let update = FrameCodec::parse_window_update(frame.stream_id, &frame.payload)?;

        if update.stream_id == CONNECTION_STREAM_ID {
            self.connection_flow
                .send_window_mut()
                .increase(update.size_increment)?;
        } else if let Some(stream) = self.streams.get_mut(&update.stream_id) {
            stream.flow.send_window_mut().increase(update.size_increment)?;
        }

        self.flush_all_streams();
        Ok(())
    }

    fn queue_window_update(&mut self, stream_id: StreamId, increment: u32) {
        self.outbound.extend_from_slice(&FrameCodec::encode_window_update_frame(
            &WindowUpdateFrame::new(stream_id, increment),
        ));
    }
}

fn require_stream(frame: &Frame) -> Result<StreamId> {
    if frame.stream_id == CONNECTION_STREAM_ID {
        let name = frame.frame_type.map_or("frame", |t| t.name());
        return Err(protocol_error(format!("{} on stream 0", name)));
    }
    Ok(frame.stream_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    fn server_headers(encoder: &mut hpack::Encoder<'static>, pairs: &[(&str, &str)]) -> Bytes {
        Bytes::from(encoder.encode(pairs.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))))
    }

    /// Split engine output into frames
    fn frames(bytes: &[u8]) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(0x00FFFFFF);
        codec.push(bytes);
        let mut out = Vec::new();
        while let Some(frame) = codec.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_preface_starts_with_magic_and_settings() {
        let engine = ProtocolEngine::new(Settings::client_defaults());
        let preface = engine.preface();

        assert!(preface.starts_with(CONNECTION_PREFACE));
        let rest = frames(&preface[CONNECTION_PREFACE.len()..]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].frame_type, Some(FrameType::Settings));
        let advertised = FrameCodec::parse_settings(&rest[0].payload).unwrap();
        assert_eq!(advertised.enable_push, Some(false));
    }

    #[test]
    fn test_settings_are_applied_and_acknowledged() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        assert_eq!(engine.remote_settings(), RemoteSettings::default());

        let peer = SettingsBuilder::new().max_concurrent_streams(100).build().unwrap();
        let events = engine.feed(&FrameCodec::encode_settings_frame(&SettingsFrame::new(peer)));

        assert!(matches!(
            events.as_slice(),
            [EngineEvent::SettingsUpdate(snapshot)] if snapshot.max_concurrent_streams == 100
        ));
        let out = frames(&engine.take_outbound().unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame_type, Some(FrameType::Settings));
        assert!(out[0].flags.is_ack());
        assert!(engine.take_outbound().is_none());
    }

    #[test]
    fn test_response_headers_and_body_events() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let mut server = hpack::Encoder::new();

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1,
            server_headers(&mut server, &[(":status", "200"), ("Content-Length", "13")]),
            false,
            true,
        )));
        wire.extend_from_slice(&FrameCodec::encode_data_frame(
            &DataFrame::new(1, Bytes::from("response body"), true).with_padding(4),
        ));

        let events = engine.feed(&wire);
        assert_eq!(events.len(), 3);
        match &events[0] {
            EngineEvent::Headers { stream_id, headers } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(headers.get(":status"), Some("200"));
                assert_eq!(headers.get("content-length"), Some("13"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(&events[1], EngineEvent::Data { data, .. } if &data[..] == b"response body"));
        assert!(matches!(events[2], EngineEvent::StreamEnd { stream_id: 1 }));
    }

    #[test]
    fn test_continuation_is_reassembled() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let mut server = hpack::Encoder::new();
        let block = server_headers(&mut server, &[(":status", "204"), ("x-trace", "abc")]);
        let split = block.len() / 2;

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            3,
            block.slice(..split),
            true,
            false,
        )));
        assert!(engine.feed(&wire).is_empty());

        let events = engine.feed(&FrameCodec::encode_continuation_frame(&ContinuationFrame::new(
            3,
            block.slice(split..),
            true,
        )));
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], EngineEvent::Headers { headers, .. } if headers.get("x-trace") == Some("abc")));
        assert!(matches!(events[1], EngineEvent::StreamEnd { stream_id: 3 }));
    }

    #[test]
    fn test_interleaved_frame_during_continuation_is_an_error() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1,
            Bytes::from_static(b"\x88"),
            false,
            false,
        )));
        wire.extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::new([0; 8])));

        let events = engine.feed(&wire);
        assert!(matches!(events.last(), Some(EngineEvent::ProtocolError(_))));
        assert!(engine.failure().is_some());
    }

    #[test]
    fn test_push_promise_is_rejected_with_goaway() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let header = FrameCodec::encode_header(FrameType::PushPromise, FrameFlags::empty(), 1, 4);
        let mut wire = BytesMut::from(&header[..]);
        wire.extend_from_slice(&[0, 0, 0, 2]);

        let events = engine.feed(&wire);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::ProtocolError(Error::Protocol(msg))] if msg.contains("PUSH_PROMISE")
        ));

        let out = frames(&engine.take_outbound().unwrap());
        assert_eq!(out[0].frame_type, Some(FrameType::Goaway));

        // Decoding stays stopped
        assert!(engine.feed(&FrameCodec::encode_ping_frame(&PingFrame::new([1; 8]))).is_empty());
        assert!(engine
            .send(FrameRequest::Ping { data: [0; 8] })
            .is_err());
    }

    #[test]
    fn test_ping_is_answered() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        assert!(engine
            .feed(&FrameCodec::encode_ping_frame(&PingFrame::new([9; 8])))
            .is_empty());

        let out = frames(&engine.take_outbound().unwrap());
        assert_eq!(out[0].frame_type, Some(FrameType::Ping));
        assert!(out[0].flags.is_ack());
        assert_eq!(&out[0].payload[..], &[9; 8]);
    }

    #[test]
    fn test_request_headers_split_into_continuation() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let mut headers = Headers::new();
        headers.insert(":method", "GET");
        headers.insert(":path", "/");
        // Incompressible value larger than one frame
        let big: String = (0..20000).map(|i| char::from(b'a' + (i * 7 % 26) as u8)).collect();
        headers.insert("x-big", big.clone());

        let bytes = engine
            .send(FrameRequest::Headers {
                stream_id: 1,
                headers,
                end_stream: true,
            })
            .unwrap();

        let out = frames(&bytes);
        assert!(out.len() >= 2);
        assert_eq!(out[0].frame_type, Some(FrameType::Headers));
        assert!(out[0].flags.is_end_stream());
        assert!(!out[0].flags.is_end_headers());
        assert!(out.iter().all(|f| f.payload_len() <= 16384));
        let last = out.last().unwrap();
        assert_eq!(last.frame_type, Some(FrameType::Continuation));
        assert!(last.flags.is_end_headers());

        let mut block = BytesMut::new();
        for frame in &out {
            block.extend_from_slice(&frame.payload);
        }
        let decoded = hpack::Decoder::new().decode(&block).unwrap();
        assert_eq!(decoded[2].1, big.as_bytes());
    }

    #[test]
    fn test_request_body_waits_for_window() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let peer = SettingsBuilder::new().initial_window_size(10).build().unwrap();
        engine.feed(&FrameCodec::encode_settings_frame(&SettingsFrame::new(peer)));
        engine.take_outbound();

        engine
            .send(FrameRequest::Headers {
                stream_id: 1,
                headers: Headers::new(),
                end_stream: false,
            })
            .unwrap();
        let bytes = engine
            .send(FrameRequest::Data {
                stream_id: 1,
                data: Bytes::from("0123456789abcdef"),
                end_stream: true,
            })
            .unwrap();

        let out = frames(&bytes);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"0123456789");
        assert!(!out[0].flags.is_end_stream());
        assert_eq!(engine.queued_bytes(1), 6);

        engine.feed(&FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 100)));
        let out = frames(&engine.take_outbound().unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"abcdef");
        assert!(out[0].flags.is_end_stream());
        assert_eq!(engine.queued_bytes(1), 0);
    }

    #[test]
    fn test_receive_window_is_replenished() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        engine
            .send(FrameRequest::Headers {
                stream_id: 1,
                headers: Headers::new(),
                end_stream: true,
            })
            .unwrap();

        let chunk = Bytes::from(vec![b'x'; 16384]);
        let mut wire = BytesMut::new();
        for _ in 0..3 {
            wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(1, chunk.clone(), false)));
        }
        let events = engine.feed(&wire);
        assert_eq!(events.len(), 3);

        let out = frames(&engine.take_outbound().unwrap());
        let updates: Vec<(StreamId, u32)> = out
            .iter()
            .filter(|f| f.frame_type == Some(FrameType::WindowUpdate))
            .map(|f| {
                let u = FrameCodec::parse_window_update(f.stream_id, &f.payload).unwrap();
                (u.stream_id, u.size_increment)
            })
            .collect();
        // 3 * 16384 consumed leaves 16383, below half of 65535
        assert!(updates.contains(&(1, 49152)));
        assert!(updates.contains(&(0, 49152)));
    }

    #[test]
    fn test_reset_and_goaway_events() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(
            5,
            ErrorCode::RefusedStream,
        )));
        wire.extend_from_slice(&FrameCodec::encode_goaway_frame(&GoawayFrame::new(
            5,
            ErrorCode::NoError,
            Bytes::new(),
        )));

        let events = engine.feed(&wire);
        assert!(matches!(events[0], EngineEvent::Reset { stream_id: 5, code: 0x7 }));
        assert!(events[0].is_stream_terminal());
        assert!(matches!(events[1], EngineEvent::GoAway { last_stream_id: 5, code: 0, .. }));
        assert_eq!(events[1].stream_id(), None);
    }

    #[test]
    fn test_data_on_stream_zero_is_an_error() {
        let mut engine = ProtocolEngine::new(Settings::client_defaults());
        let events = engine.feed(&FrameCodec::encode_data_frame(&DataFrame::new(
            0,
            Bytes::from("x"),
            false,
        )));
        assert!(matches!(events.as_slice(), [EngineEvent::ProtocolError(_)]));
    }
}
