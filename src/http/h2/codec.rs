//! HTTP/2 frame encoding and decoding
//!
//! Encoders turn frame structs into wire bytes. The decoder is incremental:
//! bytes are pushed as they arrive from the socket and complete frames are
//! pulled out one at a time, so a frame split across reads is never lost.

use super::error::protocol_error;
use super::frames::*;
use super::settings::{Settings, SettingsParameter};
use super::stream::StreamId;
use super::DEFAULT_MAX_FRAME_SIZE;
use crate::http::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec {
    /// Bytes received but not yet decoded
    read_buffer: BytesMut,
    /// Largest payload we accept, as advertised in our SETTINGS
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(4096),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    /// Accept payloads up to this size
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = (size as usize).min(MAX_FRAME_SIZE);
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Append received bytes to the decode buffer
    pub fn push(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Take the next complete frame out of the decode buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
        let (frame_type, flags, stream_id, length) = Self::decode_header(&header);

        if length > self.max_frame_size {
            return Err(protocol_error(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(length).freeze();

        Ok(Some(Frame::new(frame_type, flags, stream_id, payload)))
    }

    /// Encode a frame header into a buffer
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header from bytes
    pub fn decode_header(
        bytes: &[u8; FRAME_HEADER_SIZE],
    ) -> (Option<FrameType>, FrameFlags, StreamId, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let frame_type = FrameType::from_u8(bytes[3]);
        let flags = FrameFlags::from_u8(bytes[4]);

        // Stream ID (31 bits, ignore reserved bit)
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        (frame_type, flags, stream_id, length)
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.frame_size());
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.padding.is_some() {
            flags.set(FrameFlags::PADDED);
        }

        let header = Self::encode_header(FrameType::Data, flags, frame.stream_id, frame.frame_size());
        buf.put_slice(&header);

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
        }
        buf.put_slice(&frame.data);
        if let Some(pad_len) = frame.padding {
            buf.put_bytes(0, pad_len as usize);
        }

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
        }

        let header = Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
        }
        buf.put_slice(&frame.header_block);
        if let Some(pad_len) = frame.padding {
            buf.put_bytes(0, pad_len as usize);
        }

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());
        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        // Each setting is 6 bytes (2 byte ID + 4 byte value)
        let mut settings_data = BytesMut::new();

        if !frame.ack {
            for (param, value) in frame.settings.entries() {
                settings_data.put_u16(param.as_u16());
                settings_data.put_u32(value);
            }
        }

        // Stream ID must be 0 for SETTINGS
        let header = Self::encode_header(FrameType::Settings, flags, 0, settings_data.len());
        buf.put_slice(&header);
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let header = Self::encode_header(FrameType::Ping, flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        // 4 bytes stream ID + 4 bytes error code + debug data
        let payload_len = 8 + frame.debug_data.len();

        let header = Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        buf.put_slice(&header);
        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(frame.error_code);
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        buf.put_slice(&header);
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = Self::encode_header(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);
        buf.put_u32(frame.error_code);

        buf.freeze()
    }

    /// Remove the padding of a PADDED DATA or HEADERS payload
    pub fn strip_padding(flags: FrameFlags, payload: Bytes) -> Result<Bytes> {
        if !flags.is_padded() {
            return Ok(payload);
        }

        let pad_len = *payload
            .first()
            .ok_or_else(|| protocol_error("padded frame without pad length"))? as usize;
        if pad_len >= payload.len() {
            return Err(protocol_error(format!(
                "padding length {} exceeds payload length {}",
                pad_len,
                payload.len()
            )));
        }

        Ok(payload.slice(1..payload.len() - pad_len))
    }

    /// Parse a SETTINGS payload; unknown identifiers are ignored
    pub fn parse_settings(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(protocol_error(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for chunk in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            if let Some(param) = SettingsParameter::from_u16(id) {
                settings.apply(param, value)?;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parse a PING payload
    pub fn parse_ping(payload: &[u8]) -> Result<[u8; 8]> {
        payload
            .try_into()
            .map_err(|_| protocol_error(format!("PING payload length {} != 8", payload.len())))
    }

    /// Parse a GOAWAY payload
    pub fn parse_goaway(payload: &Bytes) -> Result<GoawayFrame> {
        if payload.len() < 8 {
            return Err(protocol_error("GOAWAY payload shorter than 8 bytes"));
        }

        Ok(GoawayFrame {
            last_stream_id: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                & 0x7FFFFFFF,
            error_code: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            debug_data: payload.slice(8..),
        })
    }

    /// Parse a WINDOW_UPDATE payload
    pub fn parse_window_update(stream_id: StreamId, payload: &[u8]) -> Result<WindowUpdateFrame> {
        if payload.len() != 4 {
            return Err(protocol_error(format!(
                "WINDOW_UPDATE payload length {} != 4",
                payload.len()
            )));
        }

        let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFFFFFF;
        Ok(WindowUpdateFrame::new(stream_id, increment))
    }

    /// Parse a RST_STREAM payload
    pub fn parse_rst_stream(stream_id: StreamId, payload: &[u8]) -> Result<RstStreamFrame> {
        if payload.len() != 4 {
            return Err(protocol_error(format!(
                "RST_STREAM payload length {} != 4",
                payload.len()
            )));
        }

        Ok(RstStreamFrame {
            stream_id,
            error_code: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        })
    }

    /// Read one frame from a blocking reader
    pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let (frame_type, flags, stream_id, payload_len) = Self::decode_header(&header);

        if payload_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame payload too large: {}", payload_len),
            ));
        }

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Frame::new(frame_type, flags, stream_id, Bytes::from(payload)))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
