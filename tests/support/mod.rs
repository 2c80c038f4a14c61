//! In-process peers for integration tests
//!
//! `DummyServer` is a minimal HTTP/2 server built on the crate's own frame
//! codec: it answers the preface, acknowledges SETTINGS and PINGs, decodes
//! request headers with HPACK and hands each complete request to a
//! handler. `MockProxy` accepts one CONNECT and records what follows.

#![allow(dead_code)]

use bytes::Bytes;
use h2mux::http::h2::frames::{DataFrame, HeadersFrame, PingFrame, RstStreamFrame, SettingsFrame};
use h2mux::http::h2::{ErrorCode, FrameCodec, FrameType, Settings, CONNECTION_PREFACE};
use h2mux::Headers;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A request as seen by the server
#[derive(Debug, Clone)]
pub struct Request {
    pub stream_id: u32,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// What the server does with a request
pub enum Reply {
    /// Send a response; `content-length` is added automatically
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// Refuse the stream with RST_STREAM
    Reset(ErrorCode),
    /// Hang up the connection without answering
    Close,
    /// Never answer
    Ignore,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::Respond {
            status: 200,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// HTTP/2 server on an ephemeral local port
pub struct DummyServer {
    port: u16,
    handler: Arc<Mutex<Handler>>,
    stop: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    acceptor: Option<JoinHandle<()>>,
}

impl DummyServer {
    /// Start listening; every request gets an empty 200 until `on_request`
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let default: Handler = Arc::new(|_| Reply::ok(""));
        let handler = Arc::new(Mutex::new(default));
        let stop = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let acceptor = {
            let handler = handler.clone();
            let stop = stop.clone();
            let connections = connections.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            stream.set_nonblocking(false).unwrap();
                            connections.fetch_add(1, Ordering::SeqCst);
                            let handler = handler.clone();
                            thread::spawn(move || serve(stream, handler));
                        }
                        Err(_) => thread::sleep(Duration::from_millis(10)),
                    }
                }
            })
        };

        DummyServer {
            port,
            handler,
            stop,
            connections,
            acceptor: Some(acceptor),
        }
    }

    /// Replace the request handler
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uri(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for DummyServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

fn serve(mut stream: TcpStream, handler: Arc<Mutex<Handler>>) {
    let mut preface = [0u8; 24];
    if stream.read_exact(&mut preface).is_err() || preface[..] != *CONNECTION_PREFACE {
        return;
    }
    let settings = FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new()));
    if stream.write_all(&settings).is_err() {
        return;
    }

    let mut decoder = hpack::Decoder::new();
    let mut encoder = hpack::Encoder::new();
    let mut partial: HashMap<u32, Request> = HashMap::new();

    while let Ok(frame) = FrameCodec::read_frame(&mut stream) {
        let complete = match frame.frame_type {
            Some(FrameType::Settings) if !frame.flags.is_ack() => {
                let ack = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
                if stream.write_all(&ack).is_err() {
                    return;
                }
                None
            }
            Some(FrameType::Ping) if !frame.flags.is_ack() => {
                let data = FrameCodec::parse_ping(&frame.payload).unwrap();
                let ack = FrameCodec::encode_ping_frame(&PingFrame::ack(data));
                if stream.write_all(&ack).is_err() {
                    return;
                }
                None
            }
            Some(FrameType::Headers) => {
                let mut headers = Headers::new();
                for (name, value) in decoder.decode(&frame.payload).unwrap() {
                    headers.insert(
                        String::from_utf8(name).unwrap(),
                        String::from_utf8(value).unwrap(),
                    );
                }
                let request = Request {
                    stream_id: frame.stream_id,
                    headers,
                    body: Vec::new(),
                };
                if frame.flags.is_end_stream() {
                    Some(request)
                } else {
                    partial.insert(frame.stream_id, request);
                    None
                }
            }
            Some(FrameType::Data) => {
                if let Some(request) = partial.get_mut(&frame.stream_id) {
                    request.body.extend_from_slice(&frame.payload);
                }
                if frame.flags.is_end_stream() {
                    partial.remove(&frame.stream_id)
                } else {
                    None
                }
            }
            Some(FrameType::Goaway) => return,
            _ => None,
        };

        let request = match complete {
            Some(request) => request,
            None => continue,
        };

        let handler = handler.lock().unwrap().clone();
        match handler(&request) {
            Reply::Respond {
                status,
                headers,
                body,
            } => {
                let status = status.to_string();
                let length = body.len().to_string();
                let mut fields: Vec<(&[u8], &[u8])> = vec![
                    (&b":status"[..], status.as_bytes()),
                    (&b"content-length"[..], length.as_bytes()),
                ];
                for (name, value) in &headers {
                    fields.push((name.as_bytes(), value.as_bytes()));
                }
                let block = Bytes::from(encoder.encode(fields));

                let mut out = FrameCodec::encode_headers_frame(&HeadersFrame::new(
                    request.stream_id,
                    block,
                    body.is_empty(),
                    true,
                ))
                .to_vec();
                if !body.is_empty() {
                    out.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
                        request.stream_id,
                        Bytes::from(body),
                        true,
                    )));
                }
                if stream.write_all(&out).is_err() {
                    return;
                }
            }
            Reply::Reset(code) => {
                let rst = FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(request.stream_id, code));
                if stream.write_all(&rst).is_err() {
                    return;
                }
            }
            Reply::Close => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            Reply::Ignore => {}
        }
    }
}

/// What the proxy saw on its single connection
pub struct ProxyCapture {
    /// The CONNECT request head, up to and including the blank line
    pub connect: String,
    /// First bytes sent through the tunnel
    pub tunneled: Vec<u8>,
}

/// HTTP proxy that accepts one CONNECT with a 200
pub struct MockProxy {
    port: u16,
    captured: Receiver<ProxyCapture>,
}

impl MockProxy {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, captured) = mpsc::channel();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).unwrap() == 0 {
                    return;
                }
                head.push(byte[0]);
            }

            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .unwrap();

            // A TLS record: 5-byte header, then the advertised length
            let mut tunneled = vec![0u8; 5];
            stream.read_exact(&mut tunneled).unwrap();
            let len = u16::from_be_bytes([tunneled[3], tunneled[4]]) as usize;
            let mut record = vec![0u8; len];
            stream.read_exact(&mut record).unwrap();
            tunneled.extend_from_slice(&record);

            let _ = tx.send(ProxyCapture {
                connect: String::from_utf8(head).unwrap(),
                tunneled,
            });
        });

        MockProxy { port, captured }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the proxy to record its connection
    pub fn capture(&self) -> ProxyCapture {
        self.captured.recv_timeout(Duration::from_secs(5)).unwrap()
    }
}
