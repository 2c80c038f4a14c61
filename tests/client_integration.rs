//! Client integration tests
//!
//! These tests drive the client against an in-process HTTP/2 server:
//! - Asynchronous dispatch and join
//! - Idle timeout with and without a client error handler
//! - Transparent reconnection after a dropped connection
//! - Synchronous calls
//! - Stream resets and explicit close

mod support;

use h2mux::http::h2::{ErrorCode, StreamState};
use h2mux::{Client, ClientOptions, Error, Headers, Method, RequestOptions, TimeoutKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use support::{DummyServer, Reply};

#[derive(Default)]
struct Observed {
    headers: Mutex<Option<Headers>>,
    body: Mutex<Vec<u8>>,
    closes: AtomicUsize,
    errors: AtomicUsize,
}

/// Record every event an exchange emits
fn observe(exchange: &h2mux::Exchange) -> Arc<Observed> {
    let observed = Arc::new(Observed::default());

    let sink = observed.clone();
    exchange.on_headers(move |headers| {
        *sink.headers.lock().unwrap() = Some(headers.clone());
    });
    let sink = observed.clone();
    exchange.on_body_chunk(move |chunk| sink.body.lock().unwrap().extend_from_slice(chunk));
    let sink = observed.clone();
    exchange.on_close(move || {
        sink.closes.fetch_add(1, Ordering::SeqCst);
    });
    let sink = observed.clone();
    exchange.on_error(move |_| {
        sink.errors.fetch_add(1, Ordering::SeqCst);
    });

    observed
}

fn idle_client(server: &DummyServer, idle: Duration) -> Client {
    Client::with_options(&server.uri(), ClientOptions::new().idle_timeout(idle)).unwrap()
}

#[test]
fn test_async_request_and_join() {
    let server = DummyServer::start();
    server.on_request(|_| Reply::ok("response body"));

    let client = Client::new(&server.uri()).unwrap();
    let exchange = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    let observed = observe(&exchange);

    client.call_async(&exchange).unwrap();
    client.join(Some(Duration::from_secs(5))).unwrap();

    let headers = observed.headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get(":status"), Some("200"));
    assert_eq!(headers.get("content-length"), Some("13"));
    assert_eq!(&*observed.body.lock().unwrap(), b"response body");
    assert_eq!(observed.closes.load(Ordering::SeqCst), 1);
    assert_eq!(observed.errors.load(Ordering::SeqCst), 0);
    assert_eq!(exchange.state(), StreamState::Closed);
    assert_eq!(client.stream_count(), 0);
}

#[test]
fn test_concurrent_exchanges_share_one_connection() {
    let server = DummyServer::start();
    server.on_request(|request| Reply::ok(request.headers.get(":path").unwrap_or("")));

    let client = Client::new(&server.uri()).unwrap();
    let exchanges: Vec<_> = (0..5)
        .map(|i| {
            client.prepare_request(Method::Get, &format!("/item/{}", i), RequestOptions::new())
        })
        .collect();

    for exchange in &exchanges {
        client.call_async(exchange).unwrap();
    }
    client.join(Some(Duration::from_secs(5))).unwrap();

    let ids: Vec<u32> = exchanges.iter().map(|e| e.stream_id().unwrap()).collect();
    assert_eq!(ids, vec![1, 3, 5, 7, 9]);
    for (i, exchange) in exchanges.iter().enumerate() {
        assert_eq!(&exchange.response_body()[..], format!("/item/{}", i).as_bytes());
    }
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_idle_timeout_reported_to_client_handler() {
    let server = DummyServer::start();
    server.on_request(|_| {
        thread::sleep(Duration::from_millis(1500));
        Reply::Ignore
    });

    let client = idle_client(&server, Duration::from_millis(500));
    let captured: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    client.on_error(move |err| {
        *sink.lock().unwrap() = Some(err.clone());
    });

    let exchange = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    client.call_async(&exchange).unwrap();
    client.join(Some(Duration::from_secs(5))).unwrap();

    let err = captured.lock().unwrap().clone().unwrap();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Idle));
    assert_eq!(err.to_string(), "Connection was idle");
    assert_eq!(exchange.state(), StreamState::Failed);
}

#[test]
fn test_idle_timeout_raised_by_join() {
    let server = DummyServer::start();
    server.on_request(|_| {
        thread::sleep(Duration::from_millis(1500));
        Reply::Ignore
    });

    let client = idle_client(&server, Duration::from_millis(500));
    let exchange = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    client.call_async(&exchange).unwrap();

    let err = client.join(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, Error::Timeout(TimeoutKind::Idle)));
    assert_eq!(err.to_string(), "Connection was idle");
}

#[test]
fn test_exchange_handler_absorbs_idle_timeout() {
    let server = DummyServer::start();
    server.on_request(|_| {
        thread::sleep(Duration::from_millis(1500));
        Reply::Ignore
    });

    let client = idle_client(&server, Duration::from_millis(500));
    let exchange = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    let observed = observe(&exchange);
    client.call_async(&exchange).unwrap();

    client.join(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(observed.errors.load(Ordering::SeqCst), 1);
    assert_eq!(observed.closes.load(Ordering::SeqCst), 0);
    assert!(exchange.error().unwrap().is_timeout());
}

fn close_first_then_respond(server: &DummyServer) {
    let close_next = AtomicBool::new(true);
    server.on_request(move |_| {
        if close_next.swap(false, Ordering::SeqCst) {
            Reply::Close
        } else {
            Reply::ok("response body")
        }
    });
}

fn assert_repaired(client: &Client) {
    let exchange = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    let observed = observe(&exchange);

    client.call_async(&exchange).unwrap();
    client.join(Some(Duration::from_secs(5))).unwrap();

    let headers = observed.headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get(":status"), Some("200"));
    assert_eq!(headers.get("content-length"), Some("13"));
    assert_eq!(&*observed.body.lock().unwrap(), b"response body");
    assert_eq!(observed.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_repairs_connection_with_client_handler() {
    let server = DummyServer::start();
    close_first_then_respond(&server);

    let client = idle_client(&server, Duration::from_secs(1));
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    client.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let first = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    client.call_async(&first).unwrap();
    client.join(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(first.error().unwrap().is_transport());

    assert_repaired(&client);
    assert_eq!(server.connections(), 2);
}

#[test]
fn test_repairs_connection_without_client_handler() {
    let server = DummyServer::start();
    close_first_then_respond(&server);

    let client = idle_client(&server, Duration::from_secs(1));

    let first = client.prepare_request(Method::Get, "/path", RequestOptions::new());
    client.call_async(&first).unwrap();
    let err = client.join(Some(Duration::from_secs(5))).unwrap_err();
    assert!(err.is_transport() || err.is_timeout());

    assert_repaired(&client);
}

#[test]
fn test_join_timeout_leaves_exchange_running() {
    let server = DummyServer::start();
    server.on_request(|_| {
        thread::sleep(Duration::from_millis(300));
        Reply::ok("late")
    });

    let client = Client::new(&server.uri()).unwrap();
    let exchange = client.prepare_request(Method::Get, "/slow", RequestOptions::new());
    client.call_async(&exchange).unwrap();

    let err = client.join(Some(Duration::from_millis(50))).unwrap_err();
    assert!(matches!(err, Error::Timeout(TimeoutKind::Exceeded)));
    assert_eq!(err.to_string(), "Exceeded timeout");
    assert!(!exchange.is_finished());

    client.join(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(&exchange.response_body()[..], b"late");
}

#[test]
fn test_synchronous_call() {
    let server = DummyServer::start();
    server.on_request(|request| Reply::Respond {
        status: 201,
        headers: vec![("x-echo-length".to_string(), request.body.len().to_string())],
        body: request.body.clone(),
    });

    let client = Client::new(&server.uri()).unwrap();
    let response = client
        .call(
            Method::Post,
            "/upload",
            RequestOptions::new()
                .header("Content-Type", "text/plain")
                .body("payload bytes"),
        )
        .unwrap();

    assert_eq!(response.status(), Some(201));
    assert!(response.is_ok());
    assert_eq!(response.headers().get("x-echo-length"), Some("13"));
    assert_eq!(&response.body()[..], b"payload bytes");

    // Synchronous calls never leave anything for join
    client.join(Some(Duration::from_millis(50))).unwrap();
}

#[test]
fn test_synchronous_call_timeout() {
    let server = DummyServer::start();
    server.on_request(|_| Reply::Ignore);

    let client = Client::new(&server.uri()).unwrap();
    let err = client
        .call(
            Method::Get,
            "/never",
            RequestOptions::new().timeout(Duration::from_millis(100)),
        )
        .unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Exceeded));
}

#[test]
fn test_request_headers_reach_server() {
    let server = DummyServer::start();
    let seen: Arc<Mutex<Option<Headers>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    server.on_request(move |request| {
        *sink.lock().unwrap() = Some(request.headers.clone());
        Reply::ok("")
    });

    let client = Client::new(&server.uri()).unwrap();
    client
        .call(
            Method::Get,
            "/search",
            RequestOptions::new().header("X-Trace", "abc").param("q", "rust h2"),
        )
        .unwrap();

    let headers = seen.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get(":method"), Some("GET"));
    assert_eq!(headers.get(":scheme"), Some("http"));
    assert_eq!(headers.get(":path"), Some("/search?q=rust+h2"));
    assert_eq!(
        headers.get(":authority"),
        Some(format!("127.0.0.1:{}", server.port()).as_str())
    );
    assert_eq!(headers.get("x-trace"), Some("abc"));
}

#[test]
fn test_stream_reset_fails_only_that_exchange() {
    let server = DummyServer::start();
    server.on_request(|request| {
        if request.headers.get(":path") == Some("/refused") {
            Reply::Reset(ErrorCode::RefusedStream)
        } else {
            Reply::ok("fine")
        }
    });

    let client = Client::new(&server.uri()).unwrap();
    let refused = client.prepare_request(Method::Get, "/refused", RequestOptions::new());
    let observed = observe(&refused);
    client.call_async(&refused).unwrap();
    client.join(Some(Duration::from_secs(5))).unwrap();

    let err = refused.error().unwrap();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("REFUSED_STREAM"));
    assert_eq!(observed.errors.load(Ordering::SeqCst), 1);

    // The connection survives the reset
    let response = client.call(Method::Get, "/ok", RequestOptions::new()).unwrap();
    assert_eq!(&response.body()[..], b"fine");
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_unhandled_stream_reset_raised_by_join() {
    let server = DummyServer::start();
    server.on_request(|_| Reply::Reset(ErrorCode::InternalError));

    let client = Client::new(&server.uri()).unwrap();
    let exchange = client.prepare_request(Method::Get, "/", RequestOptions::new());
    client.call_async(&exchange).unwrap();

    let err = client.join(Some(Duration::from_secs(5))).unwrap_err();
    assert!(err.to_string().contains("reset by peer"));
}

#[test]
fn test_close_fails_open_exchanges_once() {
    let server = DummyServer::start();
    server.on_request(|_| Reply::Ignore);

    let client = Client::new(&server.uri()).unwrap();
    let exchange = client.prepare_request(Method::Get, "/pending", RequestOptions::new());
    let observed = observe(&exchange);
    client.call_async(&exchange).unwrap();

    for _ in 0..50 {
        if client.stream_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(client.stream_count(), 1);

    client.close();
    assert!(matches!(exchange.error(), Some(Error::Closed)));
    assert_eq!(observed.errors.load(Ordering::SeqCst), 1);
    assert_eq!(observed.closes.load(Ordering::SeqCst), 0);
    assert_eq!(client.stream_count(), 0);

    // Closing is not an error for join
    client.join(Some(Duration::from_millis(50))).unwrap();
}

#[test]
fn test_close_is_not_overtaken_by_peer_hangup() {
    // DummyServer hangs up as soon as it reads the GOAWAY sent by close
    let server = DummyServer::start();
    server.on_request(|_| Reply::Ignore);

    for _ in 0..20 {
        let client = Client::new(&server.uri()).unwrap();
        let exchange = client.prepare_request(Method::Get, "/pending", RequestOptions::new());
        client.call_async(&exchange).unwrap();

        client.close();
        assert!(matches!(exchange.error(), Some(Error::Closed)));
        client.join(Some(Duration::from_millis(50))).unwrap();
    }
}

#[test]
fn test_synchronous_call_failure_skips_client_handler() {
    let server = DummyServer::start();
    server.on_request(|_| Reply::Close);

    let client = Client::new(&server.uri()).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    client.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = client.call(Method::Get, "/", RequestOptions::new()).unwrap_err();
    assert!(err.is_transport());

    // The read loop reports after failing the exchange
    thread::sleep(Duration::from_millis(200));
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    client.join(Some(Duration::from_millis(50))).unwrap();
}

#[test]
fn test_remote_settings_after_connecting() {
    let server = DummyServer::start();
    let client = Client::new(&server.uri()).unwrap();
    client.call(Method::Get, "/", RequestOptions::new()).unwrap();

    let settings = client.remote_settings().as_map();
    assert_eq!(settings.len(), 6);
    assert_eq!(settings["settings_initial_window_size"], 65535);
    assert_eq!(settings["settings_max_frame_size"], 16384);
    assert_eq!(settings["settings_header_table_size"], 4096);
}
