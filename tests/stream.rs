//! Stream transport scenarios: echo, broadcast, lifecycle idempotence, the
//! HTTP-style key-value smoke test and random churn.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use zeehond::{
    ClientHandler, Endpoint, Error, Reactor, ServerHandler, Session, StreamClient, StreamServer,
};

/// Echoes every received buffer straight back into the session.
#[derive(Default)]
struct EchoServer {
    errors: AtomicU64,
}

impl ServerHandler for EchoServer {
    fn on_received(&self, session: &Arc<Session>, buffer: &[u8]) {
        session.send(buffer);
    }

    fn on_error(&self, _error: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records everything the client sees.
#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<u8>>,
    connected: AtomicU64,
    disconnected: AtomicU64,
    errors: AtomicU64,
}

impl Recorder {
    fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.received.lock().unwrap().clear();
    }
}

impl ClientHandler for Recorder {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_received(&self, buffer: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(buffer);
    }

    fn on_error(&self, _error: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn endpoint(port: u16) -> Endpoint {
    Endpoint::resolve("127.0.0.1", port).unwrap()
}

#[test]
fn tcp_echo() {
    common::setup();
    let reactor = Reactor::new();
    assert!(reactor.start());
    reactor.wait_started();

    let server_side = Arc::new(EchoServer::default());
    let port = common::free_port();
    let server = StreamServer::new(reactor.clone(), server_side.clone(), endpoint(port));
    assert!(server.start());
    server.wait_started();

    let client_side = Arc::new(Recorder::default());
    let client = StreamClient::new(reactor.clone(), client_side.clone(), endpoint(port));
    assert!(client.connect());
    client.wait_connected();

    assert!(client.send(b"test") > 0);
    assert!(common::eventually(|| client.bytes_received() == 4));
    assert_eq!(client.bytes_sent(), 4);
    assert_eq!(client_side.received(), b"test");

    assert!(client.disconnect());
    client.wait_disconnected();
    assert!(!client.is_connected());
    assert_eq!(server_side.errors.load(Ordering::SeqCst), 0);

    assert!(server.stop());
    server.wait_stopped();
    assert!(reactor.stop());
}

#[test]
fn send_order_is_preserved() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let port = common::free_port();
    let server = StreamServer::new(
        reactor.clone(),
        Arc::new(EchoServer::default()),
        endpoint(port),
    );
    server.start();
    server.wait_started();

    let client_side = Arc::new(Recorder::default());
    let client = StreamClient::new(reactor.clone(), client_side.clone(), endpoint(port));
    client.connect();
    client.wait_connected();

    let mut expected = Vec::new();
    for n in 0u32..64 {
        let chunk = n.to_be_bytes();
        expected.extend_from_slice(&chunk);
        client.send(&chunk);
    }
    assert!(common::eventually(|| client.bytes_received() == expected.len() as u64));
    assert_eq!(client_side.received(), expected);

    client.disconnect();
    client.wait_disconnected();
    server.stop();
    server.wait_stopped();
    reactor.stop();
}

#[test]
fn broadcast_reaches_every_session() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let port = common::free_port();
    let server = StreamServer::new(
        reactor.clone(),
        Arc::new(EchoServer::default()),
        endpoint(port),
    );
    server.start();
    server.wait_started();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let side = Arc::new(Recorder::default());
        let client = StreamClient::new(reactor.clone(), side.clone(), endpoint(port));
        client.connect();
        client.wait_connected();
        clients.push((client, side));
    }
    assert!(common::eventually(|| server.current_sessions() == 3));

    assert!(server.broadcast(b"hi"));
    for (client, side) in &clients {
        assert!(common::eventually(|| client.bytes_received() == 2));
        assert_eq!(side.received(), b"hi");
    }

    assert!(server.disconnect_all());
    for (client, _) in &clients {
        client.wait_disconnected();
    }
    assert!(common::eventually(|| server.current_sessions() == 0));

    server.stop();
    server.wait_stopped();
    reactor.stop();
}

#[test]
fn server_lifecycle_is_idempotent() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let port = common::free_port();
    let server = StreamServer::new(
        reactor.clone(),
        Arc::new(EchoServer::default()),
        endpoint(port),
    );
    assert!(server.start());
    server.wait_started();
    assert!(!server.start());

    assert!(server.restart());
    server.wait_started();
    assert!(server.is_started());

    assert!(server.stop());
    server.wait_stopped();
    assert!(!server.stop());
    reactor.stop();
}

#[test]
fn bind_failure_is_fatal_and_reported() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let port = common::free_port();
    let first = StreamServer::new(
        reactor.clone(),
        Arc::new(EchoServer::default()),
        endpoint(port),
    );
    first.start();
    first.wait_started();

    // Same port again: the bind fails, the error surfaces, the server never
    // reaches the started state.
    let side = Arc::new(EchoServer::default());
    let second = StreamServer::new(reactor.clone(), side.clone(), endpoint(port));
    assert!(second.start());
    assert!(common::eventually(|| side.errors.load(Ordering::SeqCst) > 0));
    assert!(!second.is_started());

    first.stop();
    first.wait_stopped();
    reactor.stop();
}

#[test]
fn reconnect_looks_like_a_fresh_connect() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let port = common::free_port();
    let server = StreamServer::new(
        reactor.clone(),
        Arc::new(EchoServer::default()),
        endpoint(port),
    );
    server.start();
    server.wait_started();

    let side = Arc::new(Recorder::default());
    let client = StreamClient::new(reactor.clone(), side.clone(), endpoint(port));
    client.connect();
    client.wait_connected();
    client.send(b"one");
    assert!(common::eventually(|| client.bytes_received() == 3));

    assert!(client.reconnect());
    client.wait_connected();
    // Fresh statistics after the reconnect, same identity for the client.
    assert_eq!(client.bytes_sent(), 0);
    side.clear();
    client.send(b"two");
    assert!(common::eventually(|| client.bytes_received() == 3));
    assert_eq!(side.received(), b"two");
    assert_eq!(side.connected.load(Ordering::SeqCst), 2);
    assert_eq!(side.disconnected.load(Ordering::SeqCst), 1);

    client.disconnect();
    client.wait_disconnected();
    server.stop();
    server.wait_stopped();
    reactor.stop();
}

/// A bytes-in/bytes-out key-value store in the shape of HTTP requests,
/// exercising the pipeline end to end: `VERB /storage/KEY` headers-free
/// requests with an optional body after a blank line.
struct KvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KvStore {
    fn respond(&self, request: &str) -> String {
        let (line, body) = match request.split_once("\n\n") {
            Some((line, body)) => (line.trim(), body),
            None => (request.trim(), ""),
        };
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let key = parts.next().unwrap_or_default().to_owned();
        let mut entries = self.entries.lock().unwrap();
        match verb {
            "GET" => format!("200\n\n{}", entries.get(&key).cloned().unwrap_or_default()),
            "POST" | "PUT" => {
                entries.insert(key, body.to_owned());
                "200\n\n".to_owned()
            }
            "DELETE" => {
                entries.remove(&key);
                "200\n\n".to_owned()
            }
            _ => "400\n\n".to_owned(),
        }
    }
}

impl ServerHandler for KvStore {
    fn on_received(&self, session: &Arc<Session>, buffer: &[u8]) {
        let request = String::from_utf8_lossy(buffer);
        session.send(self.respond(&request).as_bytes());
    }
}

#[test]
fn http_style_key_value_storage() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let port = common::free_port();
    let server = StreamServer::new(
        reactor.clone(),
        Arc::new(KvStore {
            entries: Mutex::new(HashMap::new()),
        }),
        endpoint(port),
    );
    server.start();
    server.wait_started();

    let side = Arc::new(Recorder::default());
    let client = StreamClient::new(reactor.clone(), side.clone(), endpoint(port));
    client.connect();
    client.wait_connected();

    let exchange = |request: &str| -> String {
        side.clear();
        client.send(request.as_bytes());
        assert!(common::eventually(|| {
            String::from_utf8_lossy(&side.received()).contains("\n\n")
        }));
        // Give a response split across reads a moment to finish arriving.
        std::thread::sleep(Duration::from_millis(20));
        let response = String::from_utf8(side.received()).unwrap();
        response
            .split_once("\n\n")
            .map(|(_, body)| body.to_owned())
            .unwrap_or_default()
    };

    assert_eq!(exchange("GET /storage/test"), "");
    assert_eq!(exchange("POST /storage/test\n\n123"), "");
    assert_eq!(exchange("GET /storage/test"), "123");
    assert_eq!(exchange("PUT /storage/test\n\n123456"), "");
    assert_eq!(exchange("GET /storage/test"), "123456");
    assert_eq!(exchange("DELETE /storage/test"), "");
    assert_eq!(exchange("GET /storage/test"), "");

    client.disconnect();
    client.wait_disconnected();
    server.stop();
    server.wait_stopped();
    reactor.stop();
}

#[test]
fn engine_config_flows_into_components() {
    common::setup();
    let path = std::env::temp_dir().join(format!("zeehond-config-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
        [reactor]
        polling = true

        [stream]
        chunk = 1024
        "#,
    )
    .unwrap();
    let config = zeehond::EngineConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert!(config.reactor.polling);
    assert_eq!(config.stream.chunk, 1024);

    let reactor = Reactor::with_config(&config.reactor, Arc::new(zeehond::NullHandler));
    // Polling mode is the configured default for `start`.
    assert!(reactor.start());
    reactor.wait_started();

    let port = common::free_port();
    let server = StreamServer::with_config(
        reactor.clone(),
        Arc::new(EchoServer::default()),
        endpoint(port),
        None,
        config.stream.clone(),
    )
    .unwrap();
    server.start();
    server.wait_started();

    let side = Arc::new(Recorder::default());
    let client = StreamClient::with_config(
        reactor.clone(),
        side.clone(),
        endpoint(port),
        None,
        config.stream,
    )
    .unwrap();
    client.connect();
    client.wait_connected();
    client.send(b"configured");
    assert!(common::eventually(|| client.bytes_received() == 10));

    client.disconnect();
    client.wait_disconnected();
    server.stop();
    server.wait_stopped();
    reactor.stop();
}

#[test]
fn random_churn_settles_cleanly() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let server_side = Arc::new(EchoServer::default());
    let port = common::free_port();
    let server = StreamServer::new(reactor.clone(), server_side.clone(), endpoint(port));
    server.start();
    server.wait_started();

    let mut clients = Vec::new();
    for _ in 0..24 {
        let side = Arc::new(Recorder::default());
        let client = StreamClient::new(reactor.clone(), side.clone(), endpoint(port));
        clients.push((client, side));
    }

    let mut rng = rand::thread_rng();
    let rounds = 400;
    for _ in 0..rounds {
        let (client, _) = &clients[rng.gen_range(0..clients.len())];
        match rng.gen_range(0..10) {
            0 => {
                client.disconnect();
            }
            1..=2 => {
                client.connect();
            }
            _ => {
                if client.is_connected() {
                    let size = rng.gen_range(1..256);
                    let payload: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
                    client.send(&payload);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    // Settle: bring every client up, retrying those caught mid-teardown.
    assert!(common::eventually(|| {
        for (client, _) in &clients {
            if !client.is_connected() {
                client.connect();
            }
        }
        clients.iter().all(|(client, _)| client.is_connected())
    }));
    for (client, _) in &clients {
        client.send(b"fin");
    }
    assert!(common::eventually(|| server.bytes_received() > 0));

    for (client, _) in &clients {
        client.disconnect();
    }
    assert!(common::eventually(|| clients
        .iter()
        .all(|(client, _)| !client.is_connected())));
    assert!(common::eventually(|| server.current_sessions() == 0));
    // Churn produces only the silent-disconnect class of failures, none of
    // which may surface as errors on the clients.
    assert!(clients
        .iter()
        .all(|(_, side)| side.errors.load(Ordering::SeqCst) == 0));

    server.stop();
    server.wait_stopped();
    reactor.stop();
}
