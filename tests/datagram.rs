//! Datagram endpoint scenarios: UDP echo, reentrant reconnect from inside
//! `on_disconnected`, and multicast group management.

mod common;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use zeehond::{DatagramHandler, DatagramSocket, Endpoint, Error, Reactor};

fn endpoint(port: u16) -> Endpoint {
    Endpoint::resolve("127.0.0.1", port).unwrap()
}

/// Echoes each datagram back to its sender. The socket handle is installed
/// after construction because the handler is created first.
#[derive(Default)]
struct EchoPeer {
    socket: Mutex<Option<DatagramSocket>>,
    errors: AtomicU64,
}

impl DatagramHandler for EchoPeer {
    fn on_received(&self, peer: &Endpoint, buffer: &[u8]) {
        if let Some(socket) = self.socket.lock().unwrap().as_ref() {
            socket.send_to(*peer, buffer);
        }
    }

    fn on_error(&self, _error: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<u8>>,
    disconnected: AtomicU64,
}

impl DatagramHandler for Recorder {
    fn on_received(&self, _peer: &Endpoint, buffer: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(buffer);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn udp_echo() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let server_side = Arc::new(EchoPeer::default());
    let server = DatagramSocket::new(reactor.clone(), server_side.clone());
    *server_side.socket.lock().unwrap() = Some(server.clone());
    let port = common::free_port();
    assert!(server.start(endpoint(port)));
    server.wait_started();

    let client_side = Arc::new(Recorder::default());
    let client = DatagramSocket::new(reactor.clone(), client_side.clone());
    assert!(client.connect(endpoint(port)));
    client.wait_connected();

    assert!(client.send(b"test"));
    assert!(common::eventually(|| client.bytes_received() == 4));
    assert_eq!(client.bytes_sent(), 4);
    assert_eq!(client.datagrams_sent(), 1);
    assert_eq!(client.datagrams_received(), 1);
    assert_eq!(&*client_side.received.lock().unwrap(), b"test");
    assert_eq!(server_side.errors.load(Ordering::SeqCst), 0);

    assert!(client.disconnect());
    client.wait_disconnected();
    assert!(common::eventually(|| client_side.disconnected.load(Ordering::SeqCst) == 1));
    assert!(!client.disconnect());

    assert!(server.stop());
    server.wait_stopped();
    assert!(!server.stop());
    reactor.stop();
}

/// `on_disconnected` may call straight back into `connect`; the endpoint
/// must come up again.
struct Reconnector {
    peer: Endpoint,
    socket: Mutex<Option<DatagramSocket>>,
    disconnects: AtomicU64,
}

impl DatagramHandler for Reconnector {
    fn on_disconnected(&self) {
        if self.disconnects.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(socket) = self.socket.lock().unwrap().as_ref() {
                socket.connect(self.peer);
            }
        }
    }
}

#[test]
fn reentrant_connect_from_disconnect_hook() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let server = DatagramSocket::new(reactor.clone(), Arc::new(Recorder::default()));
    let port = common::free_port();
    server.start(endpoint(port));
    server.wait_started();

    let side = Arc::new(Reconnector {
        peer: endpoint(port),
        socket: Mutex::new(None),
        disconnects: AtomicU64::new(0),
    });
    let client = DatagramSocket::new(reactor.clone(), side.clone());
    *side.socket.lock().unwrap() = Some(client.clone());
    client.connect(endpoint(port));
    client.wait_connected();

    assert!(client.disconnect());
    assert!(common::eventually(|| side.disconnects.load(Ordering::SeqCst) == 1));
    // The hook reconnected us.
    assert!(common::eventually(|| client.is_connected()));

    client.disconnect();
    assert!(common::eventually(|| !client.is_connected()));
    server.stop();
    server.wait_stopped();
    reactor.stop();
}

#[test]
fn multicast_group_management() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let group: IpAddr = "239.255.0.1".parse().unwrap();
    let port = common::free_port();

    let receiver_side = Arc::new(Recorder::default());
    let receiver = DatagramSocket::new(reactor.clone(), receiver_side.clone());
    assert!(receiver.start_multicast(Endpoint::resolve("239.255.0.1", port).unwrap()));
    receiver.wait_started();

    // Multicast routing depends on the host; bail out rather than fail when
    // the environment cannot join the group.
    if receiver.join_multicast(group).is_err() {
        eprintln!("skipping multicast delivery check: group join not permitted here");
        receiver.stop();
        receiver.wait_stopped();
        reactor.stop();
        return;
    }

    let sender = DatagramSocket::new(reactor.clone(), Arc::new(Recorder::default()));
    sender.start(Endpoint::resolve("0.0.0.0", 0).unwrap());
    sender.wait_started();
    assert!(sender.send_to(Endpoint::resolve("239.255.0.1", port).unwrap(), b"tick"));

    let delivered = common::wait_until(Duration::from_secs(2), || {
        receiver.bytes_received() >= 4
    });
    if delivered {
        assert_eq!(&*receiver_side.received.lock().unwrap(), b"tick");
    } else {
        eprintln!("skipping multicast delivery assertion: no loopback multicast route");
    }

    assert!(receiver.leave_multicast(group).is_ok());
    sender.stop();
    sender.wait_stopped();
    receiver.stop();
    receiver.wait_stopped();
    reactor.stop();
}

#[test]
fn send_requires_a_running_socket() {
    common::setup();
    let reactor = Reactor::new();
    reactor.start();
    reactor.wait_started();

    let socket = DatagramSocket::new(reactor.clone(), Arc::new(Recorder::default()));
    assert!(!socket.send(b"nope"));
    assert!(!socket.send_to(endpoint(9), b"nope"));
    assert!(socket.join_multicast("239.255.0.1".parse().unwrap()).is_err());

    reactor.stop();
}
