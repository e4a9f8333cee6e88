//! The datagram endpoint: a UDP peer in either role, with per-datagram
//! receive, a FIFO send queue and multicast group management.
//!
//! There is no per-peer state: one receive is in flight at a time and each
//! completion delivers `(peer, bytes)` before re-arming. Multicast binds use
//! `reuse_address`/`reuse_port` so several processes can share a group.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::RecvBuffer;
use crate::config::StreamConfig;
use crate::endpoint::Endpoint;
use crate::error::{self, Error};
use crate::event::DatagramHandler;
use crate::reactor::Reactor;

/// A UDP endpoint: `start` binds it as a server (optionally on a multicast
/// group), `connect` pairs it with a single peer as a client.
#[derive(Clone)]
pub struct DatagramSocket {
    shared: Arc<DgramShared>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Bound,
    Connected,
}

struct DgramShared {
    reactor: Reactor,
    handler: Arc<dyn DatagramHandler>,
    chunk: usize,

    started: AtomicBool,
    connected: AtomicBool,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: Mutex<Option<Endpoint>>,
    peer: Mutex<Option<Endpoint>>,
    state: Mutex<DgramState>,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,

    signal: Mutex<()>,
    cond: Condvar,
}

#[derive(Default)]
struct DgramState {
    mode: Option<Mode>,
    closed: Option<watch::Sender<bool>>,
    sends: Option<UnboundedSender<(Option<SocketAddr>, Vec<u8>)>>,
}

impl DatagramSocket {
    pub fn new(reactor: Reactor, handler: Arc<dyn DatagramHandler>) -> DatagramSocket {
        DatagramSocket::with_config(reactor, handler, StreamConfig::default())
    }

    pub fn with_config(
        reactor: Reactor,
        handler: Arc<dyn DatagramHandler>,
        config: StreamConfig,
    ) -> DatagramSocket {
        DatagramSocket {
            shared: Arc::new(DgramShared {
                reactor,
                handler,
                chunk: config.chunk,
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                socket: Mutex::new(None),
                local: Mutex::new(None),
                peer: Mutex::new(None),
                state: Mutex::new(DgramState::default()),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                datagrams_sent: AtomicU64::new(0),
                datagrams_received: AtomicU64::new(0),
                signal: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Bind to `endpoint` and start receiving. Returns `false` when already
    /// running; a bind failure is reported to `on_error` and the endpoint
    /// never reaches the started state.
    pub fn start(&self, endpoint: Endpoint) -> bool {
        self.launch(Mode::Bound, endpoint, false, None)
    }

    /// Bind to a multicast group endpoint with `reuse_address` and
    /// `reuse_port` enabled. Join the group afterwards with
    /// [`join_multicast`](DatagramSocket::join_multicast).
    pub fn start_multicast(&self, endpoint: Endpoint) -> bool {
        self.launch(Mode::Bound, endpoint, true, None)
    }

    /// Bind an ephemeral port and pair the socket with `peer`. Safe to call
    /// from inside `on_disconnected`.
    pub fn connect(&self, peer: Endpoint) -> bool {
        self.launch(
            Mode::Connected,
            Endpoint::any(peer.family(), 0),
            false,
            Some(peer),
        )
    }

    /// Stop a bound endpoint.
    pub fn stop(&self) -> bool {
        self.shutdown(Mode::Bound)
    }

    /// Disconnect a connected endpoint.
    pub fn disconnect(&self) -> bool {
        self.shutdown(Mode::Connected)
    }

    /// Queue one datagram to `peer`. Returns `false` when the endpoint is
    /// not running.
    pub fn send_to(&self, peer: Endpoint, buffer: &[u8]) -> bool {
        if buffer.is_empty() {
            return false;
        }
        let state = self.shared.state.lock().unwrap();
        match &state.sends {
            Some(sends) => sends
                .send((Some(peer.socket_addr()), buffer.to_vec()))
                .is_ok(),
            None => false,
        }
    }

    /// Queue one datagram to the connected peer.
    pub fn send(&self, buffer: &[u8]) -> bool {
        if buffer.is_empty() || !self.is_connected() {
            return false;
        }
        let state = self.shared.state.lock().unwrap();
        match &state.sends {
            Some(sends) => sends.send((None, buffer.to_vec())).is_ok(),
            None => false,
        }
    }

    /// Join a multicast group on the default interface.
    pub fn join_multicast(&self, group: IpAddr) -> Result<(), Error> {
        let socket = self.socket()?;
        match group {
            IpAddr::V4(group) => socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
        }
        debug!(%group, "joined multicast group");
        Ok(())
    }

    /// Leave a multicast group.
    pub fn leave_multicast(&self, group: IpAddr) -> Result<(), Error> {
        let socket = self.socket()?;
        match group {
            IpAddr::V4(group) => socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0)?,
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The bound local endpoint, once running.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.shared.local.lock().unwrap()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::SeqCst)
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.shared.datagrams_sent.load(Ordering::SeqCst)
    }

    pub fn datagrams_received(&self) -> u64 {
        self.shared.datagrams_received.load(Ordering::SeqCst)
    }

    pub fn wait_started(&self) {
        self.shared
            .wait(|shared| shared.started.load(Ordering::SeqCst));
    }

    pub fn wait_stopped(&self) {
        self.shared
            .wait(|shared| !shared.started.load(Ordering::SeqCst));
    }

    pub fn wait_connected(&self) {
        self.shared
            .wait(|shared| shared.connected.load(Ordering::SeqCst));
    }

    pub fn wait_disconnected(&self) {
        self.shared
            .wait(|shared| !shared.connected.load(Ordering::SeqCst));
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, Error> {
        self.shared
            .socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::WrongState("datagram socket is not running"))
    }

    fn launch(&self, mode: Mode, local: Endpoint, reuse: bool, peer: Option<Endpoint>) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.mode.is_some() {
            return false;
        }
        let (closed, closed_rx) = watch::channel(false);
        let (sends, sends_rx) = mpsc::unbounded_channel();
        state.mode = Some(mode);
        state.closed = Some(closed);
        state.sends = Some(sends);
        drop(state);

        let shared = self.shared.clone();
        self.shared
            .reactor
            .spawn(run(shared, mode, local, reuse, peer, closed_rx, sends_rx));
        true
    }

    fn shutdown(&self, mode: Mode) -> bool {
        let closed = {
            let mut state = self.shared.state.lock().unwrap();
            if state.mode != Some(mode) {
                return false;
            }
            state.mode = None;
            state.sends = None;
            match state.closed.take() {
                Some(closed) => closed,
                None => return false,
            }
        };
        self.shared.reactor.post(move || {
            let _ = closed.send(true);
        });
        true
    }
}

impl DgramShared {
    fn set_flag(&self, flag: &AtomicBool, value: bool) {
        let _guard = self.signal.lock().unwrap();
        flag.store(value, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn wait<F>(&self, pred: F)
    where
        F: Fn(&DgramShared) -> bool,
    {
        let mut guard = self.signal.lock().unwrap();
        while !pred(self) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Forget the current run. Idempotent; also covers teardown initiated
    /// from inside the run task itself.
    fn clear_state(&self) {
        let mut state = self.state.lock().unwrap();
        state.mode = None;
        state.closed = None;
        state.sends = None;
        drop(state);
        *self.socket.lock().unwrap() = None;
        *self.peer.lock().unwrap() = None;
    }
}

fn bind_socket(endpoint: SocketAddr, reuse: bool) -> io::Result<std::net::UdpSocket> {
    let domain = if endpoint.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.bind(&endpoint.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn run(
    shared: Arc<DgramShared>,
    mode: Mode,
    local: Endpoint,
    reuse: bool,
    peer: Option<Endpoint>,
    mut closed: watch::Receiver<bool>,
    sends: UnboundedReceiver<(Option<SocketAddr>, Vec<u8>)>,
) {
    let socket = bind_socket(local.socket_addr(), reuse).and_then(UdpSocket::from_std);
    let socket = match socket {
        Ok(socket) => socket,
        Err(err) => {
            warn!(endpoint = %local, %err, "failed to bind datagram socket");
            shared.handler.on_error(&Error::from(err));
            shared.clear_state();
            return;
        }
    };

    if let Some(peer) = peer {
        if let Err(err) = socket.connect(peer.socket_addr()).await {
            if !error::is_silent_disconnect(&err) {
                shared.handler.on_error(&Error::from(err));
            }
            shared.clear_state();
            shared.handler.on_disconnected();
            return;
        }
        *shared.peer.lock().unwrap() = Some(peer);
    }

    let socket = Arc::new(socket);
    *shared.socket.lock().unwrap() = Some(socket.clone());
    *shared.local.lock().unwrap() = socket.local_addr().ok().map(Endpoint::from);

    shared.bytes_sent.store(0, Ordering::SeqCst);
    shared.bytes_received.store(0, Ordering::SeqCst);
    shared.datagrams_sent.store(0, Ordering::SeqCst);
    shared.datagrams_received.store(0, Ordering::SeqCst);

    match mode {
        Mode::Bound => {
            info!(endpoint = %local, "datagram endpoint started");
            shared.set_flag(&shared.started, true);
            shared.handler.on_started();
        }
        Mode::Connected => {
            shared.set_flag(&shared.connected, true);
            shared.handler.on_connected();
        }
    }

    let sender = tokio::spawn(send_loop(
        shared.clone(),
        socket.clone(),
        sends,
        closed.clone(),
    ));
    recv_loop(&shared, &socket, &mut closed).await;
    let _ = sender.await;

    shared.clear_state();
    match mode {
        Mode::Bound => {
            shared.set_flag(&shared.started, false);
            shared.handler.on_stopped();
        }
        Mode::Connected => {
            shared.set_flag(&shared.connected, false);
            shared.handler.on_disconnected();
        }
    }
}

/// Single in-flight receive: deliver `(peer, bytes)`, grow the buffer when a
/// datagram filled it, re-arm.
async fn recv_loop(
    shared: &Arc<DgramShared>,
    socket: &Arc<UdpSocket>,
    closed: &mut watch::Receiver<bool>,
) {
    let mut buffer = RecvBuffer::new(shared.chunk);
    loop {
        if *closed.borrow() {
            break;
        }
        let result = tokio::select! {
            biased;
            _ = closed.changed() => break,
            result = socket.recv_from(buffer.space()) => result,
        };
        match result {
            Ok((count, from)) => {
                shared
                    .bytes_received
                    .fetch_add(count as u64, Ordering::SeqCst);
                shared.datagrams_received.fetch_add(1, Ordering::SeqCst);
                shared
                    .handler
                    .on_received(&Endpoint::from(from), buffer.filled(count));
                if count == buffer.capacity() {
                    buffer.grow();
                }
            }
            // ICMP-driven failures (port unreachable on a connected socket)
            // do not take the endpoint down.
            Err(err) if error::is_silent_disconnect(&err) || error::is_benign(&err) => continue,
            Err(err) => {
                shared.handler.on_error(&Error::from(err));
                break;
            }
        }
    }
}

/// One in-flight send at a time, in queue order.
async fn send_loop(
    shared: Arc<DgramShared>,
    socket: Arc<UdpSocket>,
    mut sends: UnboundedReceiver<(Option<SocketAddr>, Vec<u8>)>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        if *closed.borrow() {
            break;
        }
        let item = tokio::select! {
            biased;
            _ = closed.changed() => break,
            item = sends.recv() => item,
        };
        let (target, buffer) = match item {
            Some(item) => item,
            None => break,
        };
        let result = match target {
            Some(addr) => socket.send_to(&buffer, addr).await,
            None => socket.send(&buffer).await,
        };
        match result {
            Ok(count) => {
                shared.bytes_sent.fetch_add(count as u64, Ordering::SeqCst);
                shared.datagrams_sent.fetch_add(1, Ordering::SeqCst);
                let peer = target
                    .map(Endpoint::from)
                    .or_else(|| *shared.peer.lock().unwrap());
                if let Some(peer) = peer {
                    shared.handler.on_sent(&peer, count);
                }
            }
            Err(err) => {
                if !error::is_silent_disconnect(&err) && !error::is_benign(&err) {
                    shared.handler.on_error(&Error::from(err));
                }
            }
        }
    }
}
