//! The message-passing socket: pipes, pattern routing and the optional
//! polling thread.
//!
//! A socket owns zero or more *pipes*, one per connected peer. Each pipe is
//! a length-delimited framed stream driven by a task on the socket's
//! reactor; incoming frames from all pipes fair-queue into one ingress
//! channel that the blocking `receive`/`try_receive` calls drain. When a
//! pipe opens, both ends exchange their pattern identifier and the pipe is
//! torn down unless the patterns match.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver as IngressReceiver, RecvTimeoutError, Sender as IngressSender, TryRecvError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::config::MeshConfig;
use crate::error::Error;
use crate::event::MeshHandler;
use crate::mesh::{MeshAddress, Message, SocketKind};
use crate::reactor::Reactor;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const INPROC_CAPACITY: usize = 256 * 1024;

lazy_static! {
    /// In-process rendezvous: bound names and the channels over which
    /// connectors deliver their half of a duplex pipe.
    static ref INPROC: Mutex<HashMap<String, tokio::sync::mpsc::UnboundedSender<DuplexStream>>> =
        Mutex::new(HashMap::new());
}

/// A brokerless message-passing socket of a fixed [`SocketKind`].
#[derive(Clone)]
pub struct MeshSocket {
    shared: Arc<MeshShared>,
}

struct MeshShared {
    reactor: Reactor,
    kind: SocketKind,
    handler: Option<Arc<dyn MeshHandler>>,

    pipes: Mutex<HashMap<u64, Pipe>>,
    next_pipe: AtomicU64,
    round_robin: AtomicU64,

    ingress_tx: Mutex<Option<IngressSender<(u64, Bytes)>>>,
    ingress_rx: Mutex<IngressReceiver<(u64, Bytes)>>,

    subscriptions: Mutex<Vec<Vec<u8>>>,
    survey_deadline: Mutex<Duration>,
    survey_expiry: Mutex<Option<Instant>>,
    awaiting_reply: AtomicBool,
    reply_to: Mutex<Option<u64>>,

    closed: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    polling: Mutex<Option<thread::JoinHandle<()>>>,

    inproc_names: Mutex<Vec<String>>,
    #[cfg(unix)]
    ipc_paths: Mutex<Vec<PathBuf>>,

    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct Pipe {
    outgoing: UnboundedSender<Bytes>,
}

impl MeshSocket {
    pub fn new(reactor: Reactor, kind: SocketKind) -> MeshSocket {
        MeshSocket::with_config(reactor, kind, None, &MeshConfig::default())
    }

    /// A socket with a capability object; a polling thread delivering
    /// `on_received`/`on_idle` starts with the first bind or connect (for
    /// patterns that can receive).
    pub fn with_handler(
        reactor: Reactor,
        kind: SocketKind,
        handler: Arc<dyn MeshHandler>,
    ) -> MeshSocket {
        MeshSocket::with_config(reactor, kind, Some(handler), &MeshConfig::default())
    }

    pub fn with_config(
        reactor: Reactor,
        kind: SocketKind,
        handler: Option<Arc<dyn MeshHandler>>,
        config: &MeshConfig,
    ) -> MeshSocket {
        let (ingress_tx, ingress_rx) = mpsc::channel();
        let (closed, closed_rx) = watch::channel(false);
        MeshSocket {
            shared: Arc::new(MeshShared {
                reactor,
                kind,
                handler,
                pipes: Mutex::new(HashMap::new()),
                next_pipe: AtomicU64::new(1),
                round_robin: AtomicU64::new(0),
                ingress_tx: Mutex::new(Some(ingress_tx)),
                ingress_rx: Mutex::new(ingress_rx),
                subscriptions: Mutex::new(Vec::new()),
                survey_deadline: Mutex::new(config.survey_deadline),
                survey_expiry: Mutex::new(None),
                awaiting_reply: AtomicBool::new(false),
                reply_to: Mutex::new(None),
                closed,
                closed_rx,
                polling: Mutex::new(None),
                inproc_names: Mutex::new(Vec::new()),
                #[cfg(unix)]
                ipc_paths: Mutex::new(Vec::new()),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.shared.kind
    }

    /// The number of currently connected peers.
    pub fn peers(&self) -> usize {
        self.shared.pipes.lock().unwrap().len()
    }

    pub fn messages_sent(&self) -> u64 {
        self.shared.messages_sent.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> u64 {
        self.shared.messages_received.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::SeqCst)
    }

    /// Listen on `address` and accept peers. Blocks until the transport is
    /// bound; must not be called from a reactor worker.
    pub fn bind(&self, address: &str) -> Result<(), Error> {
        let address: MeshAddress = address.parse()?;
        self.check_open()?;

        match address {
            MeshAddress::Tcp(endpoint) => {
                let (ready_tx, ready_rx) = oneshot::channel();
                let shared = self.shared.clone();
                self.shared.reactor.spawn(async move {
                    let listener = match tokio::net::TcpListener::bind(endpoint.socket_addr()).await
                    {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = ready_tx.send(Err(Error::from(err)));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    let mut closed = shared.closed_rx.clone();
                    loop {
                        tokio::select! {
                            biased;
                            _ = closed.changed() => break,
                            result = listener.accept() => match result {
                                Ok((stream, _)) => {
                                    let _ = stream.set_nodelay(true);
                                    tokio::spawn(run_pipe(
                                        shared.clone(),
                                        MeshStream::Tcp(stream),
                                        None,
                                    ));
                                }
                                Err(err) => warn!(%err, "mesh accept error"),
                            },
                        }
                    }
                });
                self.finish_open(ready_rx)
            }
            #[cfg(unix)]
            MeshAddress::Ipc(path) => {
                let (ready_tx, ready_rx) = oneshot::channel();
                let shared = self.shared.clone();
                let bind_path = path.clone();
                self.shared.reactor.spawn(async move {
                    // A stale socket file from a previous run blocks the bind.
                    let _ = std::fs::remove_file(&bind_path);
                    let listener = match UnixListener::bind(&bind_path) {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = ready_tx.send(Err(Error::from(err)));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    let mut closed = shared.closed_rx.clone();
                    loop {
                        tokio::select! {
                            biased;
                            _ = closed.changed() => break,
                            result = listener.accept() => match result {
                                Ok((stream, _)) => {
                                    tokio::spawn(run_pipe(
                                        shared.clone(),
                                        MeshStream::Ipc(stream),
                                        None,
                                    ));
                                }
                                Err(err) => warn!(%err, "mesh accept error"),
                            },
                        }
                    }
                });
                let result = self.finish_open(ready_rx);
                if result.is_ok() {
                    self.shared.ipc_paths.lock().unwrap().push(path);
                }
                result
            }
            MeshAddress::Inproc(name) => {
                let (accept_tx, mut accept_rx) =
                    tokio::sync::mpsc::unbounded_channel::<DuplexStream>();
                {
                    let mut registry = INPROC.lock().unwrap();
                    if registry.contains_key(&name) {
                        return Err(Error::from(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("inproc://{} is already bound", name),
                        )));
                    }
                    registry.insert(name.clone(), accept_tx);
                }
                self.shared.inproc_names.lock().unwrap().push(name);
                let shared = self.shared.clone();
                self.shared.reactor.spawn(async move {
                    let mut closed = shared.closed_rx.clone();
                    loop {
                        tokio::select! {
                            biased;
                            _ = closed.changed() => break,
                            half = accept_rx.recv() => match half {
                                Some(half) => {
                                    tokio::spawn(run_pipe(
                                        shared.clone(),
                                        MeshStream::Inproc(half),
                                        None,
                                    ));
                                }
                                None => break,
                            },
                        }
                    }
                });
                self.after_open();
                Ok(())
            }
        }
    }

    /// Connect to a bound peer. Blocks until the pipe is established and the
    /// pattern handshake has been validated; must not be called from a
    /// reactor worker.
    pub fn connect(&self, address: &str) -> Result<(), Error> {
        let address: MeshAddress = address.parse()?;
        self.check_open()?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = self.shared.clone();
        self.shared.reactor.spawn(async move {
            let stream = match establish(address).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(Error::from(err)));
                    return;
                }
            };
            run_pipe(shared, stream, Some(ready_tx)).await;
        });

        let result = self.finish_open(ready_rx);
        if result.is_ok() {
            if let Some(handler) = &self.shared.handler {
                handler.on_connected();
            }
        }
        result
    }

    /// Send one message, routed according to the socket pattern. Returns
    /// the payload size on success.
    pub fn send(&self, buffer: impl AsRef<[u8]>) -> Result<usize, Error> {
        let buffer = buffer.as_ref();
        if !self.shared.kind.can_send() {
            return Err(Error::NotSupported(self.shared.kind));
        }
        self.check_open()?;

        let payload = Bytes::copy_from_slice(buffer);
        match self.shared.kind {
            SocketKind::Req => {
                if self.shared.awaiting_reply.swap(true, Ordering::SeqCst) {
                    return Err(Error::WrongState("a request is already in flight"));
                }
                if let Err(err) = self.route_one(payload) {
                    self.shared.awaiting_reply.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
            SocketKind::Rep | SocketKind::Respondent => {
                let target = self
                    .shared
                    .reply_to
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or(Error::WrongState("no request to reply to"))?;
                self.route_to(target, payload)?;
            }
            SocketKind::Push => self.route_one(payload)?,
            SocketKind::Pair => self.route_first(payload)?,
            SocketKind::Pub | SocketKind::Bus => {
                self.route_all(payload);
            }
            SocketKind::Surveyor => {
                self.begin_survey();
                self.route_all(payload);
            }
            SocketKind::Pull | SocketKind::Sub => unreachable!(),
        }
        self.shared.messages_sent.fetch_add(1, Ordering::SeqCst);
        Ok(buffer.len())
    }

    /// Block until a message arrives (or, for a surveyor, until the survey
    /// deadline expires).
    pub fn receive(&self) -> Result<Message, Error> {
        match self.receive_inner(true)? {
            Some(message) => Ok(message),
            None => Err(Error::WrongState("socket disconnected")),
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Result<Option<Message>, Error> {
        self.receive_inner(false)
    }

    /// Subscribe to a message prefix (SUB sockets). The empty prefix
    /// matches every message.
    pub fn subscribe(&self, prefix: impl AsRef<[u8]>) -> Result<(), Error> {
        if self.shared.kind != SocketKind::Sub {
            return Err(Error::NotSupported(self.shared.kind));
        }
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .push(prefix.as_ref().to_vec());
        Ok(())
    }

    /// Remove a previously added subscription prefix.
    pub fn unsubscribe(&self, prefix: impl AsRef<[u8]>) -> Result<(), Error> {
        if self.shared.kind != SocketKind::Sub {
            return Err(Error::NotSupported(self.shared.kind));
        }
        let prefix = prefix.as_ref();
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .retain(|existing| existing != prefix);
        Ok(())
    }

    /// Change the survey deadline applied to subsequent surveys.
    pub fn set_survey_deadline(&self, deadline: Duration) -> Result<(), Error> {
        if self.shared.kind != SocketKind::Surveyor {
            return Err(Error::NotSupported(self.shared.kind));
        }
        *self.shared.survey_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    pub fn survey_deadline(&self) -> Duration {
        *self.shared.survey_deadline.lock().unwrap()
    }

    /// Tear the socket down: every pipe closes, the polling thread exits
    /// and blocked receivers unblock. Terminal.
    pub fn disconnect(&self) -> bool {
        if *self.shared.closed_rx.borrow() {
            return false;
        }
        let _ = self.shared.closed.send(true);
        *self.shared.ingress_tx.lock().unwrap() = None;

        {
            let mut registry = INPROC.lock().unwrap();
            for name in self.shared.inproc_names.lock().unwrap().drain(..) {
                registry.remove(&name);
            }
        }
        #[cfg(unix)]
        for path in self.shared.ipc_paths.lock().unwrap().drain(..) {
            let _ = std::fs::remove_file(path);
        }

        if let Some(polling) = self.shared.polling.lock().unwrap().take() {
            if polling.thread().id() != thread::current().id() {
                let _ = polling.join();
            }
        }
        if let Some(handler) = &self.shared.handler {
            handler.on_disconnected();
        }
        true
    }

    fn check_open(&self) -> Result<(), Error> {
        if *self.shared.closed_rx.borrow() {
            Err(Error::WrongState("socket disconnected"))
        } else {
            Ok(())
        }
    }

    fn finish_open(&self, ready: oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
        match ready.blocking_recv() {
            Ok(result) => {
                result?;
                self.after_open();
                Ok(())
            }
            Err(_) => Err(Error::WrongState("reactor is not running")),
        }
    }

    /// Start the polling thread once a transport is up, when configured
    /// with a handler on a receiving pattern.
    fn after_open(&self) {
        let handler = match &self.shared.handler {
            Some(handler) if self.shared.kind.can_receive() => handler.clone(),
            _ => return,
        };
        let mut polling = self.shared.polling.lock().unwrap();
        if polling.is_some() {
            return;
        }
        let socket = self.clone();
        *polling = Some(thread::spawn(move || {
            handler.on_thread_initialize();
            loop {
                if *socket.shared.closed_rx.borrow() {
                    break;
                }
                match socket.try_receive() {
                    Ok(Some(message)) => handler.on_received(&message),
                    Ok(None) | Err(Error::SurveyExpired) => {
                        handler.on_idle();
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
            handler.on_thread_cleanup();
        }));
    }

    fn receive_inner(&self, blocking: bool) -> Result<Option<Message>, Error> {
        if !self.shared.kind.can_receive() {
            return Err(Error::NotSupported(self.shared.kind));
        }
        if self.shared.kind == SocketKind::Req
            && !self.shared.awaiting_reply.load(Ordering::SeqCst)
        {
            return Err(Error::WrongState("no request in flight"));
        }

        loop {
            let expiry = if self.shared.kind == SocketKind::Surveyor {
                let expiry = self
                    .shared
                    .survey_expiry
                    .lock()
                    .unwrap()
                    .ok_or(Error::WrongState("no survey in flight"))?;
                if Instant::now() >= expiry {
                    return Err(Error::SurveyExpired);
                }
                Some(expiry)
            } else {
                None
            };

            let received = {
                let ingress = self.shared.ingress_rx.lock().unwrap();
                if blocking {
                    match expiry {
                        None => match ingress.recv() {
                            Ok(item) => item,
                            Err(_) => return Err(Error::WrongState("socket disconnected")),
                        },
                        Some(expiry) => {
                            let remaining = expiry
                                .checked_duration_since(Instant::now())
                                .ok_or(Error::SurveyExpired)?;
                            match ingress.recv_timeout(remaining) {
                                Ok(item) => item,
                                Err(RecvTimeoutError::Timeout) => return Err(Error::SurveyExpired),
                                Err(RecvTimeoutError::Disconnected) => {
                                    return Err(Error::WrongState("socket disconnected"))
                                }
                            }
                        }
                    }
                } else {
                    match ingress.try_recv() {
                        Ok(item) => item,
                        Err(TryRecvError::Empty) => return Ok(None),
                        Err(TryRecvError::Disconnected) => {
                            return Err(Error::WrongState("socket disconnected"))
                        }
                    }
                }
            };

            let (pipe, frame) = received;
            if self.shared.kind == SocketKind::Sub
                && !matches_subscription(&self.shared.subscriptions.lock().unwrap(), &frame)
            {
                continue;
            }
            match self.shared.kind {
                SocketKind::Rep | SocketKind::Respondent => {
                    *self.shared.reply_to.lock().unwrap() = Some(pipe);
                }
                SocketKind::Req => {
                    self.shared.awaiting_reply.store(false, Ordering::SeqCst);
                }
                _ => {}
            }
            self.shared.messages_received.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(Message::new(frame)));
        }
    }

    /// Load-balance to one peer, round-robin.
    fn route_one(&self, payload: Bytes) -> Result<(), Error> {
        let pipes = self.shared.pipes.lock().unwrap();
        if pipes.is_empty() {
            return Err(Error::WrongState("no connected peers"));
        }
        let mut ids: Vec<u64> = pipes.keys().copied().collect();
        ids.sort_unstable();
        let index = self.shared.round_robin.fetch_add(1, Ordering::SeqCst) as usize % ids.len();
        pipes[&ids[index]]
            .outgoing
            .send(payload)
            .map_err(|_| Error::WrongState("peer went away"))
    }

    /// Send to the single pair peer.
    fn route_first(&self, payload: Bytes) -> Result<(), Error> {
        let pipes = self.shared.pipes.lock().unwrap();
        let first = pipes
            .keys()
            .min()
            .copied()
            .ok_or(Error::WrongState("no connected peers"))?;
        pipes[&first]
            .outgoing
            .send(payload)
            .map_err(|_| Error::WrongState("peer went away"))
    }

    /// Fan out to every peer. Messages to no one are silently dropped, as
    /// pub/sub semantics require.
    fn route_all(&self, payload: Bytes) -> usize {
        let pipes = self.shared.pipes.lock().unwrap();
        let mut delivered = 0;
        for pipe in pipes.values() {
            if pipe.outgoing.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn route_to(&self, target: u64, payload: Bytes) -> Result<(), Error> {
        let pipes = self.shared.pipes.lock().unwrap();
        match pipes.get(&target) {
            Some(pipe) => pipe
                .outgoing
                .send(payload)
                .map_err(|_| Error::WrongState("peer went away")),
            None => Err(Error::WrongState("peer went away")),
        }
    }

    /// Start a new survey: discard responses still queued from the previous
    /// one and arm the deadline.
    fn begin_survey(&self) {
        {
            let ingress = self.shared.ingress_rx.lock().unwrap();
            while ingress.try_recv().is_ok() {}
        }
        let deadline = *self.shared.survey_deadline.lock().unwrap();
        *self.shared.survey_expiry.lock().unwrap() = Some(Instant::now() + deadline);
    }
}

fn matches_subscription(subscriptions: &[Vec<u8>], frame: &[u8]) -> bool {
    subscriptions.iter().any(|prefix| frame.starts_with(prefix))
}

/// The transport under a pipe.
enum MeshStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Ipc(UnixStream),
    Inproc(DuplexStream),
}

impl tokio::io::AsyncRead for MeshStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            MeshStream::Ipc(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            MeshStream::Inproc(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for MeshStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            MeshStream::Ipc(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            MeshStream::Inproc(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            MeshStream::Ipc(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            MeshStream::Inproc(stream) => std::pin::Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            MeshStream::Tcp(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            MeshStream::Ipc(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            MeshStream::Inproc(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Open the connecting side of a pipe transport.
async fn establish(address: MeshAddress) -> io::Result<MeshStream> {
    match address {
        MeshAddress::Tcp(endpoint) => {
            let stream = TcpStream::connect(endpoint.socket_addr()).await?;
            stream.set_nodelay(true)?;
            Ok(MeshStream::Tcp(stream))
        }
        #[cfg(unix)]
        MeshAddress::Ipc(path) => Ok(MeshStream::Ipc(UnixStream::connect(path).await?)),
        MeshAddress::Inproc(name) => {
            let (ours, theirs) = tokio::io::duplex(INPROC_CAPACITY);
            let registry = INPROC.lock().unwrap();
            let listener = registry.get(&name).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("inproc://{} is not bound", name),
                )
            })?;
            listener.send(theirs).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("inproc://{} is shutting down", name),
                )
            })?;
            Ok(MeshStream::Inproc(ours))
        }
    }
}

/// Drive one pipe: pattern handshake, then shuttle frames between the wire
/// and the socket until either side goes away.
async fn run_pipe(
    shared: Arc<MeshShared>,
    stream: MeshStream,
    ready: Option<oneshot::Sender<Result<(), Error>>>,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    // Both ends announce their pattern; mismatched pipes are torn down.
    let hello = Bytes::copy_from_slice(&shared.kind.id().to_be_bytes());
    if let Err(err) = framed.send(hello).await {
        if let Some(ready) = ready {
            let _ = ready.send(Err(Error::from(err)));
        }
        return;
    }
    let peer_kind = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) if frame.len() == 2 => {
            SocketKind::from_id(u16::from_be_bytes([frame[0], frame[1]]))
        }
        Ok(Some(Err(err))) => {
            if let Some(ready) = ready {
                let _ = ready.send(Err(Error::from(err)));
            }
            return;
        }
        _ => None,
    };
    match peer_kind {
        Some(peer_kind) if shared.kind.matches(peer_kind) => {}
        _ => {
            warn!(kind = ?shared.kind, ?peer_kind, "incompatible mesh peer");
            if let Some(ready) = ready {
                let _ = ready.send(Err(Error::WrongState("incompatible peer pattern")));
            }
            return;
        }
    }

    let ingress = match shared.ingress_tx.lock().unwrap().clone() {
        Some(ingress) => ingress,
        None => return,
    };
    let (outgoing_tx, mut outgoing) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
    let id = shared.next_pipe.fetch_add(1, Ordering::SeqCst);
    shared.pipes.lock().unwrap().insert(
        id,
        Pipe {
            outgoing: outgoing_tx,
        },
    );
    debug!(id, kind = ?shared.kind, "mesh pipe established");
    if let Some(ready) = ready {
        let _ = ready.send(Ok(()));
    }

    let mut closed = shared.closed_rx.clone();
    loop {
        if *closed.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = closed.changed() => break,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    shared
                        .bytes_received
                        .fetch_add(frame.len() as u64, Ordering::SeqCst);
                    if ingress.send((id, frame.freeze())).is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(id, %err, "mesh pipe read error");
                    break;
                }
                None => break,
            },
            item = outgoing.recv() => match item {
                Some(payload) => {
                    shared
                        .bytes_sent
                        .fetch_add(payload.len() as u64, Ordering::SeqCst);
                    if framed.send(payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    shared.pipes.lock().unwrap().remove(&id);
    debug!(id, "mesh pipe closed");
}
