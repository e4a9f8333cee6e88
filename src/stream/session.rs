//! The per-connection state machine shared by servers and clients: the
//! serialized receive and send chains, the double-buffered send path and the
//! disconnect protocol.
//!
//! A session moves through `connecting → (handshaking) → handshaked →
//! disconnecting → disconnected`. Its receive chain is one resident task
//! that keeps exactly one read outstanding; its send chain is one resident
//! task that keeps exactly one write outstanding, draining the flush buffer
//! swapped out from under the send mutex. Both tasks live on the session's
//! reactor, so every user hook runs serialized on that reactor's worker.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::buffer::{FlushBuffer, RecvBuffer, SendBuffer};
use crate::endpoint::Endpoint;
use crate::error::{self, Error};
use crate::reactor::Reactor;
use crate::stream::io_stream::IoStream;
use crate::tls::TlsContext;

/// Callbacks out of the session pipeline, implemented by the owning server
/// (which forwards to its handler and maintains the registry) and by the
/// stream client.
pub(crate) trait SessionSink: Send + Sync + 'static {
    fn handshaked(&self, session: &Arc<Session>);
    fn received(&self, session: &Arc<Session>, buffer: &[u8]);
    fn sent(&self, session: &Arc<Session>, sent: usize, pending: usize);
    fn empty(&self, session: &Arc<Session>);
    fn disconnected(&self, session: &Arc<Session>);
    fn error(&self, session: &Arc<Session>, error: &Error);
}

/// One connection: identity, peer endpoint, lifecycle flags, buffers and
/// counters. Owned by its server's registry or by a client; kept alive by
/// the I/O chains for as long as any completion is pending.
pub struct Session {
    id: Uuid,
    weak_self: Weak<Session>,
    reactor: Reactor,
    peer: Endpoint,
    tls: Option<TlsContext>,
    sink: Arc<dyn SessionSink>,
    chunk: usize,

    connecting: AtomicBool,
    connected: AtomicBool,
    handshaking: AtomicBool,
    handshaked: AtomicBool,
    receiving: AtomicBool,
    sending: AtomicBool,

    send_buffer: Mutex<SendBuffer>,
    send_signal: Notify,
    closed: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Session {
    pub(crate) fn new(
        reactor: Reactor,
        peer: Endpoint,
        tls: Option<TlsContext>,
        sink: Arc<dyn SessionSink>,
        chunk: usize,
    ) -> Arc<Session> {
        let (closed, closed_rx) = watch::channel(false);
        Arc::new_cyclic(|weak| Session {
            id: Uuid::new_v4(),
            weak_self: weak.clone(),
            reactor,
            peer,
            tls,
            sink,
            chunk,
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            handshaking: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            send_buffer: Mutex::new(SendBuffer::new()),
            send_signal: Notify::new(),
            closed,
            closed_rx,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// The connection identity: unique within the process lifetime, used as
    /// the server registry key.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The peer's endpoint.
    pub fn peer(&self) -> Endpoint {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Append bytes to the send path. Callable from any thread; bytes go
    /// into the main buffer under the send mutex and the session's writer is
    /// woken to drain them. Returns the number of bytes now pending in the
    /// main buffer, or 0 when the session is not ready to send.
    pub fn send(&self, buffer: &[u8]) -> usize {
        if buffer.is_empty() || !self.is_handshaked() {
            return 0;
        }
        let pending = self.send_buffer.lock().unwrap().append(buffer);
        self.send_signal.notify_one();
        pending
    }

    /// Schedule a disconnect via `post`. Returns `false` when the session is
    /// not connected or is mid-connect/mid-handshake.
    pub fn disconnect(&self) -> bool {
        self.disconnect_via(false)
    }

    /// Schedule a disconnect via `dispatch` (inline when already on the
    /// reactor worker).
    pub fn disconnect_dispatch(&self) -> bool {
        self.disconnect_via(true)
    }

    fn disconnect_via(&self, dispatch: bool) -> bool {
        if !self.is_connected()
            || self.connecting.load(Ordering::SeqCst)
            || self.handshaking.load(Ordering::SeqCst)
        {
            return false;
        }
        let session = self.strong();
        let routine = move || session.close_now();
        if dispatch {
            self.reactor.dispatch(routine);
        } else {
            self.reactor.post(routine);
        }
        true
    }

    /// Signal the I/O chains to unwind. Unconditional: also used by server
    /// stop to take down sessions that are still mid-handshake.
    pub(crate) fn close_now(&self) {
        let _ = self.closed.send(true);
    }

    pub(crate) fn set_connecting(&self, value: bool) {
        self.connecting.store(value, Ordering::SeqCst);
    }

    /// Mark the socket up and restart the statistics. For raw transports
    /// the handshake is implicit and coincides with connect.
    pub(crate) fn set_connected(&self) {
        self.bytes_sent.store(0, Ordering::SeqCst);
        self.bytes_received.store(0, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        if self.tls.is_none() {
            self.handshaked.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn copy_counters_from(&self, other: &Session) {
        self.bytes_sent
            .store(other.bytes_sent(), Ordering::SeqCst);
        self.bytes_received
            .store(other.bytes_received(), Ordering::SeqCst);
    }

    fn is_closing(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// The session's own strong handle; any caller of an inherent method is
    /// holding at least one `Arc`, so the upgrade cannot fail.
    fn strong(&self) -> Arc<Session> {
        self.weak_self.upgrade().expect("session outlives its methods")
    }

    /// Drive the session over `stream` until it disconnects. Runs on the
    /// session's reactor; holds the strong reference that keeps the session
    /// alive while I/O is pending.
    pub(crate) async fn run(self: Arc<Self>, stream: TcpStream) {
        let mut closed = self.closed_rx.clone();

        let stream = match self.tls.clone() {
            // Raw transport: the handshake is implicit and coincides with
            // connect.
            None => {
                self.handshaked.store(true, Ordering::SeqCst);
                IoStream::from(stream)
            }
            Some(context) => {
                if self.is_closing() {
                    self.teardown();
                    return;
                }
                self.handshaking.store(true, Ordering::SeqCst);
                let result = tokio::select! {
                    biased;
                    _ = closed.changed() => {
                        self.handshaking.store(false, Ordering::SeqCst);
                        self.teardown();
                        return;
                    }
                    result = context.handshake(stream) => result,
                };
                self.handshaking.store(false, Ordering::SeqCst);
                match result {
                    Ok(stream) => {
                        self.handshaked.store(true, Ordering::SeqCst);
                        self.sink.handshaked(&self);
                        // Prime the send path before the first read arms.
                        self.sink.empty(&self);
                        stream
                    }
                    Err(err) => {
                        self.report(err);
                        self.teardown();
                        return;
                    }
                }
            }
        };

        let (rd, wr) = tokio::io::split(stream);
        let writer = tokio::spawn(Session::send_chain(self.clone(), wr));
        Session::receive_chain(&self, rd).await;

        // Unwind the writer and shut the transport down cleanly.
        self.close_now();
        match writer.await {
            Ok(mut wr) => {
                let _ = wr.shutdown().await;
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => {}
        }
        self.teardown();
    }

    /// The receive chain: exactly one read outstanding; deliver, grow the
    /// buffer when a read filled it, re-arm.
    async fn receive_chain(session: &Arc<Session>, mut rd: ReadHalf<IoStream>) {
        let mut closed = session.closed_rx.clone();
        let mut buffer = RecvBuffer::new(session.chunk);
        loop {
            if session.is_closing() || !session.is_handshaked() {
                break;
            }
            session.receiving.store(true, Ordering::SeqCst);
            let result = tokio::select! {
                biased;
                _ = closed.changed() => {
                    session.receiving.store(false, Ordering::SeqCst);
                    break;
                }
                result = rd.read(buffer.space()) => result,
            };
            session.receiving.store(false, Ordering::SeqCst);
            match result {
                // Peer closed the stream.
                Ok(0) => break,
                Ok(count) => {
                    session.bytes_received.fetch_add(count as u64, Ordering::SeqCst);
                    session.sink.received(session, buffer.filled(count));
                    if count == buffer.capacity() {
                        buffer.grow();
                    }
                }
                Err(err) => {
                    session.report(err);
                    break;
                }
            }
        }
    }

    /// The send chain: woken by `send`, swaps the main buffer into the flush
    /// buffer and keeps exactly one write outstanding until both are dry.
    async fn send_chain(session: Arc<Session>, mut wr: WriteHalf<IoStream>) -> WriteHalf<IoStream> {
        let mut closed = session.closed_rx.clone();
        let mut flush = FlushBuffer::new();
        'chain: loop {
            if session.is_closing() || !session.is_handshaked() {
                break;
            }
            tokio::select! {
                biased;
                _ = closed.changed() => break,
                _ = session.send_signal.notified() => {}
            }
            loop {
                if session.is_closing() || !session.is_handshaked() {
                    break 'chain;
                }
                if flush.is_empty() {
                    session.send_buffer.lock().unwrap().swap_into(&mut flush);
                }
                if flush.is_empty() {
                    // Nothing to send.
                    break;
                }
                session.sending.store(true, Ordering::SeqCst);
                let result = tokio::select! {
                    biased;
                    _ = closed.changed() => {
                        session.sending.store(false, Ordering::SeqCst);
                        break 'chain;
                    }
                    result = wr.write(flush.remaining()) => result,
                };
                session.sending.store(false, Ordering::SeqCst);
                match result {
                    Ok(0) => {
                        session.report(io::ErrorKind::WriteZero.into());
                        session.close_now();
                        break 'chain;
                    }
                    Ok(count) => {
                        session.bytes_sent.fetch_add(count as u64, Ordering::SeqCst);
                        let drained = flush.advance(count);
                        session.sink.sent(&session, count, flush.pending());
                        if drained {
                            session.sink.empty(&session);
                        }
                    }
                    Err(err) => {
                        session.report(err);
                        session.close_now();
                        break 'chain;
                    }
                }
            }
        }
        wr
    }

    /// The terminal transition: close out the flags, clear the buffers and
    /// tell the owner. Runs once, on the reactor.
    fn teardown(&self) {
        self.close_now();
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.handshaked.store(false, Ordering::SeqCst);
        self.send_buffer.lock().unwrap().clear();
        self.sink.disconnected(&self.strong());
    }

    /// Surface a transport error unless it is one of the conditions that
    /// just mean the peer went away.
    fn report(&self, err: io::Error) {
        if !error::is_silent_disconnect(&err) {
            self.sink.error(&self.strong(), &Error::from(err));
        }
    }
}
