//! The stream server: acceptor loop, session registry and the broadcast
//! path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::event::ServerHandler;
use crate::reactor::Reactor;
use crate::stream::session::{Session, SessionSink};
use crate::tls::TlsContext;

/// A stream server owning a registry of sessions keyed by connection
/// identity. Raw TCP by default; constructed with a server-role
/// [`TlsContext`] it handshakes every accepted connection before arming the
/// receive chain.
#[derive(Clone)]
pub struct StreamServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    reactor: Reactor,
    endpoint: Endpoint,
    tls: Option<TlsContext>,
    handler: Arc<dyn ServerHandler>,
    config: StreamConfig,

    started: AtomicBool,
    state: Mutex<ServerState>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    multicast: Mutex<Vec<u8>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    signal: Mutex<()>,
    cond: Condvar,
}

#[derive(Default)]
struct ServerState {
    closed: Option<watch::Sender<bool>>,
}

impl StreamServer {
    /// A raw TCP server.
    pub fn new(
        reactor: Reactor,
        handler: Arc<dyn ServerHandler>,
        endpoint: Endpoint,
    ) -> StreamServer {
        StreamServer::build(reactor, handler, endpoint, None, StreamConfig::default())
            .expect("raw stream server construction cannot fail")
    }

    /// A TLS server; `tls` must be a server-role context.
    pub fn with_tls(
        reactor: Reactor,
        handler: Arc<dyn ServerHandler>,
        endpoint: Endpoint,
        tls: TlsContext,
    ) -> Result<StreamServer, Error> {
        StreamServer::build(reactor, handler, endpoint, Some(tls), StreamConfig::default())
    }

    pub fn with_config(
        reactor: Reactor,
        handler: Arc<dyn ServerHandler>,
        endpoint: Endpoint,
        tls: Option<TlsContext>,
        config: StreamConfig,
    ) -> Result<StreamServer, Error> {
        StreamServer::build(reactor, handler, endpoint, tls, config)
    }

    fn build(
        reactor: Reactor,
        handler: Arc<dyn ServerHandler>,
        endpoint: Endpoint,
        tls: Option<TlsContext>,
        config: StreamConfig,
    ) -> Result<StreamServer, Error> {
        if let Some(context) = &tls {
            if !context.is_server_role() {
                return Err(Error::Config(
                    "stream server requires a server-role TLS context".into(),
                ));
            }
        }
        Ok(StreamServer {
            shared: Arc::new(ServerShared {
                reactor,
                endpoint,
                tls,
                handler,
                config,
                started: AtomicBool::new(false),
                state: Mutex::new(ServerState::default()),
                sessions: Mutex::new(HashMap::new()),
                multicast: Mutex::new(Vec::new()),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                signal: Mutex::new(()),
                cond: Condvar::new(),
            }),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// The number of sessions currently registered.
    pub fn current_sessions(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    /// Bytes sent across all sessions since start.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::SeqCst)
    }

    /// Bytes received across all sessions since start.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::SeqCst)
    }

    /// Bind the listener and enter the accept loop. Returns `false` when
    /// already started. A bind failure is fatal: it is reported to
    /// `on_error` and the server never reaches the started state.
    pub fn start(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed.is_some() {
            return false;
        }
        let (closed, closed_rx) = watch::channel(false);
        state.closed = Some(closed);
        drop(state);

        let shared = self.shared.clone();
        self.shared.reactor.spawn(accept_loop(shared, closed_rx));
        true
    }

    /// Close the acceptor, clear the multicast buffer, disconnect every
    /// session and fire `on_stopped`. Returns `false` when not started.
    pub fn stop(&self) -> bool {
        let closed = {
            let mut state = self.shared.state.lock().unwrap();
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

    /// Stop, wait for the teardown to complete, start again.
    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        self.wait_stopped();
        self.start()
    }

    /// Multicast bytes to every registered session. The bytes accumulate in
    /// the multicast buffer; a reactor-scheduled drain snapshots the
    /// accumulator and feeds it into each session's send path. Returns
    /// `false` when the server is not started.
    pub fn broadcast(&self, buffer: &[u8]) -> bool {
        if buffer.is_empty() || !self.is_started() {
            return false;
        }
        self.shared
            .multicast
            .lock()
            .unwrap()
            .extend_from_slice(buffer);

        let shared = self.shared.clone();
        self.shared.reactor.dispatch(move || {
            // Snapshot and release both locks before touching any session's
            // send path, so a slow session cannot hold up other callers.
            let payload = std::mem::take(&mut *shared.multicast.lock().unwrap());
            if payload.is_empty() {
                return;
            }
            let sessions: Vec<_> = shared.sessions.lock().unwrap().values().cloned().collect();
            for session in sessions {
                session.send(&payload);
            }
        });
        true
    }

    /// Disconnect every registered session.
    pub fn disconnect_all(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        let shared = self.shared.clone();
        self.shared.reactor.dispatch(move || {
            let sessions: Vec<_> = shared.sessions.lock().unwrap().values().cloned().collect();
            for session in sessions {
                session.disconnect();
            }
        });
        true
    }

    /// Block until the `on_started` callback has run.
    pub fn wait_started(&self) {
        self.shared
            .wait(|shared| shared.started.load(Ordering::SeqCst));
    }

    /// Block until the server has fully wound down.
    pub fn wait_stopped(&self) {
        self.shared
            .wait(|shared| !shared.started.load(Ordering::SeqCst));
    }
}

impl ServerShared {
    fn set_started(&self, value: bool) {
        let _guard = self.signal.lock().unwrap();
        self.started.store(value, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn wait<F>(&self, pred: F)
    where
        F: Fn(&ServerShared) -> bool,
    {
        let mut guard = self.signal.lock().unwrap();
        while !pred(self) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    fn force_disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.close_now();
        }
    }
}

/// Construct, register and start a freshly accepted session, returning its
/// driver future for the accept loop to poll.
fn register_session(
    shared: &Arc<ServerShared>,
    stream: TcpStream,
    peer: Endpoint,
) -> impl Future<Output = ()> {
    let sink = Arc::new(ServerSink {
        server: Arc::downgrade(shared),
    });
    let session = Session::new(
        shared.reactor.clone(),
        peer,
        shared.tls.clone(),
        sink,
        shared.config.chunk,
    );
    shared
        .sessions
        .lock()
        .unwrap()
        .insert(session.id(), session.clone());
    session.set_connected();
    debug!(id = %session.id(), %peer, "session registered");
    shared.handler.on_connected(&session);
    Session::run(session, stream)
}

async fn accept_loop(shared: Arc<ServerShared>, mut closed: watch::Receiver<bool>) {
    let listener = match TcpListener::bind(shared.endpoint.socket_addr()).await {
        Ok(listener) => listener,
        Err(err) => {
            // Bind failures are fatal: report and abandon the start.
            error!(endpoint = %shared.endpoint, %err, "failed to bind listener");
            shared.handler.on_error(&Error::from(err));
            shared.state.lock().unwrap().closed = None;
            return;
        }
    };

    info!(endpoint = %shared.endpoint, "serving");
    shared.bytes_sent.store(0, Ordering::SeqCst);
    shared.bytes_received.store(0, Ordering::SeqCst);
    shared.set_started(true);
    shared.handler.on_started();

    let mut drivers = FuturesUnordered::new();
    loop {
        tokio::select! {
            biased;
            _ = closed.changed() => break,
            Some(()) = drivers.next(), if !drivers.is_empty() => {}
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    if shared.config.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    drivers.push(register_session(&shared, stream, peer.into()));
                }
                // A per-connection accept error does not stop the loop.
                Err(err) => {
                    warn!(%err, "accept error");
                    shared.handler.on_error(&Error::from(err));
                }
            },
        }
    }

    drop(listener);
    shared.multicast.lock().unwrap().clear();
    shared.force_disconnect_all();
    while drivers.next().await.is_some() {}
    shared.sessions.lock().unwrap().clear();
    shared.set_started(false);
    shared.handler.on_stopped();
}

/// The server side of the session pipeline: forwards hooks to the server
/// handler, keeps the aggregate counters and owns registry removal.
struct ServerSink {
    server: Weak<ServerShared>,
}

impl SessionSink for ServerSink {
    fn handshaked(&self, session: &Arc<Session>) {
        if let Some(server) = self.server.upgrade() {
            server.handler.on_handshaked(session);
        }
    }

    fn received(&self, session: &Arc<Session>, buffer: &[u8]) {
        if let Some(server) = self.server.upgrade() {
            server
                .bytes_received
                .fetch_add(buffer.len() as u64, Ordering::SeqCst);
            server.handler.on_received(session, buffer);
        }
    }

    fn sent(&self, session: &Arc<Session>, sent: usize, pending: usize) {
        if let Some(server) = self.server.upgrade() {
            server.bytes_sent.fetch_add(sent as u64, Ordering::SeqCst);
            server.handler.on_sent(session, sent, pending);
        }
    }

    fn empty(&self, session: &Arc<Session>) {
        if let Some(server) = self.server.upgrade() {
            server.handler.on_empty(session);
        }
    }

    fn disconnected(&self, session: &Arc<Session>) {
        if let Some(server) = self.server.upgrade() {
            server.sessions.lock().unwrap().remove(&session.id());
            server.handler.on_disconnected(session);
        }
    }

    fn error(&self, _session: &Arc<Session>, error: &Error) {
        if let Some(server) = self.server.upgrade() {
            server.handler.on_error(error);
        }
    }
}
