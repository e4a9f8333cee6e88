//! The stream client: one session's pipeline inverted, with the transport
//! state rebuilt in place after every disconnect so that a subsequent
//! `connect` starts clean.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::endpoint::Endpoint;
use crate::error::{self, Error};
use crate::event::ClientHandler;
use crate::reactor::Reactor;
use crate::stream::session::{Session, SessionSink};
use crate::tls::TlsContext;

/// An outbound stream connection. Raw TCP by default; constructed with a
/// client-role [`TlsContext`] it handshakes after connecting.
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    id: Uuid,
    reactor: Reactor,
    endpoint: Endpoint,
    tls: Option<TlsContext>,
    handler: Arc<dyn ClientHandler>,
    config: StreamConfig,

    /// The current transport state; replaced wholesale at every disconnect.
    session: Mutex<Arc<Session>>,
    connecting: AtomicBool,

    signal: Mutex<()>,
    cond: Condvar,
}

impl StreamClient {
    /// A raw TCP client.
    pub fn new(
        reactor: Reactor,
        handler: Arc<dyn ClientHandler>,
        endpoint: Endpoint,
    ) -> StreamClient {
        StreamClient::build(reactor, handler, endpoint, None, StreamConfig::default())
            .expect("raw stream client construction cannot fail")
    }

    /// A TLS client; `tls` must be a client-role context.
    pub fn with_tls(
        reactor: Reactor,
        handler: Arc<dyn ClientHandler>,
        endpoint: Endpoint,
        tls: TlsContext,
    ) -> Result<StreamClient, Error> {
        StreamClient::build(reactor, handler, endpoint, Some(tls), StreamConfig::default())
    }

    pub fn with_config(
        reactor: Reactor,
        handler: Arc<dyn ClientHandler>,
        endpoint: Endpoint,
        tls: Option<TlsContext>,
        config: StreamConfig,
    ) -> Result<StreamClient, Error> {
        StreamClient::build(reactor, handler, endpoint, tls, config)
    }

    fn build(
        reactor: Reactor,
        handler: Arc<dyn ClientHandler>,
        endpoint: Endpoint,
        tls: Option<TlsContext>,
        config: StreamConfig,
    ) -> Result<StreamClient, Error> {
        if let Some(context) = &tls {
            if context.is_server_role() {
                return Err(Error::Config(
                    "stream client requires a client-role TLS context".into(),
                ));
            }
        }
        let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
            let sink = Arc::new(ClientSink {
                client: weak.clone(),
            });
            let session = Session::new(
                reactor.clone(),
                endpoint,
                tls.clone(),
                sink,
                config.chunk,
            );
            ClientShared {
                id: Uuid::new_v4(),
                reactor,
                endpoint,
                tls,
                handler,
                config,
                session: Mutex::new(session),
                connecting: AtomicBool::new(false),
                signal: Mutex::new(()),
                cond: Condvar::new(),
            }
        });
        Ok(StreamClient { shared })
    }

    /// The client identity, stable across reconnects.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session().is_connected()
    }

    pub fn is_handshaked(&self) -> bool {
        self.shared.session().is_handshaked()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.session().bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.session().bytes_received()
    }

    /// Begin connecting. Returns `false` when already connected or a
    /// connect is in flight. Safe to call from inside `on_disconnected`.
    pub fn connect(&self) -> bool {
        if self.is_connected() || self.shared.connecting.load(Ordering::SeqCst) {
            return false;
        }
        let shared = self.shared.clone();
        self.shared.reactor.post(move || {
            if shared.session().is_connected() || shared.connecting.swap(true, Ordering::SeqCst) {
                return;
            }
            let reactor = shared.reactor.clone();
            reactor.spawn(async move {
                let session = shared.session();
                session.set_connecting(true);
                let result = TcpStream::connect(shared.endpoint.socket_addr()).await;
                session.set_connecting(false);
                shared.connecting.store(false, Ordering::SeqCst);
                match result {
                    Ok(stream) => {
                        if shared.config.nodelay {
                            let _ = stream.set_nodelay(true);
                        }
                        debug!(endpoint = %shared.endpoint, "connected");
                        session.set_connected();
                        shared.notify_state();
                        shared.handler.on_connected();
                        Session::run(session, stream).await;
                    }
                    Err(err) => {
                        if !error::is_silent_disconnect(&err) {
                            shared.handler.on_error(&Error::from(err));
                        }
                        shared.handler.on_disconnected();
                    }
                }
            });
        });
        true
    }

    /// Schedule a disconnect via `post`.
    pub fn disconnect(&self) -> bool {
        self.shared.session().disconnect()
    }

    /// Schedule a disconnect via `dispatch`.
    pub fn disconnect_dispatch(&self) -> bool {
        self.shared.session().disconnect_dispatch()
    }

    /// Disconnect, wait for the teardown, connect again. Must not be called
    /// from a handler running on this client's reactor.
    pub fn reconnect(&self) -> bool {
        if !self.disconnect() {
            return false;
        }
        self.wait_disconnected();
        self.connect()
    }

    /// Append bytes to the session's send path; see [`Session::send`].
    pub fn send(&self, buffer: &[u8]) -> usize {
        self.shared.session().send(buffer)
    }

    /// Block until the connection is up (and handshaked, under TLS).
    pub fn wait_connected(&self) {
        self.shared.wait(|shared| shared.session().is_connected());
    }

    pub fn wait_handshaked(&self) {
        self.shared.wait(|shared| shared.session().is_handshaked());
    }

    pub fn wait_disconnected(&self) {
        self.shared.wait(|shared| !shared.session().is_connected());
    }
}

impl ClientShared {
    fn session(&self) -> Arc<Session> {
        self.session.lock().unwrap().clone()
    }

    fn notify_state(&self) {
        let _guard = self.signal.lock().unwrap();
        self.cond.notify_all();
    }

    fn wait<F>(&self, pred: F)
    where
        F: Fn(&ClientShared) -> bool,
    {
        let mut guard = self.signal.lock().unwrap();
        while !pred(self) {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// Rebuild the client's transport state in place: fresh buffers and flags,
/// with the statistics carried over until the next successful connect.
fn reset(shared: &Arc<ClientShared>, old: &Arc<Session>) {
    let sink = Arc::new(ClientSink {
        client: Arc::downgrade(shared),
    });
    let fresh = Session::new(
        shared.reactor.clone(),
        shared.endpoint,
        shared.tls.clone(),
        sink,
        shared.config.chunk,
    );
    fresh.copy_counters_from(old);
    *shared.session.lock().unwrap() = fresh;
    shared.notify_state();
}

/// The client side of the session pipeline: forwards hooks to the client
/// handler and rebuilds the transport state on disconnect.
struct ClientSink {
    client: Weak<ClientShared>,
}

impl SessionSink for ClientSink {
    fn handshaked(&self, _session: &Arc<Session>) {
        if let Some(client) = self.client.upgrade() {
            client.notify_state();
            client.handler.on_handshaked();
        }
    }

    fn received(&self, _session: &Arc<Session>, buffer: &[u8]) {
        if let Some(client) = self.client.upgrade() {
            client.handler.on_received(buffer);
        }
    }

    fn sent(&self, _session: &Arc<Session>, sent: usize, pending: usize) {
        if let Some(client) = self.client.upgrade() {
            client.handler.on_sent(sent, pending);
        }
    }

    fn empty(&self, _session: &Arc<Session>) {
        if let Some(client) = self.client.upgrade() {
            client.handler.on_empty();
        }
    }

    fn disconnected(&self, session: &Arc<Session>) {
        if let Some(client) = self.client.upgrade() {
            // Rebuild first so a reentrant `connect` from inside the hook
            // starts from a clean state.
            reset(&client, session);
            client.handler.on_disconnected();
        }
    }

    fn error(&self, _session: &Arc<Session>, error: &Error) {
        if let Some(client) = self.client.upgrade() {
            client.handler.on_error(error);
        }
    }
}
