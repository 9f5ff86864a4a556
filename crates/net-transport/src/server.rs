//! Server role: accept loop, session registry and broadcast

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crypto_session::Role;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    ChannelListener, Connection, ConnectionId, TransportError, TransportResult, TunnelConfig,
};

/// Live sessions keyed by connection id, behind one lock
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.sessions.lock().insert(connection.id(), connection);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.sessions.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Visit every session while holding the registry lock
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for connection in self.sessions.lock().values() {
            f(connection);
        }
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.sessions.lock().drain().map(|(_, connection)| connection).collect()
    }
}

struct ServerInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TunnelConfig,
    handler: Arc<dyn ChannelListener>,
    registry: SessionRegistry,
    running: AtomicBool,
}

/// Accepts tunnel clients and fans messages out to all of them
#[derive(Clone)]
pub struct SecureChannelServer {
    inner: Arc<ServerInner>,
}

impl SecureChannelServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        config: TunnelConfig,
        handler: Arc<dyn ChannelListener>,
    ) -> TransportResult<Self> {
        config.validate()?;
        config.ensure_receive_dir()?;

        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!("Tunnel server listening on {}", local_addr);

        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                local_addr,
                config,
                handler,
                registry: SessionRegistry::new(),
                running: AtomicBool::new(true),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of connections that completed the handshake and are still live
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Accept connections on the current thread until `shutdown` is called
    pub fn run(&self) -> TransportResult<()> {
        for incoming in self.inner.listener.incoming() {
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }

            match incoming {
                Ok(stream) => self.spawn_handler(stream),
                Err(e) => warn!("Accept failed: {}", e),
            }
        }

        info!("Tunnel server on {} stopped accepting", self.inner.local_addr);
        Ok(())
    }

    /// Run the accept loop on a background thread
    pub fn spawn(&self) -> TransportResult<JoinHandle<()>> {
        let server = self.clone();
        let handle = thread::Builder::new()
            .name(format!("accept-{}", self.inner.local_addr))
            .spawn(move || {
                if let Err(e) = server.run() {
                    warn!("Accept loop ended with error: {}", e);
                }
            })?;
        Ok(handle)
    }

    fn spawn_handler(&self, stream: TcpStream) {
        let inner = Arc::clone(&self.inner);
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Client from {} connected", peer);

        let spawned = thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || handle_connection(inner, stream));
        if let Err(e) = spawned {
            warn!("Failed to spawn handler for {}: {}", peer, e);
        }
    }

    /// Send `text` to every live session; returns how many succeeded
    pub fn broadcast_message(&self, text: &str) -> usize {
        self.broadcast(|connection| connection.send_message(text))
    }

    /// Send the file at `path` to every live session; returns how many succeeded
    pub fn broadcast_file(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        self.broadcast(|connection| connection.send_file(path))
    }

    fn broadcast(&self, send: impl Fn(&Connection) -> TransportResult<()>) -> usize {
        let mut delivered = 0;
        self.inner.registry.for_each(|connection| match send(connection.as_ref()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("Broadcast to {} failed: {}", connection.peer_addr(), e),
        });
        delivered
    }

    /// Stop accepting and close every live connection
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // wake the blocking accept
        if let Err(e) = TcpStream::connect(self.inner.local_addr) {
            debug!("Wake-up connection failed: {}", e);
        }

        for connection in self.inner.registry.drain() {
            connection.close();
        }
        info!("Tunnel server on {} shut down", self.inner.local_addr);
    }
}

/// Per-connection handler: handshake, register, serve, unregister
fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }

    let (connection, inbound) =
        match Connection::establish(stream, Role::Responder, &inner.config) {
            Ok(established) => established,
            Err(TransportError::Handshake(e)) => {
                warn!("Handshake failed: {}", e);
                return;
            }
            Err(e) => {
                warn!("Failed to set up connection: {}", e);
                return;
            }
        };

    inner.registry.insert(Arc::clone(&connection));
    if !inner.running.load(Ordering::SeqCst) {
        // shutdown drained the registry before this handshake finished
        connection.close();
    }

    let rekey_timer = inner
        .config
        .rekey_interval()
        .and_then(|interval| match connection.spawn_rekey_timer(interval) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start key rotation timer for {}: {}", connection.peer_addr(), e);
                None
            }
        });

    connection.serve(inbound, inner.handler.as_ref(), &inner.config.receive_dir);

    inner.registry.remove(&connection.id());
    if let Some(handle) = rekey_timer {
        let _ = handle.join();
    }
    debug!("Handler for {} finished", connection.peer_addr());
}
