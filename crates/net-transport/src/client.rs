//! Client role: one connection to a tunnel server

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crypto_session::Role;
use tracing::{info, warn};

use crate::{ChannelListener, Connection, TransportResult, TunnelConfig};

/// Encrypted channel to a server.
///
/// Owns a receive thread and, unless disabled, a key rotation timer.
/// Dropping the client closes the connection.
pub struct SecureChannelClient {
    connection: Arc<Connection>,
    receiver: Option<JoinHandle<()>>,
    rekey_timer: Option<JoinHandle<()>>,
}

impl SecureChannelClient {
    /// Connect, perform the handshake and start the background threads
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        config: TunnelConfig,
        listener: Arc<dyn ChannelListener>,
    ) -> TransportResult<Self> {
        config.validate()?;
        config.ensure_receive_dir()?;

        let stream = TcpStream::connect(addr)?;
        info!("Connected to {}", stream.peer_addr()?);

        let (connection, inbound) = Connection::establish(stream, Role::Initiator, &config)?;

        let rekey_timer = match config.rekey_interval() {
            Some(interval) => match connection.spawn_rekey_timer(interval) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to start key rotation timer: {}", e);
                    None
                }
            },
            None => None,
        };

        let receiver = {
            let connection = Arc::clone(&connection);
            let receive_dir = config.receive_dir.clone();
            thread::Builder::new()
                .name(format!("recv-{}", connection.peer_addr()))
                .spawn(move || connection.serve(inbound, listener.as_ref(), &receive_dir))
        };
        let receiver = match receiver {
            Ok(handle) => handle,
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };

        Ok(Self {
            connection,
            receiver: Some(receiver),
            rekey_timer,
        })
    }

    pub fn send_message(&self, text: &str) -> TransportResult<()> {
        self.connection.send_message(text)
    }

    pub fn send_file(&self, path: impl AsRef<Path>) -> TransportResult<()> {
        self.connection.send_file(path.as_ref())
    }

    /// Rotate session keys now instead of waiting for the timer
    pub fn rotate_keys(&self) -> TransportResult<bool> {
        self.connection.rotate_keys()
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Close the connection and wait for the background threads
    pub fn close(&mut self) {
        self.connection.close();

        for handle in [self.receiver.take(), self.rekey_timer.take()].into_iter().flatten() {
            // a listener callback may drop the client from the receive thread
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SecureChannelClient {
    fn drop(&mut self) {
        self.close();
    }
}
