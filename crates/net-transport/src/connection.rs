//! Per-connection state shared by the client and server endpoints
//!
//! Ownership on one connection:
//! - the outbound session and the socket writer sit behind one lock, so a
//!   nonce is consumed and its frame written as a single unit,
//! - the inbound session belongs to the receive loop alone,
//! - the rekey phase has its own lock, always taken before the outbound one.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use crypto_session::{KeyPair, Role, SecureSession, SessionKey, perform_handshake};
use parking_lot::Mutex;
use shared_protocol::{
    FILE_CHUNK_SIZE, FileHeader, FrameHeader, FrameReader, FrameWriter, MAX_FILENAME_LEN,
    ProtocolError, RekeyMessage,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{ChannelListener, TransportError, TransportResult, TunnelConfig};

/// Unique identifier of a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sealing state and the writer it feeds
struct Outbound {
    session: SecureSession,
    writer: FrameWriter<BufWriter<TcpStream>>,
}

impl Outbound {
    fn send_message(&mut self, plaintext: &[u8]) -> TransportResult<()> {
        let ciphertext = self.session.seal(plaintext)?;
        self.writer.write_message(&ciphertext)?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_rekey(&mut self, message: RekeyMessage) -> TransportResult<()> {
        let ciphertext = self.session.seal(&message.to_bytes())?;
        self.writer.write_rekey(&ciphertext)?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_file(&mut self, header: &FileHeader, file: File) -> TransportResult<()> {
        self.writer.write_file_header(header)?;

        let mut source = file.take(header.total_size);
        let mut chunk = [0u8; FILE_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = fill_chunk(&mut source, &mut chunk)?;
            if n == 0 {
                break;
            }
            let ciphertext = self.session.seal(&chunk[..n])?;
            self.writer.write_chunk(&ciphertext)?;
            sent += n as u64;
        }

        if sent != header.total_size {
            return Err(TransportError::FileChanged {
                expected: header.total_size,
                actual: sent,
            });
        }

        self.writer.flush()?;
        Ok(())
    }
}

/// Read until `buf` is full or the source is exhausted
fn fill_chunk(source: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Progress of an in-flight key rotation
enum RekeyPhase {
    Idle,
    /// We sent an offer and keep our half until the peer accepts
    Offered(KeyPair),
    /// We accepted; inbound switches to this key once the peer confirms
    AwaitingConfirm(SessionKey),
}

/// Inbound half of a connection, owned by its receive loop
pub(crate) struct Inbound {
    session: SecureSession,
    reader: FrameReader<BufReader<TcpStream>>,
}

/// An established, encrypted connection
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    role: Role,
    stream: TcpStream,
    outbound: Mutex<Outbound>,
    rekey: Mutex<RekeyPhase>,
    closed: AtomicBool,
    /// Dropped on close to wake the rekey timer
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Connection {
    /// Configure the socket, run the handshake and split it into halves
    pub(crate) fn establish(
        stream: TcpStream,
        role: Role,
        config: &TunnelConfig,
    ) -> TransportResult<(Arc<Self>, Inbound)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(config.nodelay)?;
        stream.set_write_timeout(config.write_timeout())?;
        stream.set_read_timeout(config.handshake_timeout())?;

        let session_key = perform_handshake(&mut &stream).map_err(TransportError::Handshake)?;
        stream.set_read_timeout(None)?;

        let keys = session_key.split(role)?;
        let outbound = Outbound {
            session: SecureSession::new(&keys.seal)?,
            writer: FrameWriter::new(BufWriter::new(stream.try_clone()?)),
        };
        let inbound = Inbound {
            session: SecureSession::new(&keys.open)?,
            reader: FrameReader::new(BufReader::new(stream.try_clone()?)),
        };

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            peer_addr,
            role,
            stream,
            outbound: Mutex::new(outbound),
            rekey: Mutex::new(RekeyPhase::Idle),
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        });

        info!(
            "Secure session established with {} ({:?}, id {})",
            peer_addr, role, connection.id
        );

        Ok((connection, inbound))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Rotations applied to the outbound direction since the handshake
    pub fn key_epoch(&self) -> u64 {
        self.outbound.lock().session.epoch()
    }

    /// Seal and send one text message
    pub fn send_message(&self, text: &str) -> TransportResult<()> {
        self.with_outbound(|out| out.send_message(text.as_bytes()))
    }

    /// Stream a file as a header plus one sealed frame per 1024-byte chunk.
    ///
    /// The outbound lock is held for the whole transfer so no other frame
    /// lands between its chunks.
    pub fn send_file(&self, path: &Path) -> TransportResult<()> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| name.len() <= MAX_FILENAME_LEN)
            .ok_or_else(|| TransportError::InvalidPath(path.to_path_buf()))?;

        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(TransportError::InvalidPath(path.to_path_buf()));
        }

        let header = FileHeader::new(filename, metadata.len());
        self.with_outbound(|out| out.send_file(&header, file))?;

        debug!(
            "Sent {} ({} bytes, {} chunks) to {}",
            header.filename,
            header.total_size,
            header.chunk_count(),
            self.peer_addr
        );
        Ok(())
    }

    /// Start a key rotation by offering a fresh ephemeral key.
    ///
    /// Returns `Ok(false)` when a rotation is already in flight.
    pub fn rotate_keys(&self) -> TransportResult<bool> {
        self.ensure_open()?;

        let mut phase = self.rekey.lock();
        if !matches!(*phase, RekeyPhase::Idle) {
            debug!("Key rotation with {} already in progress", self.peer_addr);
            return Ok(false);
        }

        let keypair = KeyPair::generate();
        let offer = RekeyMessage::Offer(keypair.public_key_bytes());
        self.with_outbound(|out| out.send_rekey(offer))?;
        *phase = RekeyPhase::Offered(keypair);

        debug!("Offered fresh session key to {}", self.peer_addr);
        Ok(true)
    }

    /// Shut the socket down; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown_tx.lock().take();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown for {}: {}", self.peer_addr, e);
        }
        debug!("Connection {} to {} closed", self.id, self.peer_addr);
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    /// Run `f` under the outbound lock. A failed send leaves the stream in an
    /// unknown framing state, so the connection is closed.
    fn with_outbound<T>(
        &self,
        f: impl FnOnce(&mut Outbound) -> TransportResult<T>,
    ) -> TransportResult<T> {
        self.ensure_open()?;

        let result = f(&mut self.outbound.lock());
        if let Err(e) = &result {
            warn!("Send to {} failed, closing connection: {}", self.peer_addr, e);
            self.close();
        }
        result
    }

    /// Spawn the periodic rotation task; it exits when the connection closes
    pub(crate) fn spawn_rekey_timer(
        self: &Arc<Self>,
        interval: Duration,
    ) -> io::Result<JoinHandle<()>> {
        let connection = Arc::clone(self);
        let shutdown = self.shutdown_rx.clone();

        thread::Builder::new()
            .name(format!("rekey-{}", self.peer_addr))
            .spawn(move || {
                loop {
                    match shutdown.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = connection.rotate_keys() {
                                if connection.is_closed() {
                                    break;
                                }
                                warn!(
                                    "Key rotation with {} failed, keeping current key: {}",
                                    connection.peer_addr, e
                                );
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Rekey timer for {} stopped", connection.peer_addr);
            })
    }

    /// Run the receive loop until the stream ends or fails, then close
    pub(crate) fn serve(
        &self,
        mut inbound: Inbound,
        listener: &dyn ChannelListener,
        receive_dir: &Path,
    ) {
        let result = self.receive_loop(&mut inbound, listener, receive_dir);

        match result {
            _ if self.is_closed() => {
                debug!("Receive loop for {} stopped after local close", self.peer_addr)
            }
            Ok(()) => info!("{} closed the connection", self.peer_addr),
            Err(TransportError::Authentication) => error!(
                "Authentication failure from {}, dropping connection",
                self.peer_addr
            ),
            Err(e) => warn!("Connection to {} terminated: {}", self.peer_addr, e),
        }

        self.close();
    }

    fn receive_loop(
        &self,
        inbound: &mut Inbound,
        listener: &dyn ChannelListener,
        receive_dir: &Path,
    ) -> TransportResult<()> {
        while let Some(header) = inbound.reader.read_header()? {
            match header {
                FrameHeader::Message { len } => {
                    let ciphertext = inbound.reader.read_payload(len)?;
                    let plaintext = inbound.session.open(&ciphertext)?;
                    listener.on_message(String::from_utf8_lossy(&plaintext).into_owned());
                }
                FrameHeader::File(header) => {
                    let path = self.receive_file(inbound, &header, receive_dir)?;
                    info!(
                        "Received {} ({} bytes) from {}",
                        path.display(),
                        header.total_size,
                        self.peer_addr
                    );
                    listener.on_file_received(path);
                }
                FrameHeader::Rekey { len } => {
                    let ciphertext = inbound.reader.read_payload(len)?;
                    let plaintext = inbound.session.open(&ciphertext)?;
                    let message = RekeyMessage::from_bytes(&plaintext)?;
                    self.handle_rekey(message, &mut inbound.session)?;
                }
            }
        }
        Ok(())
    }

    fn receive_file(
        &self,
        inbound: &mut Inbound,
        header: &FileHeader,
        receive_dir: &Path,
    ) -> TransportResult<PathBuf> {
        let path = receive_dir.join(format!("recv_{}", local_file_name(&header.filename)));
        debug!(
            "Receiving {} ({} bytes) into {}",
            header.filename,
            header.total_size,
            path.display()
        );

        let result = Self::write_chunks(inbound, header, &path);
        if result.is_err() {
            if let Err(e) = fs::remove_file(&path) {
                debug!("Could not remove partial {}: {}", path.display(), e);
            }
        }
        result.map(|()| path)
    }

    fn write_chunks(inbound: &mut Inbound, header: &FileHeader, path: &Path) -> TransportResult<()> {
        let mut out = BufWriter::new(File::create(path)?);
        let mut received = 0u64;

        while received < header.total_size {
            let ciphertext = inbound.reader.read_chunk()?;
            let chunk = inbound.session.open(&ciphertext)?;
            if chunk.is_empty() {
                return Err(ProtocolError::EmptyChunk.into());
            }

            received += chunk.len() as u64;
            if received > header.total_size {
                return Err(ProtocolError::ChunkOverrun {
                    expected: header.total_size,
                    received,
                }
                .into());
            }
            out.write_all(&chunk)?;
        }

        out.flush()?;
        Ok(())
    }

    /// Advance the rotation state machine for one opened rekey message.
    ///
    /// Each side switches its outbound key right after the frame that
    /// announces the switch (accept or confirm), and its inbound key right
    /// after opening the peer's announcing frame.
    fn handle_rekey(&self, message: RekeyMessage, inbound: &mut SecureSession) -> TransportResult<()> {
        let mut phase = self.rekey.lock();

        match (message, std::mem::replace(&mut *phase, RekeyPhase::Idle)) {
            // Simultaneous offers: the initiator's wins, the responder answers it
            (RekeyMessage::Offer(_), RekeyPhase::Offered(ours)) if self.role == Role::Initiator => {
                debug!("Ignoring crossing key offer from {}", self.peer_addr);
                *phase = RekeyPhase::Offered(ours);
            }
            (RekeyMessage::Offer(peer_public), RekeyPhase::Idle | RekeyPhase::Offered(_)) => {
                let keypair = KeyPair::generate();
                let our_public = keypair.public_key_bytes();
                let keys = keypair.derive_session_key(&peer_public)?.split(self.role)?;

                self.with_outbound(|out| {
                    out.send_rekey(RekeyMessage::Accept(our_public))?;
                    out.session.rotate(&keys.seal)?;
                    Ok(())
                })?;
                *phase = RekeyPhase::AwaitingConfirm(keys.open);
            }
            (RekeyMessage::Accept(peer_public), RekeyPhase::Offered(ours)) => {
                let keys = ours.derive_session_key(&peer_public)?.split(self.role)?;
                inbound.rotate(&keys.open)?;

                self.with_outbound(|out| {
                    out.send_rekey(RekeyMessage::Confirm)?;
                    out.session.rotate(&keys.seal)?;
                    Ok(())
                })?;
                info!(
                    "Session keys rotated with {} (epoch {})",
                    self.peer_addr,
                    inbound.epoch()
                );
            }
            (RekeyMessage::Confirm, RekeyPhase::AwaitingConfirm(open_key)) => {
                inbound.rotate(&open_key)?;
                info!(
                    "Session keys rotated with {} (epoch {})",
                    self.peer_addr,
                    inbound.epoch()
                );
            }
            (message, previous) => {
                *phase = previous;
                return Err(ProtocolError::UnexpectedRekey(message.name()).into());
            }
        }

        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Final path component of an announced filename, never a traversal
pub(crate) fn local_file_name(announced: &str) -> &str {
    Path::new(announced)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unnamed")
}
