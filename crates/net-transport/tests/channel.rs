//! End-to-end tunnel tests over loopback TCP

use std::fs;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use crypto_session::{
    DirectionalKeys, KeyPair, Role, SecureSession, TAG_SIZE, perform_handshake,
};
use net_transport::{
    ChannelEvent, ChannelListener, SecureChannelClient, SecureChannelServer, TransportError,
    TunnelConfig,
};
use shared_protocol::{FileHeader, FrameHeader, FrameReader, FrameWriter, RekeyMessage};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn config(dir: &TempDir) -> TunnelConfig {
    TunnelConfig {
        rekey_interval_ms: 0,
        ..Default::default()
    }
    .with_receive_dir(dir.path())
}

fn events() -> (Arc<dyn ChannelListener>, Receiver<ChannelEvent>) {
    let (tx, rx) = unbounded();
    (Arc::new(tx), rx)
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn start_server(dir: &TempDir) -> (SecureChannelServer, Receiver<ChannelEvent>) {
    let (listener, rx) = events();
    let server = SecureChannelServer::bind("127.0.0.1:0", config(dir), listener).unwrap();
    server.spawn().unwrap();
    (server, rx)
}

fn connect(server: &SecureChannelServer, dir: &TempDir) -> (SecureChannelClient, Receiver<ChannelEvent>) {
    let (listener, rx) = events();
    let client = SecureChannelClient::connect(server.local_addr(), config(dir), listener).unwrap();
    (client, rx)
}

/// Hand-driven endpoint that speaks the wire protocol directly
struct RawPeer {
    role: Role,
    keys: DirectionalKeys,
    seal: SecureSession,
    open: SecureSession,
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
}

impl RawPeer {
    fn accept(listener: TcpListener) -> thread::JoinHandle<RawPeer> {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            RawPeer::handshake(stream, Role::Responder)
        })
    }

    fn connect(addr: SocketAddr) -> RawPeer {
        RawPeer::handshake(TcpStream::connect(addr).unwrap(), Role::Initiator)
    }

    fn handshake(mut stream: TcpStream, role: Role) -> RawPeer {
        let keys = perform_handshake(&mut stream).unwrap().split(role).unwrap();
        RawPeer {
            role,
            seal: SecureSession::new(&keys.seal).unwrap(),
            open: SecureSession::new(&keys.open).unwrap(),
            reader: FrameReader::new(stream.try_clone().unwrap()),
            writer: FrameWriter::new(stream),
            keys,
        }
    }

    fn send_rekey(&mut self, message: RekeyMessage) {
        let ciphertext = self.seal.seal(&message.to_bytes()).unwrap();
        self.writer.write_rekey(&ciphertext).unwrap();
    }

    fn send_message(&mut self, text: &str) {
        let ciphertext = self.seal.seal(text.as_bytes()).unwrap();
        self.writer.write_message(&ciphertext).unwrap();
    }

    /// Answer an offer: accept under the old key, then switch outbound.
    /// Returns the new keys; inbound switches once the confirm arrives.
    fn accept_offer(&mut self, offered: &[u8; 32]) -> DirectionalKeys {
        let ours = KeyPair::generate();
        let our_public = ours.public_key_bytes();
        let keys = ours
            .derive_session_key(offered)
            .unwrap()
            .split(self.role)
            .unwrap();

        self.send_rekey(RekeyMessage::Accept(our_public));
        self.seal.rotate(&keys.seal).unwrap();
        keys
    }

    fn read_rekey(&mut self) -> RekeyMessage {
        let Some(FrameHeader::Rekey { len }) = self.reader.read_header().unwrap() else {
            panic!("expected rekey frame");
        };
        let ciphertext = self.reader.read_payload(len).unwrap();
        RekeyMessage::from_bytes(&self.open.open(&ciphertext).unwrap()).unwrap()
    }

    fn read_message_ciphertext(&mut self) -> Vec<u8> {
        let Some(FrameHeader::Message { len }) = self.reader.read_header().unwrap() else {
            panic!("expected message frame");
        };
        self.reader.read_payload(len).unwrap()
    }

    /// Next text message, opening and discarding any rekey frames before it
    fn read_message(&mut self) -> String {
        loop {
            match self.reader.read_header().unwrap() {
                Some(FrameHeader::Message { len }) => {
                    let ciphertext = self.reader.read_payload(len).unwrap();
                    return String::from_utf8(self.open.open(&ciphertext).unwrap()).unwrap();
                }
                Some(FrameHeader::Rekey { len }) => {
                    let ciphertext = self.reader.read_payload(len).unwrap();
                    self.open.open(&ciphertext).unwrap();
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
}

fn raw_pair(dir: &TempDir) -> (SecureChannelClient, Receiver<ChannelEvent>, RawPeer) {
    raw_pair_with(config(dir))
}

fn raw_pair_with(config: TunnelConfig) -> (SecureChannelClient, Receiver<ChannelEvent>, RawPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = RawPeer::accept(listener);

    let (handler, rx) = events();
    let client = SecureChannelClient::connect(addr, config, handler).unwrap();
    (client, rx, peer.join().unwrap())
}

#[test]
fn test_client_message_reaches_server() {
    let dir = TempDir::new().unwrap();
    let (server, server_rx) = start_server(&dir);
    let (client, _client_rx) = connect(&server, &dir);

    client.send_message("hello").unwrap();

    assert_eq!(
        server_rx.recv_timeout(TIMEOUT).unwrap(),
        ChannelEvent::Message("hello".to_string())
    );
    server.shutdown();
}

#[test]
fn test_messages_arrive_in_order() {
    let dir = TempDir::new().unwrap();
    let (server, server_rx) = start_server(&dir);
    let (client, _client_rx) = connect(&server, &dir);

    for i in 0..200 {
        client.send_message(&format!("message {}", i)).unwrap();
    }
    for i in 0..200 {
        assert_eq!(
            server_rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Message(format!("message {}", i))
        );
    }
    server.shutdown();
}

#[test]
fn test_broadcast_survives_closed_client() {
    let dir = TempDir::new().unwrap();
    let (server, _server_rx) = start_server(&dir);
    let (first, first_rx) = connect(&server, &dir);
    let (second, second_rx) = connect(&server, &dir);
    let (mut third, _third_rx) = connect(&server, &dir);
    wait_for(|| server.connection_count() == 3);

    third.close();
    let delivered = server.broadcast_message("hi");
    assert!(delivered >= 2);

    for rx in [&first_rx, &second_rx] {
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Message("hi".to_string())
        );
    }

    wait_for(|| server.connection_count() == 2);
    assert!(first.is_connected() && second.is_connected());
    server.shutdown();
}

#[test]
fn test_file_transfer_to_server() {
    let dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let (server, server_rx) = start_server(&inbox);
    let (client, _client_rx) = connect(&server, &dir);

    let source = dir.path().join("x.bin");
    let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    fs::write(&source, &content).unwrap();

    client.send_file(&source).unwrap();

    let ChannelEvent::FileReceived(path) = server_rx.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected a file");
    };
    assert_eq!(path, inbox.path().join("recv_x.bin"));
    assert_eq!(fs::read(&path).unwrap(), content);
    server.shutdown();
}

#[test]
fn test_file_chunks_on_the_wire() {
    let dir = TempDir::new().unwrap();
    let (client, _rx, mut peer) = raw_pair(&dir);

    let source = dir.path().join("x.bin");
    let content: Vec<u8> = (0..2500u32).map(|i| (i * 7) as u8).collect();
    fs::write(&source, &content).unwrap();
    client.send_file(&source).unwrap();

    let header = peer.reader.read_header().unwrap();
    assert_eq!(header, Some(FrameHeader::File(FileHeader::new("x.bin", 2500))));

    let mut reassembled = Vec::new();
    let mut plain_lengths = Vec::new();
    for _ in 0..3 {
        let ciphertext = peer.reader.read_chunk().unwrap();
        let chunk = peer.open.open(&ciphertext).unwrap();
        assert_eq!(ciphertext.len(), chunk.len() + TAG_SIZE);
        plain_lengths.push(chunk.len());
        reassembled.extend_from_slice(&chunk);
    }

    assert_eq!(plain_lengths, vec![1024, 1024, 452]);
    assert_eq!(reassembled, content);
    assert_eq!(peer.open.counter(), 3);
}

#[test]
fn test_empty_file() {
    let dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let (server, server_rx) = start_server(&inbox);
    let (client, _client_rx) = connect(&server, &dir);

    let source = dir.path().join("empty.txt");
    fs::write(&source, b"").unwrap();
    client.send_file(&source).unwrap();
    client.send_message("after").unwrap();

    let ChannelEvent::FileReceived(path) = server_rx.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected a file");
    };
    assert!(fs::read(&path).unwrap().is_empty());
    assert_eq!(
        server_rx.recv_timeout(TIMEOUT).unwrap(),
        ChannelEvent::Message("after".to_string())
    );
    server.shutdown();
}

#[test]
fn test_broadcast_file() {
    let dir = TempDir::new().unwrap();
    let inbox_a = TempDir::new().unwrap();
    let inbox_b = TempDir::new().unwrap();
    let (server, _server_rx) = start_server(&dir);
    let (_a, a_rx) = connect(&server, &inbox_a);
    let (_b, b_rx) = connect(&server, &inbox_b);
    wait_for(|| server.connection_count() == 2);

    let source = dir.path().join("notes.txt");
    fs::write(&source, "shared notes\n".repeat(300)).unwrap();
    assert_eq!(server.broadcast_file(&source), 2);

    for (rx, inbox) in [(&a_rx, &inbox_a), (&b_rx, &inbox_b)] {
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::FileReceived(inbox.path().join("recv_notes.txt"))
        );
        assert_eq!(
            fs::read(inbox.path().join("recv_notes.txt")).unwrap(),
            fs::read(&source).unwrap()
        );
    }
    server.shutdown();
}

#[test]
fn test_manual_rotation_keeps_channel_working() {
    let dir = TempDir::new().unwrap();
    let (server, server_rx) = start_server(&dir);
    let (client, client_rx) = connect(&server, &dir);
    wait_for(|| server.connection_count() == 1);

    client.send_message("before").unwrap();
    assert!(client.rotate_keys().unwrap());
    wait_for(|| client.connection().key_epoch() == 1);
    client.send_message("after").unwrap();

    for expected in ["before", "after"] {
        assert_eq!(
            server_rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Message(expected.to_string())
        );
    }

    assert_eq!(server.broadcast_message("from server"), 1);
    assert_eq!(
        client_rx.recv_timeout(TIMEOUT).unwrap(),
        ChannelEvent::Message("from server".to_string())
    );
    server.shutdown();
}

#[test]
fn test_timer_rotation_under_traffic() {
    let dir = TempDir::new().unwrap();
    let fast = TunnelConfig::default()
        .with_receive_dir(dir.path())
        .with_rekey_interval(Duration::from_millis(50));

    let (server_listener, server_rx) = events();
    let server = SecureChannelServer::bind("127.0.0.1:0", fast.clone(), server_listener).unwrap();
    server.spawn().unwrap();
    let (client_listener, client_rx) = events();
    let client = SecureChannelClient::connect(server.local_addr(), fast, client_listener).unwrap();
    wait_for(|| server.connection_count() == 1);

    let deadline = Instant::now() + Duration::from_millis(600);
    let mut sent = 0;
    while Instant::now() < deadline {
        client.send_message(&format!("up {}", sent)).unwrap();
        assert_eq!(server.broadcast_message(&format!("down {}", sent)), 1);
        sent += 1;
        thread::sleep(Duration::from_millis(5));
    }

    for i in 0..sent {
        assert_eq!(
            server_rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Message(format!("up {}", i))
        );
        assert_eq!(
            client_rx.recv_timeout(TIMEOUT).unwrap(),
            ChannelEvent::Message(format!("down {}", i))
        );
    }
    assert!(client.connection().key_epoch() >= 1);
    assert!(client.is_connected());
    server.shutdown();
}

#[test]
fn test_rekey_sequence_on_the_wire() {
    let dir = TempDir::new().unwrap();
    let (client, _rx, mut peer) = raw_pair(&dir);
    let old_keys = peer.keys.clone();

    assert!(client.rotate_keys().unwrap());
    let RekeyMessage::Offer(client_public) = peer.read_rekey() else {
        panic!("expected offer");
    };

    // a second request while the first is in flight is a no-op
    assert!(!client.rotate_keys().unwrap());

    let new_keys = peer.accept_offer(&client_public);

    assert_eq!(peer.read_rekey(), RekeyMessage::Confirm);
    peer.open.rotate(&new_keys.open).unwrap();

    client.send_message("fresh").unwrap();
    let ciphertext = peer.read_message_ciphertext();

    let mut stale = SecureSession::new(&old_keys.open).unwrap();
    assert!(stale.open(&ciphertext).is_err());
    assert_eq!(peer.open.open(&ciphertext).unwrap(), b"fresh");
    assert_eq!(client.connection().key_epoch(), 1);
}

#[test]
fn test_tampered_frame_drops_connection() {
    let dir = TempDir::new().unwrap();
    let (client, rx, mut peer) = raw_pair(&dir);

    let mut ciphertext = peer.seal.seal(b"genuine").unwrap();
    ciphertext[0] ^= 0x01;
    peer.writer.write_message(&ciphertext).unwrap();

    wait_for(|| !client.is_connected());
    assert!(rx.try_recv().is_err());
    assert!(matches!(
        client.send_message("late"),
        Err(TransportError::ConnectionClosed)
    ));
}

#[test]
fn test_unknown_frame_type_drops_connection() {
    let dir = TempDir::new().unwrap();
    let (client, _rx, peer) = raw_pair(&dir);

    let mut raw = peer.writer.get_ref();
    raw.write_all(&7i32.to_be_bytes()).unwrap();

    wait_for(|| !client.is_connected());
    drop(peer);
}

#[test]
fn test_handshake_failure_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let closer = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let dir = TempDir::new().unwrap();
    let (handler, _rx) = events();
    let result = SecureChannelClient::connect(addr, config(&dir), handler);
    closer.join().unwrap();

    assert!(matches!(result, Err(TransportError::Handshake(_))));
}

#[test]
fn test_server_shutdown_disconnects_clients() {
    let dir = TempDir::new().unwrap();
    let (server, _server_rx) = start_server(&dir);
    let (client, _client_rx) = connect(&server, &dir);
    wait_for(|| server.connection_count() == 1);

    server.shutdown();

    wait_for(|| !client.is_connected());
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_client_ignores_crossing_server_offer() {
    let dir = TempDir::new().unwrap();
    let (client, rx, mut peer) = raw_pair(&dir);

    assert!(client.rotate_keys().unwrap());
    let RekeyMessage::Offer(client_public) = peer.read_rekey() else {
        panic!("expected offer");
    };

    // the responder's offer crosses the client's and loses
    peer.send_rekey(RekeyMessage::Offer(KeyPair::generate().public_key_bytes()));
    let new_keys = peer.accept_offer(&client_public);

    assert_eq!(peer.read_rekey(), RekeyMessage::Confirm);
    peer.open.rotate(&new_keys.open).unwrap();

    client.send_message("up").unwrap();
    assert_eq!(peer.read_message(), "up");
    peer.send_message("down");
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        ChannelEvent::Message("down".to_string())
    );
    assert!(client.is_connected());
    assert_eq!(client.connection().key_epoch(), 1);
}

#[test]
fn test_server_yields_to_crossing_client_offer() {
    let dir = TempDir::new().unwrap();
    let fast = config(&dir).with_rekey_interval(Duration::from_millis(100));
    let (handler, server_rx) = events();
    let server = SecureChannelServer::bind("127.0.0.1:0", fast, handler).unwrap();
    server.spawn().unwrap();

    let mut peer = RawPeer::connect(server.local_addr());
    let RekeyMessage::Offer(_) = peer.read_rekey() else {
        panic!("expected the server's timer offer");
    };

    let ours = KeyPair::generate();
    peer.send_rekey(RekeyMessage::Offer(ours.public_key_bytes()));

    // the server drops its own offer and answers ours
    let RekeyMessage::Accept(server_public) = peer.read_rekey() else {
        panic!("expected accept");
    };
    let new_keys = ours
        .derive_session_key(&server_public)
        .unwrap()
        .split(Role::Initiator)
        .unwrap();
    peer.open.rotate(&new_keys.open).unwrap();
    peer.send_rekey(RekeyMessage::Confirm);
    peer.seal.rotate(&new_keys.seal).unwrap();

    peer.send_message("after collision");
    assert_eq!(
        server_rx.recv_timeout(TIMEOUT).unwrap(),
        ChannelEvent::Message("after collision".to_string())
    );

    assert_eq!(server.broadcast_message("reply"), 1);
    assert_eq!(peer.read_message(), "reply");
    assert_eq!(server.connection_count(), 1);
    server.shutdown();
}

#[test]
fn test_out_of_sequence_rekey_drops_connection() {
    for stray in [RekeyMessage::Confirm, RekeyMessage::Accept([5u8; 32])] {
        let dir = TempDir::new().unwrap();
        let (client, _rx, mut peer) = raw_pair(&dir);

        peer.send_rekey(stray);

        wait_for(|| !client.is_connected());
        assert!(matches!(
            client.send_message("late"),
            Err(TransportError::ConnectionClosed)
        ));
    }
}

#[test]
fn test_chunk_overrun_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let (client, rx, mut peer) = raw_pair(&dir);

    peer.writer
        .write_file_header(&FileHeader::new("over.bin", 5))
        .unwrap();
    let chunk = peer.seal.seal(&[0xAB; 10]).unwrap();
    peer.writer.write_chunk(&chunk).unwrap();

    wait_for(|| !client.is_connected());
    assert!(!dir.path().join("recv_over.bin").exists());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_empty_chunk_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let (client, rx, mut peer) = raw_pair(&dir);

    peer.writer
        .write_file_header(&FileHeader::new("empty.bin", 5))
        .unwrap();
    let chunk = peer.seal.seal(&[]).unwrap();
    peer.writer.write_chunk(&chunk).unwrap();

    wait_for(|| !client.is_connected());
    assert!(!dir.path().join("recv_empty.bin").exists());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_truncated_transfer_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let (client, rx, mut peer) = raw_pair(&dir);

    peer.writer
        .write_file_header(&FileHeader::new("cut.bin", 2000))
        .unwrap();
    let chunk = peer.seal.seal(&[0x11; 1024]).unwrap();
    peer.writer.write_chunk(&chunk).unwrap();
    drop(peer);

    wait_for(|| !client.is_connected());
    assert!(!dir.path().join("recv_cut.bin").exists());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_missing_receive_dir_is_created() {
    let root = TempDir::new().unwrap();
    let inbox = root.path().join("inbox").join("nested");
    let (client, rx, mut peer) = raw_pair_with(
        TunnelConfig {
            rekey_interval_ms: 0,
            ..Default::default()
        }
        .with_receive_dir(&inbox),
    );
    assert!(inbox.is_dir());

    peer.writer
        .write_file_header(&FileHeader::new("abc.txt", 3))
        .unwrap();
    let chunk = peer.seal.seal(b"abc").unwrap();
    peer.writer.write_chunk(&chunk).unwrap();

    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        ChannelEvent::FileReceived(inbox.join("recv_abc.txt"))
    );
    assert_eq!(fs::read(inbox.join("recv_abc.txt")).unwrap(), b"abc");
    assert!(client.is_connected());
}

#[test]
fn test_unusable_receive_dir_rejected_at_bind() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let (handler, _rx) = events();
    let result = SecureChannelServer::bind(
        "127.0.0.1:0",
        TunnelConfig::default().with_receive_dir(blocker.path()),
        handler,
    );
    assert!(matches!(result, Err(TransportError::Config(_))));
}
