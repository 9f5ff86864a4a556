//! Ephemeral Diffie-Hellman handshake over a blocking byte stream

use std::io::{Read, Write};

use tracing::debug;

use crate::{CryptoError, CryptoResult, KeyPair, PUBLIC_KEY_SIZE, SessionKey};

/// Run the handshake and return the negotiated session key.
///
/// Both ends write their public key before reading the peer's, so the
/// exchange cannot deadlock on a blocking transport.
pub fn perform_handshake<T: Read + Write>(transport: &mut T) -> CryptoResult<SessionKey> {
    let keypair = KeyPair::generate();

    transport
        .write_all(&keypair.public_key_bytes())
        .map_err(CryptoError::Handshake)?;
    transport.flush().map_err(CryptoError::Handshake)?;

    let mut their_public = [0u8; PUBLIC_KEY_SIZE];
    transport
        .read_exact(&mut their_public)
        .map_err(CryptoError::Handshake)?;

    let key = keypair.derive_session_key(&their_public)?;
    debug!("Handshake complete");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// Replays canned peer bytes and records what we wrote
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handshake_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            perform_handshake(&mut stream).unwrap()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let client_key = perform_handshake(&mut client).unwrap();
        let server_key = server.join().unwrap();

        assert_eq!(client_key, server_key);
    }

    #[test]
    fn test_writes_public_key_first() {
        let peer = KeyPair::generate();
        let mut transport = Scripted {
            input: Cursor::new(peer.public_key_bytes().to_vec()),
            output: Vec::new(),
        };

        perform_handshake(&mut transport).unwrap();
        assert_eq!(transport.output.len(), PUBLIC_KEY_SIZE);
    }

    #[test]
    fn test_peer_closes_early() {
        let mut transport = Scripted {
            input: Cursor::new(vec![1u8; 10]),
            output: Vec::new(),
        };

        let err = perform_handshake(&mut transport).unwrap_err();
        assert!(matches!(err, CryptoError::Handshake(_)));
        assert!(err.is_handshake_failure());
    }

    #[test]
    fn test_malformed_peer_key() {
        let mut transport = Scripted {
            input: Cursor::new(vec![0u8; PUBLIC_KEY_SIZE]),
            output: Vec::new(),
        };

        let err = perform_handshake(&mut transport).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPublicKey));
        assert!(err.is_handshake_failure());
    }
}
