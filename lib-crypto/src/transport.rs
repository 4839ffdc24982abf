//! Authenticated transport handshake
//!
//! A three-message handshake establishes mutually authenticated AEAD
//! session keys over any datagram exchange. Overlay peer connections run
//! it over framed TCP; tunnels run it over overlay messages. The exchange:
//!
//! 1. client hello: version, random, ephemeral X25519 key
//! 2. server response: random, ephemeral key, certificate, transcript signature
//! 3. client finish: certificate, transcript signature
//!
//! Session keys are HKDF(shared secret) salted with both randoms. A side
//! that expects a specific peer identifier rejects the handshake when the
//! certified key's digest differs; the check happens after the transcript
//! signature verifies, so an unknown caller is accepted into the handshake
//! and refused only at the authentication step.

use crate::aead::DatagramCipher;
use crate::digest::Digest;
use crate::error::CryptoError;
use crate::identity::{Certificate, Identity, PublicIdentity};
use crate::kdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Handshake protocol version
pub const TRANSPORT_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportRole {
    Client,
    Server,
}

#[derive(Serialize, Deserialize)]
enum HandshakeMessage {
    Hello {
        version: u8,
        random: [u8; 32],
        exchange: [u8; 32],
    },
    Response {
        random: [u8; 32],
        exchange: [u8; 32],
        certificate: Certificate,
        signature: Vec<u8>,
    },
    Finish {
        certificate: Certificate,
        signature: Vec<u8>,
    },
}

enum State {
    ClientStart,
    ClientSentHello,
    ServerStart,
    ServerSentResponse,
    Established,
    Failed,
}

/// Handshake and session state for one secured channel
pub struct SecureTransport {
    role: TransportRole,
    state: State,
    identity: Arc<Identity>,
    expected: Option<Digest>,
    secret: Option<StaticSecret>,
    local_random: [u8; 32],
    remote_random: [u8; 32],
    shared: Option<[u8; 32]>,
    transcript: Vec<u8>,
    peer: Option<PublicIdentity>,
    peer_name: Option<String>,
    send_cipher: Option<DatagramCipher>,
    recv_cipher: Option<DatagramCipher>,
}

impl SecureTransport {
    /// Initiating side; `expected` is the identifier the peer must prove
    pub fn client(identity: Arc<Identity>, expected: Option<Digest>) -> Self {
        Self::new(TransportRole::Client, identity, expected)
    }

    /// Accepting side; pass `None` to learn the caller's identity
    pub fn server(identity: Arc<Identity>, expected: Option<Digest>) -> Self {
        Self::new(TransportRole::Server, identity, expected)
    }

    fn new(role: TransportRole, identity: Arc<Identity>, expected: Option<Digest>) -> Self {
        let state = match role {
            TransportRole::Client => State::ClientStart,
            TransportRole::Server => State::ServerStart,
        };
        let mut local_random = [0u8; 32];
        crate::random::fill(&mut local_random);
        Self {
            role,
            state,
            identity,
            expected,
            secret: Some(StaticSecret::random_from_rng(OsRng)),
            local_random,
            remote_random: [0u8; 32],
            shared: None,
            transcript: Vec::new(),
            peer: None,
            peer_name: None,
            send_cipher: None,
            recv_cipher: None,
        }
    }

    pub fn role(&self) -> TransportRole {
        self.role
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established)
    }

    /// The authenticated peer key, available once established
    pub fn peer(&self) -> Option<&PublicIdentity> {
        self.peer.as_ref()
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// Produce the client hello. Client side only, once.
    pub fn initiate(&mut self) -> Result<Vec<u8>, CryptoError> {
        if !matches!(self.state, State::ClientStart) {
            return Err(CryptoError::State("initiate called twice".into()));
        }
        let exchange = self.exchange_public();
        let message = HandshakeMessage::Hello {
            version: TRANSPORT_VERSION,
            random: self.local_random,
            exchange,
        };
        self.append_transcript(b"hello", &self.local_random.clone(), &exchange);
        self.state = State::ClientSentHello;
        encode(&message)
    }

    /// Feed one handshake frame; returns the reply frame to send, if any
    pub fn handle(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, CryptoError> {
        let message = decode(frame)?;
        // The state is reinstated on success; any error leaves the
        // handshake failed
        let state = std::mem::replace(&mut self.state, State::Failed);
        match (state, message) {
            (State::ServerStart, HandshakeMessage::Hello { version, random, exchange }) => {
                if version != TRANSPORT_VERSION {
                    return Err(CryptoError::Unsupported(format!(
                        "transport version {version}"
                    )));
                }
                self.remote_random = random;
                self.append_transcript(b"hello", &random, &exchange);
                self.compute_shared(&exchange)?;

                let my_exchange = self.exchange_public();
                let certificate = self.identity.certificate();
                self.append_transcript(b"response", &self.local_random.clone(), &my_exchange);
                self.append_certificate(&certificate)?;
                let signature = self.identity.sign(&self.transcript);
                self.transcript.extend_from_slice(&signature);

                self.state = State::ServerSentResponse;
                let reply = HandshakeMessage::Response {
                    random: self.local_random,
                    exchange: my_exchange,
                    certificate,
                    signature,
                };
                Ok(Some(encode(&reply)?))
            }
            (
                State::ClientSentHello,
                HandshakeMessage::Response { random, exchange, certificate, signature },
            ) => {
                self.remote_random = random;
                self.append_transcript(b"response", &random, &exchange);
                self.append_certificate(&certificate)?;

                let peer = self.authenticate(&certificate, &signature)?;
                self.transcript.extend_from_slice(&signature);
                self.compute_shared(&exchange)?;

                let my_certificate = self.identity.certificate();
                self.append_transcript(b"finish", &[0u8; 32], &[0u8; 32]);
                self.append_certificate(&my_certificate)?;
                let my_signature = self.identity.sign(&self.transcript);

                self.peer = Some(peer);
                self.peer_name = Some(certificate.name);
                self.derive_session()?;
                self.state = State::Established;

                let reply = HandshakeMessage::Finish {
                    certificate: my_certificate,
                    signature: my_signature,
                };
                Ok(Some(encode(&reply)?))
            }
            (State::ServerSentResponse, HandshakeMessage::Finish { certificate, signature }) => {
                self.append_transcript(b"finish", &[0u8; 32], &[0u8; 32]);
                self.append_certificate(&certificate)?;
                let peer = self.authenticate(&certificate, &signature)?;

                self.peer = Some(peer);
                self.peer_name = Some(certificate.name);
                self.derive_session()?;
                self.state = State::Established;
                Ok(None)
            }
            _ => Err(CryptoError::State("unexpected handshake message".into())),
        }
    }

    /// Seal application data once established
    pub fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self
            .send_cipher
            .as_mut()
            .ok_or_else(|| CryptoError::State("not established".into()))?;
        cipher.seal(data)
    }

    /// Open application data once established
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self
            .recv_cipher
            .as_mut()
            .ok_or_else(|| CryptoError::State("not established".into()))?;
        cipher.open(frame)
    }

    /// Derive extra key material bound to this session, for secondary
    /// channels (the datagram carrier) that need their own replay windows
    pub fn export_key(&self, label: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
        if !self.is_established() {
            return Err(CryptoError::State("not established".into()));
        }
        let shared = self
            .shared
            .ok_or_else(|| CryptoError::State("no shared secret".into()))?;
        let (client_random, server_random) = match self.role {
            TransportRole::Client => (self.local_random, self.remote_random),
            TransportRole::Server => (self.remote_random, self.local_random),
        };
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(&client_random);
        salt.extend_from_slice(&server_random);
        kdf::derive_key_salted(&shared, &salt, label, len)
            .map_err(|e| CryptoError::State(e.to_string()))
    }

    /// Consume the transport, yielding the (send, receive) ciphers so the
    /// two directions can live on separate tasks
    pub fn into_ciphers(mut self) -> Result<(DatagramCipher, DatagramCipher), CryptoError> {
        let send = self
            .send_cipher
            .take()
            .ok_or_else(|| CryptoError::State("not established".into()))?;
        let recv = self
            .recv_cipher
            .take()
            .ok_or_else(|| CryptoError::State("not established".into()))?;
        Ok((send, recv))
    }

    fn exchange_public(&self) -> [u8; 32] {
        let secret = self.secret.as_ref().expect("exchange secret consumed");
        X25519Public::from(secret).to_bytes()
    }

    fn compute_shared(&mut self, peer_exchange: &[u8; 32]) -> Result<(), CryptoError> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| CryptoError::State("exchange secret consumed".into()))?;
        let shared = secret.diffie_hellman(&X25519Public::from(*peer_exchange));
        self.shared = Some(shared.to_bytes());
        Ok(())
    }

    fn append_transcript(&mut self, label: &[u8], random: &[u8; 32], exchange: &[u8; 32]) {
        self.transcript.extend_from_slice(label);
        self.transcript.extend_from_slice(random);
        self.transcript.extend_from_slice(exchange);
    }

    fn append_certificate(&mut self, certificate: &Certificate) -> Result<(), CryptoError> {
        let bytes = bincode::serialize(certificate)
            .map_err(|e| CryptoError::InvalidData(format!("certificate encoding: {e}")))?;
        self.transcript.extend_from_slice(&bytes);
        Ok(())
    }

    /// Validate the certificate, the transcript signature, and the
    /// expected identifier, in that order.
    fn authenticate(
        &mut self,
        certificate: &Certificate,
        signature: &[u8],
    ) -> Result<PublicIdentity, CryptoError> {
        let peer = match certificate.validate() {
            Ok(peer) => peer,
            Err(e) => {
                self.state = State::Failed;
                return Err(e);
            }
        };
        if let Err(e) = peer.verify(&self.transcript, signature) {
            self.state = State::Failed;
            return Err(e);
        }
        if let Some(expected) = &self.expected {
            if peer.digest() != *expected {
                self.state = State::Failed;
                return Err(CryptoError::Auth(format!(
                    "peer key digest {:?} does not match expected {:?}",
                    peer.digest(),
                    expected
                )));
            }
        }
        Ok(peer)
    }

    fn derive_session(&mut self) -> Result<(), CryptoError> {
        let shared = self
            .shared
            .ok_or_else(|| CryptoError::State("no shared secret".into()))?;

        let (client_random, server_random) = match self.role {
            TransportRole::Client => (self.local_random, self.remote_random),
            TransportRole::Server => (self.remote_random, self.local_random),
        };
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(&client_random);
        salt.extend_from_slice(&server_random);

        let client_key = kdf::derive_key_salted(&shared, &salt, b"teapotnet client write", 32)
            .map_err(|e| CryptoError::State(e.to_string()))?;
        let server_key = kdf::derive_key_salted(&shared, &salt, b"teapotnet server write", 32)
            .map_err(|e| CryptoError::State(e.to_string()))?;

        let mut client_bytes = [0u8; 32];
        client_bytes.copy_from_slice(&client_key);
        let mut server_bytes = [0u8; 32];
        server_bytes.copy_from_slice(&server_key);

        let (send, recv) = match self.role {
            TransportRole::Client => (client_bytes, server_bytes),
            TransportRole::Server => (server_bytes, client_bytes),
        };
        self.send_cipher = Some(DatagramCipher::new(&send));
        self.recv_cipher = Some(DatagramCipher::new(&recv));
        Ok(())
    }
}

fn encode(message: &HandshakeMessage) -> Result<Vec<u8>, CryptoError> {
    bincode::serialize(message)
        .map_err(|e| CryptoError::InvalidData(format!("handshake encoding: {e}")))
}

fn decode(frame: &[u8]) -> Result<HandshakeMessage, CryptoError> {
    bincode::deserialize(frame)
        .map_err(|e| CryptoError::InvalidData(format!("handshake decoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake(
        client: &mut SecureTransport,
        server: &mut SecureTransport,
    ) -> Result<(), CryptoError> {
        let hello = client.initiate()?;
        let response = server.handle(&hello)?.expect("server must respond");
        let finish = client.handle(&response)?.expect("client must finish");
        assert!(server.handle(&finish)?.is_none());
        Ok(())
    }

    #[test]
    fn test_mutual_handshake() {
        let alice = Arc::new(Identity::generate_with_bits("alice", 1024).unwrap());
        let bob = Arc::new(Identity::generate_with_bits("bob", 1024).unwrap());

        let mut client = SecureTransport::client(alice.clone(), Some(bob.digest()));
        let mut server = SecureTransport::server(bob.clone(), Some(alice.digest()));
        run_handshake(&mut client, &mut server).unwrap();

        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(client.peer().unwrap().digest(), bob.digest());
        assert_eq!(server.peer().unwrap().digest(), alice.digest());
        assert_eq!(server.peer_name(), Some("alice"));

        let frame = client.seal(b"over the tunnel").unwrap();
        assert_eq!(server.open(&frame).unwrap(), b"over the tunnel");
        let frame = server.seal(b"and back").unwrap();
        assert_eq!(client.open(&frame).unwrap(), b"and back");
    }

    #[test]
    fn test_wrong_identifier_rejected() {
        let alice = Arc::new(Identity::generate_with_bits("alice", 1024).unwrap());
        let bob = Arc::new(Identity::generate_with_bits("bob", 1024).unwrap());
        let mallory = Arc::new(Identity::generate_with_bits("mallory", 1024).unwrap());

        // Client expects bob but mallory answers
        let mut client = SecureTransport::client(alice, Some(bob.digest()));
        let mut server = SecureTransport::server(mallory, None);

        let hello = client.initiate().unwrap();
        let response = server.handle(&hello).unwrap().unwrap();
        let err = client.handle(&response).unwrap_err();
        assert!(matches!(err, CryptoError::Auth(_)));
        assert!(!client.is_established());
    }

    #[test]
    fn test_unknown_caller_accepted_when_unfiltered() {
        let alice = Arc::new(Identity::generate_with_bits("alice", 1024).unwrap());
        let bob = Arc::new(Identity::generate_with_bits("bob", 1024).unwrap());

        let mut client = SecureTransport::client(alice.clone(), Some(bob.digest()));
        let mut server = SecureTransport::server(bob, None);
        run_handshake(&mut client, &mut server).unwrap();
        assert_eq!(server.peer().unwrap().digest(), alice.digest());
    }

    #[test]
    fn test_bad_version_rejected() {
        let alice = Arc::new(Identity::generate_with_bits("alice", 1024).unwrap());
        let bob = Arc::new(Identity::generate_with_bits("bob", 1024).unwrap());

        let mut client = SecureTransport::client(alice, None);
        let mut server = SecureTransport::server(bob, None);

        let mut hello = client.initiate().unwrap();
        // Version byte is the first field of the bincode enum body
        let message: HandshakeMessage = bincode::deserialize(&hello).unwrap();
        if let HandshakeMessage::Hello { random, exchange, .. } = message {
            hello = bincode::serialize(&HandshakeMessage::Hello {
                version: 99,
                random,
                exchange,
            })
            .unwrap();
        }
        let err = server.handle(&hello).unwrap_err();
        assert!(matches!(err, CryptoError::Unsupported(_)));
    }
}
