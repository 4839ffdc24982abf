//! Secure tunneler
//!
//! Tunnels carry an end-to-end authenticated datagram stream between
//! two contacts across arbitrary overlay hops. The overlay's TUNNEL
//! messages hold `tunnel_id(8 LE) | frame`; frames are the transport
//! handshake first, sealed datagrams after. Tunnel ids are chosen
//! randomly by the opener and are unique per (peer node, id) while
//! open; a frame for an unknown id opens an inbound tunnel.

use crate::error::NetworkError;
use lib_crypto::{DatagramCipher, Digest, Identity, PublicIdentity, SecureTransport};
use lib_overlay::{Message, MessageType, Overlay};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Per-step handshake deadline
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a contact stays refused after an authentication failure
const BLACKLIST_INTERVAL: Duration = Duration::from_secs(30);

/// Queued inbound frames per tunnel
const TUNNEL_QUEUE: usize = 256;

/// One side of an open or opening tunnel
pub struct Tunnel {
    node: Digest,
    id: u64,
    overlay: Arc<Overlay>,
    incoming: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Tunnel {
    pub fn node(&self) -> Digest {
        self.node
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wrap a frame into an overlay message towards the peer node
    pub fn send(&self, frame: &[u8]) -> Result<(), NetworkError> {
        let mut payload = Vec::with_capacity(8 + frame.len());
        payload.extend_from_slice(&self.id.to_le_bytes());
        payload.extend_from_slice(frame);
        let message = Message::new(
            MessageType::Tunnel,
            self.overlay.local_node(),
            self.node,
            payload,
        );
        self.overlay.send(message).map_err(NetworkError::from)
    }

    /// Wait for the next frame, up to `timeout`
    pub async fn recv(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let incoming = self.incoming.as_mut()?;
        tokio::time::timeout(timeout, incoming.recv())
            .await
            .ok()
            .flatten()
    }

    /// Detach the receive queue so a handler can select on it while
    /// keeping the send half
    pub fn take_incoming(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.incoming.take()
    }
}

/// An authenticated tunnel ready to carry a link
pub struct EstablishedTunnel {
    pub tunnel: Tunnel,
    pub send_cipher: DatagramCipher,
    pub recv_cipher: DatagramCipher,
    pub peer: PublicIdentity,
    pub peer_name: String,
}

/// Outcome of routing one overlay TUNNEL message
pub enum RoutedFrame {
    /// Delivered to an open tunnel
    Delivered,
    /// A previously unknown id: the caller should run `accept`
    Inbound { tunnel: Tunnel, first_frame: Vec<u8> },
}

pub struct Tunneler {
    overlay: Arc<Overlay>,
    user: Arc<Identity>,
    tunnels: Mutex<HashMap<(Digest, u64), mpsc::Sender<Vec<u8>>>>,
    opening: Mutex<HashSet<(Digest, Digest)>>,
    blacklist: Mutex<HashMap<Digest, Instant>>,
}

impl Tunneler {
    pub fn new(overlay: Arc<Overlay>, user: Arc<Identity>) -> Self {
        Self {
            overlay,
            user,
            tunnels: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashSet::new()),
            blacklist: Mutex::new(HashMap::new()),
        }
    }

    pub fn user(&self) -> &Arc<Identity> {
        &self.user
    }

    /// Route one TUNNEL message payload from the overlay dispatcher
    pub fn route(&self, source: Digest, payload: &[u8]) -> Option<RoutedFrame> {
        if payload.len() < 8 {
            trace!("dropping short tunnel payload");
            return None;
        }
        let id = u64::from_le_bytes(payload[..8].try_into().expect("fixed slice"));
        let frame = payload[8..].to_vec();

        let sender = self.tunnels.lock().get(&(source, id)).cloned();
        if let Some(sender) = sender {
            if sender.try_send(frame).is_err() {
                trace!(node = ?source, id, "tunnel queue full, frame dropped");
            }
            return Some(RoutedFrame::Delivered);
        }

        // Unknown id on a node that did not open it: inbound request
        let (tx, rx) = mpsc::channel(TUNNEL_QUEUE);
        self.tunnels.lock().insert((source, id), tx);
        let tunnel = Tunnel {
            node: source,
            id,
            overlay: self.overlay.clone(),
            incoming: Some(rx),
        };
        Some(RoutedFrame::Inbound { tunnel, first_frame: frame })
    }

    fn is_blacklisted(&self, remote: &Digest) -> bool {
        let mut blacklist = self.blacklist.lock();
        match blacklist.get(remote) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                blacklist.remove(remote);
                false
            }
            None => false,
        }
    }

    fn blacklist(&self, remote: Digest) {
        self.blacklist
            .lock()
            .insert(remote, Instant::now() + BLACKLIST_INTERVAL);
    }

    /// Drop the routing entry for a closed tunnel
    pub fn release(&self, node: Digest, id: u64) {
        self.tunnels.lock().remove(&(node, id));
    }

    /// Open a tunnel to `remote` on a specific node and authenticate
    pub async fn open(
        self: &Arc<Self>,
        node: Digest,
        remote: Digest,
    ) -> Result<EstablishedTunnel, NetworkError> {
        if self.is_blacklisted(&remote) {
            return Err(NetworkError::Auth(format!(
                "contact {remote:?} briefly blacklisted"
            )));
        }
        if !self.opening.lock().insert((node, remote)) {
            return Err(NetworkError::Busy(format!(
                "tunnel to {remote:?} already opening"
            )));
        }
        let result = self.open_inner(node, remote).await;
        self.opening.lock().remove(&(node, remote));
        if matches!(result, Err(NetworkError::Auth(_))) {
            self.blacklist(remote);
        }
        result
    }

    async fn open_inner(
        self: &Arc<Self>,
        node: Digest,
        remote: Digest,
    ) -> Result<EstablishedTunnel, NetworkError> {
        // Duplicate ids are retried
        let (id, rx) = loop {
            let id = lib_crypto::random_u64();
            let mut tunnels = self.tunnels.lock();
            if let std::collections::hash_map::Entry::Vacant(entry) =
                tunnels.entry((node, id))
            {
                let (tx, rx) = mpsc::channel(TUNNEL_QUEUE);
                entry.insert(tx);
                break (id, rx);
            }
        };
        let mut tunnel = Tunnel {
            node,
            id,
            overlay: self.overlay.clone(),
            incoming: Some(rx),
        };

        let mut transport = SecureTransport::client(self.user.clone(), Some(remote));
        let result = Self::drive_handshake(&mut transport, &mut tunnel, None).await;
        match result {
            Ok(()) => Self::finish(transport, tunnel),
            Err(e) => {
                self.release(node, id);
                Err(e)
            }
        }
    }

    /// Complete an inbound handshake. The caller authenticates the
    /// resulting contact before wiring up a link.
    pub async fn accept(
        self: &Arc<Self>,
        mut tunnel: Tunnel,
        first_frame: Vec<u8>,
    ) -> Result<EstablishedTunnel, NetworkError> {
        let mut transport = SecureTransport::server(self.user.clone(), None);
        let result =
            Self::drive_handshake(&mut transport, &mut tunnel, Some(first_frame)).await;
        match result {
            Ok(()) => Self::finish(transport, tunnel),
            Err(e) => {
                self.release(tunnel.node, tunnel.id);
                if matches!(e, NetworkError::Auth(_)) {
                    debug!(node = ?tunnel.node, "inbound tunnel failed authentication");
                }
                Err(e)
            }
        }
    }

    async fn drive_handshake(
        transport: &mut SecureTransport,
        tunnel: &mut Tunnel,
        first_frame: Option<Vec<u8>>,
    ) -> Result<(), NetworkError> {
        if first_frame.is_none() {
            let hello = transport.initiate()?;
            tunnel.send(&hello)?;
        }
        let mut pending = first_frame;
        while !transport.is_established() {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => tunnel
                    .recv(HANDSHAKE_STEP_TIMEOUT)
                    .await
                    .ok_or(NetworkError::Timeout)?,
            };
            if let Some(reply) = transport.handle(&frame)? {
                tunnel.send(&reply)?;
            }
        }
        Ok(())
    }

    fn finish(
        transport: SecureTransport,
        tunnel: Tunnel,
    ) -> Result<EstablishedTunnel, NetworkError> {
        let peer = transport
            .peer()
            .cloned()
            .ok_or_else(|| NetworkError::Auth("handshake yielded no peer key".into()))?;
        let peer_name = transport.peer_name().unwrap_or_default().to_string();
        let (send_cipher, recv_cipher) = transport.into_ciphers()?;
        Ok(EstablishedTunnel {
            tunnel,
            send_cipher,
            recv_cipher,
            peer,
            peer_name,
        })
    }

    /// Close every tunnel entry (the handlers notice on their own)
    pub fn clear(&self) {
        let count = {
            let mut tunnels = self.tunnels.lock();
            let count = tunnels.len();
            tunnels.clear();
            count
        };
        if count > 0 {
            warn!(count, "cleared open tunnels");
        }
    }
}
