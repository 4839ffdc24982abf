//! Peer connections
//!
//! One peer = one authenticated TCP connection plus shared keys for the
//! datagram carrier. Frames on the stream are `length(2 LE) | bytes`;
//! handshake frames travel in the clear, everything after is sealed.
//! Immediately after the handshake each side sends an init record with
//! its datagram port and advertised addresses.

use crate::address::NodeAddr;
use crate::error::OverlayError;
use crate::message::Message;
use lib_crypto::{DatagramCipher, Digest, Identity, SecureTransport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Outgoing message queue depth per peer
const SEND_QUEUE: usize = 256;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Read one length-prefixed frame
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, OverlayError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), OverlayError> {
    if frame.len() > u16::MAX as usize {
        return Err(OverlayError::InvalidData("frame exceeds length prefix".into()));
    }
    writer.write_all(&(frame.len() as u16).to_le_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// First sealed record after the handshake
#[derive(Serialize, Deserialize)]
struct PeerInit {
    udp_port: u16,
    addresses: Vec<NodeAddr>,
}

/// Everything needed to run a peer after handshake and init exchange
pub struct PeerSetup {
    pub node: Digest,
    pub name: String,
    pub addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub addresses: Vec<NodeAddr>,
    send_cipher: DatagramCipher,
    recv_cipher: DatagramCipher,
    udp_send: DatagramCipher,
    udp_recv: DatagramCipher,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
}

async fn exchange_init(
    transport: &mut SecureTransport,
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    local_udp_port: u16,
    local_addresses: Vec<NodeAddr>,
) -> Result<PeerInit, OverlayError> {
    let init = PeerInit { udp_port: local_udp_port, addresses: local_addresses };
    let encoded = bincode::serialize(&init)
        .map_err(|e| OverlayError::InvalidData(e.to_string()))?;
    let sealed = transport.seal(&encoded)?;
    write_frame(write_half, &sealed).await?;

    let frame = read_frame(read_half).await?;
    let opened = transport.open(&frame)?;
    bincode::deserialize(&opened).map_err(|e| OverlayError::InvalidData(e.to_string()))
}

fn finish_setup(
    transport: SecureTransport,
    stream_addr: SocketAddr,
    init: PeerInit,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
) -> Result<PeerSetup, OverlayError> {
    let peer = transport
        .peer()
        .ok_or_else(|| OverlayError::Auth("handshake yielded no peer key".into()))?;
    let node = peer.digest();
    let name = transport.peer_name().unwrap_or_default().to_string();

    // Directional datagram keys with their own replay windows
    let client_udp = transport.export_key(b"teapotnet udp client write", 32)?;
    let server_udp = transport.export_key(b"teapotnet udp server write", 32)?;
    let mut client_key = [0u8; 32];
    client_key.copy_from_slice(&client_udp);
    let mut server_key = [0u8; 32];
    server_key.copy_from_slice(&server_udp);

    let (udp_send, udp_recv) = match transport.role() {
        lib_crypto::TransportRole::Client => {
            (DatagramCipher::new(&client_key), DatagramCipher::new(&server_key))
        }
        lib_crypto::TransportRole::Server => {
            (DatagramCipher::new(&server_key), DatagramCipher::new(&client_key))
        }
    };

    let udp_addr = SocketAddr::new(stream_addr.ip(), init.udp_port);
    let (send_cipher, recv_cipher) = transport.into_ciphers()?;
    Ok(PeerSetup {
        node,
        name,
        addr: stream_addr,
        udp_addr,
        addresses: init.addresses,
        send_cipher,
        recv_cipher,
        udp_send,
        udp_recv,
        read_half,
        write_half,
    })
}

/// Open an outbound peer connection and run the handshake
pub async fn connect(
    stream: TcpStream,
    identity: Arc<Identity>,
    expected: Option<Digest>,
    local_udp_port: u16,
    local_addresses: Vec<NodeAddr>,
) -> Result<PeerSetup, OverlayError> {
    let stream_addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let mut transport = SecureTransport::client(identity, expected);
    let hello = transport.initiate()?;
    write_frame(&mut write_half, &hello).await?;

    while !transport.is_established() {
        let frame = read_frame(&mut read_half).await?;
        if let Some(reply) = transport.handle(&frame)? {
            write_frame(&mut write_half, &reply).await?;
        }
    }

    let init = exchange_init(
        &mut transport,
        &mut read_half,
        &mut write_half,
        local_udp_port,
        local_addresses,
    )
    .await?;
    finish_setup(transport, stream_addr, init, read_half, write_half)
}

/// Run the handshake on an accepted connection
pub async fn accept(
    stream: TcpStream,
    identity: Arc<Identity>,
    local_udp_port: u16,
    local_addresses: Vec<NodeAddr>,
) -> Result<PeerSetup, OverlayError> {
    let stream_addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let mut transport = SecureTransport::server(identity, None);
    while !transport.is_established() {
        let frame = read_frame(&mut read_half).await?;
        if let Some(reply) = transport.handle(&frame)? {
            write_frame(&mut write_half, &reply).await?;
        }
    }

    let init = exchange_init(
        &mut transport,
        &mut read_half,
        &mut write_half,
        local_udp_port,
        local_addresses,
    )
    .await?;
    finish_setup(transport, stream_addr, init, read_half, write_half)
}

/// A running peer connection
pub struct Peer {
    pub node: Digest,
    pub name: String,
    pub addr: SocketAddr,
    pub udp_addr: SocketAddr,
    pub addresses: Vec<NodeAddr>,
    sender: mpsc::Sender<Message>,
    pub udp_send: Mutex<DatagramCipher>,
    pub udp_recv: Mutex<DatagramCipher>,
    pub last_seen: AtomicU64,
    pub missed_pings: AtomicU32,
    pub rtt_ms: AtomicU32,
    /// Malformed frames count against the peer's reputation
    pub bad_frames: AtomicU32,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Malformed frames tolerated before the connection is cut
const MAX_BAD_FRAMES: u32 = 64;

impl Peer {
    /// Start the send and receive loops for an established connection
    pub fn spawn(
        setup: PeerSetup,
        ingress: mpsc::Sender<(Digest, Message)>,
        disconnects: mpsc::Sender<Digest>,
    ) -> Arc<Peer> {
        let (sender, mut send_queue) = mpsc::channel::<Message>(SEND_QUEUE);
        let peer = Arc::new(Peer {
            node: setup.node,
            name: setup.name,
            addr: setup.addr,
            udp_addr: setup.udp_addr,
            addresses: setup.addresses,
            sender,
            udp_send: Mutex::new(setup.udp_send),
            udp_recv: Mutex::new(setup.udp_recv),
            last_seen: AtomicU64::new(now_secs()),
            missed_pings: AtomicU32::new(0),
            rtt_ms: AtomicU32::new(0),
            bad_frames: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let node = setup.node;
        let mut send_cipher = setup.send_cipher;
        let mut write_half = setup.write_half;
        let writer = tokio::spawn(async move {
            while let Some(message) = send_queue.recv().await {
                let frame = match message.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(peer = ?node, "dropping unencodable message: {e}");
                        continue;
                    }
                };
                let sealed = match send_cipher.seal(&frame) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(peer = ?node, "seal failed, closing connection: {e}");
                        break;
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &sealed).await {
                    debug!(peer = ?node, "write failed: {e}");
                    break;
                }
            }
        });

        let mut recv_cipher = setup.recv_cipher;
        let mut read_half = setup.read_half;
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut read_half).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer = ?node, "read failed: {e}");
                        break;
                    }
                };
                let opened = match recv_cipher.open(&frame) {
                    Ok(opened) => opened,
                    Err(e) => {
                        // Bad tag or replay: drop the frame, keep the link
                        trace!(peer = ?node, "discarding frame: {e}");
                        if reader_peer.penalize() {
                            break;
                        }
                        continue;
                    }
                };
                let message = match Message::decode(&opened) {
                    Ok(message) => message,
                    Err(e) => {
                        trace!(peer = ?node, "discarding malformed message: {e}");
                        if reader_peer.penalize() {
                            break;
                        }
                        continue;
                    }
                };
                reader_peer.touch();
                if ingress.send((node, message)).await.is_err() {
                    break;
                }
            }
            let _ = disconnects.send(node).await;
        });

        peer.tasks.lock().extend([writer, reader]);
        peer
    }

    /// Queue a message; a full queue counts as a transport failure
    pub fn send(&self, message: Message) -> Result<(), OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        self.sender
            .try_send(message)
            .map_err(|_| OverlayError::Network("peer send queue full or closed".into()))
    }

    pub fn touch(&self) {
        self.last_seen.store(now_secs(), Ordering::SeqCst);
        self.missed_pings.store(0, Ordering::SeqCst);
    }

    /// Count one malformed frame; true once the reputation budget is
    /// exhausted and the connection should be cut
    pub fn penalize(&self) -> bool {
        self.bad_frames.fetch_add(1, Ordering::SeqCst) + 1 >= MAX_BAD_FRAMES
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}
