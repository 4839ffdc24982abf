//! Overlay node
//!
//! Owns the stream listener, the datagram socket, the peer set and the
//! routing table. The ingress pipeline delivers messages addressed to
//! the local node to per-type dispatchers and forwards the rest towards
//! the closest known node, decrementing the TTL at each hop.

use crate::address::NodeAddr;
use crate::dht::{
    self, NodeInfo, ValueStore, LOOKUP_ALPHA, REPLICATION,
};
use crate::error::OverlayError;
use crate::message::{Message, MessageType};
use crate::peer::{self, Peer};
use crate::routing::RoutingTable;
use lib_crypto::{Digest, Identity};
use lib_runtime::Scheduler;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Recently seen message cache size
const SEEN_CACHE: usize = 4096;

/// Probes a peer may miss before the connection is dropped
const MAX_MISSED_PINGS: u32 = 3;

/// Attempts before a destination is given up on
const MAX_ROUTE_ATTEMPTS: u32 = 3;

/// Base delay for the per-destination resend backoff
const ROUTE_BACKOFF: Duration = Duration::from_millis(200);

/// Handshake deadline for one connection attempt
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One round of an iterative lookup waits this long for answers
const LOOKUP_ROUND: Duration = Duration::from_millis(700);

#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Stream and datagram bind address; port 0 picks an ephemeral port
    pub bind: SocketAddr,
    /// Extra addresses to advertise to peers
    pub advertise: Vec<NodeAddr>,
    /// Liveness probe period
    pub ping_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8480".parse().expect("static address"),
            advertise: Vec::new(),
            ping_interval: Duration::from_secs(10),
        }
    }
}

struct RouteBackoff {
    attempts: u32,
}

type RetrieveWaiter = mpsc::UnboundedSender<(Vec<Vec<u8>>, Vec<NodeInfo>)>;
type CallWaiter = mpsc::UnboundedSender<Vec<NodeInfo>>;

/// The overlay router for one node
pub struct Overlay {
    identity: Arc<Identity>,
    local: Digest,
    config: OverlayConfig,
    listen_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    scheduler: Scheduler,

    peers: RwLock<HashMap<Digest, Arc<Peer>>>,
    routing: Mutex<RoutingTable>,
    seen: Mutex<LruCache<Digest, ()>>,
    dispatch: Mutex<HashMap<u8, mpsc::Sender<Message>>>,
    values: Mutex<ValueStore>,
    pending_retrieves: Mutex<HashMap<Digest, Vec<RetrieveWaiter>>>,
    pending_calls: Mutex<HashMap<Digest, Vec<CallWaiter>>>,
    pending_pings: Mutex<HashMap<u64, (Digest, Instant)>>,
    route_backoff: Mutex<HashMap<Digest, RouteBackoff>>,

    ingress_tx: mpsc::Sender<(Digest, Message)>,
    disconnect_tx: mpsc::Sender<Digest>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    scheduled: Mutex<Vec<lib_runtime::TaskId>>,
    closed: AtomicBool,
}

impl Overlay {
    /// Bind the carriers and start the receive loops
    pub async fn start(
        identity: Arc<Identity>,
        config: OverlayConfig,
        scheduler: Scheduler,
    ) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind).await?;
        let listen_addr = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(listen_addr).await?);
        let local = identity.digest();

        let (ingress_tx, ingress_rx) = mpsc::channel(1024);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(64);

        let overlay = Arc::new(Self {
            identity,
            local,
            config,
            listen_addr,
            udp,
            scheduler,
            peers: RwLock::new(HashMap::new()),
            routing: Mutex::new(RoutingTable::new(local)),
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CACHE).expect("nonzero cache size"),
            )),
            dispatch: Mutex::new(HashMap::new()),
            values: Mutex::new(ValueStore::new()),
            pending_retrieves: Mutex::new(HashMap::new()),
            pending_calls: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            route_backoff: Mutex::new(HashMap::new()),
            ingress_tx,
            disconnect_tx,
            tasks: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        overlay.spawn_accept_loop(listener);
        overlay.spawn_udp_loop();
        overlay.spawn_ingress_loop(ingress_rx);
        overlay.spawn_disconnect_loop(disconnect_rx);
        overlay.schedule_maintenance();

        info!(node = ?local, addr = %listen_addr, "overlay started");
        Ok(overlay)
    }

    pub fn local_node(&self) -> Digest {
        self.local
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Addresses advertised to peers and in call responses
    pub fn local_addresses(&self) -> Vec<NodeAddr> {
        let mut addrs = vec![NodeAddr(self.listen_addr)];
        addrs.extend(self.config.advertise.iter().copied());
        addrs.sort();
        addrs.dedup();
        addrs
    }

    pub fn neighbors(&self) -> Vec<Digest> {
        self.peers.read().keys().copied().collect()
    }

    pub fn is_connected(&self, node: &Digest) -> bool {
        self.peers.read().contains_key(node)
    }

    /// Receive all messages of one type addressed to this node
    pub fn subscribe(&self, message_type: MessageType) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(256);
        self.dispatch.lock().insert(message_type as u8, tx);
        rx
    }

    /// Connect to a peer; `expected` pins the node identifier
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        expected: Option<Digest>,
    ) -> Result<Digest, OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let setup = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            peer::connect(
                stream,
                self.identity.clone(),
                expected,
                self.listen_addr.port(),
                self.local_addresses(),
            ),
        )
        .await
        .map_err(|_| OverlayError::Timeout)??;
        self.install_peer(setup)
    }

    fn install_peer(self: &Arc<Self>, setup: peer::PeerSetup) -> Result<Digest, OverlayError> {
        let node = setup.node;
        if node == self.local {
            return Err(OverlayError::InvalidData("connected to self".into()));
        }
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&node) {
                debug!(peer = ?node, "already connected");
                return Ok(node);
            }
            let addresses = setup.addresses.clone();
            let peer = Peer::spawn(setup, self.ingress_tx.clone(), self.disconnect_tx.clone());
            peers.insert(node, peer);
            self.routing.lock().insert(node, addresses);
        }
        info!(peer = ?node, "peer connected");
        Ok(node)
    }

    /// Send or forward a message. Destination equal to the local node
    /// delivers straight to the dispatcher.
    pub fn send(self: &Arc<Self>, message: Message) -> Result<(), OverlayError> {
        if message.destination == self.local {
            self.deliver_local(self.local, message);
            return Ok(());
        }
        self.mark_seen_frame(&message);
        self.route(message, &[])
    }

    /// Pick the closest connected peers and hand the message to the
    /// first that accepts it
    fn route(self: &Arc<Self>, message: Message, exclude: &[Digest]) -> Result<(), OverlayError> {
        let destination = message.destination;
        let candidates: Vec<Arc<Peer>> = {
            let peers = self.peers.read();
            let mut nodes: Vec<&Arc<Peer>> = peers
                .values()
                .filter(|p| {
                    p.node != message.source && !exclude.contains(&p.node)
                })
                .collect();
            nodes.sort_by(|a, b| {
                destination
                    .distance(&a.node)
                    .cmp(&destination.distance(&b.node))
            });
            nodes.into_iter().cloned().collect()
        };

        // A directly connected destination short-circuits the metric
        if let Some(direct) = candidates.iter().find(|p| p.node == destination) {
            if direct.send(message.clone()).is_ok() {
                self.clear_backoff(&destination);
                return Ok(());
            }
        }

        for candidate in &candidates {
            if candidate.send(message.clone()).is_ok() {
                self.clear_backoff(&destination);
                return Ok(());
            }
        }
        self.schedule_route_retry(message)
    }

    fn clear_backoff(&self, destination: &Digest) {
        self.route_backoff.lock().remove(destination);
    }

    /// Per-destination exponential backoff before a resend; the message
    /// is dropped once the attempt budget is spent
    fn schedule_route_retry(self: &Arc<Self>, message: Message) -> Result<(), OverlayError> {
        let destination = message.destination;
        let attempts = {
            let mut backoff = self.route_backoff.lock();
            let entry = backoff
                .entry(destination)
                .or_insert(RouteBackoff { attempts: 0 });
            entry.attempts += 1;
            entry.attempts
        };
        if attempts > MAX_ROUTE_ATTEMPTS {
            self.route_backoff.lock().remove(&destination);
            return Err(OverlayError::NoRoute(destination.to_hex()));
        }
        let delay = ROUTE_BACKOFF * 2u32.pow(attempts - 1);
        let weak = Arc::downgrade(self);
        self.scheduler.schedule(delay, move || {
            if let Some(overlay) = weak.upgrade() {
                let _ = overlay.route(message, &[]);
            }
        });
        Ok(())
    }

    fn mark_seen_frame(&self, message: &Message) -> bool {
        let digest = message.dedup_digest();
        let mut seen = self.seen.lock();
        if seen.contains(&digest) {
            return false;
        }
        seen.put(digest, ());
        true
    }

    // ----- ingress pipeline -----

    fn spawn_ingress_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<(Digest, Message)>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some((arrival, message)) = rx.recv().await {
                let Some(overlay) = weak.upgrade() else { break };
                overlay.handle_ingress(arrival, message);
            }
        });
        self.tasks.lock().push(task);
    }

    fn handle_ingress(self: &Arc<Self>, arrival: Digest, mut message: Message) {
        if !self.mark_seen_frame(&message) {
            trace!(from = ?arrival, "dropping duplicate");
            return;
        }
        if let Some(peer) = self.peers.read().get(&arrival) {
            peer.touch();
        }
        self.routing.lock().mark_seen(&arrival);

        if message.destination == self.local {
            self.deliver_local(arrival, message);
            return;
        }

        // Forwarding path
        if message.ttl == 0 {
            trace!("dropping expired message");
            return;
        }
        message.ttl -= 1;
        if message.ttl == 0 {
            return;
        }

        // Call messages accumulate address hints hop by hop
        if message.message_type == MessageType::Call {
            if let Ok((target, mut hints)) = dht::decode_call(&message.payload) {
                if let Some(entry) = self.routing.lock().get(&target) {
                    if !entry.addresses.is_empty()
                        && !hints.iter().any(|h| h.node == target)
                    {
                        hints.push(NodeInfo { node: target, addresses: entry.addresses.clone() });
                        message.payload = dht::encode_call(&target, &hints);
                    }
                }
            }
        }

        let destination = message.destination;
        let source = message.source;
        if self.route(message, &[arrival]).is_err() {
            // Nothing better to offer; suggest candidates to the origin
            let candidates: Vec<NodeInfo> = self
                .routing
                .lock()
                .closest(&destination, LOOKUP_ALPHA, &[source])
                .into_iter()
                .map(|e| NodeInfo { node: e.node, addresses: e.addresses })
                .collect();
            if !candidates.is_empty() {
                let suggest = Message::new(
                    MessageType::Suggest,
                    self.local,
                    source,
                    dht::encode_call(&destination, &candidates),
                );
                let _ = self.send(suggest);
            }
        }
    }

    fn deliver_local(self: &Arc<Self>, arrival: Digest, message: Message) {
        match message.message_type {
            MessageType::Ping => self.on_ping(arrival, message),
            MessageType::Pong => self.on_pong(message),
            MessageType::Store => self.on_store(message),
            MessageType::Retrieve => self.on_retrieve(message),
            MessageType::RetrieveResponse => self.on_retrieve_response(message),
            MessageType::Call => self.on_call(message),
            MessageType::CallResponse => self.on_call_response(message),
            MessageType::Suggest => self.on_suggest(message),
            MessageType::Tunnel => self.dispatch_external(message),
        }
    }

    fn dispatch_external(&self, message: Message) {
        let sender = self
            .dispatch
            .lock()
            .get(&(message.message_type as u8))
            .cloned();
        match sender {
            Some(sender) => {
                if sender.try_send(message).is_err() {
                    warn!("dispatcher queue full, dropping message");
                }
            }
            None => trace!("no dispatcher registered, dropping message"),
        }
    }

    fn on_ping(self: &Arc<Self>, _arrival: Digest, message: Message) {
        let Ok(nonce) = dht::decode_ping(&message.payload) else { return };
        let pong = Message::new(
            MessageType::Pong,
            self.local,
            message.source,
            dht::encode_ping(nonce),
        );
        let _ = self.send(pong);
    }

    fn on_pong(self: &Arc<Self>, message: Message) {
        let Ok(nonce) = dht::decode_ping(&message.payload) else { return };
        if let Some((node, sent)) = self.pending_pings.lock().remove(&nonce) {
            let rtt = sent.elapsed().as_millis() as u32;
            if let Some(peer) = self.peers.read().get(&node) {
                peer.rtt_ms.store(rtt, Ordering::SeqCst);
                peer.touch();
            }
            self.routing.lock().mark_seen(&node);
        }
    }

    fn on_store(self: &Arc<Self>, message: Message) {
        match dht::decode_store(&message.payload) {
            Ok((key, value)) => {
                trace!(key = ?key, "stored value");
                self.values.lock().insert(key, value);
            }
            Err(e) => trace!("dropping malformed store: {e}"),
        }
    }

    fn on_retrieve(self: &Arc<Self>, message: Message) {
        let Ok(key) = dht::decode_retrieve(&message.payload) else { return };
        let values = self.values.lock().get(&key);
        let nodes: Vec<NodeInfo> = self
            .routing
            .lock()
            .closest(&key, REPLICATION, &[message.source])
            .into_iter()
            .map(|e| NodeInfo { node: e.node, addresses: e.addresses })
            .collect();
        let response = Message::new(
            MessageType::RetrieveResponse,
            self.local,
            message.source,
            dht::encode_retrieve_response(&key, &values, &nodes),
        );
        let _ = self.send(response);
    }

    fn on_retrieve_response(self: &Arc<Self>, message: Message) {
        let Ok((key, values, nodes)) = dht::decode_retrieve_response(&message.payload) else {
            return;
        };
        self.learn_nodes(&nodes);
        let waiters = self.pending_retrieves.lock().get(&key).cloned();
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send((values.clone(), nodes.clone()));
            }
        }
    }

    fn on_call(self: &Arc<Self>, message: Message) {
        let Ok((target, mut hints)) = dht::decode_call(&message.payload) else { return };
        if target == self.local {
            hints.push(NodeInfo { node: self.local, addresses: self.local_addresses() });
        }
        let response = Message::new(
            MessageType::CallResponse,
            self.local,
            message.source,
            dht::encode_call(&target, &hints),
        );
        let _ = self.send(response);
    }

    fn on_call_response(self: &Arc<Self>, message: Message) {
        let Ok((target, nodes)) = dht::decode_call(&message.payload) else { return };
        self.learn_nodes(&nodes);
        let waiters = self.pending_calls.lock().get(&target).cloned();
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(nodes.clone());
            }
        }
    }

    fn on_suggest(self: &Arc<Self>, message: Message) {
        if let Ok((_, nodes)) = dht::decode_call(&message.payload) {
            self.learn_nodes(&nodes);
        }
    }

    fn learn_nodes(&self, nodes: &[NodeInfo]) {
        let mut routing = self.routing.lock();
        for info in nodes {
            if info.node != self.local {
                routing.insert(info.node, info.addresses.clone());
            }
        }
    }

    // ----- DHT operations -----

    /// Replicate a value to the closest known nodes (and locally)
    pub fn store(self: &Arc<Self>, key: Digest, value: Vec<u8>) {
        self.values.lock().insert(key, value.clone());
        let targets = self.routing.lock().closest(&key, REPLICATION, &[]);
        for target in targets {
            let message = Message::new(
                MessageType::Store,
                self.local,
                target.node,
                dht::encode_store(&key, &value),
            );
            let _ = self.send(message);
        }
    }

    /// Iterative value lookup. Local matches return immediately; remote
    /// rounds query the closest known nodes and recurse on anything
    /// closer they report, until no progress or the deadline.
    pub async fn retrieve(
        self: &Arc<Self>,
        key: Digest,
        timeout: Duration,
    ) -> Result<BTreeSet<Vec<u8>>, OverlayError> {
        let local = self.values.lock().get(&key);
        if !local.is_empty() {
            return Ok(local.into_iter().collect());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = tx.clone();
        self.pending_retrieves.lock().entry(key).or_default().push(tx);

        let deadline = Instant::now() + timeout;
        let mut results: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut queried: HashSet<Digest> = HashSet::new();
        let mut candidates: Vec<Digest> = {
            let routing = self.routing.lock();
            routing
                .closest(&key, REPLICATION, &[])
                .into_iter()
                .map(|e| e.node)
                .collect()
        };

        'rounds: while Instant::now() < deadline {
            if !results.is_empty() {
                break;
            }
            candidates.sort_by(|a, b| key.distance(a).cmp(&key.distance(b)));
            let round: Vec<Digest> = candidates
                .iter()
                .filter(|n| !queried.contains(*n))
                .take(LOOKUP_ALPHA)
                .copied()
                .collect();
            if round.is_empty() {
                break;
            }
            for node in &round {
                queried.insert(*node);
                let message = Message::new(
                    MessageType::Retrieve,
                    self.local,
                    *node,
                    dht::encode_retrieve(&key),
                );
                let _ = self.send(message);
            }

            let round_deadline = (Instant::now() + LOOKUP_ROUND).min(deadline);
            let mut answers = 0usize;
            while answers < round.len() {
                let remaining = round_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    continue 'rounds;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some((values, nodes))) => {
                        answers += 1;
                        for value in values {
                            results.insert(value);
                        }
                        for info in nodes {
                            if info.node != self.local && !queried.contains(&info.node) {
                                candidates.push(info.node);
                            }
                        }
                    }
                    Ok(None) => break 'rounds,
                    Err(_) => continue 'rounds,
                }
            }
            if !results.is_empty() {
                break;
            }
        }

        {
            // Only drop this call's waiter; concurrent lookups of the
            // same key keep theirs
            let mut pending = self.pending_retrieves.lock();
            if let Some(waiters) = pending.get_mut(&key) {
                waiters.retain(|w| !w.same_channel(&waiter));
                if waiters.is_empty() {
                    pending.remove(&key);
                }
            }
        }
        if results.is_empty() && Instant::now() >= deadline {
            return Err(OverlayError::Timeout);
        }
        Ok(results)
    }

    /// Resolve a node identifier to transport addresses
    pub async fn resolve_node(
        self: &Arc<Self>,
        target: Digest,
        timeout: Duration,
    ) -> Result<Vec<NodeAddr>, OverlayError> {
        if let Some(peer) = self.peers.read().get(&target) {
            let mut addrs = peer.addresses.clone();
            addrs.push(NodeAddr(peer.addr));
            addrs.sort();
            addrs.dedup();
            return Ok(addrs);
        }
        if let Some(entry) = self.routing.lock().get(&target) {
            if !entry.addresses.is_empty() {
                return Ok(entry.addresses.clone());
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = tx.clone();
        self.pending_calls.lock().entry(target).or_default().push(tx);

        let message = Message::new(
            MessageType::Call,
            self.local,
            target,
            dht::encode_call(&target, &[]),
        );
        let _ = self.send(message);

        let deadline = Instant::now() + timeout;
        let mut addresses: BTreeSet<NodeAddr> = BTreeSet::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(nodes)) => {
                    for info in nodes {
                        if info.node == target {
                            addresses.extend(info.addresses);
                        }
                    }
                    if !addresses.is_empty() {
                        break;
                    }
                }
                _ => break,
            }
        }

        {
            let mut pending = self.pending_calls.lock();
            if let Some(waiters) = pending.get_mut(&target) {
                waiters.retain(|w| !w.same_channel(&waiter));
                if waiters.is_empty() {
                    pending.remove(&target);
                }
            }
        }
        if addresses.is_empty() {
            return Err(OverlayError::Timeout);
        }
        Ok(addresses.into_iter().collect())
    }

    // ----- background loops -----

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, addr)) = listener.accept().await else { break };
                let Some(overlay) = weak.upgrade() else { break };
                debug!(%addr, "incoming connection");
                let weak_inner = Arc::downgrade(&overlay);
                tokio::spawn(async move {
                    let Some(overlay) = weak_inner.upgrade() else { return };
                    let result = tokio::time::timeout(
                        HANDSHAKE_TIMEOUT,
                        peer::accept(
                            stream,
                            overlay.identity.clone(),
                            overlay.listen_addr.port(),
                            overlay.local_addresses(),
                        ),
                    )
                    .await;
                    match result {
                        Ok(Ok(setup)) => {
                            let _ = overlay.install_peer(setup);
                        }
                        Ok(Err(e)) => debug!(%addr, "inbound handshake failed: {e}"),
                        Err(_) => debug!(%addr, "inbound handshake timed out"),
                    }
                });
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_udp_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let udp = self.udp.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((len, _from)) = udp.recv_from(&mut buf).await else { break };
                let Some(overlay) = weak.upgrade() else { break };
                if len < 32 {
                    continue;
                }
                let Some(node) = Digest::from_slice(&buf[..32]) else { continue };
                let peer = overlay.peers.read().get(&node).cloned();
                let Some(peer) = peer else { continue };
                let opened = peer.udp_recv.lock().open(&buf[32..len]);
                match opened {
                    Ok(plain) => match Message::decode(&plain) {
                        Ok(message) => {
                            let _ = overlay.ingress_tx.send((node, message)).await;
                        }
                        Err(e) => trace!("bad datagram message: {e}"),
                    },
                    Err(e) => trace!("bad datagram frame: {e}"),
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_disconnect_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<Digest>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(node) = rx.recv().await {
                let Some(overlay) = weak.upgrade() else { break };
                overlay.drop_peer(&node);
            }
        });
        self.tasks.lock().push(task);
    }

    fn drop_peer(&self, node: &Digest) {
        let peer = self.peers.write().remove(node);
        if let Some(peer) = peer {
            peer.close();
            self.routing.lock().mark_failed(node);
            info!(peer = ?node, "peer disconnected");
        }
    }

    fn schedule_maintenance(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let ping_task = self.scheduler.repeat(self.config.ping_interval, move || {
            if let Some(overlay) = weak.upgrade() {
                overlay.ping_peers();
            }
        });

        let weak = Arc::downgrade(self);
        let cleanup_task = self.scheduler.repeat(Duration::from_secs(60), move || {
            if let Some(overlay) = weak.upgrade() {
                overlay.values.lock().cleanup();
                overlay.routing.lock().prune_stale(3600);
                if let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(30)) {
                    overlay
                        .pending_pings
                        .lock()
                        .retain(|_, (_, sent)| *sent > cutoff);
                }
            }
        });

        self.scheduled.lock().extend([ping_task, cleanup_task]);
    }

    /// Probe every peer over the datagram carrier; peers past the missed
    /// budget are dropped
    fn ping_peers(self: &Arc<Self>) {
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            let missed = peer.missed_pings.fetch_add(1, Ordering::SeqCst);
            if missed >= MAX_MISSED_PINGS {
                warn!(peer = ?peer.node, "peer unresponsive, dropping");
                self.drop_peer(&peer.node);
                continue;
            }

            let nonce = lib_crypto::random_u64();
            self.pending_pings
                .lock()
                .insert(nonce, (peer.node, Instant::now()));
            let message = Message::new(
                MessageType::Ping,
                self.local,
                peer.node,
                dht::encode_ping(nonce),
            );

            // Keepalives prefer the datagram carrier; fall back to the
            // stream when sealing or sending fails
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            let sealed = peer.udp_send.lock().seal(&frame);
            match sealed {
                Ok(sealed) => {
                    let mut datagram = Vec::with_capacity(32 + sealed.len());
                    datagram.extend_from_slice(self.local.as_bytes());
                    datagram.extend_from_slice(&sealed);
                    if self.udp.try_send_to(&datagram, peer.udp_addr).is_err() {
                        let _ = peer.send(message);
                    }
                }
                Err(_) => {
                    let _ = peer.send(message);
                }
            }
        }
    }

    /// Stop all loops and drop every peer
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for id in self.scheduled.lock().drain(..) {
            self.scheduler.cancel(id);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let peers: Vec<Arc<Peer>> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close();
        }
        info!(node = ?self.local, "overlay closed");
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_TTL;
    use lib_runtime::TaskPool;

    async fn test_overlay(name: &str) -> Arc<Overlay> {
        let identity = Arc::new(Identity::generate_with_bits(name, 1024).unwrap());
        let scheduler = Scheduler::new(TaskPool::new(4));
        let config = OverlayConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            advertise: Vec::new(),
            ping_interval: Duration::from_millis(500),
        };
        Overlay::start(identity, config, scheduler).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_and_neighbors() {
        let a = test_overlay("a").await;
        let b = test_overlay("b").await;

        let node = a.connect(b.listen_addr(), Some(b.local_node())).await.unwrap();
        assert_eq!(node, b.local_node());
        assert!(a.is_connected(&b.local_node()));

        // The inbound side registers the peer too
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.is_connected(&a.local_node()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_wrong_identity_rejected() {
        let a = test_overlay("a").await;
        let b = test_overlay("b").await;
        let c = test_overlay("c").await;

        let err = a
            .connect(b.listen_addr(), Some(c.local_node()))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::Auth(_)), "got {err:?}");
        assert!(!a.is_connected(&b.local_node()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_retrieve_two_nodes() {
        let a = test_overlay("a").await;
        let b = test_overlay("b").await;
        a.connect(b.listen_addr(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let key = lib_crypto::sha256(b"key");
        a.store(key, b"value".to_vec());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let values = b.retrieve(key, Duration::from_secs(5)).await.unwrap();
        assert!(values.contains(&b"value".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tunnel_dispatch() {
        let a = test_overlay("a").await;
        let b = test_overlay("b").await;
        let mut tunnel_rx = b.subscribe(MessageType::Tunnel);

        a.connect(b.listen_addr(), None).await.unwrap();
        let message = Message::new(
            MessageType::Tunnel,
            a.local_node(),
            b.local_node(),
            b"tunnel payload".to_vec(),
        );
        a.send(message).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), tunnel_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, b"tunnel payload");
        assert_eq!(received.source, a.local_node());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forwarding_two_hops() {
        // a - b - c: a sends a tunnel message to c through b
        let a = test_overlay("a").await;
        let b = test_overlay("b").await;
        let c = test_overlay("c").await;
        let mut tunnel_rx = c.subscribe(MessageType::Tunnel);

        a.connect(b.listen_addr(), None).await.unwrap();
        c.connect(b.listen_addr(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let message = Message::new(
            MessageType::Tunnel,
            a.local_node(),
            c.local_node(),
            b"across two hops".to_vec(),
        );
        a.send(message).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), tunnel_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, b"across two hops");
        assert!(received.ttl < MAX_TTL, "forwarded ttl must have decreased");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_connected_node() {
        let a = test_overlay("a").await;
        let b = test_overlay("b").await;
        a.connect(b.listen_addr(), None).await.unwrap();

        let addrs = a
            .resolve_node(b.local_node(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(addrs.iter().any(|na| na.0.port() == b.listen_addr().port()));
    }
}
