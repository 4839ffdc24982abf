//! The contact-plane service
//!
//! Ties the tunneler, the per-link fountain handlers, the pub/sub
//! tables and the caller registry together over one overlay. Lock
//! order when nested: listeners, handlers, subscribers/publishers,
//! remote subscribers, callers, links-from-nodes. Callbacks always run
//! with every table lock released.

use crate::error::NetworkError;
use crate::handler::{self, LinkEvent, LinkHandle};
use crate::link::{match_prefix, normalize_prefix, Link, Locator};
use crate::pubsub::{Listener, Publisher, Subscriber};
use crate::records::{
    CallRecord, IssueRecord, PublishRecord, TargetRecord, TYPE_CALL, TYPE_ISSUE,
    TYPE_PUBLISH, TYPE_TARGET,
};
use crate::tunneler::{EstablishedTunnel, RoutedFrame, Tunneler};
use lib_crypto::{Digest, Identity, PublicIdentity};
use lib_overlay::Overlay;
use lib_runtime::Scheduler;
use lib_storage::BlockStore;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How often pending callers re-emit their call records
pub const CALL_PERIOD: Duration = Duration::from_secs(1);

/// A caller this old switches from direct pushes to DHT retrieval
pub const CALL_FALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub call_period: Duration,
    pub call_fallback_timeout: Duration,
    /// Watcher budget for one fetch intent
    pub fetch_timeout: Duration,
    /// Accept inbound contacts nobody listens for; test meshes use this
    pub accept_any_contact: bool,
    /// Period of the contact-to-node presence announcement in the DHT
    pub presence_period: Duration,
    /// Redundancy tokens attached to push requests
    pub push_tokens: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            call_period: CALL_PERIOD,
            call_fallback_timeout: CALL_FALLBACK_TIMEOUT,
            fetch_timeout: Duration::from_secs(120),
            accept_any_contact: false,
            presence_period: Duration::from_secs(300),
            push_tokens: 15,
        }
    }
}

struct CallState {
    hint: Option<Link>,
    started: Instant,
    relay_to: HashSet<Link>,
    fallback_running: bool,
}

pub struct Network {
    overlay: Arc<Overlay>,
    store: BlockStore,
    user: Arc<Identity>,
    local: Digest,
    config: NetworkConfig,
    scheduler: Scheduler,
    tunneler: Arc<Tunneler>,

    listeners: Mutex<HashMap<(Digest, Digest), Vec<Arc<dyn Listener>>>>,
    handlers: Mutex<HashMap<Link, LinkHandle>>,
    publishers: Mutex<HashMap<String, Vec<Arc<dyn Publisher>>>>,
    subscribers: Mutex<HashMap<String, Vec<Arc<dyn Subscriber>>>>,
    remote_subscribers: Mutex<HashMap<Link, BTreeSet<String>>>,
    /// Interest paths already relayed to the rest of the mesh
    propagated: Mutex<HashSet<String>>,
    /// (subscriber, digest) pairs already delivered; redundant paths
    /// must not re-invoke a subscriber for the same target
    delivered: Mutex<HashSet<(usize, Digest)>>,
    callers: Mutex<HashMap<Digest, CallState>>,
    links_from_node: Mutex<HashMap<Digest, Vec<Link>>>,

    events_tx: mpsc::Sender<LinkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    scheduled: Mutex<Vec<lib_runtime::TaskId>>,
    closed: AtomicBool,
}

impl Network {
    /// Wire the service onto a running overlay and start its loops
    pub fn start(
        overlay: Arc<Overlay>,
        store: BlockStore,
        user: Arc<Identity>,
        config: NetworkConfig,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        let local = user.digest();
        let tunneler = Arc::new(Tunneler::new(overlay.clone(), user.clone()));
        let (events_tx, events_rx) = mpsc::channel(1024);

        let network = Arc::new(Self {
            overlay,
            store,
            user,
            local,
            config,
            scheduler,
            tunneler,
            listeners: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            publishers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            remote_subscribers: Mutex::new(HashMap::new()),
            propagated: Mutex::new(HashSet::new()),
            delivered: Mutex::new(HashSet::new()),
            callers: Mutex::new(HashMap::new()),
            links_from_node: Mutex::new(HashMap::new()),
            events_tx,
            tasks: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        network.spawn_tunnel_dispatcher();
        network.spawn_event_loop(events_rx);
        network.schedule_ticks();
        network.announce_presence();

        info!(contact = ?local, "network plane started");
        network
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// The local contact identifier
    pub fn local_contact(&self) -> Digest {
        self.local
    }

    /// The local user identity backing tunnels and signatures
    pub fn user(&self) -> &Arc<Identity> {
        &self.user
    }

    // ----- connection management -----

    /// Resolve a contact through the DHT and open links to its nodes
    pub async fn connect(self: &Arc<Self>, remote: Digest) -> Result<Link, NetworkError> {
        if let Some(link) = self.find_link(&Link::wildcard(self.local, remote)) {
            return Ok(link);
        }
        let values = self
            .overlay
            .retrieve(remote, Duration::from_secs(5))
            .await
            .map_err(NetworkError::from)?;

        let mut last_error = NetworkError::NotPresent;
        for value in values {
            let Some(node) = Digest::from_slice(&value) else { continue };
            if node == self.overlay.local_node() {
                continue;
            }
            match self.connect_node(node, remote).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    debug!(node = ?node, "tunnel attempt failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Open a link to a contact on a known node
    pub async fn connect_node(
        self: &Arc<Self>,
        node: Digest,
        remote: Digest,
    ) -> Result<Link, NetworkError> {
        let link = Link::new(self.local, remote, node);
        if self.handlers.lock().contains_key(&link) {
            return Ok(link);
        }
        let established = self.tunneler.open(node, remote).await?;
        self.register_link(link, established);
        Ok(link)
    }

    pub fn has_link(&self, link: &Link) -> bool {
        self.find_link(link).is_some()
    }

    /// First open link matching a possibly wildcard pattern
    pub fn find_link(&self, pattern: &Link) -> Option<Link> {
        self.handlers
            .lock()
            .keys()
            .find(|l| pattern.matches(l))
            .copied()
    }

    pub fn links_from_node(&self, node: &Digest) -> Vec<Link> {
        self.links_from_node
            .lock()
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    fn snapshot_handlers(&self) -> Vec<(Link, LinkHandle)> {
        self.handlers
            .lock()
            .iter()
            .map(|(l, h)| (*l, h.clone()))
            .collect()
    }

    fn register_link(self: &Arc<Self>, link: Link, established: EstablishedTunnel) {
        let handle = handler::spawn(
            link,
            established,
            self.store.clone(),
            self.tunneler.clone(),
            self.events_tx.clone(),
        );
        self.handlers.lock().insert(link, handle.clone());
        self.links_from_node
            .lock()
            .entry(link.node)
            .or_default()
            .push(link);

        // Existing subscriptions extend onto the new link
        let interests: Vec<String> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|(_, subs)| {
                    subs.iter().any(|s| !s.local_only() && s.link().matches(&link))
                })
                .map(|(prefix, _)| prefix.clone())
                .collect()
        };
        for prefix in interests {
            let record = PublishRecord { path: prefix };
            let _ = handle.send_record(TYPE_PUBLISH, encode_json(&record));
        }

        for listener in self.listeners_for(&link) {
            listener.seen(&link);
            listener.connected(&link, true);
        }
        info!(link = ?link, "link open");
    }

    fn listeners_for(&self, link: &Link) -> Vec<Arc<dyn Listener>> {
        self.listeners
            .lock()
            .get(&(link.local, link.remote))
            .cloned()
            .unwrap_or_default()
    }

    fn authorize(&self, link: &Link, key: &PublicIdentity) -> bool {
        // The transport already proved the key; this is the contact
        // admission decision
        debug_assert_eq!(key.digest(), link.remote);
        let listeners = self.listeners_for(link);
        if listeners.iter().any(|l| l.auth(link, key)) {
            return true;
        }
        self.config.accept_any_contact
    }

    // ----- listeners -----

    pub fn register_listener(
        self: &Arc<Self>,
        local: Digest,
        remote: Digest,
        listener: Arc<dyn Listener>,
    ) {
        self.listeners
            .lock()
            .entry((local, remote))
            .or_default()
            .push(listener.clone());

        // Report links that are already open
        let existing: Vec<Link> = {
            let handlers = self.handlers.lock();
            handlers
                .keys()
                .filter(|l| l.local == local && l.remote == remote)
                .copied()
                .collect()
        };
        for link in existing {
            listener.seen(&link);
            listener.connected(&link, true);
        }
    }

    pub fn unregister_listener(
        &self,
        local: Digest,
        remote: Digest,
        listener: &Arc<dyn Listener>,
    ) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(&(local, remote)) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
            if list.is_empty() {
                listeners.remove(&(local, remote));
            }
        }
    }

    // ----- publish / subscribe -----

    pub fn publish(self: &Arc<Self>, prefix: &str, publisher: Arc<dyn Publisher>) {
        let prefix = normalize_prefix(prefix);
        self.publishers
            .lock()
            .entry(prefix.clone())
            .or_default()
            .push(publisher.clone());

        // Remote interest may already be waiting for this prefix
        let waiting: Vec<(Link, String)> = {
            let remotes = self.remote_subscribers.lock();
            remotes
                .iter()
                .flat_map(|(link, paths)| {
                    paths
                        .iter()
                        .filter(|p| match_prefix(&prefix, p).is_some())
                        .map(|p| (*link, p.clone()))
                })
                .collect()
        };
        for (link, path) in waiting {
            self.announce_to_link(&path, &link);
        }
    }

    pub fn unpublish(&self, prefix: &str, publisher: &Arc<dyn Publisher>) {
        let prefix = normalize_prefix(prefix);
        let mut publishers = self.publishers.lock();
        if let Some(list) = publishers.get_mut(&prefix) {
            list.retain(|p| !Arc::ptr_eq(p, publisher));
            if list.is_empty() {
                publishers.remove(&prefix);
            }
        }
    }

    pub fn subscribe(self: &Arc<Self>, prefix: &str, subscriber: Arc<dyn Subscriber>) {
        let prefix = normalize_prefix(prefix);
        self.subscribers
            .lock()
            .entry(prefix.clone())
            .or_default()
            .push(subscriber.clone());

        // Local short-circuit: matching publishers answer without any
        // network traffic
        let key = Arc::as_ptr(&subscriber) as *const () as usize;
        for (locator, targets) in self.collect_local_targets(&prefix, &Link::NULL) {
            for target in targets {
                if !self.delivered.lock().insert((key, target)) {
                    continue;
                }
                if subscriber.incoming(&locator, &target) {
                    self.register_caller_internal(target, None);
                }
            }
        }

        if subscriber.local_only() {
            return;
        }
        let record = PublishRecord { path: prefix };
        let payload = encode_json(&record);
        for (link, handle) in self.snapshot_handlers() {
            if subscriber.link().matches(&link) {
                let _ = handle.send_record(TYPE_PUBLISH, payload.clone());
            }
        }
    }

    pub fn unsubscribe(&self, prefix: &str, subscriber: &Arc<dyn Subscriber>) {
        let prefix = normalize_prefix(prefix);
        {
            let mut subscribers = self.subscribers.lock();
            if let Some(list) = subscribers.get_mut(&prefix) {
                list.retain(|s| !Arc::ptr_eq(s, subscriber));
                if list.is_empty() {
                    subscribers.remove(&prefix);
                }
            }
        }
        let key = Arc::as_ptr(subscriber) as *const () as usize;
        self.delivered.lock().retain(|(k, _)| *k != key);
    }

    /// Publisher-initiated announcement that content exists under
    /// `prefix` + `path`
    pub fn advertise(self: &Arc<Self>, prefix: &str, path: &str, publisher: &Arc<dyn Publisher>) {
        let prefix = normalize_prefix(prefix);
        let locator = Locator::new(&prefix, path, Link::NULL);
        let Some(targets) = publisher.announce(&locator) else { return };
        if targets.is_empty() {
            return;
        }
        for target in &targets {
            self.advertise_block(*target);
        }
        let full = locator.full_path();
        self.deliver_targets(&full, &targets, None);
    }

    /// Unsolicited payload pushed to subscribers of the prefix
    pub fn issue(self: &Arc<Self>, prefix: &str, path: &str, payload: serde_json::Value) {
        let prefix = normalize_prefix(prefix);
        let full = Locator::new(&prefix, path, Link::NULL).full_path();
        self.deliver_issue(&full, &payload, None);
    }

    /// Record a block holder mapping in the DHT
    pub fn advertise_block(&self, digest: Digest) {
        self.overlay
            .store(digest, self.overlay.local_node().to_vec());
    }

    /// Local publishers matching a path: (locator, targets) pairs
    fn collect_local_targets(&self, path: &str, from: &Link) -> Vec<(Locator, Vec<Digest>)> {
        let snapshot: Vec<(String, Vec<Arc<dyn Publisher>>)> = {
            let publishers = self.publishers.lock();
            publishers
                .iter()
                .map(|(p, list)| (p.clone(), list.clone()))
                .collect()
        };
        let mut results = Vec::new();
        for (prefix, list) in snapshot {
            let Some(rest) = match_prefix(&prefix, path) else { continue };
            for publisher in list {
                if !publisher.link().is_null() && !publisher.link().matches(from) {
                    continue;
                }
                let locator = Locator::new(&prefix, &rest, *from);
                if let Some(targets) = publisher.announce(&locator) {
                    if !targets.is_empty() {
                        results.push((locator, targets));
                    }
                }
            }
        }
        results
    }

    /// Answer one remote subscriber's interest in a path
    fn announce_to_link(self: &Arc<Self>, path: &str, link: &Link) {
        let found = self.collect_local_targets(path, link);
        if found.is_empty() {
            return;
        }
        let handle = self.handlers.lock().get(link).cloned();
        let Some(handle) = handle else { return };
        for (locator, targets) in found {
            for target in &targets {
                self.advertise_block(*target);
            }
            let record = TargetRecord::new(&locator.full_path(), &targets);
            let _ = handle.send_record(TYPE_TARGET, encode_json(&record));
        }
    }

    /// Deliver targets to local subscribers and forward them to remote
    /// subscribers, excluding the link they came from
    fn deliver_targets(self: &Arc<Self>, full_path: &str, targets: &[Digest], from: Option<Link>) {
        let from_link = from.unwrap_or(Link::NULL);

        // Local subscribers
        let matching: Vec<(Locator, Arc<dyn Subscriber>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter_map(|(prefix, list)| {
                    match_prefix(prefix, full_path).map(|rest| (prefix.clone(), rest, list.clone()))
                })
                .flat_map(|(prefix, rest, list)| {
                    let from_link = from_link;
                    list.into_iter().filter_map(move |s| {
                        if from.is_some() && !s.link().matches(&from_link) {
                            return None;
                        }
                        Some((Locator::new(&prefix, &rest, from_link), s))
                    })
                })
                .collect()
        };
        for (locator, subscriber) in matching {
            let key = Arc::as_ptr(&subscriber) as *const () as usize;
            for target in targets {
                if !self.delivered.lock().insert((key, *target)) {
                    continue; // a redundant path already delivered this
                }
                if subscriber.incoming(&locator, target) {
                    self.register_caller_internal(*target, from);
                }
            }
        }

        // Remote subscribers (relay)
        let forwards: Vec<Link> = {
            let remotes = self.remote_subscribers.lock();
            remotes
                .iter()
                .filter(|(link, paths)| {
                    Some(**link) != from
                        && paths.iter().any(|p| match_prefix(p, full_path).is_some())
                })
                .map(|(link, _)| *link)
                .collect()
        };
        if !forwards.is_empty() {
            let record = TargetRecord::new(full_path, targets);
            let payload = encode_json(&record);
            let handlers = self.handlers.lock();
            for link in forwards {
                if let Some(handle) = handlers.get(&link) {
                    let _ = handle.send_record(TYPE_TARGET, payload.clone());
                }
            }
        }
    }

    fn deliver_issue(self: &Arc<Self>, full_path: &str, payload: &serde_json::Value, from: Option<Link>) {
        let from_link = from.unwrap_or(Link::NULL);
        let matching: Vec<(Locator, Arc<dyn Subscriber>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter_map(|(prefix, list)| {
                    match_prefix(prefix, full_path).map(|rest| (prefix.clone(), rest, list.clone()))
                })
                .flat_map(|(prefix, rest, list)| {
                    list.into_iter()
                        .map(move |s| (Locator::new(&prefix, &rest, from_link), s))
                })
                .collect()
        };
        for (locator, subscriber) in matching {
            subscriber.issue(&locator, payload);
        }

        let forwards: Vec<Link> = {
            let remotes = self.remote_subscribers.lock();
            remotes
                .iter()
                .filter(|(link, paths)| {
                    Some(**link) != from
                        && paths.iter().any(|p| match_prefix(p, full_path).is_some())
                })
                .map(|(link, _)| *link)
                .collect()
        };
        if !forwards.is_empty() {
            let record = IssueRecord { path: full_path.to_string(), payload: payload.clone() };
            let encoded = encode_json(&record);
            let handlers = self.handlers.lock();
            for link in forwards {
                if let Some(handle) = handlers.get(&link) {
                    let _ = handle.send_record(TYPE_ISSUE, encoded.clone());
                }
            }
        }
    }

    // ----- records -----

    /// Send an application record over every link matching the pattern
    pub fn send(&self, pattern: &Link, record_type: &str, payload: &serde_json::Value) -> bool {
        let encoded = match serde_json::to_vec(payload) {
            Ok(encoded) => encoded,
            Err(_) => return false,
        };
        let mut sent = false;
        for (link, handle) in self.snapshot_handlers() {
            if pattern.matches(&link) {
                sent |= handle.send_record(record_type, encoded.clone()).is_ok();
            }
        }
        sent
    }

    /// Send an application record over every open link
    pub fn broadcast(&self, record_type: &str, payload: &serde_json::Value) -> bool {
        self.send(&Link::NULL, record_type, payload)
    }

    /// Push a block over every link matching the pattern
    pub fn push(&self, pattern: &Link, target: Digest, tokens: u32) -> bool {
        let mut pushed = false;
        for (link, handle) in self.snapshot_handlers() {
            if pattern.matches(&link) {
                pushed |= handle.push(target, tokens).is_ok();
            }
        }
        pushed
    }

    // ----- DHT passthrough -----

    pub fn store_value(&self, key: Digest, value: Vec<u8>) {
        self.overlay.store(key, value);
    }

    pub async fn retrieve_value(
        &self,
        key: Digest,
        timeout: Duration,
    ) -> Result<BTreeSet<Vec<u8>>, NetworkError> {
        self.overlay
            .retrieve(key, timeout)
            .await
            .map_err(NetworkError::from)
    }

    // ----- caller plane -----

    /// Register a fetch intent. The block lands in the store when any
    /// source provides it; await it with `fetch` or the store's wait.
    pub fn register_caller(self: &Arc<Self>, target: Digest, hint: Option<Link>) {
        self.register_caller_internal(target, hint);
    }

    pub fn unregister_caller(&self, target: &Digest) {
        self.callers.lock().remove(target);
    }

    /// Fetch intent plus wait: resolves once the block is local
    pub async fn fetch(self: &Arc<Self>, target: Digest, timeout: Duration) -> Result<Vec<u8>, NetworkError> {
        if let Ok(data) = self.store.get(&target).await {
            return Ok(data);
        }
        self.register_caller_internal(target, None);
        self.store
            .wait(&target, timeout)
            .await
            .map_err(NetworkError::from)
    }

    fn register_caller_internal(self: &Arc<Self>, target: Digest, hint: Option<Link>) {
        {
            let mut callers = self.callers.lock();
            if let Some(state) = callers.get_mut(&target) {
                if state.hint.is_none() {
                    state.hint = hint;
                }
                return; // coalesced with the pending intent
            }
            callers.insert(
                target,
                CallState {
                    hint,
                    started: Instant::now(),
                    relay_to: HashSet::new(),
                    fallback_running: false,
                },
            );
        }
        self.spawn_caller_watcher(target);
        // First call goes out immediately; the tick repeats it
        self.send_calls_for(target);
    }

    fn spawn_caller_watcher(self: &Arc<Self>, target: Digest) {
        let weak = Arc::downgrade(self);
        let store = self.store.clone();
        let timeout = self.config.fetch_timeout;
        let task = tokio::spawn(async move {
            let arrived = store.wait(&target, timeout).await.is_ok();
            let Some(network) = weak.upgrade() else { return };
            let state = network.callers.lock().remove(&target);
            let Some(state) = state else { return };
            if !arrived {
                debug!(block = ?target, "fetch intent expired");
                return;
            }
            // Relay the block to links that asked us for it
            let tokens = network.config.push_tokens;
            let handlers = network.snapshot_handlers();
            for link in state.relay_to {
                if let Some((_, handle)) = handlers.iter().find(|(l, _)| *l == link) {
                    let _ = handle.push(target, tokens);
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Emit call records for one pending target
    fn send_calls_for(self: &Arc<Self>, target: Digest) {
        let hint = match self.callers.lock().get(&target) {
            Some(state) => state.hint,
            None => return,
        };
        let record = CallRecord::new(&target, self.config.push_tokens);
        let payload = encode_json(&record);
        let handlers = self.snapshot_handlers();
        match hint {
            Some(link) => {
                if let Some((_, handle)) = handlers.iter().find(|(l, _)| *l == link) {
                    let _ = handle.send_record(TYPE_CALL, payload);
                    return;
                }
                // The hinted link is gone; fall through to broadcast
                for (_, handle) in &handlers {
                    let _ = handle.send_record(TYPE_CALL, payload.clone());
                }
            }
            None => {
                for (_, handle) in &handlers {
                    let _ = handle.send_record(TYPE_CALL, payload.clone());
                }
            }
        }
    }

    /// Periodic pass over pending callers
    fn tick_calls(self: &Arc<Self>) {
        let pending: Vec<(Digest, bool)> = {
            let mut callers = self.callers.lock();
            callers
                .iter_mut()
                .map(|(target, state)| {
                    let fallback_due = state.started.elapsed()
                        >= self.config.call_fallback_timeout
                        && !state.fallback_running;
                    if fallback_due {
                        state.fallback_running = true;
                    }
                    (*target, fallback_due)
                })
                .collect()
        };
        for (target, fallback_due) in pending {
            self.send_calls_for(target);
            if fallback_due {
                self.spawn_fallback(target);
            }
        }
    }

    /// DHT fallback: find holder nodes, then call over links to them
    fn spawn_fallback(self: &Arc<Self>, target: Digest) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let Some(network) = weak.upgrade() else { return };
            let values = match network
                .overlay
                .retrieve(target, Duration::from_secs(5))
                .await
            {
                Ok(values) => values,
                Err(e) => {
                    trace!(block = ?target, "fallback retrieval failed: {e}");
                    return;
                }
            };
            let record = CallRecord::new(&target, network.config.push_tokens);
            let payload = encode_json(&record);
            let handlers = network.snapshot_handlers();
            for value in values {
                let Some(node) = Digest::from_slice(&value) else { continue };
                for link in network.links_from_node(&node) {
                    if let Some((_, handle)) = handlers.iter().find(|(l, _)| *l == link) {
                        let _ = handle.send_record(TYPE_CALL, payload.clone());
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    // ----- background loops -----

    fn spawn_tunnel_dispatcher(self: &Arc<Self>) {
        let mut rx = self.overlay.subscribe(lib_overlay::MessageType::Tunnel);
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(network) = weak.upgrade() else { break };
                let routed = network.tunneler.route(message.source, &message.payload);
                if let Some(RoutedFrame::Inbound { tunnel, first_frame }) = routed {
                    let weak_inner = Arc::downgrade(&network);
                    tokio::spawn(async move {
                        let Some(network) = weak_inner.upgrade() else { return };
                        let tunneler = network.tunneler.clone();
                        match tunneler.accept(tunnel, first_frame).await {
                            Ok(established) => network.on_inbound_tunnel(established),
                            Err(e) => debug!("inbound tunnel failed: {e}"),
                        }
                    });
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn on_inbound_tunnel(self: &Arc<Self>, established: EstablishedTunnel) {
        let remote = established.peer.digest();
        let node = established.tunnel.node();
        let link = Link::new(self.local, remote, node);

        if !self.authorize(&link, &established.peer) {
            warn!(link = ?link, "inbound contact refused at authentication");
            self.tunneler
                .release(established.tunnel.node(), established.tunnel.id());
            return;
        }
        if self.handlers.lock().contains_key(&link) {
            // A link already exists for this exact triple; drop the new tunnel
            self.tunneler
                .release(established.tunnel.node(), established.tunnel.id());
            return;
        }
        self.register_link(link, established);
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events_rx: mpsc::Receiver<LinkEvent>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(network) = weak.upgrade() else { break };
                match event {
                    LinkEvent::Record { link, record_type, payload } => {
                        network.on_record(link, &record_type, &payload).await;
                    }
                    LinkEvent::BlockStored { link, digest } => {
                        trace!(link = ?link, digest = ?digest, "block received over link");
                    }
                    LinkEvent::Closed { link } => {
                        network.on_link_closed(link);
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    async fn on_record(self: &Arc<Self>, link: Link, record_type: &str, payload: &[u8]) {
        match record_type {
            TYPE_PUBLISH => {
                let Ok(record) = serde_json::from_slice::<PublishRecord>(payload) else {
                    trace!(link = ?link, "malformed publish record");
                    return;
                };
                self.on_interest(link, &record.path);
            }
            TYPE_TARGET => {
                let Ok(record) = serde_json::from_slice::<TargetRecord>(payload) else {
                    trace!(link = ?link, "malformed target record");
                    return;
                };
                let targets = record.digests();
                self.deliver_targets(&record.path, &targets, Some(link));
            }
            TYPE_ISSUE => {
                let Ok(record) = serde_json::from_slice::<IssueRecord>(payload) else {
                    trace!(link = ?link, "malformed issue record");
                    return;
                };
                self.deliver_issue(&record.path, &record.payload, Some(link));
            }
            TYPE_CALL => {
                let Ok(record) = serde_json::from_slice::<CallRecord>(payload) else {
                    trace!(link = ?link, "malformed call record");
                    return;
                };
                let Some(target) = record.digest() else { return };
                self.on_call(link, target, record.tokens).await;
            }
            other => {
                let listeners = self.listeners_for(&link);
                let mut consumed = false;
                for listener in listeners {
                    consumed |= listener.recv(&link, other, payload);
                }
                if !consumed {
                    trace!(link = ?link, record_type = other, "unhandled record");
                }
            }
        }
    }

    /// A peer subscribed to a path over a link
    fn on_interest(self: &Arc<Self>, link: Link, path: &str) {
        let path = normalize_prefix(path);
        let newly = self
            .remote_subscribers
            .lock()
            .entry(link)
            .or_default()
            .insert(path.clone());

        self.announce_to_link(&path, &link);
        if !newly {
            return;
        }

        // Relay the interest deeper into the mesh, once per path
        let relay = {
            let subscribed_locally = self
                .subscribers
                .lock()
                .keys()
                .any(|p| match_prefix(p, &path).is_some() || match_prefix(&path, p).is_some());
            !subscribed_locally && self.propagated.lock().insert(path.clone())
        };
        if relay {
            let record = PublishRecord { path: path.clone() };
            let payload = encode_json(&record);
            for (other, handle) in self.snapshot_handlers() {
                if other != link {
                    let _ = handle.send_record(TYPE_PUBLISH, payload.clone());
                }
            }
        }
    }

    /// A peer asked for a block over a link
    async fn on_call(self: &Arc<Self>, link: Link, target: Digest, tokens: u32) {
        if self.store.has(&target).await {
            let handle = self.handlers.lock().get(&link).cloned();
            if let Some(handle) = handle {
                let _ = handle.push(target, tokens);
            }
            return;
        }
        // Relay fetch: acquire the block ourselves, push when it lands
        {
            let mut callers = self.callers.lock();
            if let Some(state) = callers.get_mut(&target) {
                state.relay_to.insert(link);
                return;
            }
        }
        self.register_caller_internal(target, None);
        if let Some(state) = self.callers.lock().get_mut(&target) {
            state.relay_to.insert(link);
        }
    }

    fn on_link_closed(self: &Arc<Self>, link: Link) {
        self.handlers.lock().remove(&link);
        self.remote_subscribers.lock().remove(&link);
        {
            let mut from_nodes = self.links_from_node.lock();
            if let Some(list) = from_nodes.get_mut(&link.node) {
                list.retain(|l| *l != link);
                if list.is_empty() {
                    from_nodes.remove(&link.node);
                }
            }
        }
        for listener in self.listeners_for(&link) {
            listener.connected(&link, false);
        }
        info!(link = ?link, "link closed");
    }

    fn schedule_ticks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let calls = self.scheduler.repeat(self.config.call_period, move || {
            if let Some(network) = weak.upgrade() {
                network.tick_calls();
            }
        });
        let weak = Arc::downgrade(self);
        let presence = self.scheduler.repeat(self.config.presence_period, move || {
            if let Some(network) = weak.upgrade() {
                network.announce_presence();
            }
        });
        self.scheduled.lock().extend([calls, presence]);
    }

    /// Publish the contact-to-node mapping in the DHT
    fn announce_presence(&self) {
        self.overlay
            .store(self.local, self.overlay.local_node().to_vec());
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for id in self.scheduled.lock().drain(..) {
            self.scheduler.cancel(id);
        }
        for (_, handle) in self.handlers.lock().iter() {
            handle.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.tunneler.clear();
        info!(contact = ?self.local, "network plane closed");
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.close();
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}
