//! Fountain link handler
//!
//! One handler runs per established tunnel and multiplexes two flows in
//! each direction: the in-order record stream and opportunistic block
//! pushes. Emission is paced by a byte token bucket topped up at the
//! packet rate; the rate follows an AIMD rule driven by the seen/count
//! counters the peer piggybacks on its symbols.

use crate::error::NetworkError;
use crate::link::Link;
use crate::records::RecordParser;
use crate::tunneler::{EstablishedTunnel, Tunnel, Tunneler};
use crate::wire::{Counter64, SymbolFrame, SYMBOL_SIZE};
use lib_crypto::{sha256, DatagramCipher, Digest};
use lib_fountain::block::DEFAULT_REDUNDANCY;
use lib_fountain::{BlockDecoder, BlockEncoder, Sink, Source};
use lib_storage::BlockStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Initial and ceiling emission rates, packets per second
pub const DEFAULT_PACKET_RATE: f64 = 500.0;
const MIN_PACKET_RATE: f64 = 10.0;
const MAX_PACKET_RATE: f64 = 2000.0;

/// Send an empty combination after this much silence
pub const KEEPALIVE: Duration = Duration::from_secs(10);

/// Close the link after this much silence
pub const LINK_TIMEOUT: Duration = Duration::from_secs(60);

/// Token bucket granularity
const PACING_TICK: Duration = Duration::from_millis(20);

/// Loss measurement period for the AIMD rule
const RATE_PERIOD: Duration = Duration::from_secs(2);

/// Halve the rate above this loss, raise it below the clear threshold
const LOSS_HALVE: f64 = 0.10;
const LOSS_CLEAR: f64 = 0.01;
const RATE_STEP: f64 = 50.0;

/// Minimum spacing of idle repair combinations
const REPAIR_INTERVAL: Duration = Duration::from_millis(100);

/// Give up on the link after this many consecutive send failures
const MAX_SEND_FAILURES: u32 = 32;

/// Commands accepted by a running handler
pub enum LinkCommand {
    Record { record_type: String, payload: Vec<u8> },
    Push { digest: Digest, tokens: u32 },
    Close,
}

/// Events a handler reports to the network plane
pub enum LinkEvent {
    Record { link: Link, record_type: String, payload: Vec<u8> },
    BlockStored { link: Link, digest: Digest },
    Closed { link: Link },
}

/// Shared handle to a running link handler
#[derive(Clone)]
pub struct LinkHandle {
    pub link: Link,
    commands: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    pub fn send_record(&self, record_type: &str, payload: Vec<u8>) -> Result<(), NetworkError> {
        self.commands
            .try_send(LinkCommand::Record {
                record_type: record_type.to_string(),
                payload,
            })
            .map_err(|_| NetworkError::Network("link command queue full".into()))
    }

    pub fn push(&self, digest: Digest, tokens: u32) -> Result<(), NetworkError> {
        self.commands
            .try_send(LinkCommand::Push { digest, tokens })
            .map_err(|_| NetworkError::Network("link command queue full".into()))
    }

    pub fn close(&self) {
        let _ = self.commands.try_send(LinkCommand::Close);
    }
}

/// Start the handler task for an authenticated tunnel
pub fn spawn(
    link: Link,
    established: EstablishedTunnel,
    store: BlockStore,
    tunneler: Arc<Tunneler>,
    events: mpsc::Sender<LinkEvent>,
) -> LinkHandle {
    let (commands_tx, commands_rx) = mpsc::channel(256);
    let handle = LinkHandle { link, commands: commands_tx };

    let mut tunnel = established.tunnel;
    let incoming = tunnel
        .take_incoming()
        .expect("tunnel receive queue taken before handler start");
    let handler = Handler {
        link,
        tunnel,
        send_cipher: established.send_cipher,
        recv_cipher: established.recv_cipher,
        store,
        tunneler,
        events,
        source: Source::new(SYMBOL_SIZE),
        sink: Sink::new(SYMBOL_SIZE),
        parser: RecordParser::new(),
        encoders: VecDeque::new(),
        decoders: HashMap::new(),
        tokens: 0.0,
        packet_rate: DEFAULT_PACKET_RATE,
        peer_seen: Counter64::new(),
        peer_count: Counter64::new(),
        rate_checked: Instant::now(),
        seen_snapshot: 0,
        peer_count_snapshot: 0,
        last_recv: Instant::now(),
        last_send: Instant::now(),
        last_repair: Instant::now(),
        send_failures: 0,
        rng: StdRng::from_entropy(),
    };
    tokio::spawn(handler.run(commands_rx, incoming));
    handle
}

struct Handler {
    link: Link,
    tunnel: Tunnel,
    send_cipher: DatagramCipher,
    recv_cipher: DatagramCipher,
    store: BlockStore,
    tunneler: Arc<Tunneler>,
    events: mpsc::Sender<LinkEvent>,

    source: Source,
    sink: Sink,
    parser: RecordParser,
    encoders: VecDeque<(Digest, BlockEncoder)>,
    decoders: HashMap<Digest, BlockDecoder>,

    tokens: f64,
    packet_rate: f64,
    peer_seen: Counter64,
    peer_count: Counter64,
    rate_checked: Instant,
    seen_snapshot: u64,
    peer_count_snapshot: u64,
    last_recv: Instant,
    last_send: Instant,
    last_repair: Instant,
    send_failures: u32,
    rng: StdRng,
}

impl Handler {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut incoming: mpsc::Receiver<Vec<u8>>,
    ) {
        debug!(link = ?self.link, "link handler started");
        let mut tick = tokio::time::interval(PACING_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.on_tick().await {
                        break;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(LinkCommand::Record { record_type, payload }) => {
                            self.queue_record(&record_type, &payload);
                        }
                        Some(LinkCommand::Push { digest, tokens }) => {
                            self.start_push(digest, tokens).await;
                        }
                        Some(LinkCommand::Close) | None => {
                            self.flush_before_close();
                            break;
                        }
                    }
                }
                frame = incoming.recv() => {
                    match frame {
                        Some(frame) => self.on_frame(frame).await,
                        None => break,
                    }
                }
            }
        }

        self.tunneler.release(self.tunnel.node(), self.tunnel.id());
        let _ = self.events.send(LinkEvent::Closed { link: self.link }).await;
        debug!(link = ?self.link, "link handler stopped");
    }

    fn queue_record(&mut self, record_type: &str, payload: &[u8]) {
        match crate::records::encode_record(record_type, payload) {
            Ok(frame) => {
                self.source.write(&frame);
                self.source.flush();
            }
            Err(e) => warn!(link = ?self.link, "dropping record: {e}"),
        }
    }

    async fn start_push(&mut self, digest: Digest, tokens: u32) {
        if self.encoders.iter().any(|(d, _)| *d == digest) {
            return; // a push for this block is already queued
        }
        match self.store.get(&digest).await {
            Ok(data) => {
                let redundancy = DEFAULT_REDUNDANCY.max(tokens as f64 / 100.0);
                let encoder = BlockEncoder::new(&data, SYMBOL_SIZE, redundancy);
                trace!(link = ?self.link, digest = ?digest,
                       symbols = encoder.symbol_count(), "queueing block push");
                self.encoders.push_back((digest, encoder));
            }
            Err(e) => debug!(link = ?self.link, digest = ?digest, "push skipped: {e}"),
        }
    }

    /// Returns false when the link must close
    async fn on_tick(&mut self) -> bool {
        if self.last_recv.elapsed() >= LINK_TIMEOUT {
            debug!(link = ?self.link, "link timed out");
            return false;
        }
        if self.send_failures >= MAX_SEND_FAILURES {
            debug!(link = ?self.link, "too many send failures");
            return false;
        }

        let vector_len = (SYMBOL_SIZE + 2) as f64;
        self.tokens =
            (self.tokens + self.packet_rate * vector_len * PACING_TICK.as_secs_f64())
                .min(vector_len * 32.0);

        // Records before pushes, pushes before idle repair
        while self.tokens >= vector_len {
            if self.source.pending() > 0 {
                if let Some(combination) = self.source.emit(&mut self.rng) {
                    self.send_symbol(Digest::ZERO, &combination);
                    self.tokens -= vector_len;
                    continue;
                }
            }
            if let Some((digest, encoder)) = self.encoders.front_mut() {
                let digest = *digest;
                let combination = encoder.emit(&mut self.rng);
                let done = encoder.is_exhausted();
                self.send_symbol(digest, &combination);
                self.tokens -= vector_len;
                if done {
                    self.encoders.pop_front();
                }
                continue;
            }
            if self.source.unacked() > 0 && self.last_repair.elapsed() >= REPAIR_INTERVAL {
                if let Some(combination) = self.source.repair(&mut self.rng) {
                    self.last_repair = Instant::now();
                    self.send_symbol(Digest::ZERO, &combination);
                    self.tokens -= vector_len;
                    continue;
                }
            }
            break;
        }

        if self.last_send.elapsed() >= KEEPALIVE {
            let frame = SymbolFrame::keepalive(
                self.sink.seen() as u32,
                self.source.emitted() as u32,
            );
            self.send_frame(&frame);
        }

        self.update_rate();
        true
    }

    /// AIMD on the emission rate from the piggybacked counters: halve
    /// on loss, creep up while the channel is clean
    fn update_rate(&mut self) {
        if self.rate_checked.elapsed() < RATE_PERIOD {
            return;
        }
        self.rate_checked = Instant::now();

        let received = self.sink.seen();
        let claimed = self.peer_count.value();
        let d_received = received - self.seen_snapshot;
        let d_claimed = claimed.saturating_sub(self.peer_count_snapshot);
        self.seen_snapshot = received;
        self.peer_count_snapshot = claimed;

        if d_claimed == 0 {
            return;
        }
        let loss = 1.0 - (d_received as f64 / d_claimed as f64).min(1.0);
        if loss > LOSS_HALVE {
            self.packet_rate = (self.packet_rate / 2.0).max(MIN_PACKET_RATE);
            debug!(link = ?self.link, loss, rate = self.packet_rate, "congestion, rate halved");
        } else if loss < LOSS_CLEAR {
            self.packet_rate = (self.packet_rate + RATE_STEP).min(MAX_PACKET_RATE);
        }
    }

    fn send_symbol(&mut self, digest: Digest, combination: &lib_fountain::Combination) {
        let frame = SymbolFrame::from_combination(
            digest,
            combination,
            self.sink.seen() as u32,
            self.source.emitted() as u32,
        );
        self.send_frame(&frame);
    }

    fn send_frame(&mut self, frame: &SymbolFrame) {
        let encoded = frame.encode();
        match self.send_cipher.seal(&encoded) {
            Ok(sealed) => match self.tunnel.send(&sealed) {
                Ok(()) => {
                    self.send_failures = 0;
                    self.last_send = Instant::now();
                }
                Err(e) => {
                    self.send_failures += 1;
                    trace!(link = ?self.link, "tunnel send failed: {e}");
                }
            },
            Err(e) => warn!(link = ?self.link, "seal failed: {e}"),
        }
    }

    async fn on_frame(&mut self, sealed: Vec<u8>) {
        let plain = match self.recv_cipher.open(&sealed) {
            Ok(plain) => plain,
            Err(e) => {
                trace!(link = ?self.link, "discarding tunnel frame: {e}");
                return;
            }
        };
        let frame = match SymbolFrame::decode(&plain) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(link = ?self.link, "discarding symbol frame: {e}");
                return;
            }
        };
        self.last_recv = Instant::now();

        // The peer's decoded prefix slides our window; its emission
        // count feeds the loss estimate
        let acked = self.peer_seen.update(frame.seen);
        self.source.acknowledge(acked);
        self.peer_count.update(frame.count);

        let Some(combination) = frame.to_combination() else {
            return; // bare keepalive
        };

        if frame.digest.is_zero() {
            if let Err(e) = self.sink.push(combination) {
                trace!(link = ?self.link, "record symbol rejected: {e}");
                return;
            }
            let bytes = self.sink.read();
            if !bytes.is_empty() {
                self.parser.feed(&bytes);
                self.drain_records().await;
            }
        } else {
            self.on_block_symbol(frame.digest, combination).await;
        }
    }

    async fn drain_records(&mut self) {
        loop {
            match self.parser.next() {
                Ok(Some((record_type, payload))) => {
                    let event = LinkEvent::Record {
                        link: self.link,
                        record_type,
                        payload,
                    };
                    if self.events.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    // The record stream is unrecoverable past this point
                    warn!(link = ?self.link, "record stream corrupted: {e}");
                    self.parser = RecordParser::new();
                    return;
                }
            }
        }
    }

    async fn on_block_symbol(&mut self, digest: Digest, combination: lib_fountain::Combination) {
        if self.store.has(&digest).await {
            return; // duplicate delivery path, already have it
        }
        let decoder = self
            .decoders
            .entry(digest)
            .or_insert_with(|| BlockDecoder::new(SYMBOL_SIZE));
        if let Err(e) = decoder.push(combination) {
            trace!(link = ?self.link, digest = ?digest, "block symbol rejected: {e}");
            return;
        }

        let assembled = if decoder.is_complete() {
            decoder.assemble()
        } else {
            // The symbol count may still be unknown; a digest match on
            // the contiguous prefix also proves completion
            decoder.assemble().filter(|bytes| sha256(bytes) == digest)
        };
        let Some(bytes) = assembled else { return };

        if sha256(&bytes) != digest {
            warn!(link = ?self.link, digest = ?digest, "block failed verification, dropped");
            self.decoders.remove(&digest);
            return;
        }
        self.decoders.remove(&digest);
        match self.store.put_expected(digest, bytes).await {
            Ok(()) => {
                let event = LinkEvent::BlockStored { link: self.link, digest };
                let _ = self.events.send(event).await;
            }
            Err(e) => warn!(link = ?self.link, "failed to store pushed block: {e}"),
        }
    }

    /// Best-effort flush of queued records before teardown
    fn flush_before_close(&mut self) {
        self.source.flush();
        let mut budget = 1024;
        while budget > 0 {
            if self.source.pending() == 0 {
                break;
            }
            let Some(combination) = self.source.emit(&mut self.rng) else { break };
            self.send_symbol(Digest::ZERO, &combination);
            budget -= 1;
        }
    }
}
