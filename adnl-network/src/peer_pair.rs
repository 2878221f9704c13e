//! The central per-(local, peer) state machine: sliding receive window,
//! huge-message reassembly, outbound queueing, channel lifecycle,
//! connection selection, and query correlation all live here. A
//! `PeerTable` holds one `PeerPair` per remote identity it talks to and
//! routes inbound datagrams into it by channel id or destination short
//! id.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use adnl_core::ecies;
use adnl_core::{AdnlError, Keyring};
use adnl_types::constants::{HUGE_PACKET_MAX_SIZE, MESSAGE_MTU, QUEUE_MESSAGE_TTL_SECS, SEQNO_WINDOW};
use adnl_types::{AddressList, FullNodeId, Message, PacketContents, ShortNodeId};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelEvent};
use crate::connection::Connection;
use crate::dht::{DhtHandle, DhtKey};
use crate::error::NetError;
use crate::local_id::LocalId;
use crate::network_manager::NetworkManager;
use crate::query::QueryTable;
use crate::rate_limiter::RateLimiter;
use crate::stats::PacketStats;
use crate::static_nodes::StaticNodes;
use crate::subscription::QueryResponder;
use crate::time::jittered;

/// Tag byte prepended to every `Answer` payload this implementation
/// sends, distinguishing an application reply from the internal
/// no-handler signal: a query against an unmatched subscription prefix
/// replies with a specific no-handler marker so the querying side
/// resolves its promise with `NoHandler` rather than ordinary answer
/// bytes. Not part of the TL wire schema — `Answer.answer` stays an
/// opaque byte string on the wire; this is a convention private to how
/// this crate fills that field.
const ANSWER_TAG_OK: u8 = 0;
const ANSWER_TAG_NO_HANDLER: u8 = 1;

/// No packet received for this long: arm `try_reinit_at`.
const HANDSHAKE_SILENCE: Duration = Duration::from_secs(5);
/// Delay before `try_reinit_at` actually forces a full-identity packet.
const TRY_REINIT_DELAY: Duration = Duration::from_secs(10);
/// Once it has fired once, re-arm `try_reinit_at` within this jittered
/// window rather than forcing `source` on every single outbound packet.
const TRY_REINIT_REARM_LO: Duration = Duration::from_millis(500);
const TRY_REINIT_REARM_HI: Duration = Duration::from_millis(1500);
/// No packet received for this long: arm `drop_addr_list_at`.
const INACTIVITY_LIMIT: Duration = Duration::from_secs(9 * 60);
/// Grace period after `drop_addr_list_at` arms before addresses are torn
/// down for good.
const DROP_ADDR_LIST_DELAY: Duration = Duration::from_secs(60);
/// Minimum spacing between `request_reverse_ping` calls.
const REVERSE_PING_DEBOUNCE: Duration = Duration::from_secs(15);
/// Window `respond_with_nop_at` is rearmed into after every outbound burst.
const RESPOND_NOP_LO: Duration = Duration::from_secs(1);
const RESPOND_NOP_HI: Duration = Duration::from_secs(2);
/// How long to wait with no connection before retrying a queued send.
const RETRY_SEND_DELAY: Duration = Duration::from_secs(9);

/// Callbacks the owning `PeerTable` gives every `PeerPair` so it can
/// keep the table's `channel_in_id -> PeerPair` registry consistent
/// without the `PeerPair` holding a reference back to the table itself,
/// avoiding an owner <-> owned reference cycle.
pub struct ChannelRegistry {
    pub register: Arc<dyn Fn(ShortNodeId, [u8; 32], u16) + Send + Sync>,
    pub unregister: Arc<dyn Fn([u8; 32]) + Send + Sync>,
}

/// Single in-flight huge-message reassembly slot: only one oversized
/// message can be mid-reassembly per PeerPair at a time.
struct Reassembly {
    hash: [u8; 32],
    total_size: usize,
    buffer: Vec<u8>,
    expected_offset: usize,
    started_at: Instant,
}

impl Reassembly {
    fn new(hash: [u8; 32], total_size: usize) -> Self {
        Reassembly {
            hash,
            total_size,
            buffer: Vec::with_capacity(total_size),
            expected_offset: 0,
            started_at: Instant::now(),
        }
    }
}

/// Outcome of feeding one `Part` into the reassembly slot.
enum PartOutcome {
    /// Dropped: wrong offset, overrun, or a non-zero-offset part for a
    /// hash that isn't (or no longer is) in flight. The slot, if any, is
    /// left untouched.
    Dropped,
    Continuing,
    Complete(Vec<u8>),
}

struct QueuedMessage {
    message: Message,
    enqueued_at: Instant,
}

struct PeerPairState {
    channel: Option<Channel>,
    /// Connections built from the peer's ordinary address list.
    conns: Vec<Connection>,
    /// Connections built from the peer's priority address list, tried
    /// before `conns` in both passes of `get_conn`.
    priority_conns: Vec<Connection>,
    peer_addr_list: Option<AddressList>,
    peer_priority_addr_list: Option<AddressList>,
    out_seqno: u64,
    ack_seqno: u64,
    max_in_seqno: u64,
    in_seqno_mask: u64,
    local_reinit_date: i32,
    peer_reinit_date: i32,
    out_queue: VecDeque<QueuedMessage>,
    reassembly: Option<Reassembly>,
    last_packet_received_at: Instant,
    /// Set when a connection couldn't be found; read back by `flush_queue`
    /// solely so a caller inspecting pair state can see the scheduled
    /// retry (the actual retry is driven by a spawned delayed task).
    retry_send_at: Option<Instant>,
    /// §4.4.4: 5 s of silence arms this 10 s out; once past, the next
    /// outbound packet is forced onto the non-channel (full-identity) path.
    try_reinit_at: Option<Instant>,
    /// §4.4.4: 9 min of silence arms this 1 min out; once past, addresses
    /// and connections are torn down.
    drop_addr_list_at: Option<Instant>,
    last_reverse_ping_at: Option<Instant>,
    respond_with_nop_at: Option<Instant>,
}

impl PeerPairState {
    fn new(local_reinit_date: i32) -> Self {
        PeerPairState {
            channel: None,
            conns: Vec::new(),
            priority_conns: Vec::new(),
            peer_addr_list: None,
            peer_priority_addr_list: None,
            out_seqno: 0,
            ack_seqno: 0,
            max_in_seqno: 0,
            in_seqno_mask: 0,
            local_reinit_date,
            peer_reinit_date: 0,
            out_queue: VecDeque::new(),
            reassembly: None,
            last_packet_received_at: Instant::now(),
            retry_send_at: None,
            try_reinit_at: None,
            drop_addr_list_at: None,
            last_reverse_ping_at: None,
            respond_with_nop_at: None,
        }
    }

    /// Read-only replay check over the sliding receive window. Returns
    /// `true` if `seqno` is a duplicate or far enough in the past that it
    /// must be treated as one.
    fn received_packet(&self, seqno: u64) -> bool {
        if seqno + SEQNO_WINDOW <= self.max_in_seqno {
            return true;
        }
        if seqno > self.max_in_seqno {
            return false;
        }
        let back = self.max_in_seqno - seqno;
        self.in_seqno_mask & (1u64 << back) != 0
    }

    /// Commit `seqno` into the window (`add_received_packet`). Caller
    /// must have already confirmed `received_packet(seqno)` was `false`.
    fn add_received_packet(&mut self, seqno: u64) {
        if seqno > self.max_in_seqno {
            let shift = seqno - self.max_in_seqno;
            self.in_seqno_mask = if shift >= SEQNO_WINDOW { 0 } else { self.in_seqno_mask << shift };
            self.max_in_seqno = seqno;
        }
        let back = self.max_in_seqno - seqno;
        self.in_seqno_mask |= 1u64 << back;
    }

    /// Full reset on a confirmed peer reinit: zero every seqno counter,
    /// drop the channel, and discard any in-flight huge-message
    /// reassembly. Returns the dropped channel's `in_id`, if any, so the
    /// caller can unregister it from the table's channel index.
    fn reinit(&mut self, date: i32) -> Option<[u8; 32]> {
        self.peer_reinit_date = date;
        self.max_in_seqno = 0;
        self.in_seqno_mask = 0;
        self.out_seqno = 0;
        self.ack_seqno = 0;
        self.reassembly = None;
        self.channel.take().and_then(|c| c.in_id())
    }

    fn apply_addr_list(&mut self, list: AddressList, priority: bool) {
        let conns: Vec<Connection> = list.addrs.iter().filter_map(Connection::from_address).collect();
        if priority {
            self.priority_conns = conns;
            self.peer_priority_addr_list = Some(list);
        } else {
            self.conns = conns;
            self.peer_addr_list = Some(list);
        }
    }

    /// Feed one `Part` into the single reassembly slot.
    fn receive_part(&mut self, hash: [u8; 32], total_size: usize, offset: usize, data: &[u8], ttl: Duration) -> PartOutcome {
        if self.reassembly.as_ref().is_some_and(|r| r.started_at.elapsed() > ttl) {
            self.reassembly = None;
        }
        match &mut self.reassembly {
            Some(r) if r.hash == hash => {
                if total_size != r.total_size || offset != r.expected_offset || offset + data.len() > total_size {
                    return PartOutcome::Dropped;
                }
                r.buffer.extend_from_slice(data);
                r.expected_offset += data.len();
                if r.expected_offset == r.total_size {
                    let buffer = self.reassembly.take().unwrap().buffer;
                    PartOutcome::Complete(buffer)
                } else {
                    PartOutcome::Continuing
                }
            }
            _ => {
                // A part for a different (or no) in-flight hash only
                // starts a fresh buffer at offset 0; any other offset is
                // dropped without disturbing whatever is already in
                // flight.
                if offset != 0 || data.len() > total_size {
                    return PartOutcome::Dropped;
                }
                let mut fresh = Reassembly::new(hash, total_size);
                fresh.buffer.extend_from_slice(data);
                fresh.expected_offset = data.len();
                if fresh.expected_offset == total_size {
                    PartOutcome::Complete(fresh.buffer)
                } else {
                    self.reassembly = Some(fresh);
                    PartOutcome::Continuing
                }
            }
        }
    }
}

/// One (local identity, remote identity) relationship.
pub struct PeerPair {
    local_id: ShortNodeId,
    local: Arc<LocalId>,
    peer_id: ShortNodeId,
    peer_full_id: FullNodeId,
    keyring: Keyring,
    network: NetworkManager,
    dht: Arc<dyn DhtHandle>,
    static_nodes: Arc<StaticNodes>,
    channel_registry: ChannelRegistry,
    self_weak: Weak<PeerPair>,
    state: Mutex<PeerPairState>,
    queries: QueryTable,
    stats: Mutex<PacketStats>,
    rate_limiter: Mutex<RateLimiter>,
}

impl PeerPair {
    /// Constructed via `Arc::new_cyclic` so the pair can hand query
    /// responders a `Weak<PeerPair>` of itself without owning a cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_weak: Weak<PeerPair>,
        local_id: ShortNodeId,
        local: Arc<LocalId>,
        peer_id: ShortNodeId,
        peer_full_id: FullNodeId,
        keyring: Keyring,
        network: NetworkManager,
        dht: Arc<dyn DhtHandle>,
        static_nodes: Arc<StaticNodes>,
        channel_registry: ChannelRegistry,
        now: i32,
    ) -> Self {
        PeerPair {
            local_id,
            local,
            peer_id,
            peer_full_id,
            keyring,
            network,
            dht,
            static_nodes,
            channel_registry,
            self_weak,
            state: Mutex::new(PeerPairState::new(now)),
            queries: QueryTable::new(),
            stats: Mutex::new(PacketStats::default()),
            rate_limiter: Mutex::new(RateLimiter::default()),
        }
    }

    pub fn peer_id(&self) -> ShortNodeId {
        self.peer_id
    }

    pub fn stats(&self) -> PacketStats {
        self.stats.lock().clone()
    }

    pub fn is_channel_ready(&self) -> bool {
        self.state.lock().channel.as_ref().is_some_and(Channel::is_ready)
    }

    /// Try static nodes first, then the DHT. Updates the cached
    /// connection and peer address list on success. Called
    /// whenever `flush_queue` can't find a usable connection, and can
    /// also be driven by a periodic refresh loop while no channel is
    /// ready.
    pub async fn discover(&self) -> Result<(), NetError> {
        if let Some(list) = self.static_nodes.addr_list_for(&self.peer_id, 0) {
            self.install_addr_list(list, false);
            return Ok(());
        }
        let list = self.dht.get_value(DhtKey::address(self.peer_id)).await?;
        self.install_addr_list(list, false);
        Ok(())
    }

    /// Seed this pair's connection from an address list obtained out of
    /// band (config, DHT `foundNode`, whatever the caller already had).
    pub fn adopt_addr_list(&self, list: AddressList) {
        self.install_addr_list(list, false);
    }

    fn install_addr_list(&self, list: AddressList, priority: bool) {
        self.state.lock().apply_addr_list(list, priority);
    }

    /// Two-pass connection selection: direct-only first, then any,
    /// through `priority_conns` then `conns`. Falls back to a debounced
    /// reverse-ping request, then plain `NotReady`.
    fn get_conn(&self) -> Result<Connection, NetError> {
        let mut state = self.state.lock();

        if let Some(at) = state.drop_addr_list_at {
            if Instant::now() >= at {
                state.drop_addr_list_at = None;
                state.peer_addr_list = None;
                state.peer_priority_addr_list = None;
                state.conns.clear();
                state.priority_conns.clear();
                debug!(peer_id = %self.peer_id, "peer pair: 9 min inactive, dropped address lists");
                return Err(NetError::NotReady("no active connections".into()));
            }
        }

        for direct_only in [true, false] {
            for conn in state.priority_conns.iter().chain(state.conns.iter()) {
                if conn.ready() && (!direct_only || conn.is_direct()) {
                    return Ok(conn.clone());
                }
            }
        }

        let has_reverse = state.peer_addr_list.as_ref().is_some_and(AddressList::has_reverse)
            || state.peer_priority_addr_list.as_ref().is_some_and(AddressList::has_reverse);
        if has_reverse {
            let debounced = state.last_reverse_ping_at.is_some_and(|t| t.elapsed() < REVERSE_PING_DEBOUNCE);
            if !debounced {
                state.last_reverse_ping_at = Some(Instant::now());
                drop(state);
                self.spawn_reverse_ping();
            }
            return Err(NetError::NotReady("waiting for reverse ping".into()));
        }
        Err(NetError::NotReady("no active connections".into()))
    }

    fn spawn_reverse_ping(&self) {
        let dht = Arc::clone(&self.dht);
        let peer_id = self.peer_id;
        tokio::spawn(async move {
            if let Err(e) = dht.request_reverse_ping(peer_id).await {
                debug!(%peer_id, error = %e, "peer pair: reverse ping request failed");
            }
        });
    }

    /// Spawn a background `discover()` attempt without blocking the
    /// caller (used whenever `flush_queue` can't find a connection).
    fn arm_discovery(&self) {
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            if let Some(pair) = weak.upgrade() {
                if let Err(e) = pair.discover().await {
                    debug!(peer_id = %pair.peer_id, error = %e, "peer pair: dht rediscovery failed");
                }
            }
        });
    }

    /// Retry a deferred flush after `RETRY_SEND_DELAY`, having already
    /// set `retry_send_at` and armed DHT rediscovery.
    fn schedule_retry(&self) {
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_SEND_DELAY).await;
            if let Some(pair) = weak.upgrade() {
                if let Err(e) = pair.flush_queue().await {
                    debug!(peer_id = %pair.peer_id, error = %e, "peer pair: retry flush failed");
                }
            }
        });
    }

    /// Run one query/answer round-trip over this peer pair, resolving
    /// with a timeout error if no matching `Answer` arrives within
    /// `timeout`.
    pub async fn query(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, NetError> {
        let (query_id, fut) = self.queries.start(timeout);
        let message = Message::Query { query_id, query: payload };
        if let Err(e) = self.send_messages(vec![message]).await {
            self.queries.cancel(&query_id);
            return Err(e);
        }
        fut.await
    }

    pub async fn answer(&self, query_id: [u8; 32], payload: Vec<u8>) -> Result<(), NetError> {
        self.send_tagged_answer(query_id, ANSWER_TAG_OK, payload).await
    }

    async fn send_tagged_answer(&self, query_id: [u8; 32], tag: u8, payload: Vec<u8>) -> Result<(), NetError> {
        let mut answer = Vec::with_capacity(payload.len() + 1);
        answer.push(tag);
        answer.extend_from_slice(&payload);
        self.send_messages(vec![Message::Answer { query_id, answer }]).await
    }

    /// Build a `QueryResponder` that, once called with an application's
    /// reply bytes, sends a tagged `Answer` back over this pair. Holds
    /// only a weak reference so a subscriber sitting on the responder
    /// past the pair's lifetime can't keep it alive.
    fn responder_for(&self, query_id: [u8; 32]) -> QueryResponder {
        let weak = self.self_weak.clone();
        Arc::new(move |answer: Vec<u8>| {
            let weak = weak.clone();
            tokio::spawn(async move {
                if let Some(pair) = weak.upgrade() {
                    if let Err(e) = pair.answer(query_id, answer).await {
                        warn!(error = %e, "peer pair: failed to send query answer");
                    }
                }
            });
        })
    }

    /// Enqueue and attempt an immediate flush; queued entries older than
    /// `QUEUE_MESSAGE_TTL_SECS` are dropped on the next flush. Any message
    /// too big to ever fit a single datagram is fragmented into `Part`s
    /// up front.
    pub async fn send_messages(&self, messages: Vec<Message>) -> Result<(), NetError> {
        {
            let mut state = self.state.lock();
            for message in messages {
                for part in fragment_if_huge(message) {
                    state.out_queue.push_back(QueuedMessage {
                        message: part,
                        enqueued_at: Instant::now(),
                    });
                }
            }
        }
        self.flush_queue().await
    }

    /// Drains the outbound queue, packing messages up to `MESSAGE_MTU`
    /// per datagram and dropping anything past its TTL. When no
    /// connection is available, arms a 9 s retry and a background DHT
    /// rediscovery attempt instead of failing the caller.
    pub async fn flush_queue(&self) -> Result<(), NetError> {
        let ttl = Duration::from_secs_f64(QUEUE_MESSAGE_TTL_SECS);

        // Purge anything past its TTL unconditionally, whether or not a
        // connection is available, so queued traffic still expires while
        // a peer stays unreachable.
        {
            let mut state = self.state.lock();
            while let Some(front) = state.out_queue.front() {
                if front.enqueued_at.elapsed() > ttl {
                    let expired = state.out_queue.pop_front().unwrap();
                    self.stats.lock().add_expired(expired.message.serialized_size() as u64);
                } else {
                    break;
                }
            }
        }

        let conn = match self.get_conn() {
            Ok(conn) => conn,
            Err(e) => {
                let retry_at = Instant::now() + RETRY_SEND_DELAY;
                self.state.lock().retry_send_at = Some(retry_at);
                debug!(peer_id = %self.peer_id, error = %e, "peer pair: no connection, deferring send");
                self.arm_discovery();
                self.schedule_retry();
                return Ok(());
            }
        };
        if !conn.ready() {
            return Ok(());
        }

        let batch = {
            let mut state = self.state.lock();
            let mut batch = Vec::new();
            let mut budget = MESSAGE_MTU;
            while let Some(front) = state.out_queue.front() {
                if front.enqueued_at.elapsed() > ttl {
                    let expired = state.out_queue.pop_front().unwrap();
                    self.stats.lock().add_expired(expired.message.serialized_size() as u64);
                    continue;
                }
                let size = front.message.serialized_size();
                if !batch.is_empty() && size > budget {
                    break;
                }
                budget = budget.saturating_sub(size);
                batch.push(state.out_queue.pop_front().unwrap().message);
            }
            batch
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.send_datagram(batch, conn).await
    }

    async fn send_datagram(&self, messages: Vec<Message>, conn: Connection) -> Result<(), NetError> {
        let now = crate::time::unix_time();
        let mut state = self.state.lock();

        // Channel management timing: arm the handshake force-reinit and
        // inactivity-drop timers the first time their silence window has
        // elapsed.
        if state.try_reinit_at.is_none() && state.last_packet_received_at.elapsed() > HANDSHAKE_SILENCE {
            state.try_reinit_at = Some(Instant::now() + TRY_REINIT_DELAY);
        }
        if state.drop_addr_list_at.is_none() && state.last_packet_received_at.elapsed() > INACTIVITY_LIMIT {
            state.drop_addr_list_at = Some(Instant::now() + DROP_ADDR_LIST_DELAY);
        }

        // Kick off a channel handshake the first time we have something
        // to say and no channel exists yet.
        let mut extra: Vec<Message> = Vec::new();
        if state.channel.is_none() {
            let channel = Channel::new(self.local_id, self.peer_id, now);
            extra.push(channel.create_channel_message());
            state.channel = Some(channel);
        }

        let seqno = {
            state.out_seqno += 1;
            state.out_seqno
        };

        let try_reinit = state.try_reinit_at.is_some_and(|t| Instant::now() >= t);
        if try_reinit {
            state.try_reinit_at = Some(Instant::now() + jittered(TRY_REINIT_REARM_LO, TRY_REINIT_REARM_HI));
        }
        let use_channel = state.channel.as_ref().is_some_and(Channel::is_ready) && !try_reinit;

        if !use_channel && !self.rate_limiter.lock().try_acquire() {
            // No channel yet and the handshake-rate bucket is dry: hold
            // back non-essential traffic rather than flood the peer.
            for m in messages.into_iter().rev() {
                state.out_queue.push_front(QueuedMessage {
                    message: m,
                    enqueued_at: Instant::now(),
                });
            }
            drop(state);
            self.schedule_retry();
            return Ok(());
        }

        // Re-arm the "answer a Custom with a Nop" window for every
        // outbound burst, checked later by `respond_with_nop_if_due`.
        state.respond_with_nop_at = Some(Instant::now() + jittered(RESPOND_NOP_LO, RESPOND_NOP_HI));

        let mut all_messages = extra;
        all_messages.extend(messages);

        let mut random_bytes = vec![0u8; 7];
        rand::rngs::OsRng.fill_bytes(&mut random_bytes);

        let mut packet = PacketContents {
            from_full: if use_channel { None } else { Some(self.local.full_id().to_bytes()) },
            from_short: if use_channel { Some(*self.local_id.as_bytes()) } else { None },
            messages: all_messages,
            addr_list: None,
            priority_addr_list: None,
            seqno: Some(seqno),
            confirm_seqno: Some(state.max_in_seqno),
            recv_addr_list_version: None,
            recv_priority_addr_list_version: None,
            reinit_date: Some(state.local_reinit_date),
            dst_reinit_date: Some(state.peer_reinit_date),
            signature: None,
            random_bytes,
        };

        let framed = if use_channel {
            let channel = state.channel.as_ref().unwrap();
            let plaintext = packet.to_bytes();
            channel.encrypt(&plaintext)?
        } else {
            let signing_bytes = packet.signing_bytes();
            let signature = self.keyring.sign(&self.local_id, &signing_bytes)?;
            packet.signature = Some(signature.to_bytes());
            let plaintext = packet.to_bytes();
            ecies::seal(&self.peer_full_id.0, &plaintext)?
        };
        drop(state);

        self.network.send_udp(self.local.category(), conn.remote_addr(), 0, &framed).await?;
        self.stats.lock().add_out(framed.len() as u64, use_channel);
        Ok(())
    }

    /// Entry point for every datagram the router hands this pair,
    /// already stripped of its channel-id prefix if `channel_in_id` is
    /// `Some`. Runs the ordered acceptance checks below, dropping on the
    /// first failure.
    pub async fn receive_packet_checked(
        &self,
        channel_in_id: Option<[u8; 32]>,
        body: &[u8],
        src: SocketAddr,
    ) -> Result<(), NetError> {
        let plaintext = match channel_in_id {
            Some(_) => {
                let state = self.state.lock();
                match &state.channel {
                    Some(channel) if channel.in_id() == channel_in_id => channel.decrypt(body)?,
                    _ => return Err(NetError::Adnl(AdnlError::ProtocolViolation("channel id mismatch".into()))),
                }
            }
            None => self.keyring.decrypt(&self.local_id, body)?,
        };

        let packet = PacketContents::from_bytes(&plaintext).map_err(AdnlError::from)?;

        if channel_in_id.is_none() {
            self.verify_direct_signature(&packet)?;
        }

        let Some(seqno) = packet.seqno else {
            return Err(NetError::Adnl(AdnlError::ProtocolViolation("packet missing seqno".into())));
        };
        let confirm_seqno = packet.confirm_seqno.unwrap_or(0);
        let now = crate::time::unix_time();

        // Checks 1-5 below, plus the timer resets every accepted
        // datagram performs regardless of outcome.
        let mut unregister_channel: Option<[u8; 32]> = None;
        let mut send_nop_and_drop = false;
        {
            let mut state = self.state.lock();
            state.last_packet_received_at = Instant::now();
            state.try_reinit_at = None;
            state.drop_addr_list_at = None;
            state.last_reverse_ping_at = Some(Instant::now());

            // 1. Peer believes our reinit_date is newer than it really is.
            if let Some(dst_reinit) = packet.dst_reinit_date {
                if dst_reinit > state.local_reinit_date {
                    return Err(NetError::Adnl(AdnlError::ProtocolViolation(
                        "dst_reinit_date newer than our reinit date".into(),
                    )));
                }
            }

            // 2-4. Peer's own reinit_date: too-far-future, fresh reinit, or stale.
            if let Some(reinit) = packet.reinit_date {
                if reinit > now + 60 {
                    return Err(NetError::Adnl(AdnlError::ProtocolViolation(
                        "peer reinit_date too far in the future".into(),
                    )));
                }
                if reinit > state.peer_reinit_date {
                    debug!(peer_id = %self.peer_id, "peer reinit detected, resetting receive window");
                    unregister_channel = state.reinit(reinit);
                } else if reinit > 0 && reinit < state.peer_reinit_date {
                    return Err(NetError::Adnl(AdnlError::Stale));
                }
            }

            // 5. Peer thinks we're an older instance than we are: tell it
            // our real reinit_date via a single Nop and drop the rest.
            if let Some(dst_reinit) = packet.dst_reinit_date {
                if dst_reinit > 0 && dst_reinit < state.local_reinit_date {
                    if let Some(list) = packet.addr_list.clone() {
                        state.apply_addr_list(list, false);
                    }
                    if let Some(list) = packet.priority_addr_list.clone() {
                        state.apply_addr_list(list, true);
                    }
                    send_nop_and_drop = true;
                }
            }
        }

        if let Some(old) = unregister_channel {
            (self.channel_registry.unregister)(old);
        }
        if send_nop_and_drop {
            self.send_messages(vec![Message::Nop]).await?;
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            // 6. Duplicate / far-old seqno.
            if seqno > 0 && state.received_packet(seqno) {
                return Err(NetError::Adnl(AdnlError::Duplicate));
            }
            // 7. Peer claims to ack something we never sent.
            if confirm_seqno > 0 && confirm_seqno > state.out_seqno {
                return Err(NetError::Adnl(AdnlError::ProtocolViolation(
                    "confirm_seqno exceeds our out_seqno".into(),
                )));
            }

            if seqno > 0 {
                state.add_received_packet(seqno);
            }
            if confirm_seqno > state.ack_seqno {
                state.ack_seqno = confirm_seqno;
            }
            if let Some(list) = packet.addr_list.clone() {
                state.apply_addr_list(list, false);
            }
            if let Some(list) = packet.priority_addr_list.clone() {
                state.apply_addr_list(list, true);
            }
        }

        // A UDP source address is not itself trusted for routing (it's
        // spoofable); a connection is only adopted from an address list
        // entry we've authenticated via `addr_list`/`discover`, never
        // from the packet's wire source. `src` is accepted here purely
        // for stats/logging.
        let _ = src;

        self.stats.lock().add_in(plaintext.len() as u64, channel_in_id.is_some());

        for message in packet.messages {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    fn verify_direct_signature(&self, packet: &PacketContents) -> Result<(), NetError> {
        let (Some(from_full), Some(signature)) = (packet.from_full, packet.signature) else {
            return Err(NetError::Adnl(AdnlError::ProtocolViolation(
                "direct packet missing from/signature".into(),
            )));
        };
        let signing_bytes = packet.signing_bytes();
        if !Keyring::verify_bytes(&from_full, &signing_bytes, &signature) {
            return Err(NetError::Adnl(AdnlError::ProtocolViolation("bad direct packet signature".into())));
        }
        let full = FullNodeId::from_bytes(&from_full).map_err(|_| AdnlError::ProtocolViolation("bad from_full".into()))?;
        if full.short_id() != self.peer_id {
            return Err(NetError::Adnl(AdnlError::ProtocolViolation("from_full doesn't match expected peer".into())));
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Result<(), NetError> {
        match message {
            Message::CreateChannel { key, date } => self.on_create_channel(key, date).await,
            Message::ConfirmChannel { key, peer_key, date } => self.on_confirm_channel(key, peer_key, date).await,
            Message::Custom { data } => {
                if !self.local.dispatch(self.peer_id, data, None) {
                    trace!(peer_id = %self.peer_id, "custom message with no subscriber, dropping");
                }
                self.respond_with_nop_if_due().await
            }
            Message::Nop => Ok(()),
            Message::Reinit { date } => {
                let unregister = {
                    let mut state = self.state.lock();
                    if date > state.peer_reinit_date {
                        state.reinit(date)
                    } else {
                        None
                    }
                };
                if let Some(old) = unregister {
                    (self.channel_registry.unregister)(old);
                }
                Ok(())
            }
            Message::Query { query_id, query } => {
                let matched = self.local.dispatch(self.peer_id, query, Some(self.responder_for(query_id)));
                if !matched {
                    debug!(peer_id = %self.peer_id, "query with no subscriber, replying no-handler");
                    self.send_tagged_answer(query_id, ANSWER_TAG_NO_HANDLER, Vec::new()).await?;
                }
                Ok(())
            }
            Message::Answer { query_id, answer } => {
                let result = match answer.split_first() {
                    Some((&ANSWER_TAG_OK, rest)) => Ok(rest.to_vec()),
                    Some((&ANSWER_TAG_NO_HANDLER, _)) => Err(AdnlError::NoHandler),
                    _ => Err(AdnlError::ProtocolViolation("malformed or unrecognised answer tag".into())),
                };
                self.queries.resolve(query_id, result);
                Ok(())
            }
            Message::Part { hash, total_size, offset, data } => self.on_part(hash, total_size, offset, data).await,
        }
    }

    /// Reply to a `Custom` with a single `Nop` if the debounce window
    /// armed by the last outbound burst has elapsed.
    async fn respond_with_nop_if_due(&self) -> Result<(), NetError> {
        let due = {
            let state = self.state.lock();
            match state.respond_with_nop_at {
                None => true,
                Some(t) => Instant::now() >= t,
            }
        };
        if due {
            self.send_messages(vec![Message::Nop]).await?;
        }
        Ok(())
    }

    async fn on_create_channel(&self, key: [u8; 32], date: i32) -> Result<(), NetError> {
        let now = crate::time::unix_time();
        let outcome = {
            let mut state = self.state.lock();
            if state.channel.is_none() {
                state.channel = Some(Channel::new(self.local_id, self.peer_id, now));
            }
            let channel = state.channel.as_mut().unwrap();
            let event = channel.on_create_channel(key, date);
            (event, channel.in_id(), channel.confirm_channel_message())
        };
        self.apply_channel_event(outcome.0, outcome.1);
        if let Some(confirm) = outcome.2 {
            self.send_messages(vec![confirm]).await?;
        }
        Ok(())
    }

    async fn on_confirm_channel(&self, key: [u8; 32], peer_key: [u8; 32], date: i32) -> Result<(), NetError> {
        let (event, in_id) = {
            let mut state = self.state.lock();
            let Some(channel) = state.channel.as_mut() else {
                return Ok(());
            };
            let event = channel.on_confirm_channel(key, peer_key, date);
            (event, channel.in_id())
        };
        self.apply_channel_event(event, in_id);
        Ok(())
    }

    /// Register the (possibly rotated) channel key, and — gated on the
    /// `unregister_stale_channel_on_confirm` feature — unregister the key
    /// it superseded. Left on by default: leaving a stale `channel_in_id`
    /// registered would accumulate unreachable entries in the table's
    /// channel index over a long-running peer's lifetime.
    fn apply_channel_event(&self, event: ChannelEvent, in_id: Option<[u8; 32]>) {
        match event {
            ChannelEvent::Updated { old_in_id, .. } => {
                #[cfg(feature = "unregister_stale_channel_on_confirm")]
                if let Some(old) = old_in_id {
                    (self.channel_registry.unregister)(old);
                }
                #[cfg(not(feature = "unregister_stale_channel_on_confirm"))]
                let _ = old_in_id;
                if let Some(new_id) = in_id {
                    (self.channel_registry.register)(self.local_id, new_id, self.local.category());
                }
            }
            ChannelEvent::NoOp | ChannelEvent::Rejected => {}
        }
    }

    async fn on_part(&self, hash: [u8; 32], total_size: i32, offset: i32, data: Vec<u8>) -> Result<(), NetError> {
        let total_size = total_size as usize;
        if total_size > HUGE_PACKET_MAX_SIZE {
            return Err(NetError::Adnl(AdnlError::TooBig(total_size)));
        }
        let offset = offset as usize;

        let ttl = Duration::from_secs_f64(QUEUE_MESSAGE_TTL_SECS);
        let outcome = {
            let mut state = self.state.lock();
            state.receive_part(hash, total_size, offset, &data, ttl)
        };
        let buffer = match outcome {
            PartOutcome::Complete(buffer) => buffer,
            PartOutcome::Continuing | PartOutcome::Dropped => return Ok(()),
        };

        let mut hasher = Sha256::new();
        hasher.update(&buffer);
        let digest: [u8; 32] = hasher.finalize().into();
        if digest != hash {
            warn!(peer_id = %self.peer_id, "reassembled huge message hash mismatch, dropping");
            return Err(NetError::Adnl(AdnlError::ProtocolViolation("huge message hash mismatch".into())));
        }
        if let Ok(inner) = Message::from_bytes(&buffer) {
            Box::pin(self.handle_message(inner)).await?;
        }
        Ok(())
    }
}

/// Part header overhead (ctor + hash + total_size + offset + length
/// prefix) the chunk size must leave room for inside `MESSAGE_MTU`.
const PART_HEADER_OVERHEAD: usize = 4 + 32 + 4 + 4 + 4;

fn fragment_if_huge(message: Message) -> Vec<Message> {
    if message.serialized_size() <= MESSAGE_MTU {
        return vec![message];
    }
    let bytes = message.to_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash: [u8; 32] = hasher.finalize().into();

    let chunk_size = MESSAGE_MTU - PART_HEADER_OVERHEAD;
    bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| Message::Part {
            hash,
            total_size: bytes.len() as i32,
            offset: (i * chunk_size) as i32,
            data: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_seqno_rejects_replays() {
        let mut state = PeerPairState::new(1);
        assert!(!state.received_packet(1));
        state.add_received_packet(1);
        assert!(state.received_packet(1));
        assert!(!state.received_packet(2));
        state.add_received_packet(2);
        assert!(!state.received_packet(5));
        state.add_received_packet(5);
        // 3 and 4 are still inside the window and haven't been seen.
        assert!(!state.received_packet(4));
        state.add_received_packet(4);
        assert!(!state.received_packet(3));
        state.add_received_packet(3);
        assert!(state.received_packet(3));
    }

    #[test]
    fn accept_seqno_slides_window_past_old_gaps() {
        let mut state = PeerPairState::new(1);
        state.add_received_packet(1);
        state.add_received_packet(SEQNO_WINDOW + 10);
        // Far enough behind the new max that it falls outside the window.
        assert!(state.received_packet(1));
    }

    #[test]
    fn reinit_zeroes_every_seqno_counter_and_drops_channel() {
        let mut state = PeerPairState::new(1);
        state.add_received_packet(5);
        state.out_seqno = 7;
        state.ack_seqno = 3;
        state.channel = Some(Channel::new(ShortNodeId([1; 32]), ShortNodeId([2; 32]), 1));
        state.reassembly = Some(Reassembly::new([9u8; 32], 100));

        state.reinit(42);

        assert_eq!(state.peer_reinit_date, 42);
        assert_eq!(state.max_in_seqno, 0);
        assert_eq!(state.in_seqno_mask, 0);
        assert_eq!(state.out_seqno, 0);
        assert_eq!(state.ack_seqno, 0);
        assert!(state.channel.is_none());
        assert!(state.reassembly.is_none());
    }

    #[test]
    fn small_message_is_not_fragmented() {
        let msg = Message::Custom { data: vec![1, 2, 3] };
        let parts = fragment_if_huge(msg.clone());
        assert_eq!(parts, vec![msg]);
    }

    #[test]
    fn huge_message_fragments_and_reassembles_exactly() {
        let payload = vec![7u8; MESSAGE_MTU * 3 + 17];
        let original = Message::Custom { data: payload };
        let bytes = original.to_bytes();
        let parts = fragment_if_huge(original.clone());
        assert!(parts.len() > 1);

        let ttl = Duration::from_secs(30);
        let mut state = PeerPairState::new(1);
        let mut last = None;
        for part in &parts {
            let Message::Part { hash, total_size, offset, data } = part else {
                panic!("fragment_if_huge must only emit Part messages");
            };
            last = Some(state.receive_part(*hash, *total_size as usize, *offset as usize, data, ttl));
        }
        let Some(PartOutcome::Complete(buffer)) = last else {
            panic!("final part must complete the reassembly");
        };
        assert_eq!(buffer, bytes);

        let rebuilt = Message::from_bytes(&buffer).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn reassembly_drops_out_of_order_part_without_resetting() {
        let mut state = PeerPairState::new(1);
        let ttl = Duration::from_secs(30);
        let hash = [3u8; 32];
        let outcome = state.receive_part(hash, 10, 0, &[1, 2, 3], ttl);
        assert!(matches!(outcome, PartOutcome::Continuing));

        // Wrong expected_offset: dropped, buffer untouched.
        let outcome = state.receive_part(hash, 10, 5, &[9, 9], ttl);
        assert!(matches!(outcome, PartOutcome::Dropped));
        assert_eq!(state.reassembly.as_ref().unwrap().expected_offset, 3);

        let outcome = state.receive_part(hash, 10, 3, &[4, 5, 6, 7, 8, 9, 10], ttl);
        assert!(matches!(outcome, PartOutcome::Complete(_)));
    }

    #[test]
    fn reassembly_replaces_slot_on_hash_mismatch_at_offset_zero() {
        let mut state = PeerPairState::new(1);
        let ttl = Duration::from_secs(30);
        let first_hash = [1u8; 32];
        let second_hash = [2u8; 32];

        let outcome = state.receive_part(first_hash, 10, 0, &[1, 2, 3], ttl);
        assert!(matches!(outcome, PartOutcome::Continuing));

        // Different hash at a nonzero offset: dropped, first buffer kept.
        let outcome = state.receive_part(second_hash, 8, 3, &[0, 0], ttl);
        assert!(matches!(outcome, PartOutcome::Dropped));
        assert_eq!(state.reassembly.as_ref().unwrap().hash, first_hash);

        // Different hash at offset 0: replaces the slot entirely.
        let outcome = state.receive_part(second_hash, 8, 0, &[1, 2, 3, 4], ttl);
        assert!(matches!(outcome, PartOutcome::Continuing));
        assert_eq!(state.reassembly.as_ref().unwrap().hash, second_hash);
    }
}
