use std::fmt::{Display, Formatter};
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::engine::pending_delete::PendingDeletePool;

/// A record that lives in a [RecordTable] and goes through two-phase deletion: it is first
///  removed from the table and flagged, and its memory is reclaimed only when nobody holds a
///  reference any more.
pub trait TableRecord: Send + Sync + 'static {
    fn deletion_flag(&self) -> &AtomicBool;

    /// Threads that looked the record up before it was removed can still hold it. They must
    ///  treat a flagged record as gone.
    fn is_being_deleted(&self) -> bool {
        self.deletion_flag().load(Ordering::Acquire)
    }
}

/// A concurrent map of records. Lookups hand out `Arc` clones, and the clone is what protects a
///  record against being reclaimed while it is in use.
pub struct RecordTable<K, V> {
    records: Mutex<FxHashMap<K, Arc<V>>>,
}

impl<K: Hash + Eq + Copy + Display, V: TableRecord> RecordTable<K, V> {
    pub fn new() -> RecordTable<K, V> {
        RecordTable {
            records: Default::default(),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.records.lock().unwrap()
            .get(key)
            .cloned()
    }

    /// Returns the record and a flag whether it was created by this call
    pub fn get_or_insert_with(&self, key: K, create: impl FnOnce() -> V) -> (Arc<V>, bool) {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(&key) {
            return (existing.clone(), false);
        }
        let record = Arc::new(create());
        records.insert(key, record.clone());
        (record, true)
    }

    /// Removes the record from the table, flags it as being deleted and hands it to the pending
    ///  delete pool. Returns `false` if there was no record for the key.
    pub fn mark_for_delete(&self, key: &K, pending_delete: &PendingDeletePool) -> bool {
        let removed = self.records.lock().unwrap().remove(key);
        match removed {
            Some(record) => {
                trace!("marking record {} for deletion", key);
                record.deletion_flag().store(true, Ordering::Release);
                pending_delete.insert(record);
                true
            }
            None => false,
        }
    }

    /// a point-in-time copy for iterating without holding the table lock
    pub fn snapshot(&self) -> Vec<Arc<V>> {
        self.records.lock().unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq + Copy + Display, V: TableRecord> Default for RecordTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}


/// Tracks the newest ordering timestamp accepted from a peer
pub struct PeerOrderingRecord {
    pub peer: SocketAddr,
    being_deleted: AtomicBool,
    state: Mutex<PeerOrderingState>,
}

struct PeerOrderingState {
    last_timestamp: u16,
    /// consecutive peer scans without traffic from the peer
    quiet_cycles: u32,
    seen_since_scan: bool,
}

impl PeerOrderingRecord {
    pub fn new(peer: SocketAddr) -> PeerOrderingRecord {
        PeerOrderingRecord {
            peer,
            being_deleted: AtomicBool::new(false),
            state: Mutex::new(PeerOrderingState {
                last_timestamp: 0,
                quiet_cycles: 0,
                seen_since_scan: true,
            }),
        }
    }

    /// Accepts a timestamp unless it is older than the newest one accepted so far. Equal
    ///  timestamps are accepted. A `restart` timestamp (sent when the peer's counter wrapped
    ///  around) is always accepted and becomes the new baseline.
    ///
    /// Only accepted timestamps count as traffic: a peer whose packets are all rejected looks
    ///  quiet, and the next quiet scan resets its baseline.
    pub fn accept_timestamp(&self, timestamp: u16, restart: bool) -> bool {
        let mut state = self.state.lock().unwrap();

        if restart {
            trace!("peer {} restarted its ordering timestamps at {}", self.peer, timestamp);
        }
        else if timestamp < state.last_timestamp {
            return false;
        }
        state.last_timestamp = timestamp;
        state.seen_since_scan = true;
        true
    }

    /// registers traffic from the peer that carries no timestamp
    pub fn touch(&self) {
        self.state.lock().unwrap().seen_since_scan = true;
    }

    pub fn last_timestamp(&self) -> u16 {
        self.state.lock().unwrap().last_timestamp
    }

    /// Called once per peer scan. A quiet cycle resets the ordering baseline, so the peer may
    ///  start over with any timestamp. Returns `true` if the peer was quiet for long enough that
    ///  the record should be evicted.
    pub fn on_peer_scan(&self, quiet_threshold: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        if std::mem::replace(&mut state.seen_since_scan, false) {
            state.quiet_cycles = 0;
            return false;
        }
        state.last_timestamp = 0;
        state.quiet_cycles += 1;
        state.quiet_cycles >= quiet_threshold
    }
}

impl TableRecord for PeerOrderingRecord {
    fn deletion_flag(&self) -> &AtomicBool {
        &self.being_deleted
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Identifies a reliable exchange. Both sides of a peer pair allocate message ids independently,
///  so the role is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    pub peer: SocketAddr,
    pub message_id: u32,
    pub role: Role,
}
impl Display for ExchangeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.peer, self.message_id)?;
        match self.role {
            Role::Initiator => write!(f, "(out)"),
            Role::Responder => write!(f, "(in)"),
        }
    }
}

/// The last packet a side sent in a reliable exchange. The initiator goes through `SynSent` and
///  `AckSent`, the responder through `SynAckSent` and `AckAckSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HandshakePhase {
    None = 0,
    SynSent = 1,
    SynAckSent = 2,
    AckSent = 3,
    AckAckSent = 4,
}

pub struct ExchangeState {
    pub phase: HandshakePhase,
    /// the packet to re-send on timeout, i.e. the last one sent
    pub retransmit_buf: Bytes,
    pub retries: u32,
    pub last_interaction: Instant,
    /// set when a packet was just sent, so the next scan skips retransmitting it
    pub just_sent: bool,
}

pub struct ExchangeRecord {
    pub key: ExchangeKey,
    /// the SYN carries the timestamp 0 after the sender's counter wrapped around
    pub restarts_ordering: bool,
    being_deleted: AtomicBool,
    pub state: Mutex<ExchangeState>,
}

impl ExchangeRecord {
    pub fn new(key: ExchangeKey, phase: HandshakePhase, sent: Bytes) -> ExchangeRecord {
        ExchangeRecord {
            key,
            restarts_ordering: false,
            being_deleted: AtomicBool::new(false),
            state: Mutex::new(ExchangeState {
                phase,
                retransmit_buf: sent,
                retries: 0,
                last_interaction: Instant::now(),
                just_sent: true,
            }),
        }
    }

    pub fn with_ordering_restart(mut self, restarts_ordering: bool) -> ExchangeRecord {
        self.restarts_ordering = restarts_ordering;
        self
    }

    pub fn phase(&self) -> HandshakePhase {
        self.state.lock().unwrap().phase
    }
}

impl ExchangeState {
    pub fn advance(&mut self, phase: HandshakePhase, sent: Bytes) {
        self.phase = phase;
        self.retransmit_buf = sent;
        self.retries = 0;
        self.last_interaction = Instant::now();
        self.just_sent = true;
    }
}

impl TableRecord for ExchangeRecord {
    fn deletion_flag(&self) -> &AtomicBool {
        &self.being_deleted
    }
}


/// Remembers `(peer, message id)` of exchanges whose payload was delivered, for some time after
///  the responder's exchange record is gone. The initiator may still be retransmitting its SYN
///  (or ACK) then, and the retransmission must not be delivered a second time.
pub struct DeliveredExchanges {
    retention: Duration,
    delivered: Mutex<FxHashMap<(SocketAddr, u32), Instant>>,
}

impl DeliveredExchanges {
    pub fn new(retention: Duration) -> DeliveredExchanges {
        DeliveredExchanges {
            retention,
            delivered: Default::default(),
        }
    }

    pub fn insert(&self, peer: SocketAddr, message_id: u32, now: Instant) {
        self.delivered.lock().unwrap()
            .insert((peer, message_id), now);
    }

    pub fn contains(&self, peer: SocketAddr, message_id: u32, now: Instant) -> bool {
        self.delivered.lock().unwrap()
            .get(&(peer, message_id))
            .is_some_and(|delivered_at| now.saturating_duration_since(*delivered_at) < self.retention)
    }

    /// Forgets entries older than the retention period, returning the number of entries removed
    pub fn expire(&self, now: Instant) -> usize {
        let mut delivered = self.delivered.lock().unwrap();
        let before = delivered.len();
        delivered.retain(|_, delivered_at| now.saturating_duration_since(*delivered_at) < self.retention);
        before - delivered.len()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
