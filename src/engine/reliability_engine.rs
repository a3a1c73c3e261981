use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use bytes::Bytes;
use tracing::{debug, error, trace, warn};
use crate::codec::{decode_packet, encode_control_packet, encode_payload_packet, DecodedPacket, PacketKind, Payload, PayloadPacketOptions};
use crate::config::ReliabilityConfig;
use crate::engine::ordering::OutboundTimestamps;
use crate::engine::pending_delete::PendingDeletePool;
use crate::engine::records::{DeliveredExchanges, ExchangeKey, ExchangeRecord, ExchangeState, HandshakePhase, PeerOrderingRecord, RecordTable, Role, TableRecord};
use crate::send_socket::SendSocket;
use crate::task::ticker::{ScheduledTicker, TaskHandle, TaskOutcome};
use crate::task::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// deliver via the SYN / SYN-ACK / ACK / ACK-ACK handshake with retransmission
    pub reliable: bool,
    /// stamp the packet with an ordering timestamp, so the receiver drops it if a newer packet
    ///  from this sender arrived first
    pub ordering_critical: bool,
    /// 13 bit field counts instead of 5 bit
    pub wide_field_counts: bool,
}

/// Periodic engine work, run on the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    ScanExchanges,
    ScanPeers,
    ReclaimPending,
}

/// What to do after a record's state was updated under its lock
enum ExchangeAction {
    Send(Bytes),
    Close,
    SendAndClose(Bytes),
    Ignore,
}

/// The reliability engine: validates incoming packets, drives the handshake state machine for
///  reliable exchanges, tracks per-peer ordering, and retransmits or evicts records on timeout.
///
/// The engine does no socket reading itself. Incoming datagrams are passed to [Self::on_datagram],
///  outgoing packets go through a [SendSocket]. No lock is held while sending.
pub struct ReliabilityEngine {
    config: Arc<ReliabilityConfig>,
    send_socket: Arc<dyn SendSocket>,
    peers: RecordTable<SocketAddr, PeerOrderingRecord>,
    exchanges: RecordTable<ExchangeKey, ExchangeRecord>,
    delivered: DeliveredExchanges,
    pending_delete: PendingDeletePool,
    outbound_timestamps: OutboundTimestamps,
    next_message_id: AtomicU32,
}

impl ReliabilityEngine {
    pub fn new(config: Arc<ReliabilityConfig>, send_socket: Arc<dyn SendSocket>) -> ReliabilityEngine {
        let pending_delete = PendingDeletePool::new(config.reclaim_grace_period);
        let delivered = DeliveredExchanges::new(config.delivered_exchange_retention());
        ReliabilityEngine {
            config,
            send_socket,
            peers: RecordTable::new(),
            exchanges: RecordTable::new(),
            delivered,
            pending_delete,
            outbound_timestamps: Default::default(),
            next_message_id: AtomicU32::new(rand::random()),
        }
    }

    /// Registers the periodic maintenance tasks with the ticker. The callbacks only submit the
    ///  work to the worker pool.
    pub fn start_maintenance(self: &Arc<Self>, ticker: &ScheduledTicker, worker_pool: &Arc<WorkerPool>) -> anyhow::Result<Vec<TaskHandle>> {
        let schedule = [
            (MaintenanceTask::ScanExchanges, self.config.exchange_scan_interval),
            (MaintenanceTask::ScanPeers, self.config.peer_scan_interval),
            (MaintenanceTask::ReclaimPending, self.config.reclaim_interval),
        ];

        let mut handles = Vec::with_capacity(schedule.len());
        for (task, interval) in schedule {
            let engine = self.clone();
            let worker_pool = worker_pool.clone();
            let handle = ticker.schedule(interval, true, move || {
                let engine = engine.clone();
                if let Err(e) = worker_pool.submit(move || engine.run_maintenance(task)) {
                    debug!("could not submit {:?}: {}", task, e);
                }
                TaskOutcome::Continue
            })?;
            handles.push(handle);
        }
        Ok(handles)
    }

    pub fn run_maintenance(&self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::ScanExchanges => self.scan_exchanges(),
            MaintenanceTask::ScanPeers => self.scan_peers(),
            MaintenanceTask::ReclaimPending => { self.reclaim_pending(Instant::now()); }
        }
    }

    /// Encodes and sends a payload, returning the encoded packet. A reliable send registers the
    ///  exchange for retransmission before the packet goes out.
    pub fn send(&self, to: SocketAddr, payload: &Payload, options: SendOptions) -> anyhow::Result<Bytes> {
        let timestamp = options.ordering_critical
            .then(|| self.outbound_timestamps.next(to));

        let restarts_ordering = timestamp.is_some_and(|ts| ts.restarts_ordering);
        let reliable = options.reliable || restarts_ordering;
        if restarts_ordering && !options.reliable {
            debug!("ordering timestamps for {:?} wrapped around - sending reliably", to);
        }

        let message_id = reliable
            .then(|| self.next_message_id.fetch_add(1, Ordering::AcqRel));

        let packet_options = PayloadPacketOptions {
            message_id,
            timestamp: timestamp.map(|ts| ts.value),
            wide_field_counts: options.wide_field_counts,
        };
        let packet = encode_payload_packet(packet_options, payload, self.config.max_datagram_size)?;

        let key = message_id.map(|message_id| ExchangeKey { peer: to, message_id, role: Role::Initiator });
        if let Some(key) = key {
            let (_, created) = self.exchanges.get_or_insert_with(key, || {
                ExchangeRecord::new(key, HandshakePhase::SynSent, packet.clone())
                    .with_ordering_restart(restarts_ordering)
            });
            if !created {
                // only possible after the id counter wrapped while an old exchange is still open
                anyhow::bail!("exchange {} is still in progress", key);
            }
            trace!("registered exchange {}", key);
        }

        if let Err(e) = self.send_socket.send_packet(to, &packet) {
            warn!("error sending packet to {:?}: {}", to, e);
            if let Some(key) = key {
                self.close_exchange(&key);
            }
            return Err(e);
        }
        Ok(packet)
    }

    /// Processes a received datagram, returning the payload if it should be passed to the
    ///  application.
    pub fn on_datagram(&self, from: SocketAddr, buf: &[u8]) -> Option<Payload> {
        let packet = match decode_packet(buf) {
            Ok(packet) => packet,
            Err(rejected) => {
                debug!("dropping packet from {:?}: {:?}", from, rejected.reason);
                if let Some(message_id) = rejected.failed_syn_id() {
                    self.send_control(from, PacketKind::SynFailure, message_id);
                }
                return None;
            }
        };
        trace!("received {:?} from {:?}", packet.kind, from);

        if packet.kind == PacketKind::Unreliable {
            return self.on_unreliable(from, packet);
        }

        let Some(message_id) = packet.message_id else {
            error!("decoded {:?} packet without message id - this is a bug", packet.kind);
            return None;
        };

        match packet.kind {
            PacketKind::Syn => self.on_syn(from, message_id, packet),
            PacketKind::SynAck => { self.on_syn_ack(from, message_id); None }
            PacketKind::SynFailure => { self.on_syn_failure(from, message_id); None }
            PacketKind::Ack => { self.on_ack(from, message_id); None }
            PacketKind::AckAck => { self.on_ack_ack(from, message_id); None }
            PacketKind::Unreliable => None,
        }
    }

    fn on_unreliable(&self, from: SocketAddr, packet: DecodedPacket) -> Option<Payload> {
        if !self.check_ordering(from, packet.timestamp, false) {
            debug!("dropping out-of-order packet from {:?}", from);
            return None;
        }
        packet.payload
    }

    fn on_syn(&self, from: SocketAddr, message_id: u32, packet: DecodedPacket) -> Option<Payload> {
        let key = ExchangeKey { peer: from, message_id, role: Role::Responder };

        if let Some(existing) = self.exchanges.get(&key) {
            self.on_duplicate_syn(&existing);
            return None;
        }
        if self.delivered.contains(from, message_id, Instant::now()) {
            debug!("SYN for exchange {} was already delivered - repeating the SYN-ACK", key);
            self.send_control(from, PacketKind::SynAck, message_id);
            return None;
        }

        // a timestamp of 0 on a SYN restarts the sender's ordering sequence
        let restarts_ordering = packet.timestamp == Some(0);
        if !self.check_ordering(from, packet.timestamp, restarts_ordering) {
            debug!("rejecting out-of-order SYN {} from {:?}", message_id, from);
            self.send_control(from, PacketKind::SynFailure, message_id);
            return None;
        }

        let syn_ack = encode_control_packet(PacketKind::SynAck, message_id);
        let (record, created) = self.exchanges.get_or_insert_with(key, || ExchangeRecord::new(key, HandshakePhase::SynAckSent, syn_ack.clone()));
        if !created {
            self.on_duplicate_syn(&record);
            return None;
        }
        self.delivered.insert(from, message_id, Instant::now());

        self.send_control_buf(from, &syn_ack);
        packet.payload
    }

    fn on_duplicate_syn(&self, record: &ExchangeRecord) {
        let action = {
            let mut state = record.state.lock().unwrap();
            if record.is_being_deleted() || state.phase != HandshakePhase::SynAckSent {
                ExchangeAction::Ignore
            }
            else {
                state.last_interaction = Instant::now();
                ExchangeAction::Send(state.retransmit_buf.clone())
            }
        };
        trace!("duplicate SYN for exchange {}", record.key);
        self.perform(&record.key, action);
    }

    fn on_syn_ack(&self, from: SocketAddr, message_id: u32) {
        let mut syn_acknowledged = false;
        let record = self.on_control(from, message_id, Role::Initiator, PacketKind::SynAck, |state| {
            match state.phase {
                HandshakePhase::SynSent => {
                    syn_acknowledged = true;
                    let ack = encode_control_packet(PacketKind::Ack, message_id);
                    state.advance(HandshakePhase::AckSent, ack.clone());
                    ExchangeAction::Send(ack)
                }
                HandshakePhase::AckSent => {
                    // our ACK was lost
                    state.last_interaction = Instant::now();
                    ExchangeAction::Send(state.retransmit_buf.clone())
                }
                _ => ExchangeAction::Ignore,
            }
        });

        if syn_acknowledged && record.is_some_and(|r| r.restarts_ordering) {
            self.outbound_timestamps.confirm_restart(from);
        }
    }

    fn on_syn_failure(&self, from: SocketAddr, message_id: u32) {
        let syn_retry_cap = self.config.syn_retry_cap;
        self.on_control(from, message_id, Role::Initiator, PacketKind::SynFailure, |state| {
            if state.phase != HandshakePhase::SynSent {
                return ExchangeAction::Ignore;
            }
            state.retries += 1;
            if state.retries > syn_retry_cap {
                debug!("SYN for exchange {} failed {} times - giving up", message_id, state.retries);
                return ExchangeAction::Close;
            }
            state.last_interaction = Instant::now();
            state.just_sent = true;
            ExchangeAction::Send(state.retransmit_buf.clone())
        });
    }

    fn on_ack(&self, from: SocketAddr, message_id: u32) {
        let key = ExchangeKey { peer: from, message_id, role: Role::Responder };
        if self.exchanges.get(&key).is_none() && self.delivered.contains(from, message_id, Instant::now()) {
            debug!("ACK for closed exchange {} - repeating the ACK-ACK", key);
            self.send_control(from, PacketKind::AckAck, message_id);
            return;
        }

        self.on_control(from, message_id, Role::Responder, PacketKind::Ack, |state| {
            if state.phase != HandshakePhase::SynAckSent {
                return ExchangeAction::Ignore;
            }
            let ack_ack = encode_control_packet(PacketKind::AckAck, message_id);
            state.advance(HandshakePhase::AckAckSent, ack_ack.clone());
            ExchangeAction::SendAndClose(ack_ack)
        });
    }

    fn on_ack_ack(&self, from: SocketAddr, message_id: u32) {
        self.on_control(from, message_id, Role::Initiator, PacketKind::AckAck, |state| {
            if state.phase != HandshakePhase::AckSent {
                return ExchangeAction::Ignore;
            }
            ExchangeAction::Close
        });
    }

    fn on_control(
        &self,
        from: SocketAddr,
        message_id: u32,
        role: Role,
        kind: PacketKind,
        transition: impl FnOnce(&mut ExchangeState) -> ExchangeAction,
    ) -> Option<Arc<ExchangeRecord>> {
        let key = ExchangeKey { peer: from, message_id, role };
        let Some(record) = self.exchanges.get(&key) else {
            debug!("received {:?} for unknown exchange {} - dropping", kind, key);
            return None;
        };

        let action = {
            let mut state = record.state.lock().unwrap();
            if record.is_being_deleted() {
                ExchangeAction::Ignore
            }
            else {
                transition(&mut *state)
            }
        };

        if matches!(action, ExchangeAction::Ignore) {
            debug!("received {:?} for exchange {} in phase {:?} - dropping", kind, key, record.phase());
        }
        self.perform(&key, action);
        Some(record)
    }

    fn perform(&self, key: &ExchangeKey, action: ExchangeAction) {
        match action {
            ExchangeAction::Send(buf) => self.send_control_buf(key.peer, &buf),
            ExchangeAction::Close => self.close_exchange(key),
            ExchangeAction::SendAndClose(buf) => {
                self.send_control_buf(key.peer, &buf);
                self.close_exchange(key);
            }
            ExchangeAction::Ignore => {}
        }
    }

    /// Updates the peer's ordering record. Packets without a timestamp only count as traffic.
    fn check_ordering(&self, from: SocketAddr, timestamp: Option<u16>, restarts_ordering: bool) -> bool {
        let (peer, created) = self.peers.get_or_insert_with(from, || PeerOrderingRecord::new(from));
        if created {
            debug!("first contact with peer {:?}", from);
        }

        match timestamp {
            Some(timestamp) => peer.accept_timestamp(timestamp, restarts_ordering),
            None => {
                peer.touch();
                true
            }
        }
    }

    fn send_control(&self, to: SocketAddr, kind: PacketKind, message_id: u32) {
        self.send_control_buf(to, &encode_control_packet(kind, message_id));
    }

    fn send_control_buf(&self, to: SocketAddr, buf: &[u8]) {
        if let Err(e) = self.send_socket.send_packet(to, buf) {
            warn!("error sending control packet to {:?}: {}", to, e);
        }
    }

    fn close_exchange(&self, key: &ExchangeKey) {
        if self.exchanges.mark_for_delete(key, &self.pending_delete) {
            trace!("closed exchange {}", key);
        }
    }

    fn retry_cap(&self, role: Role, phase: HandshakePhase) -> u32 {
        match (role, phase) {
            (Role::Initiator, HandshakePhase::SynSent) => self.config.syn_retry_cap,
            (Role::Initiator, HandshakePhase::AckSent) => self.config.ack_retry_cap,
            (Role::Responder, HandshakePhase::SynAckSent) => self.config.syn_ack_retry_cap,
            _ => 0,
        }
    }

    /// Retransmits the last packet of every open exchange, or evicts the exchange if its retry
    ///  budget is used up. An initiator that just sent a packet is skipped for one scan.
    ///  Delivered exchanges past their retention are forgotten as well.
    pub fn scan_exchanges(&self) {
        let num_expired = self.delivered.expire(Instant::now());
        if num_expired > 0 {
            trace!("forgot {} delivered exchanges", num_expired);
        }

        for record in self.exchanges.snapshot() {
            let action = {
                let mut state = record.state.lock().unwrap();
                if record.is_being_deleted() {
                    continue;
                }
                if record.key.role == Role::Initiator && state.just_sent {
                    state.just_sent = false;
                    continue;
                }

                state.retries += 1;
                if state.retries > self.retry_cap(record.key.role, state.phase) {
                    debug!("exchange {} exhausted its retries in phase {:?}, last interaction {:?} ago - evicting",
                        record.key, state.phase, state.last_interaction.elapsed());
                    ExchangeAction::Close
                }
                else {
                    trace!("retransmitting for exchange {} in phase {:?}, retry #{}", record.key, state.phase, state.retries);
                    ExchangeAction::Send(state.retransmit_buf.clone())
                }
            };
            self.perform(&record.key, action);
        }
    }

    /// Evicts ordering records of peers that were quiet for too many consecutive scans
    pub fn scan_peers(&self) {
        for peer in self.peers.snapshot() {
            if peer.on_peer_scan(self.config.peer_quiet_threshold) {
                debug!("peer {:?} was quiet for {} scans - evicting its ordering record", peer.peer, self.config.peer_quiet_threshold);
                self.peers.mark_for_delete(&peer.peer, &self.pending_delete);
            }
        }
    }

    pub fn reclaim_pending(&self, now: Instant) -> usize {
        self.pending_delete.reclaim(now)
    }

    pub fn num_exchanges(&self) -> usize {
        self.exchanges.len()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn num_pending_delete(&self) -> usize {
        self.pending_delete.len()
    }

    pub fn exchange_phase(&self, key: &ExchangeKey) -> Option<HandshakePhase> {
        self.exchanges.get(key)
            .map(|r| r.phase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;
    use crate::codec::FieldValue;
    use crate::send_socket::MockSendSocket;
    use crate::test_util::send_socket::TrackingSendSocket;

    fn addr_a() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9001))
    }
    fn addr_b() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9002))
    }

    fn engine(self_addr: SocketAddr) -> (Arc<ReliabilityEngine>, Arc<TrackingSendSocket>) {
        let mut config = ReliabilityConfig::new(self_addr);
        config.reclaim_grace_period = Duration::ZERO;
        let send_socket = Arc::new(TrackingSendSocket::new());
        let engine = Arc::new(ReliabilityEngine::new(Arc::new(config), send_socket.clone()));
        (engine, send_socket)
    }

    fn ping() -> Payload {
        Payload::new().with(FieldValue::CharArray("ping".to_string()))
    }

    fn reliable() -> SendOptions {
        SendOptions { reliable: true, ordering_critical: true, wide_field_counts: false }
    }

    fn message_id(packet: &[u8]) -> u32 {
        decode_packet(packet).unwrap().message_id.unwrap()
    }

    fn initiator_key(message_id: u32) -> ExchangeKey {
        ExchangeKey { peer: addr_b(), message_id, role: Role::Initiator }
    }

    fn responder_key(message_id: u32) -> ExchangeKey {
        ExchangeKey { peer: addr_a(), message_id, role: Role::Responder }
    }

    #[test]
    fn test_handshake_completion() {
        let (a, a_socket) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let id = message_id(&syn);
        a_socket.assert_packet_sent(addr_b(), &syn);
        assert_eq!(a.exchange_phase(&initiator_key(id)), Some(HandshakePhase::SynSent));

        assert_eq!(b.on_datagram(addr_a(), &syn), Some(ping()));
        let syn_ack = encode_control_packet(PacketKind::SynAck, id);
        b_socket.assert_packet_sent(addr_a(), &syn_ack);
        assert_eq!(b.exchange_phase(&responder_key(id)), Some(HandshakePhase::SynAckSent));

        assert_eq!(a.on_datagram(addr_b(), &syn_ack), None);
        let ack = encode_control_packet(PacketKind::Ack, id);
        a_socket.assert_packet_sent(addr_b(), &ack);
        assert_eq!(a.exchange_phase(&initiator_key(id)), Some(HandshakePhase::AckSent));

        assert_eq!(b.on_datagram(addr_a(), &ack), None);
        let ack_ack = encode_control_packet(PacketKind::AckAck, id);
        b_socket.assert_packet_sent(addr_a(), &ack_ack);
        assert_eq!(b.num_exchanges(), 0);

        assert_eq!(a.on_datagram(addr_b(), &ack_ack), None);
        assert_eq!(a.num_exchanges(), 0);

        a_socket.assert_no_remaining_packets();
        b_socket.assert_no_remaining_packets();

        assert_eq!(a.reclaim_pending(Instant::now()), 1);
        assert_eq!(b.reclaim_pending(Instant::now()), 1);
        assert_eq!(a.num_pending_delete(), 0);
        assert_eq!(b.num_pending_delete(), 0);
    }

    #[test]
    fn test_unreliable_delivery() {
        let (a, a_socket) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let packet = a.send(addr_b(), &ping(), SendOptions::default()).unwrap();
        a_socket.assert_packet_sent(addr_b(), &packet);
        assert_eq!(a.num_exchanges(), 0);

        assert_eq!(b.on_datagram(addr_a(), &packet), Some(ping()));
        b_socket.assert_no_remaining_packets();
        assert_eq!(b.num_exchanges(), 0);
    }

    #[test]
    fn test_lost_syn_ack_retransmits_identical_syn_until_cap() {
        let (a, a_socket) = engine(addr_a());
        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        a_socket.assert_packet_sent(addr_b(), &syn);

        // the first scan after sending is skipped
        a.scan_exchanges();
        a_socket.assert_no_remaining_packets();

        for _ in 0..5 {
            a.scan_exchanges();
            a_socket.assert_packet_sent(addr_b(), &syn);
        }

        a.scan_exchanges();
        a_socket.assert_no_remaining_packets();
        assert_eq!(a.num_exchanges(), 0);
        assert_eq!(a.num_pending_delete(), 1);
    }

    #[test]
    fn test_duplicate_syn_is_delivered_once() {
        let (a, _) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let syn_ack = encode_control_packet(PacketKind::SynAck, message_id(&syn));

        assert_eq!(b.on_datagram(addr_a(), &syn), Some(ping()));
        b_socket.assert_packet_sent(addr_a(), &syn_ack);

        assert_eq!(b.on_datagram(addr_a(), &syn), None);
        b_socket.assert_packet_sent(addr_a(), &syn_ack);
        assert_eq!(b.num_exchanges(), 1);
    }

    #[test]
    fn test_duplicate_syn_ack_resends_ack() {
        let (a, a_socket) = engine(addr_a());
        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let id = message_id(&syn);
        a_socket.assert_packet_sent(addr_b(), &syn);

        let syn_ack = encode_control_packet(PacketKind::SynAck, id);
        let ack = encode_control_packet(PacketKind::Ack, id);
        a.on_datagram(addr_b(), &syn_ack);
        a_socket.assert_packet_sent(addr_b(), &ack);
        a.on_datagram(addr_b(), &syn_ack);
        a_socket.assert_packet_sent(addr_b(), &ack);
        assert_eq!(a.exchange_phase(&initiator_key(id)), Some(HandshakePhase::AckSent));
    }

    #[test]
    fn test_ack_sent_retries_until_cap() {
        let (a, a_socket) = engine(addr_a());
        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let id = message_id(&syn);
        a_socket.assert_packet_sent(addr_b(), &syn);

        a.on_datagram(addr_b(), &encode_control_packet(PacketKind::SynAck, id));
        let ack = encode_control_packet(PacketKind::Ack, id);
        a_socket.assert_packet_sent(addr_b(), &ack);

        a.scan_exchanges();
        for _ in 0..3 {
            a.scan_exchanges();
            a_socket.assert_packet_sent(addr_b(), &ack);
        }
        a.scan_exchanges();
        a_socket.assert_no_remaining_packets();
        assert_eq!(a.num_exchanges(), 0);
    }

    #[test]
    fn test_responder_retransmits_syn_ack_until_cap() {
        let (a, _) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let syn_ack = encode_control_packet(PacketKind::SynAck, message_id(&syn));
        b.on_datagram(addr_a(), &syn);
        b_socket.assert_packet_sent(addr_a(), &syn_ack);

        for _ in 0..2 {
            b.scan_exchanges();
            b_socket.assert_packet_sent(addr_a(), &syn_ack);
        }
        b.scan_exchanges();
        b_socket.assert_no_remaining_packets();
        assert_eq!(b.num_exchanges(), 0);
    }

    #[test]
    fn test_syn_failure_retransmits_until_cap() {
        let (a, a_socket) = engine(addr_a());
        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        a_socket.assert_packet_sent(addr_b(), &syn);
        let failure = encode_control_packet(PacketKind::SynFailure, message_id(&syn));

        for _ in 0..5 {
            a.on_datagram(addr_b(), &failure);
            a_socket.assert_packet_sent(addr_b(), &syn);
        }
        a.on_datagram(addr_b(), &failure);
        a_socket.assert_no_remaining_packets();
        assert_eq!(a.num_exchanges(), 0);
    }

    #[test]
    fn test_corrupted_syn_gets_syn_failure() {
        let (a, _) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let mut corrupted = syn.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        assert_eq!(b.on_datagram(addr_a(), &corrupted), None);
        b_socket.assert_packet_sent(addr_a(), &encode_control_packet(PacketKind::SynFailure, message_id(&syn)));
        assert_eq!(b.num_exchanges(), 0);
    }

    #[test]
    fn test_corrupted_unreliable_is_dropped_silently() {
        let (a, _) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let packet = a.send(addr_b(), &ping(), SendOptions { ordering_critical: true, ..Default::default() }).unwrap();
        let mut corrupted = packet.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        assert_eq!(b.on_datagram(addr_a(), &corrupted), None);
        b_socket.assert_no_remaining_packets();
    }

    #[test]
    fn test_ordering_rejection() {
        let (a, _) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());
        let ordered = SendOptions { ordering_critical: true, ..Default::default() };

        let first = a.send(addr_b(), &ping(), ordered).unwrap();
        let second = a.send(addr_b(), &ping(), ordered).unwrap();
        let third = a.send(addr_b(), &ping(), reliable()).unwrap();

        assert!(b.on_datagram(addr_a(), &second).is_some());
        assert!(b.on_datagram(addr_a(), &first).is_none());
        assert!(b.on_datagram(addr_a(), &second).is_some());
        b_socket.assert_no_remaining_packets();

        assert!(b.on_datagram(addr_a(), &third).is_some());
        let late_syn = {
            let (c, _) = engine(addr_a());
            c.send(addr_b(), &ping(), reliable()).unwrap()
        };
        b_socket.take_sent();
        // timestamp 1 after 3 was accepted
        assert!(b.on_datagram(addr_a(), &late_syn).is_none());
        b_socket.assert_packet_sent(addr_a(), &encode_control_packet(PacketKind::SynFailure, message_id(&late_syn)));
    }

    #[test]
    fn test_syn_with_timestamp_zero_restarts_ordering() {
        let (b, _) = engine(addr_b());
        let ordered = PayloadPacketOptions { message_id: None, timestamp: Some(500), wide_field_counts: false };
        let restart = PayloadPacketOptions { message_id: Some(1), timestamp: Some(0), wide_field_counts: false };
        let after_restart = PayloadPacketOptions { message_id: None, timestamp: Some(1), wide_field_counts: false };

        assert!(b.on_datagram(addr_a(), &encode_payload_packet(ordered, &ping(), 1472).unwrap()).is_some());
        assert!(b.on_datagram(addr_a(), &encode_payload_packet(after_restart, &ping(), 1472).unwrap()).is_none());
        assert!(b.on_datagram(addr_a(), &encode_payload_packet(restart, &ping(), 1472).unwrap()).is_some());
        assert!(b.on_datagram(addr_a(), &encode_payload_packet(after_restart, &ping(), 1472).unwrap()).is_some());
    }

    #[rstest]
    #[case::unknown_exchange(PacketKind::Ack)]
    #[case::unknown_syn_ack(PacketKind::SynAck)]
    #[case::unknown_ack_ack(PacketKind::AckAck)]
    #[case::unknown_failure(PacketKind::SynFailure)]
    fn test_control_for_unknown_exchange_is_dropped(#[case] kind: PacketKind) {
        let (b, b_socket) = engine(addr_b());
        assert_eq!(b.on_datagram(addr_a(), &encode_control_packet(kind, 4711)), None);
        b_socket.assert_no_remaining_packets();
    }

    #[test]
    fn test_control_in_wrong_phase_is_dropped() {
        let (a, a_socket) = engine(addr_a());
        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let id = message_id(&syn);
        a_socket.take_sent();

        // ACK-ACK before SYN-ACK
        a.on_datagram(addr_b(), &encode_control_packet(PacketKind::AckAck, id));
        a_socket.assert_no_remaining_packets();
        assert_eq!(a.exchange_phase(&initiator_key(id)), Some(HandshakePhase::SynSent));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let (a, a_socket) = engine(addr_a());
        let payload = Payload::new()
            .with(FieldValue::ByteArray(vec![1; 8000]));
        let options = SendOptions { reliable: true, ordering_critical: false, wide_field_counts: true };

        assert!(a.send(addr_b(), &payload, options).is_err());
        a_socket.assert_no_remaining_packets();
        assert_eq!(a.num_exchanges(), 0);
    }

    #[test]
    fn test_send_failure_closes_exchange() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_send_packet()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("network unreachable")));
        let engine = ReliabilityEngine::new(Arc::new(ReliabilityConfig::new(addr_a())), Arc::new(send_socket));

        assert!(engine.send(addr_b(), &ping(), reliable()).is_err());
        assert_eq!(engine.num_exchanges(), 0);
        assert_eq!(engine.num_pending_delete(), 1);
    }

    #[test]
    fn test_quiet_peer_is_evicted() {
        let (a, _) = engine(addr_a());
        let (b, _) = engine(addr_b());

        let packet = a.send(addr_b(), &ping(), SendOptions { ordering_critical: true, ..Default::default() }).unwrap();
        b.on_datagram(addr_a(), &packet);
        assert_eq!(b.num_peers(), 1);

        // the first scan consumes the traffic marker
        b.scan_peers();
        for _ in 0..11 {
            b.scan_peers();
            assert_eq!(b.num_peers(), 1);
        }
        b.scan_peers();
        assert_eq!(b.num_peers(), 0);
        assert_eq!(b.reclaim_pending(Instant::now()), 1);
    }

    #[test]
    fn test_eviction_bound() {
        let (a, _) = engine(addr_a());
        for _ in 0..20 {
            a.send(addr_b(), &ping(), reliable()).unwrap();
        }
        assert_eq!(a.num_exchanges(), 20);

        // cool-down scan plus one scan per retry, plus the evicting scan
        for _ in 0..7 {
            a.scan_exchanges();
        }
        assert_eq!(a.num_exchanges(), 0);
        assert_eq!(a.reclaim_pending(Instant::now()), 20);
    }

    #[test]
    fn test_lost_syn_acks_deliver_once() {
        let (a, a_socket) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        a.send(addr_b(), &ping(), reliable()).unwrap();

        let mut num_delivered = 0;
        for _ in 0..7 {
            a.scan_exchanges();
            b.scan_exchanges();
            // every SYN-ACK is lost
            b_socket.take_sent();
            for (_, packet) in a_socket.take_sent() {
                if b.on_datagram(addr_a(), &packet).is_some() {
                    num_delivered += 1;
                }
            }
        }

        assert_eq!(num_delivered, 1);
        assert_eq!(a.num_exchanges(), 0);
        assert_eq!(b.num_exchanges(), 0);
    }

    #[test]
    fn test_handshake_completes_after_responder_evicted() {
        let (a, a_socket) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        let syn = a.send(addr_b(), &ping(), reliable()).unwrap();
        let id = message_id(&syn);
        a_socket.take_sent();
        assert_eq!(b.on_datagram(addr_a(), &syn), Some(ping()));

        for _ in 0..3 {
            b.scan_exchanges();
        }
        b_socket.take_sent();
        assert_eq!(b.num_exchanges(), 0);

        // the retransmitted SYN is answered, but not delivered
        assert_eq!(b.on_datagram(addr_a(), &syn), None);
        let syn_ack = encode_control_packet(PacketKind::SynAck, id);
        b_socket.assert_packet_sent(addr_a(), &syn_ack);
        assert_eq!(b.num_exchanges(), 0);

        a.on_datagram(addr_b(), &syn_ack);
        let ack = encode_control_packet(PacketKind::Ack, id);
        a_socket.assert_packet_sent(addr_b(), &ack);

        b.on_datagram(addr_a(), &ack);
        let ack_ack = encode_control_packet(PacketKind::AckAck, id);
        b_socket.assert_packet_sent(addr_a(), &ack_ack);

        a.on_datagram(addr_b(), &ack_ack);
        assert_eq!(a.num_exchanges(), 0);
        a_socket.assert_no_remaining_packets();
        b_socket.assert_no_remaining_packets();
    }

    /// forwards packets between the engines until there are none left, returning the payloads
    ///  delivered to `b`
    fn exchange_packets(a: &ReliabilityEngine, a_socket: &TrackingSendSocket, b: &ReliabilityEngine, b_socket: &TrackingSendSocket) -> Vec<Payload> {
        let mut delivered = Vec::new();
        loop {
            let to_b = a_socket.take_sent();
            let to_a = b_socket.take_sent();
            if to_a.is_empty() && to_b.is_empty() {
                return delivered;
            }
            for (_, packet) in to_b {
                if let Some(payload) = b.on_datagram(addr_a(), &packet) {
                    delivered.push(payload);
                }
            }
            for (_, packet) in to_a {
                assert!(a.on_datagram(addr_b(), &packet).is_none());
            }
        }
    }

    #[test]
    fn test_failed_send_after_wrap_keeps_restarting() {
        let (a, a_socket) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());
        let ordered = SendOptions { ordering_critical: true, ..Default::default() };

        for _ in 0..u16::MAX - 1 {
            a.outbound_timestamps.next(addr_b());
        }
        a.send(addr_b(), &ping(), ordered).unwrap();
        assert_eq!(exchange_packets(&a, &a_socket, &b, &b_socket).len(), 1);

        // the packet that wraps the counter is never sent
        let oversized = Payload::new()
            .with(FieldValue::ByteArray(vec![1; 8000]));
        assert!(a.send(addr_b(), &oversized, SendOptions { wide_field_counts: true, ..ordered }).is_err());
        a_socket.assert_no_remaining_packets();

        let mut num_delivered = 0;
        for _ in 0..100 {
            a.send(addr_b(), &ping(), ordered).unwrap();
            num_delivered += exchange_packets(&a, &a_socket, &b, &b_socket).len();
        }
        assert_eq!(num_delivered, 100);
        assert_eq!(a.num_exchanges(), 0);
        assert_eq!(b.num_exchanges(), 0);
    }

    #[test]
    fn test_restart_is_repeated_until_acknowledged() {
        let (a, a_socket) = engine(addr_a());
        let ordered = SendOptions { ordering_critical: true, ..Default::default() };

        for _ in 0..u16::MAX {
            a.outbound_timestamps.next(addr_b());
        }
        let first = decode_packet(&a.send(addr_b(), &ping(), ordered).unwrap()).unwrap();
        let second = decode_packet(&a.send(addr_b(), &ping(), ordered).unwrap()).unwrap();
        assert_eq!((first.kind, first.timestamp), (PacketKind::Syn, Some(0)));
        assert_eq!((second.kind, second.timestamp), (PacketKind::Syn, Some(0)));
        a_socket.take_sent();

        let second_id = second.message_id.unwrap();
        a.on_datagram(addr_b(), &encode_control_packet(PacketKind::SynAck, second_id));
        let third = decode_packet(&a.send(addr_b(), &ping(), ordered).unwrap()).unwrap();
        assert_eq!((third.kind, third.timestamp), (PacketKind::Unreliable, Some(1)));
    }

    #[test]
    fn test_ping_scenario_leaves_tables_empty() {
        let (a, a_socket) = engine(addr_a());
        let (b, b_socket) = engine(addr_b());

        a.send(addr_b(), &ping(), reliable()).unwrap();

        let mut delivered = Vec::new();
        loop {
            let to_b = a_socket.take_sent();
            let to_a = b_socket.take_sent();
            if to_a.is_empty() && to_b.is_empty() {
                break;
            }
            for (_, packet) in to_b {
                if let Some(payload) = b.on_datagram(addr_a(), &packet) {
                    delivered.push(payload);
                }
            }
            for (_, packet) in to_a {
                assert!(a.on_datagram(addr_b(), &packet).is_none());
            }
        }

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].to_string(), r#"{"CharArray":"ping"}"#);
        assert_eq!(a.num_exchanges(), 0);
        assert_eq!(b.num_exchanges(), 0);
        a.reclaim_pending(Instant::now());
        b.reclaim_pending(Instant::now());
        assert_eq!(a.num_pending_delete(), 0);
        assert_eq!(b.num_pending_delete(), 0);
    }
}
