use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    pub self_addr: SocketAddr,

    /// This is the maximum size of an encoded packet. Payloads must fit into a single datagram -
    ///  there is no fragmentation, and sending a bigger packet fails.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472` for
    ///  IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    pub max_datagram_size: usize,

    /// The scheduled ticker's wake interval. All scheduled waits are effectively rounded up to a
    ///  multiple of this.
    pub tick_interval: Duration,

    /// Interval for scanning in-flight exchanges for retransmission or eviction
    pub exchange_scan_interval: Duration,
    /// Interval for the peer ordering records' quiet-cycle bookkeeping
    pub peer_scan_interval: Duration,
    /// A peer ordering record is evicted after this many consecutive peer scans without traffic
    pub peer_quiet_threshold: u32,

    pub reclaim_interval: Duration,
    /// Minimum time between marking a record for deletion and actually freeing it
    pub reclaim_grace_period: Duration,

    /// retransmissions of a SYN before the initiator gives up
    pub syn_retry_cap: u32,
    /// retransmissions of an ACK before the initiator gives up
    pub ack_retry_cap: u32,
    /// retransmissions of a SYN-ACK before the responder gives up
    pub syn_ack_retry_cap: u32,

    pub num_workers: usize,
}

impl ReliabilityConfig {
    pub fn new(self_addr: SocketAddr) -> ReliabilityConfig {
        ReliabilityConfig {
            self_addr,
            max_datagram_size: 1472,
            tick_interval: Duration::from_millis(50),
            exchange_scan_interval: Duration::from_millis(100),
            peer_scan_interval: Duration::from_secs(10),
            peer_quiet_threshold: 12,
            reclaim_interval: Duration::from_millis(100),
            reclaim_grace_period: Duration::from_millis(100),
            syn_retry_cap: 5,
            ack_retry_cap: 3,
            syn_ack_retry_cap: 2,
            num_workers: 5,
        }
    }

    /// How long a responder remembers a delivered exchange after its record is gone. This covers
    ///  the initiator retransmitting its SYN and then its ACK until both retry caps are used up,
    ///  plus the cool-down scan after each.
    pub fn delivered_exchange_retention(&self) -> Duration {
        self.exchange_scan_interval * (self.syn_retry_cap + self.ack_retry_cap + 2)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 16 {
            bail!("maximum datagram size is too small");
        }
        if self.max_datagram_size > 65507 {
            bail!("maximum datagram size exceeds what fits into a UDP packet");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        for (name, interval) in [
            ("exchange scan interval", self.exchange_scan_interval),
            ("peer scan interval", self.peer_scan_interval),
            ("reclaim interval", self.reclaim_interval),
        ] {
            if interval < self.tick_interval {
                bail!("{} must not be shorter than the tick interval", name);
            }
        }
        if self.peer_quiet_threshold == 0 {
            bail!("peer quiet threshold must be at least 1");
        }
        if self.num_workers == 0 {
            bail!("at least one worker thread is required");
        }
        Ok(())
    }
}
