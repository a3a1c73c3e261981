use std::net::SocketAddr;
use std::sync::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

/// The ordering timestamp for an outgoing packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundTimestamp {
    pub value: u16,
    /// The counter wrapped around, and the receiver must accept this timestamp as its new
    ///  baseline. The packet carrying it is sent reliably.
    pub restarts_ordering: bool,
}

#[derive(Default)]
struct DestinationCounter {
    last: u16,
    /// the counter wrapped, and no SYN carrying the restart was acknowledged yet
    restart_pending: bool,
}

/// Per-destination counters for ordering timestamps of outgoing packets. The first timestamp
///  for a destination is 1, and the value after `u16::MAX` is 0.
///
/// After a wrap, the counter stays at 0 until the receiver acknowledged a restarting SYN (see
///  [Self::confirm_restart]). Until then every packet to that destination restarts ordering,
///  so a restart that never made it to the receiver is repeated with the next packet.
#[derive(Default)]
pub struct OutboundTimestamps {
    counters: Mutex<FxHashMap<SocketAddr, DestinationCounter>>,
}

impl OutboundTimestamps {
    pub fn next(&self, to: SocketAddr) -> OutboundTimestamp {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(to).or_default();

        if counter.restart_pending {
            return OutboundTimestamp { value: 0, restarts_ordering: true };
        }

        match counter.last.checked_add(1) {
            Some(value) => {
                counter.last = value;
                OutboundTimestamp { value, restarts_ordering: false }
            }
            None => {
                counter.last = 0;
                counter.restart_pending = true;
                OutboundTimestamp { value: 0, restarts_ordering: true }
            }
        }
    }

    /// The receiver accepted a SYN that restarted ordering, so timestamps for this destination
    ///  can move on from 0.
    pub fn confirm_restart(&self, to: SocketAddr) {
        if let Some(counter) = self.counters.lock().unwrap().get_mut(&to) {
            if std::mem::replace(&mut counter.restart_pending, false) {
                debug!("{:?} accepted the restart of ordering timestamps", to);
            }
        }
    }
}
