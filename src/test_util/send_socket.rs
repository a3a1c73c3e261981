use std::net::SocketAddr;
use std::sync::Mutex;
use bytes::Bytes;
use crate::send_socket::SendSocket;

/// Records every packet instead of sending it, so tests can assert on the sequence of packets
///  and forward them to another engine by hand
#[derive(Debug, Default)]
pub struct TrackingSendSocket {
    tracker: Mutex<Vec<(SocketAddr, Bytes)>>,
}
impl TrackingSendSocket {
    pub fn new() -> Self {
        Default::default()
    }

    /// removes the oldest recorded packet and checks it
    pub fn assert_packet_sent(&self, to: SocketAddr, packet: &[u8]) {
        let mut lock = self.tracker.lock().unwrap();
        if lock.is_empty() {
            panic!("no packet was sent");
        }

        let (actual_to, actual_packet) = lock.remove(0);
        assert_eq!(actual_to, to);
        assert_eq!(actual_packet.as_ref(), packet);
    }

    pub fn assert_no_remaining_packets(&self) {
        let lock = self.tracker.lock().unwrap();
        assert!(lock.is_empty(), "unexpected packets: {:?}", lock);
    }

    pub fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.tracker.lock().unwrap())
    }
}

impl SendSocket for TrackingSendSocket {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        self.tracker.lock().unwrap().push((to, Bytes::copy_from_slice(packet_buf)));
        Ok(())
    }
}
