#[cfg(test)] use mockall::automock;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;
use anyhow::bail;
use tracing::trace;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing.
///
/// Sending is synchronous: packets are sent from worker threads and from the caller's thread,
///  outside of any async context.
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()>;
}

impl SendSocket for UdpSocket {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);

        let num_sent = retry_on_would_block(|| self.send_to(packet_buf, to))?;
        if num_sent != packet_buf.len() {
            bail!("sent only {} of {} bytes to {:?}", num_sent, packet_buf.len(), to);
        }
        Ok(())
    }
}

const MAX_WOULD_BLOCK_RETRIES: u32 = 10;

/// The end point's socket is non-blocking because it is shared with the async receive loop. A
///  full send buffer drains quickly, so a send that would block backs off and tries again
///  (for about 50ms in total) instead of failing.
fn retry_on_would_block(mut send: impl FnMut() -> io::Result<usize>) -> io::Result<usize> {
    let mut backoff = Duration::from_micros(50);
    for _ in 0..MAX_WOULD_BLOCK_RETRIES {
        match send() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("send buffer is full - retrying in {:?}", backoff);
                thread::sleep(backoff);
                backoff *= 2;
            }
            result => return result,
        }
    }
    send()
}
