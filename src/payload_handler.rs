#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use crate::codec::Payload;

/// Application callback for payloads that passed validation. Control packets never reach it,
///  and a retransmitted SYN is delivered only once.
///
/// Called on a worker thread.
#[cfg_attr(test, automock)]
pub trait PayloadHandler: Send + Sync + 'static {
    fn on_payload(&self, from: SocketAddr, payload: Payload);
}
