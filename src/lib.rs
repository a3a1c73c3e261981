//! A thin reliability layer on top of UDP: each payload fits into a single datagram, and it is
//!  sent either fire-and-forget or reliably, through a four-way handshake with retransmission.
//!
//! ## Design goals
//!
//! * peer-to-peer - each node has one UDP socket for sending and receiving
//! * the abstraction is a *payload*: a list of typed arrays, small enough for one datagram
//!   * there is no fragmentation, no flow control and no congestion control
//! * reliable delivery per payload via SYN / SYN-ACK / ACK / ACK-ACK
//!   * a payload is delivered to the application at most once per exchange, even if its SYN is
//!      retransmitted. The responder remembers delivered exchanges for as long as the initiator
//!      may still retransmit.
//!   * lost packets are retransmitted on timeout, up to a configured number of retries per phase
//! * optional ordering protection: a receiver drops packets that are older than the newest one
//!    it accepted from the same sender
//! * all per-peer and per-exchange state is cleaned up by timeouts - there are no connections
//! * there is no encryption and no authentication. The checksum detects corruption, not
//!    tampering.
//!
//! ## Packet format
//!
//! All numbers are in *native* byte order - peers must run on platforms with the same endianness.
//!
//! ```ascii
//! 0: flags (u8):
//!    * bit 0: SYN - first packet of a reliable exchange, carries a payload
//!    * bit 1: SYN-ACK - the SYN was accepted and delivered
//!    * bit 2: SYN failure - the SYN was rejected, please retransmit
//!    * bit 3: ACK
//!    * bit 4: ACK-ACK - the exchange is complete
//!    * bit 5: 'ignore timestamp' - there is no ordering timestamp
//!    * bit 6: 'double content count' - field counts have 13 bits instead of 5
//!    * bit 7: unused, must be 0
//!    At most one of bits 0-4 may be set.
//! *: message id (u32) - present iff one of bits 0-4 is set
//! ```
//!
//! Control packets (bits 1-4) end after the message id. Packets with a payload continue:
//!
//! ```ascii
//! *: checksum (u32) - wrapping sum of all following bytes
//! *: ordering timestamp (u16) - absent if the 'ignore timestamp' flag is set
//! *: fields until the end of the packet
//! ```
//!
//! ## Fields
//!
//! ```ascii
//! 0: tag (u8): bits 0-2 field type, bits 3-7 element count (or its low 5 bits)
//! *: high 8 bits of the element count (u8) - only with 'double content count'
//! *: elements
//! ```
//!
//! Field types:
//! * 0: BoolArray - bit-packed, LSB first, `ceil(count / 8)` bytes
//! * 1: ByteArray
//! * 2: CharArray - UTF-8, the count is the number of bytes
//! * 3: ShortArray - i16 elements
//! * 4: IntArray - i32 elements
//! * 5: FloatArray - f32 elements
//!
//! A receiver stops decoding at an unknown field type or at a field that extends beyond the end
//!  of the packet, keeping the fields decoded so far.
//!
//! ## Reliable exchange
//!
//! ```ascii
//! initiator                   responder
//!    |  SYN (payload) ----------> |  deliver payload
//!    |  <-------------- SYN-ACK   |
//!    |  ACK ------------------->  |
//!    |  <-------------- ACK-ACK   |  closed
//!  closed
//! ```
//!
//! A rejected SYN (bad checksum, truncated, out of order) is answered with a SYN failure, and
//!  the initiator retransmits it unchanged. Each side retransmits its last packet on timeout.
//!  A duplicate SYN or SYN-ACK is answered by repeating the reply, without delivering again.
//!  This includes a SYN or ACK for an exchange that the responder already closed.
//!
//! ## Ordering timestamps
//!
//! The sender keeps a counter per destination and stamps ordering-critical packets with it. The
//!  receiver keeps the newest accepted timestamp per sender and drops anything older. When the
//!  counter wraps around, the packet carrying 0 is sent as a SYN, and a SYN with timestamp 0
//!  resets the receiver's baseline. The sender keeps sending 0 on SYNs until one of them is
//!  acknowledged. A sender that is quiet for a peer scan cycle gets a fresh baseline as well,
//!  and rejected packets do not count as traffic.

pub mod codec;
pub mod config;
pub mod end_point;
pub mod engine;
pub mod payload_handler;
pub mod send_socket;
pub mod task;
pub mod test_util;
pub mod util;
