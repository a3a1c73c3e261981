//! Pure encoding and decoding of packets, independent of sockets. See the crate documentation
//!  for the wire format.

pub mod checksum;
pub mod field;
pub mod flags;
pub mod packet;

pub use field::{FieldType, FieldValue, Payload};
pub use flags::{PacketFlags, PacketKind};
pub use packet::{decode_packet, encode_control_packet, encode_payload_packet, DecodedPacket, PayloadPacketOptions, RejectedPacket, RejectionReason};
