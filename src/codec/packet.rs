use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::codec::checksum::Checksum;
use crate::codec::field::Payload;
use crate::codec::flags::{PacketFlags, PacketKind};

/// Options for encoding a packet that carries an application payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadPacketOptions {
    /// `Some` for a SYN packet starting a reliable exchange, `None` for fire-and-forget
    pub message_id: Option<u32>,
    /// `None` sets the `ignoreTimestamp` flag
    pub timestamp: Option<u16>,
    pub wide_field_counts: bool,
}

/// Encodes a SYN or unreliable packet:
///
/// ```ascii
/// 0: flags (u8)
/// *: message id (u32, only for SYN)
/// *: checksum (u32) over everything after it
/// *: ordering timestamp (u16, absent if the 'ignore timestamp' flag is set)
/// *: fields
/// ```
pub fn encode_payload_packet(options: PayloadPacketOptions, payload: &Payload, max_len: usize) -> anyhow::Result<Bytes> {
    let mut flags = PacketFlags::empty();
    if options.message_id.is_some() {
        flags |= PacketFlags::SYN_INIT;
    }
    if options.timestamp.is_none() {
        flags |= PacketFlags::IGNORE_TIMESTAMP;
    }
    if options.wide_field_counts {
        flags |= PacketFlags::DOUBLE_CONTENT_COUNT;
    }

    let mut buf = BytesMut::with_capacity(max_len);
    buf.put_u8(flags.bits());
    if let Some(message_id) = options.message_id {
        buf.put_u32_ne(message_id);
    }

    let checksum_offset = buf.len();
    buf.put_u32_ne(0); // placeholder
    if let Some(timestamp) = options.timestamp {
        buf.put_u16_ne(timestamp);
    }
    payload.ser(&mut buf, options.wide_field_counts)?;

    if buf.len() > max_len {
        bail!("encoded packet has {} bytes, exceeding the maximum datagram size of {}", buf.len(), max_len);
    }

    let checksum_end = checksum_offset + Checksum::SERIALIZED_LEN;
    let checksum = Checksum::over(&buf[checksum_end..]);
    buf[checksum_offset..checksum_end].copy_from_slice(&checksum.0.to_ne_bytes());

    trace!("encoded packet with flags {:?}: {} bytes, checksum {:?}", flags, buf.len(), checksum);
    Ok(buf.freeze())
}

/// Control packets consist of the flag byte and the message id, nothing else
pub fn encode_control_packet(kind: PacketKind, message_id: u32) -> Bytes {
    debug_assert!(kind.is_control());

    let mut buf = BytesMut::with_capacity(1 + size_of::<u32>());
    buf.put_u8(kind.flag().bits());
    buf.put_u32_ne(message_id);
    buf.freeze()
}


#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub message_id: Option<u32>,
    pub timestamp: Option<u16>,
    /// `None` for control packets
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// empty packet, unused flag bits or conflicting reliability flags
    InvalidFlags,
    /// the packet ends before the end of the header its flags announce
    Undersized,
    ChecksumMismatch,
}

/// Describes a packet that failed validation, with as much of its header as could be read so
///  the receiver can reply to a failed SYN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedPacket {
    pub reason: RejectionReason,
    pub kind: Option<PacketKind>,
    pub message_id: Option<u32>,
}

impl RejectedPacket {
    /// if set, the sender is waiting for a reply, and should be told to retransmit
    pub fn failed_syn_id(&self) -> Option<u32> {
        match self.kind {
            Some(PacketKind::Syn) => self.message_id,
            _ => None,
        }
    }
}

pub fn decode_packet(mut buf: &[u8]) -> Result<DecodedPacket, RejectedPacket> {
    let mut rejected = RejectedPacket {
        reason: RejectionReason::InvalidFlags,
        kind: None,
        message_id: None,
    };

    let flags = buf.try_get_u8().ok()
        .and_then(PacketFlags::from_bits)
        .ok_or(rejected)?;
    let kind = PacketKind::from_flags(flags)
        .map_err(|_| rejected)?;
    rejected.kind = Some(kind);
    rejected.reason = RejectionReason::Undersized;

    let message_id = if flags.has_message_id() {
        let id = buf.try_get_u32_ne().map_err(|_| rejected)?;
        rejected.message_id = Some(id);
        Some(id)
    }
    else {
        None
    };

    if kind.is_control() {
        if !buf.is_empty() {
            trace!("ignoring {} trailing bytes after {:?} control packet", buf.len(), kind);
        }
        return Ok(DecodedPacket {
            kind,
            flags,
            message_id,
            timestamp: None,
            payload: None,
        });
    }

    let checksum = Checksum(buf.try_get_u32_ne().map_err(|_| rejected)?);
    if Checksum::over(buf) != checksum {
        rejected.reason = RejectionReason::ChecksumMismatch;
        return Err(rejected);
    }

    let timestamp = if flags.contains(PacketFlags::IGNORE_TIMESTAMP) {
        None
    }
    else {
        Some(buf.try_get_u16_ne().map_err(|_| rejected)?)
    };

    let payload = Payload::deser(&mut buf, flags.contains(PacketFlags::DOUBLE_CONTENT_COUNT));

    Ok(DecodedPacket {
        kind,
        flags,
        message_id,
        timestamp,
        payload: Some(payload),
    })
}
