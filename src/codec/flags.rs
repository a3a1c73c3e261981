use anyhow::bail;
use bitflags::bitflags;

bitflags! {
    /// The packet's first byte. Bit 7 is unused and must be 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const SYN_INIT = 0x01;
        const SYN_ACK_SUCCESS = 0x02;
        const SYN_FAILURE = 0x04;
        const ACK_SUCCESS = 0x08;
        const ACK_ACK = 0x10;
        /// no ordering timestamp in the packet, and no ordering check on the receiving side
        const IGNORE_TIMESTAMP = 0x20;
        /// all field tags in the packet are two bytes long, allowing up to 8191 elements
        const DOUBLE_CONTENT_COUNT = 0x40;

        const CONTROL = Self::SYN_ACK_SUCCESS.bits() | Self::SYN_FAILURE.bits() | Self::ACK_SUCCESS.bits() | Self::ACK_ACK.bits();
        const RELIABILITY = Self::SYN_INIT.bits() | Self::CONTROL.bits();
    }
}

impl PacketFlags {
    /// a message id follows the flag byte iff any reliability flag is set
    pub fn has_message_id(&self) -> bool {
        self.intersects(Self::RELIABILITY)
    }
}

/// The role a packet plays in the protocol, derived from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// fire-and-forget application payload without an exchange
    Unreliable,
    /// first packet of a reliable exchange, carrying the application payload
    Syn,
    SynAck,
    SynFailure,
    Ack,
    AckAck,
}

impl PacketKind {
    pub fn from_flags(flags: PacketFlags) -> anyhow::Result<PacketKind> {
        let reliability = flags & PacketFlags::RELIABILITY;

        const SYN: u8 = PacketFlags::SYN_INIT.bits();
        const SYN_ACK: u8 = PacketFlags::SYN_ACK_SUCCESS.bits();
        const SYN_FAILURE: u8 = PacketFlags::SYN_FAILURE.bits();
        const ACK: u8 = PacketFlags::ACK_SUCCESS.bits();
        const ACK_ACK: u8 = PacketFlags::ACK_ACK.bits();

        let kind = match reliability.bits() {
            0 => PacketKind::Unreliable,
            SYN => PacketKind::Syn,
            SYN_ACK => PacketKind::SynAck,
            SYN_FAILURE => PacketKind::SynFailure,
            ACK => PacketKind::Ack,
            ACK_ACK => PacketKind::AckAck,
            _ => bail!("packet has conflicting reliability flags {:?}", reliability),
        };
        Ok(kind)
    }

    pub fn flag(&self) -> PacketFlags {
        match self {
            PacketKind::Unreliable => PacketFlags::empty(),
            PacketKind::Syn => PacketFlags::SYN_INIT,
            PacketKind::SynAck => PacketFlags::SYN_ACK_SUCCESS,
            PacketKind::SynFailure => PacketFlags::SYN_FAILURE,
            PacketKind::Ack => PacketFlags::ACK_SUCCESS,
            PacketKind::AckAck => PacketFlags::ACK_ACK,
        }
    }

    /// Control packets are handshake-only: they carry a message id, but no checksum, timestamp
    ///  or payload
    pub fn is_control(&self) -> bool {
        !matches!(self, PacketKind::Unreliable | PacketKind::Syn)
    }
}
