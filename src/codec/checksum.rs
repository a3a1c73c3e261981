use std::fmt::{Debug, Formatter};

/// Additive checksum: the wrapping sum of all bytes it covers.
///
/// NB: This detects a corrupted byte, but collisions are trivial to construct. It is part of the
///  wire format and must not be used for anything security related.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}
impl Checksum {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn over(buf: &[u8]) -> Checksum {
        Checksum(
            buf.iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
        )
    }
}
