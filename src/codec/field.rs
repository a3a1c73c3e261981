use std::fmt::{Display, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;

/// Element type of a field, stored in the low three bits of the field's tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FieldType {
    BoolArray = 0,
    ByteArray = 1,
    CharArray = 2,
    ShortArray = 3,
    IntArray = 4,
    FloatArray = 5,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::BoolArray => "BoolArray",
            FieldType::ByteArray => "ByteArray",
            FieldType::CharArray => "CharArray",
            FieldType::ShortArray => "ShortArray",
            FieldType::IntArray => "IntArray",
            FieldType::FloatArray => "FloatArray",
        }
    }

    /// number of bytes that `count` elements of this type occupy on the wire
    pub fn encoded_len(&self, count: usize) -> usize {
        match self {
            FieldType::BoolArray => count.div_ceil(8),
            FieldType::ByteArray | FieldType::CharArray => count,
            FieldType::ShortArray => count * size_of::<i16>(),
            FieldType::IntArray => count * size_of::<i32>(),
            FieldType::FloatArray => count * size_of::<f32>(),
        }
    }
}

/// Element count limits of a field tag: five bits in a single-byte tag, 13 bits in a two-byte tag
pub const MAX_NARROW_COUNT: usize = 0x1f;
pub const MAX_WIDE_COUNT: usize = 0x1fff;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    BoolArray(Vec<bool>),
    ByteArray(Vec<u8>),
    /// NB: the element count on the wire is the number of UTF-8 bytes, not of chars
    CharArray(String),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::BoolArray(_) => FieldType::BoolArray,
            FieldValue::ByteArray(_) => FieldType::ByteArray,
            FieldValue::CharArray(_) => FieldType::CharArray,
            FieldValue::ShortArray(_) => FieldType::ShortArray,
            FieldValue::IntArray(_) => FieldType::IntArray,
            FieldValue::FloatArray(_) => FieldType::FloatArray,
        }
    }

    pub fn name(&self) -> &'static str {
        self.field_type().name()
    }

    pub fn element_count(&self) -> usize {
        match self {
            FieldValue::BoolArray(v) => v.len(),
            FieldValue::ByteArray(v) => v.len(),
            FieldValue::CharArray(s) => s.len(),
            FieldValue::ShortArray(v) => v.len(),
            FieldValue::IntArray(v) => v.len(),
            FieldValue::FloatArray(v) => v.len(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut, wide_count: bool) -> anyhow::Result<()> {
        let count = self.element_count();
        let type_bits: u8 = self.field_type().into();

        if wide_count {
            if count > MAX_WIDE_COUNT {
                bail!("{} has {} elements, exceeding the maximum of {}", self.name(), count, MAX_WIDE_COUNT);
            }
            let low: u8 = (count & 0x1f).prechecked_cast();
            let high: u8 = (count >> 5).prechecked_cast();
            buf.put_u8(type_bits | (low << 3));
            buf.put_u8(high);
        }
        else {
            if count > MAX_NARROW_COUNT {
                bail!("{} has {} elements, exceeding the maximum of {} without wide field counts", self.name(), count, MAX_NARROW_COUNT);
            }
            let count: u8 = count.prechecked_cast();
            buf.put_u8(type_bits | (count << 3));
        }

        match self {
            FieldValue::BoolArray(v) => {
                for chunk in v.chunks(8) {
                    let mut packed = 0u8;
                    for (bit, &value) in chunk.iter().enumerate() {
                        if value {
                            packed |= 1 << bit;
                        }
                    }
                    buf.put_u8(packed);
                }
            }
            FieldValue::ByteArray(v) => buf.put_slice(v),
            FieldValue::CharArray(s) => buf.put_slice(s.as_bytes()),
            FieldValue::ShortArray(v) => v.iter().for_each(|&x| buf.put_i16_ne(x)),
            FieldValue::IntArray(v) => v.iter().for_each(|&x| buf.put_i32_ne(x)),
            FieldValue::FloatArray(v) => v.iter().for_each(|&x| buf.put_f32_ne(x)),
        }
        Ok(())
    }

    /// Reads the next field from the buffer. Returns `None` without consuming the field's body
    ///  if the buffer does not hold the complete field or the tag is invalid.
    pub fn try_deser(buf: &mut impl Buf, wide_count: bool) -> Option<FieldValue> {
        let (type_bits, count) = Self::try_deser_tag(buf, wide_count)?;

        let field_type = match FieldType::try_from(type_bits) {
            Ok(t) => t,
            Err(_) => {
                debug!("unknown field type {} - skipping the rest of the packet", type_bits);
                return None;
            }
        };

        let len = field_type.encoded_len(count);
        if buf.remaining() < len {
            debug!("{} with {} elements needs {} bytes, but only {} remain - truncating", field_type.name(), count, len, buf.remaining());
            return None;
        }

        let value = match field_type {
            FieldType::BoolArray => {
                let packed = buf.try_get_vec(len).ok()?;
                FieldValue::BoolArray((0..count)
                    .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
                    .collect())
            }
            FieldType::ByteArray => FieldValue::ByteArray(buf.try_get_vec(len).ok()?),
            FieldType::CharArray => FieldValue::CharArray(String::from_utf8_lossy(&buf.try_get_vec(len).ok()?).into_owned()),
            FieldType::ShortArray => FieldValue::ShortArray((0..count).map(|_| buf.get_i16_ne()).collect()),
            FieldType::IntArray => FieldValue::IntArray((0..count).map(|_| buf.get_i32_ne()).collect()),
            FieldType::FloatArray => FieldValue::FloatArray((0..count).map(|_| buf.get_f32_ne()).collect()),
        };
        Some(value)
    }

    fn try_deser_tag(buf: &mut impl Buf, wide_count: bool) -> Option<(u8, usize)> {
        let first = buf.try_get_u8().ok()?;
        let type_bits = first & 0x07;
        let low = usize::from(first >> 3);

        if wide_count {
            let high = usize::from(buf.try_get_u8().ok()?);
            Some((type_bits, low | (high << 5)))
        }
        else {
            Some((type_bits, low))
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn list<T: Display>(f: &mut Formatter<'_>, items: &[T]) -> std::fmt::Result {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, "]")
        }

        match self {
            FieldValue::BoolArray(v) => list(f, v),
            FieldValue::ByteArray(v) => list(f, v),
            FieldValue::CharArray(s) => write!(f, "{:?}", s),
            FieldValue::ShortArray(v) => list(f, v),
            FieldValue::IntArray(v) => list(f, v),
            FieldValue::FloatArray(v) => list(f, v),
        }
    }
}


/// The application-level content of a packet: an ordered sequence of typed arrays, each
///  identified by its type's name. The same name can occur several times.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    fields: Vec<FieldValue>,
}

impl Payload {
    pub fn new() -> Payload {
        Payload::default()
    }

    pub fn with(mut self, field: FieldValue) -> Payload {
        self.fields.push(field);
        self
    }

    pub fn push(&mut self, field: FieldValue) {
        self.fields.push(field);
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// the first field with the given name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter()
            .find(|f| f.name() == name)
    }

    pub fn ser(&self, buf: &mut BytesMut, wide_count: bool) -> anyhow::Result<()> {
        for field in &self.fields {
            field.ser(buf, wide_count)?;
        }
        Ok(())
    }

    /// Reads fields until the buffer is exhausted. A field that is cut short ends decoding,
    ///  keeping the fields read so far.
    pub fn deser(buf: &mut impl Buf, wide_count: bool) -> Payload {
        let mut fields = Vec::new();
        while buf.has_remaining() {
            match FieldValue::try_deser(buf, wide_count) {
                Some(field) => fields.push(field),
                None => break,
            }
        }
        Payload { fields }
    }
}

impl From<Vec<FieldValue>> for Payload {
    fn from(fields: Vec<FieldValue>) -> Self {
        Payload { fields }
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "\"{}\":{}", field.name(), field)?;
        }
        write!(f, "}}")
    }
}
