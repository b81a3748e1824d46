//! XDR (RFC 4506) encoding and decoding
//!
//! Every field is a multiple of four bytes. Integers are big-endian,
//! variable-length opaque data and strings carry a 4-byte length prefix and
//! are zero-padded to the next 4-byte boundary. Padding is always written on
//! encode and skipped without inspection on decode.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::XdrError;

/// Types that can be written as XDR
pub trait ToXdr {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError>;
}

/// Types that can be read from XDR
pub trait FromXdr: Sized {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError>;
}

/// Number of zero bytes needed to pad `len` to a 4-byte boundary
#[inline]
pub const fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Encode a single value into a fresh buffer
pub fn to_bytes<T: ToXdr + ?Sized>(value: &T) -> Result<Bytes, XdrError> {
    let mut encoder = Encoder::new();
    value.encode(&mut encoder)?;
    Ok(encoder.finish())
}

/// Decode a single value, rejecting trailing bytes
pub fn from_bytes<T: FromXdr>(data: &[u8]) -> Result<T, XdrError> {
    let mut decoder = Decoder::new(data);
    let value = T::decode(&mut decoder)?;
    decoder.finish()?;
    Ok(value)
}

/// Growable XDR output buffer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn encode<T: ToXdr + ?Sized>(&mut self, value: &T) -> Result<(), XdrError> {
        value.encode(self)
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u32(u32::from(value));
    }

    /// Fixed-length opaque: payload and padding, no length prefix
    pub fn put_fixed_opaque(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
    }

    /// Variable-length opaque with no declared upper bound
    pub fn put_opaque(&mut self, data: &[u8]) -> Result<(), XdrError> {
        self.put_opaque_bounded(data, u32::MAX as usize, "opaque")
    }

    /// Variable-length opaque `opaque<max>`
    pub fn put_opaque_bounded(
        &mut self,
        data: &[u8],
        max: usize,
        field: &'static str,
    ) -> Result<(), XdrError> {
        if data.len() > max {
            return Err(XdrError::TooLong {
                field,
                len: data.len(),
                max,
            });
        }
        self.buf.put_u32(data.len() as u32);
        self.put_fixed_opaque(data);
        Ok(())
    }

    pub fn put_string(&mut self, value: &str) -> Result<(), XdrError> {
        self.put_opaque_bounded(value.as_bytes(), u32::MAX as usize, "string")
    }

    pub fn put_string_bounded(
        &mut self,
        value: &str,
        max: usize,
        field: &'static str,
    ) -> Result<(), XdrError> {
        self.put_opaque_bounded(value.as_bytes(), max, field)
    }

    /// Counted array `T<>`
    pub fn put_array<T: ToXdr>(&mut self, items: &[T]) -> Result<(), XdrError> {
        self.buf.put_u32(items.len() as u32);
        for item in items {
            item.encode(self)?;
        }
        Ok(())
    }

    /// Optional data `*T`
    pub fn put_optional<T: ToXdr>(&mut self, value: Option<&T>) -> Result<(), XdrError> {
        match value {
            Some(v) => {
                self.put_bool(true);
                v.encode(self)
            }
            None => {
                self.put_bool(false);
                Ok(())
            }
        }
    }

    /// Linked list encoded as repeated `value_follows` entries
    pub fn put_list<T: ToXdr>(&mut self, items: &[T]) -> Result<(), XdrError> {
        for item in items {
            self.put_bool(true);
            item.encode(self)?;
        }
        self.put_bool(false);
        Ok(())
    }
}

/// Cursor over an XDR input buffer
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Unconsumed bytes
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Require the whole buffer to have been consumed
    pub fn finish(&self) -> Result<(), XdrError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(XdrError::TrailingBytes(n)),
        }
    }

    pub fn decode<T: FromXdr>(&mut self) -> Result<T, XdrError> {
        T::decode(self)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], XdrError> {
        if n > self.remaining() {
            return Err(XdrError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], XdrError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32, XdrError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, XdrError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, XdrError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_bool(&mut self) -> Result<bool, XdrError> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(XdrError::InvalidDiscriminant {
                what: "bool",
                value,
            }),
        }
    }

    pub fn get_fixed_opaque(&mut self, len: usize) -> Result<&'a [u8], XdrError> {
        let data = self.take(len)?;
        // Padding is skipped, its contents are not checked
        self.take(padding(len))?;
        Ok(data)
    }

    pub fn get_opaque(&mut self) -> Result<&'a [u8], XdrError> {
        self.get_opaque_bounded(u32::MAX as usize, "opaque")
    }

    pub fn get_opaque_bounded(
        &mut self,
        max: usize,
        field: &'static str,
    ) -> Result<&'a [u8], XdrError> {
        let len = self.get_u32()? as usize;
        if len > max {
            return Err(XdrError::TooLong { field, len, max });
        }
        self.get_fixed_opaque(len)
    }

    pub fn get_string(&mut self) -> Result<String, XdrError> {
        self.get_string_bounded(u32::MAX as usize, "string")
    }

    pub fn get_string_bounded(
        &mut self,
        max: usize,
        field: &'static str,
    ) -> Result<String, XdrError> {
        let raw = self.get_opaque_bounded(max, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| XdrError::InvalidUtf8)
    }

    /// Server-chosen names are not guaranteed to be UTF-8
    pub fn get_string_lossy(&mut self) -> Result<String, XdrError> {
        let raw = self.get_opaque()?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    pub fn get_array<T: FromXdr>(&mut self) -> Result<Vec<T>, XdrError> {
        self.get_array_bounded(u32::MAX as usize, "array")
    }

    pub fn get_array_bounded<T: FromXdr>(
        &mut self,
        max: usize,
        field: &'static str,
    ) -> Result<Vec<T>, XdrError> {
        let len = self.get_u32()? as usize;
        if len > max {
            return Err(XdrError::TooLong { field, len, max });
        }
        // Every XDR item is at least 4 bytes; don't trust the count for allocation
        let mut items = Vec::with_capacity(len.min(self.remaining() / 4));
        for _ in 0..len {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }

    pub fn get_optional<T: FromXdr>(&mut self) -> Result<Option<T>, XdrError> {
        if self.get_bool()? {
            Ok(Some(T::decode(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_list<T: FromXdr>(&mut self) -> Result<Vec<T>, XdrError> {
        let mut items = Vec::new();
        while self.get_bool()? {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

impl ToXdr for u32 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u32(*self);
        Ok(())
    }
}

impl FromXdr for u32 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        decoder.get_u32()
    }
}

impl ToXdr for i32 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_i32(*self);
        Ok(())
    }
}

impl FromXdr for i32 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        decoder.get_i32()
    }
}

impl ToXdr for u64 {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_u64(*self);
        Ok(())
    }
}

impl FromXdr for u64 {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        decoder.get_u64()
    }
}

impl ToXdr for bool {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_bool(*self);
        Ok(())
    }
}

impl FromXdr for bool {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        decoder.get_bool()
    }
}

impl ToXdr for String {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_string(self)
    }
}

impl FromXdr for String {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        decoder.get_string()
    }
}

impl ToXdr for str {
    fn encode(&self, encoder: &mut Encoder) -> Result<(), XdrError> {
        encoder.put_string(self)
    }
}

/// Procedures with no arguments or no results
impl ToXdr for () {
    fn encode(&self, _encoder: &mut Encoder) -> Result<(), XdrError> {
        Ok(())
    }
}

impl FromXdr for () {
    fn decode(_decoder: &mut Decoder<'_>) -> Result<Self, XdrError> {
        Ok(())
    }
}
