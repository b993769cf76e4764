//! TLV parameter elements
//!
//! Command, response and event frames carry their arguments as a list of
//! type-length-value elements:
//!
//! ```text
//! [0]     type
//! [1]     flags, low two bits = number of pad bytes
//! [2..4]  data length, u16 BE
//! [4..]   data, then zero padding to a multiple of four bytes
//! ```
//!
//! Integer-class values always travel as four big-endian bytes.

/// Size of an element header
pub const ELEM_HDR_SIZE: usize = 4;

/// Element data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// No data
    Empty,
    /// Signed integer
    Integer,
    /// Unsigned integer
    IntegerUnsigned,
    /// 16.16 fixed point
    IntegerFrac,
    /// Text, not NUL terminated
    String,
    /// Opaque bytes
    ByteArray,
    /// Boolean, as an integer
    Bool,
    /// IPv4 address, network order
    Ipv4Addr,
    /// IPv6 address, network order
    Ipv6Addr,
    /// MAC address
    MacAddr,
    /// Status code, as an integer
    Status,
    /// Seconds since the epoch, as an integer
    UtcTime,
}

impl ElemType {
    const EMPTY: u8 = 0;
    const INTEGER: u8 = 1;
    const INTEGER_UNSIGNED: u8 = 2;
    const INTEGER_FRAC: u8 = 3;
    const STRING: u8 = 4;
    const BYTE_ARRAY: u8 = 5;
    const BOOL: u8 = 6;
    const IPV4ADDR: u8 = 7;
    const IPV6ADDR: u8 = 8;
    const MACADDR: u8 = 9;
    const STATUS: u8 = 10;
    const UTC_TIME: u8 = 11;

    /// Types whose data is a big-endian integer
    pub fn is_int(&self) -> bool {
        matches!(
            self,
            ElemType::Integer
                | ElemType::IntegerUnsigned
                | ElemType::IntegerFrac
                | ElemType::Bool
                | ElemType::Status
                | ElemType::UtcTime
        )
    }
}

impl TryFrom<u8> for ElemType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            Self::EMPTY => ElemType::Empty,
            Self::INTEGER => ElemType::Integer,
            Self::INTEGER_UNSIGNED => ElemType::IntegerUnsigned,
            Self::INTEGER_FRAC => ElemType::IntegerFrac,
            Self::STRING => ElemType::String,
            Self::BYTE_ARRAY => ElemType::ByteArray,
            Self::BOOL => ElemType::Bool,
            Self::IPV4ADDR => ElemType::Ipv4Addr,
            Self::IPV6ADDR => ElemType::Ipv6Addr,
            Self::MACADDR => ElemType::MacAddr,
            Self::STATUS => ElemType::Status,
            Self::UTC_TIME => ElemType::UtcTime,
            other => return Err(other),
        })
    }
}

impl From<ElemType> for u8 {
    fn from(val: ElemType) -> Self {
        match val {
            ElemType::Empty => ElemType::EMPTY,
            ElemType::Integer => ElemType::INTEGER,
            ElemType::IntegerUnsigned => ElemType::INTEGER_UNSIGNED,
            ElemType::IntegerFrac => ElemType::INTEGER_FRAC,
            ElemType::String => ElemType::STRING,
            ElemType::ByteArray => ElemType::BYTE_ARRAY,
            ElemType::Bool => ElemType::BOOL,
            ElemType::Ipv4Addr => ElemType::IPV4ADDR,
            ElemType::Ipv6Addr => ElemType::IPV6ADDR,
            ElemType::MacAddr => ElemType::MACADDR,
            ElemType::Status => ElemType::STATUS,
            ElemType::UtcTime => ElemType::UTC_TIME,
        }
    }
}

/// A command parameter, ready to be encoded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param<'a> {
    /// Signed integer
    Int(i32),
    /// Unsigned integer
    UInt(u32),
    /// Fixed point candidate
    ///
    /// Encoded as [`ElemType::IntegerFrac`] when the integer part is
    /// greater than one, otherwise as a plain unsigned integer.
    Frac(u32),
    /// Boolean
    Bool(bool),
    /// Status code
    Status(u16),
    /// Seconds since the epoch
    UtcTime(u32),
    /// Text
    Str(&'a str),
    /// Opaque bytes
    Bytes(&'a [u8]),
    /// IPv4 address
    Ipv4([u8; 4]),
    /// IPv6 address
    Ipv6([u8; 16]),
    /// MAC address
    Mac([u8; 6]),
}

impl<'a> Param<'a> {
    fn kind(&self) -> ElemType {
        match self {
            Param::Int(_) => ElemType::Integer,
            Param::UInt(_) => ElemType::IntegerUnsigned,
            Param::Frac(v) if (v >> 16) > 1 => ElemType::IntegerFrac,
            Param::Frac(_) => ElemType::IntegerUnsigned,
            Param::Bool(_) => ElemType::Bool,
            Param::Status(_) => ElemType::Status,
            Param::UtcTime(_) => ElemType::UtcTime,
            Param::Str(_) => ElemType::String,
            Param::Bytes(_) => ElemType::ByteArray,
            Param::Ipv4(_) => ElemType::Ipv4Addr,
            Param::Ipv6(_) => ElemType::Ipv6Addr,
            Param::Mac(_) => ElemType::MacAddr,
        }
    }

    fn data_len(&self) -> usize {
        match self {
            Param::Str(s) => s.len(),
            Param::Bytes(b) => b.len(),
            Param::Ipv4(_) => 4,
            Param::Ipv6(_) => 16,
            Param::Mac(_) => 6,
            _ => 4,
        }
    }

    /// Bytes this parameter occupies on the wire, padding included
    pub fn encoded_len(&self) -> usize {
        ELEM_HDR_SIZE + padded(self.data_len())
    }

    /// Encode into the front of `out`, returning the bytes used
    ///
    /// Returns `None` if `out` is too small or the data is longer than
    /// an element can describe.
    pub fn encode(&self, out: &mut [u8]) -> Option<usize> {
        let len = self.data_len();
        let total = self.encoded_len();
        let len16 = u16::try_from(len).ok()?;
        let out = out.get_mut(..total)?;
        let pad = (total - ELEM_HDR_SIZE - len) as u8;

        out[0] = self.kind().into();
        out[1] = pad & 0b11;
        out[2..4].copy_from_slice(&len16.to_be_bytes());

        let data = &mut out[ELEM_HDR_SIZE..];
        let int = match *self {
            Param::Int(v) => Some(v as u32),
            Param::UInt(v) | Param::Frac(v) | Param::UtcTime(v) => Some(v),
            Param::Bool(v) => Some(v as u32),
            Param::Status(v) => Some(v as u32),
            _ => None,
        };
        match (int, self) {
            (Some(v), _) => data[..4].copy_from_slice(&v.to_be_bytes()),
            (None, Param::Str(s)) => data[..len].copy_from_slice(s.as_bytes()),
            (None, Param::Bytes(b)) => data[..len].copy_from_slice(b),
            (None, Param::Ipv4(a)) => data[..len].copy_from_slice(a),
            (None, Param::Ipv6(a)) => data[..len].copy_from_slice(a),
            (None, Param::Mac(a)) => data[..len].copy_from_slice(a),
            (None, _) => {}
        }
        data[len..].iter_mut().for_each(|b| *b = 0);
        Some(total)
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// A fixed point value read back from an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frac {
    /// Integer part
    pub int: u16,
    /// Fractional part, absent when the element was a plain integer
    pub frac: Option<u16>,
}

/// A single decoded element, borrowing the frame it came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elem<'a> {
    /// The element's declared type
    pub kind: ElemType,
    /// The element's data, padding excluded
    pub data: &'a [u8],
}

impl<'a> Elem<'a> {
    /// Integer value, sign extended only for [`ElemType::Integer`]
    pub fn as_i64(&self) -> Option<i64> {
        if !self.kind.is_int() || self.data.is_empty() || self.data.len() > 8 {
            return None;
        }
        let mut val: u64 = 0;
        for b in self.data {
            val = (val << 8) | *b as u64;
        }
        let bits = self.data.len() * 8;
        let negative = self.kind == ElemType::Integer && (self.data[0] & 0x80) != 0;
        if negative && bits < 64 {
            val |= u64::MAX << bits;
        }
        Some(val as i64)
    }

    /// Integer value truncated to 32 bits
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().map(|v| v as u32)
    }

    /// Integer value truncated to 32 bits, reinterpreted as signed
    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().map(|v| v as i32)
    }

    /// Integer value truncated to 16 bits
    pub fn as_u16(&self) -> Option<u16> {
        self.as_i64().map(|v| v as u16)
    }

    /// Integer value truncated to 8 bits
    pub fn as_u8(&self) -> Option<u8> {
        self.as_i64().map(|v| v as u8)
    }

    /// Any non-zero integer
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|v| v != 0)
    }

    /// Read as a fixed point value
    ///
    /// Fractional elements split into their 16 bit halves. Other integers
    /// are accepted when they fit in 16 bits, with no fractional part.
    pub fn as_frac(&self) -> Option<Frac> {
        let val = self.as_i64()?;
        if self.kind == ElemType::IntegerFrac {
            let val = val as u32;
            return Some(Frac {
                int: (val >> 16) as u16,
                frac: Some(val as u16),
            });
        }
        let int = u16::try_from(val).ok()?;
        Some(Frac { int, frac: None })
    }

    /// Copy a string element into `out`, zero filling the rest
    ///
    /// Fails if the string does not fit.
    pub fn read_str(&self, out: &mut [u8]) -> Option<usize> {
        if self.kind != ElemType::String || self.data.len() > out.len() {
            return None;
        }
        let (head, tail) = out.split_at_mut(self.data.len());
        head.copy_from_slice(self.data);
        tail.iter_mut().for_each(|b| *b = 0);
        Some(self.data.len())
    }

    /// Borrow a string element as text
    pub fn as_str(&self) -> Option<&'a str> {
        if self.kind != ElemType::String {
            return None;
        }
        core::str::from_utf8(self.data).ok()
    }

    /// Copy a non-integer element whose length must equal `out.len()`
    pub fn read_exact(&self, out: &mut [u8]) -> Option<()> {
        if self.kind.is_int() || self.data.len() != out.len() {
            return None;
        }
        out.copy_from_slice(self.data);
        Some(())
    }
}

/// A validated list of elements
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elems<'a> {
    num: u8,
    bytes: &'a [u8],
}

impl<'a> Elems<'a> {
    /// Validate `num` elements packed in `bytes`
    ///
    /// Fails if any element is truncated, carries an unknown type, or if
    /// fewer than `num` elements are present.
    pub fn new(num: u8, bytes: &'a [u8]) -> Option<Self> {
        let mut rest = bytes;
        for _ in 0..num {
            let (_, remain) = split_elem(rest)?;
            rest = remain;
        }
        Some(Self { num, bytes })
    }

    /// An empty list
    pub const fn empty() -> Self {
        Self { num: 0, bytes: &[] }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.num as usize
    }

    /// True if there are no elements
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Element by position
    pub fn get(&self, idx: usize) -> Option<Elem<'a>> {
        self.iter().nth(idx)
    }

    /// Iterate the elements in order
    pub fn iter(&self) -> ElemIter<'a> {
        ElemIter {
            remain: self.num,
            bytes: self.bytes,
        }
    }
}

impl<'a> IntoIterator for Elems<'a> {
    type Item = Elem<'a>;
    type IntoIter = ElemIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over [`Elems`]
pub struct ElemIter<'a> {
    remain: u8,
    bytes: &'a [u8],
}

impl<'a> Iterator for ElemIter<'a> {
    type Item = Elem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remain == 0 {
            return None;
        }
        let (elem, rest) = split_elem(self.bytes)?;
        self.remain -= 1;
        self.bytes = rest;
        Some(elem)
    }
}

fn split_elem(bytes: &[u8]) -> Option<(Elem<'_>, &[u8])> {
    let hdr = bytes.get(..ELEM_HDR_SIZE)?;
    let kind = ElemType::try_from(hdr[0]).ok()?;
    let pad = (hdr[1] & 0b11) as usize;
    let len = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
    let data = bytes.get(ELEM_HDR_SIZE..ELEM_HDR_SIZE + len)?;
    // the final element may arrive without its padding
    let next = (ELEM_HDR_SIZE + len + pad).min(bytes.len());
    Some((Elem { kind, data }, &bytes[next..]))
}

/// Encode `params` back to back into `out`, returning the bytes used
pub fn encode_params(params: &[Param<'_>], out: &mut [u8]) -> Option<usize> {
    let mut used = 0;
    for p in params {
        used += p.encode(out.get_mut(used..)?)?;
    }
    Some(used)
}
