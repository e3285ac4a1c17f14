//! The parameter codec: type tags, spans and typed access to a single parameter.
//!
//! | tag | meaning | value bytes | span |
//! |---|---|---|---|
//! | `b`/`B`/`c` | byte / boolean / char | 1 | 3 |
//! | `i`/`I` | unsigned/signed 16-bit | 2 | 4 |
//! | `l`/`L` | unsigned/signed 32-bit | 4 | 6 |
//! | `s` | short string | 1 length byte + bytes incl. terminator | 3 + len |
//! | `S` | long string | 2 length bytes + bytes incl. terminator | 4 + len |
//! | `t` | short struct | 1 length byte + struct bytes | 3 + len |
//! | `T` | long struct | 2 length bytes + struct bytes | 4 + len |
//!
//! All multi-byte integers are big-endian.

use crate::reader::{LengthKind, StructReader};

/// Size of the `(name, type)` header every parameter starts with.
pub const HEADER_LEN: usize = 2;

/// Supported parameter types, identified on the wire by a single tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Bool,
    Byte,
    Char,
    U16,
    I16,
    U32,
    I32,
    Str,
    LongStr,
    Struct,
    LongStruct,
}

impl ParamType {
    #[inline(always)]
    pub const fn tag(self) -> u8 {
        use ParamType::*;
        match self {
            Bool => b'B',
            Byte => b'b',
            Char => b'c',
            U16 => b'i',
            I16 => b'I',
            U32 => b'l',
            I32 => b'L',
            Str => b's',
            LongStr => b'S',
            Struct => b't',
            LongStruct => b'T',
        }
    }

    /// Returns `None` for tags this codec does not understand.
    #[inline(always)]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        use ParamType::*;
        Some(match tag {
            b'B' => Bool,
            b'b' => Byte,
            b'c' => Char,
            b'i' => U16,
            b'I' => I16,
            b'l' => U32,
            b'L' => I32,
            b's' => Str,
            b'S' => LongStr,
            b't' => Struct,
            b'T' => LongStruct,
            _ => return None,
        })
    }

    /// Size of the length field following the header, for variable length types.
    #[inline(always)]
    const fn length_field(self) -> Option<LengthKind> {
        use ParamType::*;
        match self {
            Str | Struct => Some(LengthKind::Short),
            LongStr | LongStruct => Some(LengthKind::Long),
            _ => None,
        }
    }

    /// Number of value bytes for fixed size types.
    #[inline(always)]
    const fn fixed_len(self) -> Option<usize> {
        use ParamType::*;
        match self {
            Bool | Byte | Char => Some(1),
            U16 | I16 => Some(2),
            U32 | I32 => Some(4),
            _ => None,
        }
    }
}

/// Computes the total number of bytes the parameter starting at `bytes[0]` occupies.
///
/// Returns `None` if the type tag is unsupported or if `bytes` is too short to even
/// hold the header and length field. A `None` here means the rest of the parameter
/// list cannot be located and scanning must stop.
///
/// The returned span is only what the parameter *declares*, it may still run past the
/// end of `bytes`.
#[inline]
pub fn span(bytes: &[u8]) -> Option<usize> {
    let (&[_name, tag], rem) = bytes.split_first_chunk::<HEADER_LEN>()?;
    let ty = ParamType::from_tag(tag)?;

    if let Some(n) = ty.fixed_len() {
        return Some(HEADER_LEN + n);
    }

    match ty.length_field()? {
        LengthKind::Short => {
            let (&[len], _) = rem.split_first_chunk::<1>()?;
            Some(HEADER_LEN + 1 + usize::from(len))
        }
        LengthKind::Long => {
            let (&len, _) = rem.split_first_chunk::<2>()?;
            Some(HEADER_LEN + 2 + usize::from(u16::from_be_bytes(len)))
        }
    }
}

/// A decoded parameter value.
///
/// String values are kept as raw bytes, without their terminator: the wire does not
/// mandate any particular encoding. Struct values are readers over the nested region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Bool(bool),
    Byte(u8),
    Char(u8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    Str(&'a [u8]),
    LongStr(&'a [u8]),
    Struct(StructReader<'a>),
    LongStruct(StructReader<'a>),
}

impl<'a> Value<'a> {
    #[inline(always)]
    pub const fn ty(&self) -> ParamType {
        match self {
            Self::Bool(_) => ParamType::Bool,
            Self::Byte(_) => ParamType::Byte,
            Self::Char(_) => ParamType::Char,
            Self::U16(_) => ParamType::U16,
            Self::I16(_) => ParamType::I16,
            Self::U32(_) => ParamType::U32,
            Self::I32(_) => ParamType::I32,
            Self::Str(_) => ParamType::Str,
            Self::LongStr(_) => ParamType::LongStr,
            Self::Struct(_) => ParamType::Struct,
            Self::LongStruct(_) => ParamType::LongStruct,
        }
    }

    /// Short string value from a `str`.
    #[inline(always)]
    pub const fn str(s: &'a str) -> Self {
        Self::Str(s.as_bytes())
    }

    /// Number of bytes the value occupies after the `(name, type)` header.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Bool(_) | Self::Byte(_) | Self::Char(_) => 1,
            Self::U16(_) | Self::I16(_) => 2,
            Self::U32(_) | Self::I32(_) => 4,
            // length field + bytes + terminator
            Self::Str(s) => 1 + s.len() + 1,
            Self::LongStr(s) => 2 + s.len() + 1,
            // the nested region is re-prefixed according to the parameter type
            Self::Struct(r) => 1 + r.content().len(),
            Self::LongStruct(r) => 2 + r.content().len(),
        }
    }

    /// Largest string a `s`/`S` parameter can carry, terminator excluded.
    #[inline(always)]
    pub const fn max_str_len(ty: ParamType) -> usize {
        match ty {
            ParamType::Str => u8::MAX as usize - 1,
            ParamType::LongStr => u16::MAX as usize - 1,
            _ => 0,
        }
    }
}

/// A view of a single parameter inside a parameter list.
///
/// `bytes` covers exactly the parameter's span, header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param<'a> {
    bytes: &'a [u8],
    ty: ParamType,
    offset: usize,
    index: u8,
}

impl<'a> Param<'a> {
    /// Parses the parameter starting at `region[offset]`.
    ///
    /// `index` is the parameter's position in its list. Returns `None` if the type is
    /// unsupported or if the declared span runs past the end of `region`.
    #[inline]
    pub fn parse(region: &'a [u8], offset: usize, index: u8) -> Option<Self> {
        let rem = region.get(offset..)?;
        let n = span(rem)?;
        let bytes = rem.get(..n)?;
        let ty = ParamType::from_tag(bytes[1])?;

        Some(Self {
            bytes,
            ty,
            offset,
            index,
        })
    }

    #[inline(always)]
    pub const fn name(&self) -> u8 {
        self.bytes[0]
    }

    #[inline(always)]
    pub const fn ty(&self) -> ParamType {
        self.ty
    }

    #[inline(always)]
    pub const fn is_type(&self, ty: ParamType) -> bool {
        self.ty.tag() == ty.tag()
    }

    /// Total number of bytes occupied by this parameter.
    #[inline(always)]
    pub const fn span(&self) -> usize {
        self.bytes.len()
    }

    /// Position of this parameter in the list it was read from.
    #[inline(always)]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Raw bytes of this parameter, header included.
    #[inline(always)]
    pub const fn as_raw(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline(always)]
    fn body(&self) -> &'a [u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// The first `N` value bytes, if the parameter has type `ty`.
    #[inline(always)]
    fn fixed<const N: usize>(&self, ty: ParamType) -> Option<[u8; N]> {
        if !self.is_type(ty) {
            return None;
        }
        self.body().first_chunk::<N>().copied()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.fixed::<1>(ParamType::Bool).map(|[b]| b != 0)
    }

    pub fn as_byte(&self) -> Option<u8> {
        self.fixed::<1>(ParamType::Byte).map(|[b]| b)
    }

    pub fn as_char(&self) -> Option<u8> {
        self.fixed::<1>(ParamType::Char).map(|[b]| b)
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.fixed(ParamType::U16).map(u16::from_be_bytes)
    }

    /// The signed value is the two's complement reading of the unsigned bit pattern.
    pub fn as_i16(&self) -> Option<i16> {
        self.fixed(ParamType::I16).map(i16::from_be_bytes)
    }

    /// Accepts both `l` and `L` parameters.
    pub fn as_u32(&self) -> Option<u32> {
        self.fixed(ParamType::U32)
            .or_else(|| self.fixed(ParamType::I32))
            .map(u32::from_be_bytes)
    }

    /// Accepts both `l` and `L` parameters.
    pub fn as_i32(&self) -> Option<i32> {
        self.as_u32().map(|v| v as i32)
    }

    /// String bytes, without the terminator.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        let skip = match self.ty {
            ParamType::Str => 1,
            ParamType::LongStr => 2,
            _ => return None,
        };

        let s = &self.body()[skip..];
        Some(s.strip_suffix(&[0]).unwrap_or(s))
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| core::str::from_utf8(b).ok())
    }

    /// Binds a struct reader over the nested region of a `t`/`T` parameter.
    pub fn as_struct(&self) -> Option<StructReader<'a>> {
        let kind = match self.ty {
            ParamType::Struct => LengthKind::Short,
            ParamType::LongStruct => LengthKind::Long,
            _ => return None,
        };

        StructReader::new(self.body(), kind)
    }

    /// Decodes the value, whatever its type.
    pub fn value(&self) -> Option<Value<'a>> {
        use ParamType::*;
        Some(match self.ty {
            Bool => Value::Bool(self.as_bool()?),
            Byte => Value::Byte(self.as_byte()?),
            Char => Value::Char(self.as_char()?),
            U16 => Value::U16(self.as_u16()?),
            I16 => Value::I16(self.as_i16()?),
            U32 => Value::U32(self.as_u32()?),
            I32 => Value::I32(self.as_i32()?),
            Str => Value::Str(self.as_bytes()?),
            LongStr => Value::LongStr(self.as_bytes()?),
            Struct => Value::Struct(self.as_struct()?),
            LongStruct => Value::LongStruct(self.as_struct()?),
        })
    }
}
