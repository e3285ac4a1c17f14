//! Zero-copy readers for structs and frames.
//!
//! Both readers share the same parameter list scanner: parameters can only be found
//! by walking the list from the start, one span at a time, since every span depends
//! on the parameter's type. A parameter with an unsupported type, or one that would
//! run past the end of the readable region, ends the walk: nothing after it can be
//! located reliably.

use crate::{Address, param::Param};

/// Size of the length prefix of a struct, selected by the `t`/`T` parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthKind {
    /// 1 byte, up to 255 bytes of content.
    Short,
    /// 2 bytes (big-endian), up to 65535 bytes of content.
    Long,
}

impl LengthKind {
    #[inline(always)]
    pub const fn prefix_len(self) -> usize {
        match self {
            Self::Short => 1,
            Self::Long => 2,
        }
    }

    /// Largest value the prefix can hold.
    #[inline(always)]
    pub const fn max_len(self) -> usize {
        match self {
            Self::Short => u8::MAX as usize,
            Self::Long => u16::MAX as usize,
        }
    }

    /// Reads the prefix at the start of `bytes`.
    #[inline]
    pub fn read(self, bytes: &[u8]) -> Option<usize> {
        match self {
            Self::Short => bytes.first().copied().map(usize::from),
            Self::Long => bytes
                .split_first_chunk()
                .map(|(&b, _)| usize::from(u16::from_be_bytes(b))),
        }
    }
}

/// The sum of all bytes modulo 256.
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A counted sequence of parameters inside `region`, starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParamList<'a> {
    region: &'a [u8],
    start: usize,
    count: u8,
}

impl<'a> ParamList<'a> {
    #[inline(always)]
    fn iter(&self) -> Params<'a> {
        Params {
            region: self.region,
            offset: self.start,
            index: 0,
            count: self.count,
        }
    }

    #[inline]
    fn get(&self, name: u8) -> Option<Param<'a>> {
        self.iter().find(|p| p.name() == name)
    }

    /// Resumes the scan right after `previous`, which must come from this list.
    #[inline]
    fn rest_after(&self, previous: &Param<'a>) -> Option<Params<'a>> {
        // make sure `previous` points into our own region, at a real parameter boundary
        let same = Param::parse(self.region, previous.offset(), previous.index())
            .filter(|p| core::ptr::eq(p.as_raw(), previous.as_raw()))?;

        Some(Params {
            region: self.region,
            offset: same.offset().checked_add(same.span())?,
            index: same.index().checked_add(1)?,
            count: self.count,
        })
    }

    #[inline]
    fn get_after(&self, name: u8, previous: &Param<'a>) -> Option<Param<'a>> {
        self.rest_after(previous)?.find(|p| p.name() == name)
    }

    #[inline]
    fn next(&self, previous: &Param<'a>) -> Option<Param<'a>> {
        self.rest_after(previous)?.next()
    }
}

/// Iterator over a parameter list. Stops early at the first unreadable parameter.
#[derive(Debug, Clone)]
pub struct Params<'a> {
    region: &'a [u8],
    offset: usize,
    index: u8,
    count: u8,
}

impl<'a> Iterator for Params<'a> {
    type Item = Param<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }

        let Some(p) = Param::parse(self.region, self.offset, self.index) else {
            // unsupported type or truncated parameter, nothing after it can be trusted
            self.count = self.index;
            return None;
        };

        self.offset += p.span();
        self.index += 1;

        Some(p)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(usize::from(self.count - self.index)))
    }
}

impl core::iter::FusedIterator for Params<'_> {}

/// Reads a struct: a length prefix, a parameter count, and the parameters.
///
/// The length prefix holds the number of bytes following it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructReader<'a> {
    kind: LengthKind,
    params: ParamList<'a>,
}

impl<'a> StructReader<'a> {
    /// Parses the struct header at the start of `bytes`.
    ///
    /// Returns `None` if the declared length runs past the end of `bytes`, or if
    /// there is no room for the parameter count.
    pub fn new(bytes: &'a [u8], kind: LengthKind) -> Option<Self> {
        let prefix = kind.prefix_len();
        let len = kind.read(bytes)?;
        let region = bytes.get(..prefix.checked_add(len)?)?;
        let &count = region.get(prefix)?;

        Some(Self {
            kind,
            params: ParamList {
                region,
                start: prefix + 1,
                count,
            },
        })
    }

    /// Builds a reader over a region that is already known to be well-formed.
    #[inline(always)]
    pub(crate) const fn from_parts(region: &'a [u8], kind: LengthKind, count: u8) -> Self {
        Self {
            kind,
            params: ParamList {
                region,
                start: kind.prefix_len() + 1,
                count,
            },
        }
    }

    #[inline(always)]
    pub const fn kind(&self) -> LengthKind {
        self.kind
    }

    /// The struct's bytes, without the length prefix.
    #[inline]
    pub fn content(&self) -> &'a [u8] {
        &self.params.region[self.kind.prefix_len()..]
    }

    /// The struct's bytes, length prefix included.
    #[inline(always)]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.params.region
    }

    /// Number of parameters the struct declares.
    #[inline(always)]
    pub const fn param_count(&self) -> u8 {
        self.params.count
    }

    /// First parameter called `name`.
    #[inline]
    pub fn get(&self, name: u8) -> Option<Param<'a>> {
        self.params.get(name)
    }

    /// Next parameter called `name` after `previous`.
    #[inline]
    pub fn get_after(&self, name: u8, previous: &Param<'a>) -> Option<Param<'a>> {
        self.params.get_after(name, previous)
    }

    #[inline]
    pub fn first(&self) -> Option<Param<'a>> {
        self.params.iter().next()
    }

    #[inline]
    pub fn next(&self, previous: &Param<'a>) -> Option<Param<'a>> {
        self.params.next(previous)
    }

    #[inline(always)]
    pub fn iter(&self) -> Params<'a> {
        self.params.iter()
    }
}

/// Reads a frame held in a receive buffer of a given capacity.
///
/// Constructing a reader only parses the header. Call [`is_valid`](Self::is_valid)
/// before trusting anything else in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    capacity: usize,
    declared_len: usize,
    target: &'a [u8],
    source: &'a [u8],
    params: ParamList<'a>,
}

impl<'a> FrameReader<'a> {
    /// Smallest possible frame: length, two 2-byte addresses, count and checksum.
    pub const MIN_LEN: usize = 2 + 1 + 2 + 1 + 2 + 1 + 1;

    /// Parses the frame header at the start of `bytes`.
    ///
    /// `capacity` is the size of the buffer the frame was received into: frames
    /// declaring a greater length are never valid.
    ///
    /// Returns `None` if the header itself does not fit in `bytes`.
    pub fn new(bytes: &'a [u8], capacity: usize) -> Option<Self> {
        let (&len, rem) = bytes.split_first_chunk::<2>()?;
        let declared_len = usize::from(u16::from_be_bytes(len));

        let (&target_len, rem) = rem.split_first()?;
        let (target, rem) = rem.split_at_checked(target_len.into())?;

        let (&source_len, rem) = rem.split_first()?;
        let (source, rem) = rem.split_at_checked(source_len.into())?;

        let (&count, _) = rem.split_first()?;

        let start = bytes.len() - rem.len() + 1;

        // parameters stop right before the checksum, unless the declared length is
        // unusable, in which case we still keep every access inside `bytes`
        let end = declared_len
            .checked_sub(1)
            .filter(|&end| end >= start && end <= bytes.len())
            .unwrap_or(bytes.len());

        Some(Self {
            bytes,
            capacity,
            declared_len,
            target,
            source,
            params: ParamList {
                region: &bytes[..end],
                start,
                count,
            },
        })
    }

    /// Length declared in the frame header.
    #[inline(always)]
    pub const fn declared_len(&self) -> usize {
        self.declared_len
    }

    /// Checks that the declared length fits both the receive buffer and the bytes we
    /// actually have, and that the checksum matches.
    pub fn is_valid(&self) -> bool {
        let len = self.declared_len;

        if len > self.capacity || len > self.bytes.len() || len <= self.params.start {
            return false;
        }

        let (body, sum) = self.bytes[..len].split_at(len - 1);

        checksum(body) == sum[0]
    }

    /// The frame's bytes, as declared by its header. `None` if the frame is invalid.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        self.is_valid().then(|| &self.bytes[..self.declared_len])
    }

    /// `true` if the frame is broadcast, or targeted at `address`.
    pub fn is_for_me(&self, address: Address) -> bool {
        self.target == Address::BROADCAST.to_bytes().as_slice()
            || self.target == address.to_bytes().as_slice()
    }

    #[inline]
    pub fn target(&self) -> Option<Address> {
        self.target.try_into().ok().map(Address::from_bytes)
    }

    #[inline]
    pub fn sender(&self) -> Option<Address> {
        self.source.try_into().ok().map(Address::from_bytes)
    }

    #[inline(always)]
    pub const fn param_count(&self) -> u8 {
        self.params.count
    }

    #[inline]
    pub fn get(&self, name: u8) -> Option<Param<'a>> {
        self.params.get(name)
    }

    #[inline]
    pub fn get_after(&self, name: u8, previous: &Param<'a>) -> Option<Param<'a>> {
        self.params.get_after(name, previous)
    }

    #[inline]
    pub fn first(&self) -> Option<Param<'a>> {
        self.params.iter().next()
    }

    #[inline]
    pub fn next(&self, previous: &Param<'a>) -> Option<Param<'a>> {
        self.params.next(previous)
    }

    #[inline(always)]
    pub fn iter(&self) -> Params<'a> {
        self.params.iter()
    }

    #[inline]
    pub fn subject(&self) -> Option<Param<'a>> {
        self.get(crate::names::SUBJECT)
    }

    #[inline]
    pub fn command(&self) -> Option<Param<'a>> {
        self.get(crate::names::COMMAND)
    }

    pub fn is_subject(&self, subject: u8) -> bool {
        self.subject().and_then(|p| p.as_char()) == Some(subject)
    }

    pub fn is_command(&self, command: u8) -> bool {
        self.command().and_then(|p| p.as_char()) == Some(command)
    }

    pub fn is_subject_and_command(&self, subject: u8, command: u8) -> bool {
        self.is_subject(subject) && self.is_command(command)
    }
}
