//! Builders writing structs and frames into caller-owned buffers.
//!
//! Every `add` either writes the whole parameter and bumps the parameter count, or
//! fails with a [`CapacityError`] and leaves the builder untouched.

use crate::{
    Address, CapacityError, names,
    param::{ParamType, Value},
    reader::{LengthKind, StructReader, checksum},
};

/// Shared parameter-list writer.
///
/// `limit` is the first index we are not allowed to write to, `count_pos` the index
/// of the parameter count byte.
#[derive(Debug)]
struct ParamWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    limit: usize,
    count_pos: usize,
}

impl<'a> ParamWriter<'a> {
    #[inline(always)]
    fn available(&self) -> usize {
        self.limit - self.pos
    }

    #[inline]
    fn push(&mut self, bytes: &[u8]) -> Result<(), CapacityError> {
        let available = self.available();

        if bytes.len() > available {
            return Err(CapacityError {
                needed: bytes.len(),
                available,
            });
        }

        let end = self.pos + bytes.len();
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    #[inline(always)]
    fn count(&self) -> u8 {
        self.buf[self.count_pos]
    }

    fn write_value(&mut self, name: u8, value: &Value) -> Result<(), CapacityError> {
        let ty = value.ty();

        // fail early, without writing anything, when the value can't possibly fit
        let needed = crate::param::HEADER_LEN + value.encoded_len();
        if needed > self.available() {
            return Err(CapacityError {
                needed,
                available: self.available(),
            });
        }

        self.push(&[name, ty.tag()])?;

        match *value {
            Value::Bool(b) => self.push(&[u8::from(b)]),
            Value::Byte(b) | Value::Char(b) => self.push(&[b]),
            Value::U16(v) => self.push(&v.to_be_bytes()),
            Value::I16(v) => self.push(&v.to_be_bytes()),
            Value::U32(v) => self.push(&v.to_be_bytes()),
            Value::I32(v) => self.push(&v.to_be_bytes()),
            Value::Str(s) | Value::LongStr(s) => {
                let max = Value::max_str_len(ty);
                if s.len() > max {
                    return Err(CapacityError {
                        needed: s.len(),
                        available: max,
                    });
                }

                // the length field counts the terminator
                let len = s.len() + 1;
                if ty == ParamType::Str {
                    self.push(&[len as u8])?;
                } else {
                    self.push(&(len as u16).to_be_bytes())?;
                }
                self.push(s)?;
                self.push(&[0])
            }
            Value::Struct(r) | Value::LongStruct(r) => {
                let content = r.content();
                let kind = if ty == ParamType::Struct {
                    LengthKind::Short
                } else {
                    LengthKind::Long
                };

                if content.len() > kind.max_len() {
                    return Err(CapacityError {
                        needed: content.len(),
                        available: kind.max_len(),
                    });
                }

                match kind {
                    LengthKind::Short => self.push(&[content.len() as u8])?,
                    LengthKind::Long => self.push(&(content.len() as u16).to_be_bytes())?,
                }
                self.push(content)
            }
        }
    }

    fn add(&mut self, name: u8, value: Value) -> Result<(), CapacityError> {
        let count = self.count();

        if count == u8::MAX {
            return Err(CapacityError {
                needed: 1,
                available: 0,
            });
        }

        let mark = self.pos;

        match self.write_value(name, &value) {
            Ok(()) => {
                self.buf[self.count_pos] = count + 1;
                Ok(())
            }
            Err(e) => {
                self.pos = mark;
                Err(e)
            }
        }
    }
}

/// Builds a struct: a length prefix, a parameter count, and parameters.
///
/// A finished struct is added to a frame (or to another struct) with
/// [`Value::Struct`] or [`Value::LongStruct`].
#[derive(Debug)]
pub struct StructBuilder<'a> {
    kind: LengthKind,
    w: ParamWriter<'a>,
}

impl<'a> StructBuilder<'a> {
    /// Starts an empty struct at the beginning of `buf`.
    ///
    /// The struct never grows past what its length prefix can describe, however big
    /// `buf` is.
    pub fn new(buf: &'a mut [u8], kind: LengthKind) -> Result<Self, CapacityError> {
        let prefix = kind.prefix_len();
        let header = prefix + 1;

        if buf.len() < header {
            return Err(CapacityError {
                needed: header,
                available: buf.len(),
            });
        }

        buf[..header].fill(0);
        let limit = buf.len().min(prefix + kind.max_len());

        Ok(Self {
            kind,
            w: ParamWriter {
                buf,
                pos: header,
                limit,
                count_pos: prefix,
            },
        })
    }

    #[inline(always)]
    pub const fn kind(&self) -> LengthKind {
        self.kind
    }

    #[inline(always)]
    pub fn param_count(&self) -> u8 {
        self.w.count()
    }

    /// Bytes written so far, length prefix included.
    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.w.pos
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.w.pos == self.kind.prefix_len() + 1
    }

    /// Appends a parameter.
    #[inline]
    pub fn add(&mut self, name: u8, value: Value) -> Result<(), CapacityError> {
        self.w.add(name, value)
    }

    /// Appends a short string parameter.
    #[inline]
    pub fn add_str(&mut self, name: u8, s: &str) -> Result<(), CapacityError> {
        self.add(name, Value::str(s))
    }

    /// Writes the length prefix and returns a reader over the finished struct.
    ///
    /// The builder stays usable: adding more parameters and finishing again is fine.
    pub fn finish(&mut self) -> StructReader<'_> {
        let prefix = self.kind.prefix_len();
        let len = self.w.pos - prefix;

        // `limit` keeps `len` within what the prefix can hold
        match self.kind {
            LengthKind::Short => self.w.buf[0] = len as u8,
            LengthKind::Long => self.w.buf[..2].copy_from_slice(&(len as u16).to_be_bytes()),
        }

        let count = self.w.count();
        StructReader::from_parts(&self.w.buf[..self.w.pos], self.kind, count)
    }
}

/// Builds a frame, starting with its addresses, subject and command.
///
/// The last byte of the buffer is always kept free for the checksum, written by
/// [`finish`](Self::finish) together with the total length.
#[derive(Debug)]
pub struct FrameBuilder<'a> {
    w: ParamWriter<'a>,
}

impl<'a> FrameBuilder<'a> {
    /// Length, both address length bytes and addresses, count, subject, command and
    /// checksum.
    pub const MIN_LEN: usize = 2 + 1 + 2 + 1 + 2 + 1 + 3 + 3 + 1;

    /// Starts a frame at the beginning of `buf`.
    pub fn new(
        buf: &'a mut [u8],
        source: Address,
        target: Address,
        subject: u8,
        command: u8,
    ) -> Result<Self, CapacityError> {
        // the length field can't describe more than this
        let limit = buf.len().min(usize::from(u16::MAX)).saturating_sub(1);

        let mut b = Self {
            w: ParamWriter {
                buf,
                pos: 0,
                limit,
                count_pos: 0,
            },
        };

        b.reset(source, target, subject, command)?;
        Ok(b)
    }

    /// Discards everything written so far and starts a new frame in the same buffer.
    pub fn reset(
        &mut self,
        source: Address,
        target: Address,
        subject: u8,
        command: u8,
    ) -> Result<(), CapacityError> {
        let available = self.w.limit + 1;
        if available < Self::MIN_LEN {
            return Err(CapacityError {
                needed: Self::MIN_LEN,
                available,
            });
        }

        self.w.pos = 0;
        self.w.push(&[0, 0, Address::LEN])?;
        self.w.push(&target.to_bytes())?;
        self.w.push(&[Address::LEN])?;
        self.w.push(&source.to_bytes())?;
        self.w.count_pos = self.w.pos;
        self.w.push(&[0])?;

        self.w.add(names::SUBJECT, Value::Char(subject))?;
        self.w.add(names::COMMAND, Value::Char(command))
    }

    #[inline(always)]
    pub fn target(&self) -> Address {
        Address::from_bytes([self.w.buf[3], self.w.buf[4]])
    }

    #[inline(always)]
    pub fn source(&self) -> Address {
        Address::from_bytes([self.w.buf[6], self.w.buf[7]])
    }

    #[inline(always)]
    pub fn param_count(&self) -> u8 {
        self.w.count()
    }

    /// Length of the frame once finished, checksum included.
    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.w.pos + 1
    }

    /// Appends a parameter.
    #[inline]
    pub fn add(&mut self, name: u8, value: Value) -> Result<(), CapacityError> {
        self.w.add(name, value)
    }

    /// Appends a short string parameter.
    #[inline]
    pub fn add_str(&mut self, name: u8, s: &str) -> Result<(), CapacityError> {
        self.add(name, Value::str(s))
    }

    /// Writes the total length and checksum, and returns the finished frame.
    ///
    /// The builder stays usable: adding more parameters and finishing again is fine.
    pub fn finish(&mut self) -> &[u8] {
        let end = self.w.pos;
        let total = end + 1;

        // `limit` keeps `total` within the length field and the buffer
        self.w.buf[..2].copy_from_slice(&(total as u16).to_be_bytes());
        self.w.buf[end] = checksum(&self.w.buf[..end]);

        &self.w.buf[..total]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{param::span, reader::FrameReader};

    const NODE: Address = Address(0x1234);

    #[test]
    fn poll_frame_layout() {
        let mut buf = [0; 60];
        let mut b = FrameBuilder::new(&mut buf, Address::MASTER, NODE, b'n', b'p').unwrap();
        let frame = b.finish();

        assert_eq!(
            frame,
            &[
                0x00, 0x10, 0x02, 0x12, 0x34, 0x02, 0x00, 0x01, 0x02, b's', b'c', b'n', b'c', b'c',
                b'p', 0xD7
            ]
        );
        assert_eq!(checksum(&frame[..15]), frame[15]);
    }

    #[test]
    fn finished_frame_reads_back() {
        let mut buf = [0; 60];
        let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
        b.add(b'a', Value::U16(0xBEEF)).unwrap();
        b.add(b'b', Value::I32(-5)).unwrap();
        b.add_str(b'h', "hi").unwrap();
        b.add(b'd', Value::Bool(true)).unwrap();

        let frame = b.finish();
        let r = FrameReader::new(frame, 60).unwrap();

        assert!(r.is_valid());
        assert_eq!(r.sender(), Some(NODE));
        assert!(r.is_for_me(Address::MASTER));
        assert!(r.is_subject_and_command(b'x', b'y'));
        assert_eq!(r.param_count(), 6);
        assert_eq!(r.get(b'a').and_then(|p| p.as_u16()), Some(0xBEEF));
        assert_eq!(r.get(b'b').and_then(|p| p.as_i32()), Some(-5));
        assert_eq!(r.get(b'h').and_then(|p| p.as_str()), Some("hi"));
        assert_eq!(r.get(b'd').and_then(|p| p.as_bool()), Some(true));
    }

    #[test]
    fn any_flipped_byte_is_detected() {
        let mut buf = [0; 60];
        let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
        b.add(b'a', Value::U32(0xDEAD_BEEF)).unwrap();
        let len = b.len();
        b.finish();

        for i in 0..len {
            let mut copy = buf;
            copy[i] ^= 0x01;
            let valid = FrameReader::new(&copy[..len], 60).is_some_and(|r| r.is_valid());
            assert!(!valid, "flip at {i} went unnoticed");
        }
    }

    #[test]
    fn failed_add_leaves_the_frame_untouched() {
        let mut buf = [0; 20];
        let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
        assert_eq!(b.len(), 16);

        // 3 bytes fit, 8 don't
        b.add(b'a', Value::Byte(7)).unwrap();
        let err = b.add_str(b'b', "abcd").unwrap_err();
        assert_eq!(err.available, 1);
        assert_eq!(b.len(), 19);
        assert_eq!(b.param_count(), 3);

        let frame = b.finish();
        assert_eq!(frame.len(), 19);
        assert!(FrameReader::new(frame, 20).unwrap().is_valid());
    }

    #[test]
    fn checksum_space_is_required() {
        let mut buf = [0; FrameBuilder::MIN_LEN - 1];
        assert!(FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').is_err());

        let mut buf = [0; FrameBuilder::MIN_LEN];
        let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
        assert_eq!(b.finish().len(), FrameBuilder::MIN_LEN);
        assert!(b.add(b'a', Value::Bool(false)).is_err());
    }

    #[test]
    fn reset_reuses_the_buffer() {
        let mut buf = [0; 60];
        let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
        b.add_str(b'q', "something long").unwrap();

        b.reset(NODE, Address::BROADCAST, b'n', b'p').unwrap();
        assert_eq!(b.param_count(), 2);
        assert_eq!(b.target(), Address::BROADCAST);
        assert_eq!(b.source(), NODE);

        let frame = b.finish();
        let r = FrameReader::new(frame, 60).unwrap();
        assert!(r.is_valid());
        assert!(r.get(b'q').is_none());
    }

    #[test]
    fn nested_structs() {
        let mut inner_buf = [0; 32];
        let mut inner = StructBuilder::new(&mut inner_buf, LengthKind::Short).unwrap();
        inner.add(b'x', Value::U16(1)).unwrap();
        inner.add_str(b'y', "ok").unwrap();

        let mut buf = [0; 60];
        let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
        b.add(b't', Value::Struct(inner.finish())).unwrap();
        b.add(b'T', Value::LongStruct(inner.finish())).unwrap();

        let frame = b.finish();
        let r = FrameReader::new(frame, 60).unwrap();
        assert!(r.is_valid());

        for name in [b't', b'T'] {
            let s = r.get(name).and_then(|p| p.as_struct()).unwrap();
            assert_eq!(s.param_count(), 2);
            assert_eq!(s.get(b'x').and_then(|p| p.as_u16()), Some(1));
            assert_eq!(s.get(b'y').and_then(|p| p.as_str()), Some("ok"));
        }

        let t = r.get(b't').unwrap();
        let long = r.get(b'T').unwrap();
        assert_eq!(long.span(), t.span() + 1);
    }

    #[test]
    fn every_type_decodes_to_what_was_written() {
        let mut short_buf = [0; 16];
        let mut short = StructBuilder::new(&mut short_buf, LengthKind::Short).unwrap();
        short.add(b'x', Value::U16(7)).unwrap();

        let mut long_buf = [0; 16];
        let mut long = StructBuilder::new(&mut long_buf, LengthKind::Long).unwrap();
        long.add_str(b'y', "in").unwrap();

        let values = [
            Value::Bool(true),
            Value::Byte(0xA5),
            Value::Char(b'q'),
            Value::U16(0xBEEF),
            Value::I16(-300),
            Value::U32(0xDEAD_BEEF),
            Value::I32(-70_000),
            Value::Str(b"hi"),
            Value::LongStr(b"longer"),
            Value::Struct(short.finish()),
            Value::LongStruct(long.finish()),
        ];

        let mut buf = [0; 128];
        let mut s = StructBuilder::new(&mut buf, LengthKind::Long).unwrap();
        let mut written = [0; 11];

        for (i, v) in values.iter().enumerate() {
            let before = s.len();
            s.add(b'a' + i as u8, *v).unwrap();
            written[i] = s.len() - before;
        }

        let r = s.finish();
        assert_eq!(r.iter().count(), values.len());

        for (i, (v, p)) in values.iter().zip(r.iter()).enumerate() {
            assert_eq!(p.name(), b'a' + i as u8);
            assert_eq!(p.ty(), v.ty());
            assert_eq!(p.span(), written[i], "span of {:?}", v.ty());
            assert_eq!(span(p.as_raw()), Some(written[i]));
            assert_eq!(p.value().as_ref(), Some(v));
        }
    }

    #[test]
    fn struct_length_prefix_counts_following_bytes() {
        let mut buf = [0; 16];
        let mut s = StructBuilder::new(&mut buf, LengthKind::Short).unwrap();
        assert!(s.is_empty());
        s.add(b'a', Value::Char(b'z')).unwrap();

        let r = s.finish();
        assert_eq!(r.as_bytes(), &[4, 1, b'a', b'c', b'z']);
    }

    #[test]
    fn short_struct_never_outgrows_its_prefix() {
        let mut buf = [0; 1024];
        let mut s = StructBuilder::new(&mut buf, LengthKind::Short).unwrap();

        let long = [b'a'; 200];
        s.add(b'a', Value::Str(&long)).unwrap();
        assert!(s.add(b'b', Value::Str(&long)).is_err());

        let r = s.finish();
        assert_eq!(usize::from(r.as_bytes()[0]), r.as_bytes().len() - 1);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut buf = [0; 1024];
        let mut s = StructBuilder::new(&mut buf, LengthKind::Long).unwrap();

        let long = [b'a'; 255];
        assert!(s.add(b'a', Value::Str(&long)).is_err());
        assert_eq!(s.param_count(), 0);
        s.add(b'a', Value::LongStr(&long)).unwrap();
        assert_eq!(s.param_count(), 1);
    }

    #[test]
    fn random_frames_round_trip() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let mut buf = [0; 60];
            let mut b = FrameBuilder::new(&mut buf, NODE, Address::MASTER, b'x', b'y').unwrap();
            let mut expected = [0u16; 8];
            let mut added = 0;

            for (i, slot) in expected.iter_mut().enumerate() {
                let v = rng.r#gen::<u16>();
                if b.add(b'0' + i as u8, Value::U16(v)).is_ok() {
                    *slot = v;
                    added += 1;
                }
            }

            let frame = b.finish();
            let r = FrameReader::new(frame, 60).unwrap();
            assert!(r.is_valid());

            for (i, v) in expected.iter().take(added).enumerate() {
                assert_eq!(r.get(b'0' + i as u8).and_then(|p| p.as_u16()), Some(*v));
            }
        }
    }
}
