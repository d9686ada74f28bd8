//! Pack binary codec.
//!
//! A pack is an ordered stream of tagged fields within nestable containers.
//! Fields carry a type, a strictly increasing id within their container, and
//! a value. The format is schema-less and forward compatible: ids are stored
//! as deltas from the previous field, so unwritten ids (NULLs) cost nothing,
//! and readers ignore ids they do not ask for.
//!
//! Each field begins with a one byte tag. The high nibble holds the type,
//! the low nibble varies by type class:
//!
//! * integer types: bit 3 set means the value fits in the tag, with bit 2
//!   holding the single value bit and bits 1-0 two low bits of the id delta.
//!   With bit 3 clear the value follows as a varint, bit 2 signals that more
//!   id delta bits follow as a varint, and bits 1-0 again hold the delta low
//!   bits.
//! * bool/bin/str: bit 3 holds the value (or nonempty) bit, bit 2 signals
//!   more id delta bits, bits 1-0 hold the delta low bits. Nonempty bin/str
//!   fields are followed by a varint length and the raw bytes.
//! * array/obj: bit 3 signals more id delta bits, bits 2-0 hold three low
//!   bits of the delta. Container contents follow, closed by a zero byte.
//!
//! The id delta stored is `id - previous id - 1`. Signed integers are
//! zig-zag encoded before varint packing. A zero tag byte ends a container;
//! the root container is terminated the same way by `finish()`.

use anyhow::Error;

use crate::error::{vault_err, ErrorClass};

/// Wire type identifiers (tag high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    Unknown = 0,
    Array = 1,
    Bool = 2,
    Bin = 3,
    I32 = 4,
    I64 = 5,
    Obj = 6,
    Ptr = 7,
    Str = 8,
    Time = 9,
    U32 = 10,
    U64 = 11,
}

impl PackType {
    fn from_nibble(nibble: u8) -> Result<PackType, Error> {
        Ok(match nibble {
            0 => PackType::Unknown,
            1 => PackType::Array,
            2 => PackType::Bool,
            3 => PackType::Bin,
            4 => PackType::I32,
            5 => PackType::I64,
            6 => PackType::Obj,
            7 => PackType::Ptr,
            8 => PackType::Str,
            9 => PackType::Time,
            10 => PackType::U32,
            11 => PackType::U64,
            _ => return Err(pack_format_err(&format!("invalid pack type {}", nibble))),
        })
    }

    fn integer(self) -> bool {
        matches!(
            self,
            PackType::I32 | PackType::I64 | PackType::Time | PackType::U32 | PackType::U64
        )
    }

    fn container(self) -> bool {
        matches!(self, PackType::Array | PackType::Obj)
    }
}

fn pack_format_err(msg: &str) -> Error {
    vault_err(ErrorClass::Format, msg)
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn varint_write(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

struct WriteFrame {
    id_last: u32,
    null_total: u32,
}

/// Pack writer. Fields are written with implicit sequential ids unless an
/// explicit id is given; NULL gaps are free.
pub struct PackWrite {
    buf: Vec<u8>,
    stack: Vec<WriteFrame>,
}

impl PackWrite {
    pub fn new() -> Self {
        PackWrite {
            buf: Vec::new(),
            stack: vec![WriteFrame { id_last: 0, null_total: 0 }],
        }
    }

    fn frame_mut(&mut self) -> &mut WriteFrame {
        self.stack.last_mut().unwrap()
    }

    // Resolve the field id: implicit ids advance past any pending NULLs,
    // explicit ids must keep the container strictly ascending.
    fn field_id(&mut self, id: Option<u32>) -> Result<u32, Error> {
        let frame = self.frame_mut();
        let minimum = frame.id_last + frame.null_total + 1;

        let id = match id {
            None => minimum,
            Some(id) => {
                if id < minimum {
                    return Err(pack_format_err(&format!(
                        "field id {} is not greater than last id {}",
                        id, frame.id_last
                    )));
                }
                id
            }
        };

        frame.null_total = 0;
        Ok(id)
    }

    // Write a tag byte plus any id delta / value varints.
    fn tag_write(&mut self, ty: PackType, id: u32, value: Option<u64>) {
        let delta = id - self.stack.last().unwrap().id_last - 1;

        match ty {
            ty if ty.container() => {
                let more = delta >> 3;
                let mut tag = (ty as u8) << 4 | (delta & 0x7) as u8;
                if more != 0 {
                    tag |= 0x8;
                }
                self.buf.push(tag);
                if more != 0 {
                    varint_write(&mut self.buf, more as u64);
                }
            }
            ty if ty.integer() => {
                let value = value.unwrap();

                if value <= 1 && delta <= 3 {
                    // Value and delta both fit in the tag.
                    let tag = (ty as u8) << 4 | 0x8 | (value as u8) << 2 | delta as u8;
                    self.buf.push(tag);
                } else {
                    let more = delta >> 2;
                    let mut tag = (ty as u8) << 4 | (delta & 0x3) as u8;
                    if more != 0 {
                        tag |= 0x4;
                    }
                    self.buf.push(tag);
                    if more != 0 {
                        varint_write(&mut self.buf, more as u64);
                    }
                    varint_write(&mut self.buf, value);
                }
            }
            _ => {
                // Single bit value types (bool, bin, str). The caller
                // appends any length/data bytes itself.
                let bit = value.unwrap() != 0;
                let more = delta >> 2;
                let mut tag = (ty as u8) << 4 | (delta & 0x3) as u8;
                if bit {
                    tag |= 0x8;
                }
                if more != 0 {
                    tag |= 0x4;
                }
                self.buf.push(tag);
                if more != 0 {
                    varint_write(&mut self.buf, more as u64);
                }
            }
        }

        self.stack.last_mut().unwrap().id_last = id;
    }

    fn put_int(&mut self, ty: PackType, id: Option<u32>, value: u64) -> Result<(), Error> {
        let id = self.field_id(id)?;
        self.tag_write(ty, id, Some(value));
        Ok(())
    }

    /// Record a NULL: the next implicit field id skips past it.
    pub fn write_null(&mut self) {
        self.frame_mut().null_total += 1;
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        self.put_int(PackType::U64, None, value)
    }

    pub fn write_u64_at(&mut self, id: u32, value: u64) -> Result<(), Error> {
        self.put_int(PackType::U64, Some(id), value)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.put_int(PackType::U32, None, value as u64)
    }

    pub fn write_u32_at(&mut self, id: u32, value: u32) -> Result<(), Error> {
        self.put_int(PackType::U32, Some(id), value as u64)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), Error> {
        self.put_int(PackType::I64, None, zigzag_encode(value))
    }

    pub fn write_i64_at(&mut self, id: u32, value: i64) -> Result<(), Error> {
        self.put_int(PackType::I64, Some(id), zigzag_encode(value))
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), Error> {
        self.put_int(PackType::I32, None, zigzag_encode(value as i64))
    }

    pub fn write_i32_at(&mut self, id: u32, value: i32) -> Result<(), Error> {
        self.put_int(PackType::I32, Some(id), zigzag_encode(value as i64))
    }

    /// Unix epoch seconds, zig-zag packed so pre-epoch times stay small.
    pub fn write_time(&mut self, value: i64) -> Result<(), Error> {
        self.put_int(PackType::Time, None, zigzag_encode(value))
    }

    pub fn write_time_at(&mut self, id: u32, value: i64) -> Result<(), Error> {
        self.put_int(PackType::Time, Some(id), zigzag_encode(value))
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), Error> {
        self.write_bool_at_opt(None, value)
    }

    pub fn write_bool_at(&mut self, id: u32, value: bool) -> Result<(), Error> {
        self.write_bool_at_opt(Some(id), value)
    }

    fn write_bool_at_opt(&mut self, id: Option<u32>, value: bool) -> Result<(), Error> {
        let id = self.field_id(id)?;
        self.tag_write(PackType::Bool, id, Some(value as u64));
        Ok(())
    }

    pub fn write_str(&mut self, value: &str) -> Result<(), Error> {
        self.write_sized(PackType::Str, None, value.as_bytes())
    }

    pub fn write_str_at(&mut self, id: u32, value: &str) -> Result<(), Error> {
        self.write_sized(PackType::Str, Some(id), value.as_bytes())
    }

    pub fn write_bin(&mut self, value: &[u8]) -> Result<(), Error> {
        self.write_sized(PackType::Bin, None, value)
    }

    pub fn write_bin_at(&mut self, id: u32, value: &[u8]) -> Result<(), Error> {
        self.write_sized(PackType::Bin, Some(id), value)
    }

    fn write_sized(&mut self, ty: PackType, id: Option<u32>, data: &[u8]) -> Result<(), Error> {
        let id = self.field_id(id)?;
        self.tag_write(ty, id, Some(!data.is_empty() as u64));

        if !data.is_empty() {
            varint_write(&mut self.buf, data.len() as u64);
            self.buf.extend_from_slice(data);
        }

        Ok(())
    }

    /// Skip a field when the value equals its default, NULL-compressing it.
    pub fn write_u64_dflt(&mut self, value: u64, dflt: u64) -> Result<(), Error> {
        if value == dflt {
            self.write_null();
            Ok(())
        } else {
            self.write_u64(value)
        }
    }

    pub fn write_bool_dflt(&mut self, value: bool, dflt: bool) -> Result<(), Error> {
        if value == dflt {
            self.write_null();
            Ok(())
        } else {
            self.write_bool(value)
        }
    }

    pub fn write_str_dflt(&mut self, value: &str, dflt: &str) -> Result<(), Error> {
        if value == dflt {
            self.write_null();
            Ok(())
        } else {
            self.write_str(value)
        }
    }

    pub fn begin_obj(&mut self) -> Result<(), Error> {
        self.begin_container(PackType::Obj, None)
    }

    pub fn begin_obj_at(&mut self, id: u32) -> Result<(), Error> {
        self.begin_container(PackType::Obj, Some(id))
    }

    pub fn begin_array(&mut self) -> Result<(), Error> {
        self.begin_container(PackType::Array, None)
    }

    pub fn begin_array_at(&mut self, id: u32) -> Result<(), Error> {
        self.begin_container(PackType::Array, Some(id))
    }

    fn begin_container(&mut self, ty: PackType, id: Option<u32>) -> Result<(), Error> {
        let id = self.field_id(id)?;
        self.tag_write(ty, id, None);
        self.stack.push(WriteFrame { id_last: 0, null_total: 0 });
        Ok(())
    }

    /// Close the current container with the zero terminator.
    pub fn end(&mut self) -> Result<(), Error> {
        if self.stack.len() < 2 {
            return Err(pack_format_err("no container open"));
        }
        self.stack.pop();
        self.buf.push(0);
        Ok(())
    }

    /// Terminate the root container and return the encoded bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        if self.stack.len() != 1 {
            return Err(pack_format_err("unclosed container at pack end"));
        }
        self.buf.push(0);
        Ok(self.buf)
    }
}

impl Default for PackWrite {
    fn default() -> Self {
        Self::new()
    }
}

// A parsed tag whose value bytes have not been consumed yet.
struct Tag {
    ty: PackType,
    id: u32,
    // Single value bit for integers with the value in the tag, the value
    // for bool, the nonempty flag for bin/str.
    bit: bool,
    // Integer value stored in the tag (no varint follows).
    in_tag: bool,
}

struct ReadFrame {
    id_last: u32,
    done: bool,
}

/// Pack reader with random access by ascending id within the current
/// container. Reading id N consumes and discards any unread fields with
/// smaller ids; an id that was never written reads as NULL.
pub struct PackRead<'a> {
    buf: &'a [u8],
    pos: usize,
    stack: Vec<ReadFrame>,
    pending: Option<Tag>,
}

impl<'a> PackRead<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PackRead {
            buf,
            pos: 0,
            stack: vec![ReadFrame { id_last: 0, done: false }],
            pending: None,
        }
    }

    fn take_byte(&mut self) -> Result<u8, Error> {
        if self.pos >= self.buf.len() {
            return Err(pack_format_err("unexpected end of pack"));
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn varint_read(&mut self) -> Result<u64, Error> {
        let mut value: u64 = 0;
        let mut shift = 0;

        loop {
            let byte = self.take_byte()?;
            if shift >= 64 {
                return Err(pack_format_err("varint too large"));
            }
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        Ok(value)
    }

    // Parse the next tag in the current container without consuming the
    // value bytes, returning its (id, type). None at the container
    // terminator.
    fn tag_next(&mut self) -> Result<Option<(u32, PackType)>, Error> {
        if let Some(tag) = &self.pending {
            return Ok(Some((tag.id, tag.ty)));
        }
        if self.stack.last().unwrap().done {
            return Ok(None);
        }

        let tag = self.take_byte()?;
        if tag == 0 {
            self.stack.last_mut().unwrap().done = true;
            return Ok(None);
        }

        let ty = PackType::from_nibble(tag >> 4)?;
        if ty == PackType::Ptr {
            return Err(pack_format_err("ptr fields are not valid in a pack stream"));
        }

        let (delta, bit, in_tag) = if ty.container() {
            let mut delta = (tag & 0x7) as u64;
            if tag & 0x8 != 0 {
                delta |= self.varint_read()? << 3;
            }
            (delta, false, false)
        } else if ty.integer() {
            if tag & 0x8 != 0 {
                // Single bit value in the tag.
                ((tag & 0x3) as u64, tag & 0x4 != 0, true)
            } else {
                let mut delta = (tag & 0x3) as u64;
                if tag & 0x4 != 0 {
                    delta |= self.varint_read()? << 2;
                }
                (delta, false, false)
            }
        } else {
            let mut delta = (tag & 0x3) as u64;
            if tag & 0x4 != 0 {
                delta |= self.varint_read()? << 2;
            }
            (delta, tag & 0x8 != 0, false)
        };

        let id = self.stack.last().unwrap().id_last + delta as u32 + 1;
        self.pending = Some(Tag { ty, id, bit, in_tag });
        Ok(Some((id, ty)))
    }

    // Consume the pending tag's value bytes and discard them.
    fn skip_pending(&mut self) -> Result<(), Error> {
        let tag = self.pending.take().unwrap();
        self.stack.last_mut().unwrap().id_last = tag.id;

        match tag.ty {
            ty if ty.container() => {
                // Recurse through the container contents.
                let mut depth = 1;
                while depth > 0 {
                    let byte = self.take_byte()?;
                    if byte == 0 {
                        depth -= 1;
                        continue;
                    }
                    let ty = PackType::from_nibble(byte >> 4)?;
                    self.skip_tag_body(ty, byte)?;
                    if ty.container() {
                        depth += 1;
                    }
                }
            }
            ty if ty.integer() => {
                if !tag.in_tag {
                    self.varint_read()?;
                }
            }
            PackType::Bin | PackType::Str => {
                if tag.bit {
                    let len = self.varint_read()? as usize;
                    if self.pos + len > self.buf.len() {
                        return Err(pack_format_err("pack data truncated"));
                    }
                    self.pos += len;
                }
            }
            _ => {}
        }

        Ok(())
    }

    // Skip delta varint and value bytes for a raw tag byte seen while
    // discarding a container.
    fn skip_tag_body(&mut self, ty: PackType, tag: u8) -> Result<(), Error> {
        if ty.container() {
            if tag & 0x8 != 0 {
                self.varint_read()?;
            }
        } else if ty.integer() {
            if tag & 0x8 == 0 {
                if tag & 0x4 != 0 {
                    self.varint_read()?;
                }
                self.varint_read()?;
            }
        } else {
            if tag & 0x4 != 0 {
                self.varint_read()?;
            }
            if (ty == PackType::Bin || ty == PackType::Str) && tag & 0x8 != 0 {
                let len = self.varint_read()? as usize;
                if self.pos + len > self.buf.len() {
                    return Err(pack_format_err("pack data truncated"));
                }
                self.pos += len;
            }
        }
        Ok(())
    }

    // Position on the field with the given id. Ok(None) when the id was
    // never written or the container is exhausted.
    fn seek(&mut self, ty: PackType, id: u32) -> Result<Option<Tag>, Error> {
        loop {
            let (tag_id, tag_ty) = match self.tag_next()? {
                Some(tag) => tag,
                None => return Ok(None),
            };

            if tag_id > id {
                return Ok(None);
            }

            if tag_id < id {
                self.skip_pending()?;
                continue;
            }

            if tag_ty != ty {
                return Err(pack_format_err(&format!(
                    "field {} is type {:?} but {:?} requested",
                    id, tag_ty, ty
                )));
            }

            let tag = self.pending.take().unwrap();
            self.stack.last_mut().unwrap().id_last = tag.id;
            return Ok(Some(tag));
        }
    }

    /// Id and type of the next unread field, None at container end.
    pub fn peek(&mut self) -> Result<Option<(u32, PackType)>, Error> {
        self.tag_next()
    }

    fn read_int(&mut self, ty: PackType, id: u32) -> Result<Option<u64>, Error> {
        let tag = match self.seek(ty, id)? {
            Some(tag) => tag,
            None => return Ok(None),
        };

        if tag.in_tag {
            Ok(Some(tag.bit as u64))
        } else {
            Ok(Some(self.varint_read()?))
        }
    }

    pub fn read_u64(&mut self, id: u32) -> Result<Option<u64>, Error> {
        self.read_int(PackType::U64, id)
    }

    pub fn read_u32(&mut self, id: u32) -> Result<Option<u32>, Error> {
        Ok(self.read_int(PackType::U32, id)?.map(|v| v as u32))
    }

    pub fn read_i64(&mut self, id: u32) -> Result<Option<i64>, Error> {
        Ok(self.read_int(PackType::I64, id)?.map(zigzag_decode))
    }

    pub fn read_i32(&mut self, id: u32) -> Result<Option<i32>, Error> {
        Ok(self.read_int(PackType::I32, id)?.map(|v| zigzag_decode(v) as i32))
    }

    pub fn read_time(&mut self, id: u32) -> Result<Option<i64>, Error> {
        Ok(self.read_int(PackType::Time, id)?.map(zigzag_decode))
    }

    pub fn read_bool(&mut self, id: u32) -> Result<Option<bool>, Error> {
        Ok(self.seek(PackType::Bool, id)?.map(|tag| tag.bit))
    }

    pub fn read_str(&mut self, id: u32) -> Result<Option<String>, Error> {
        match self.read_sized(PackType::Str, id)? {
            Some(data) => Ok(Some(String::from_utf8(data).map_err(|_| {
                pack_format_err("pack string is not valid utf-8")
            })?)),
            None => Ok(None),
        }
    }

    pub fn read_bin(&mut self, id: u32) -> Result<Option<Vec<u8>>, Error> {
        self.read_sized(PackType::Bin, id)
    }

    fn read_sized(&mut self, ty: PackType, id: u32) -> Result<Option<Vec<u8>>, Error> {
        let tag = match self.seek(ty, id)? {
            Some(tag) => tag,
            None => return Ok(None),
        };

        if !tag.bit {
            return Ok(Some(Vec::new()));
        }

        let len = self.varint_read()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(pack_format_err("pack data truncated"));
        }
        let data = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(Some(data))
    }

    /// Enter the object at the given id. Ok(false) when absent.
    pub fn begin_obj(&mut self, id: u32) -> Result<bool, Error> {
        self.begin_container(PackType::Obj, id)
    }

    /// Enter the array at the given id. Ok(false) when absent.
    pub fn begin_array(&mut self, id: u32) -> Result<bool, Error> {
        self.begin_container(PackType::Array, id)
    }

    fn begin_container(&mut self, ty: PackType, id: u32) -> Result<bool, Error> {
        match self.seek(ty, id)? {
            Some(_) => {
                self.stack.push(ReadFrame { id_last: 0, done: false });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Leave the current container, discarding any unread fields.
    pub fn end(&mut self) -> Result<(), Error> {
        while self.tag_next()?.is_some() {
            self.skip_pending()?;
        }

        if self.stack.len() > 1 {
            self.stack.pop();
        }
        Ok(())
    }
}
