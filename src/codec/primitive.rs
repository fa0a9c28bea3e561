//! Typed primitive encode/decode for message payload bodies (spec §4.1).
//!
//! All integers inside payload bodies are little-endian; only the outer
//! frame length header (see [`super::frame`]) is big-endian. This mirrors
//! the teacher's `parser::primitive` module (an XDR-flavoured
//! big-endian-everywhere reader) in spirit — one free function per
//! primitive type, operating over a cursor — but with the endianness and
//! length-prefix rules this project's own wire format actually uses.

use byteorder::{ByteOrder, LittleEndian};

/// A read cursor over an in-memory payload buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.remaining() < n {
            return Err(format!("unexpected end of payload: need {n}, have {}", self.remaining()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, String> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(format!("invalid bool discriminant {other}")),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, String> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, String> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, String> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, String> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Unix-nanosecond timestamp, encoded as a plain `i64`.
    pub fn read_timestamp_nanos(&mut self) -> Result<i64, String> {
        self.read_i64()
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, String> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

pub fn read_string(cur: &mut Cursor<'_>) -> Result<String, String> {
    let bytes = cur.read_bytes()?;
    String::from_utf8(bytes).map_err(|e| format!("invalid utf8 string: {e}"))
}

pub fn read_string_map(cur: &mut Cursor<'_>) -> Result<Vec<(String, String)>, String> {
    let len = cur.read_u32()? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let key = read_string(cur)?;
        let value = read_string(cur)?;
        out.push((key, value));
    }
    Ok(out)
}

pub fn read_array_of<T>(
    cur: &mut Cursor<'_>,
    mut item: impl FnMut(&mut Cursor<'_>) -> Result<T, String>,
) -> Result<Vec<T>, String> {
    let len = cur.read_u32()? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(item(cur)?);
    }
    Ok(out)
}

// --- writers ---

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    let mut tmp = [0u8; 2];
    LittleEndian::write_u16(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_i64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

pub fn write_timestamp_nanos(buf: &mut Vec<u8>, v: i64) {
    write_i64(buf, v);
}

pub fn write_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    write_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

pub fn write_string(buf: &mut Vec<u8>, v: &str) {
    write_bytes(buf, v.as_bytes());
}

pub fn write_string_map(buf: &mut Vec<u8>, v: &[(String, String)]) {
    write_u32(buf, v.len() as u32);
    for (k, val) in v {
        write_string(buf, k);
        write_string(buf, val);
    }
}

pub fn write_array_of<T>(buf: &mut Vec<u8>, items: &[T], mut item: impl FnMut(&mut Vec<u8>, &T)) {
    write_u32(buf, items.len() as u32);
    for it in items {
        item(buf, it);
    }
}
