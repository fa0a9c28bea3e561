//! Wire types shared by the VSSFS server and the ARPCFS client (spec §3).

use crate::codec::primitive::{self, Cursor};
use crate::error::ArpcError;

/// Open flags as presented by `OpenFile` (spec §4.7). Only a subset of a
/// POSIX `open()`'s flags matter here: the rest of the bit space is
/// inert, since this filesystem never writes.
pub mod open_flags {
    pub const RDONLY: u32 = 0;
    pub const WRONLY: u32 = 1 << 0;
    pub const RDWR: u32 = 1 << 1;
    pub const APPEND: u32 = 1 << 2;
    pub const CREATE: u32 = 1 << 3;
    pub const TRUNCATE: u32 = 1 << 4;

    /// Any of these on an `OpenFile` request MUST be rejected with
    /// permission-denied (spec §4.7).
    pub const WRITE_IMPLYING: u32 = WRONLY | RDWR | APPEND | CREATE | TRUNCATE;
}

/// `Lseek` origin (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start = 0,
    Current = 1,
    End = 2,
    Data = 3,
    Hole = 4,
}

impl Whence {
    pub fn from_u8(v: u8) -> Result<Self, ArpcError> {
        Ok(match v {
            0 => Whence::Start,
            1 => Whence::Current,
            2 => Whence::End,
            3 => Whence::Data,
            4 => Whence::Hole,
            other => {
                return Err(ArpcError::Protocol(format!("unknown lseek whence {other}")))
            }
        })
    }
}

/// File metadata as reported to a client (spec §3 "VSSFileInfo").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VssFileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time_unix: i64,
    pub is_dir: bool,
    pub blocks: u64,
}

impl VssFileInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        primitive::write_string(&mut buf, &self.name);
        primitive::write_u64(&mut buf, self.size);
        primitive::write_u32(&mut buf, self.mode);
        primitive::write_i64(&mut buf, self.mod_time_unix);
        primitive::write_bool(&mut buf, self.is_dir);
        primitive::write_u64(&mut buf, self.blocks);
        buf
    }

    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, ArpcError> {
        Ok(Self {
            name: primitive::read_string(cur).map_err(ArpcError::Protocol)?,
            size: cur.read_u64().map_err(ArpcError::Protocol)?,
            mode: cur.read_u32().map_err(ArpcError::Protocol)?,
            mod_time_unix: cur.read_i64().map_err(ArpcError::Protocol)?,
            is_dir: cur.read_bool().map_err(ArpcError::Protocol)?,
            blocks: cur.read_u64().map_err(ArpcError::Protocol)?,
        })
    }

    pub fn decode_standalone(buf: &[u8]) -> Result<Self, ArpcError> {
        let mut cur = Cursor::new(buf);
        Self::decode(&mut cur)
    }
}

/// Native attribute bits that hide a `ReadDir` entry from the client
/// (spec §4.7: reparse-point, device, offline, virtual, recall-on-open,
/// recall-on-data-access).
pub mod hidden_attrs {
    pub const REPARSE_POINT: u32 = 1 << 0;
    pub const DEVICE: u32 = 1 << 1;
    pub const OFFLINE: u32 = 1 << 2;
    pub const VIRTUAL: u32 = 1 << 3;
    pub const RECALL_ON_OPEN: u32 = 1 << 4;
    pub const RECALL_ON_DATA_ACCESS: u32 = 1 << 5;

    pub const ALL: u32 =
        REPARSE_POINT | DEVICE | OFFLINE | VIRTUAL | RECALL_ON_OPEN | RECALL_ON_DATA_ACCESS;
}

pub fn encode_file_info_list(entries: &[VssFileInfo]) -> Vec<u8> {
    let mut buf = Vec::new();
    primitive::write_u32(&mut buf, entries.len() as u32);
    for entry in entries {
        buf.extend_from_slice(&entry.encode());
    }
    buf
}

pub fn decode_file_info_list(buf: &[u8]) -> Result<Vec<VssFileInfo>, ArpcError> {
    let mut cur = Cursor::new(buf);
    let count = cur.read_u32().map_err(ArpcError::Protocol)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(VssFileInfo::decode(&mut cur)?);
    }
    Ok(out)
}

/// Filesystem-level statistics (spec §3 "StatFS").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks_total: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files_total: u64,
    pub files_free: u64,
    pub max_name_len: u32,
}

/// Nominal file-count the spec assigns to an immutable snapshot's
/// `StatFS` (spec §4.7: "files/ffree report a nominal 2^20").
pub const NOMINAL_FILE_COUNT: u64 = 1 << 20;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

impl StatFs {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        primitive::write_u32(&mut buf, self.block_size);
        primitive::write_u64(&mut buf, self.blocks_total);
        primitive::write_u64(&mut buf, self.blocks_free);
        primitive::write_u64(&mut buf, self.blocks_available);
        primitive::write_u64(&mut buf, self.files_total);
        primitive::write_u64(&mut buf, self.files_free);
        primitive::write_u32(&mut buf, self.max_name_len);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ArpcError> {
        let mut cur = Cursor::new(buf);
        Ok(Self {
            block_size: cur.read_u32().map_err(ArpcError::Protocol)?,
            blocks_total: cur.read_u64().map_err(ArpcError::Protocol)?,
            blocks_free: cur.read_u64().map_err(ArpcError::Protocol)?,
            blocks_available: cur.read_u64().map_err(ArpcError::Protocol)?,
            files_total: cur.read_u64().map_err(ArpcError::Protocol)?,
            files_free: cur.read_u64().map_err(ArpcError::Protocol)?,
            max_name_len: cur.read_u32().map_err(ArpcError::Protocol)?,
        })
    }
}
