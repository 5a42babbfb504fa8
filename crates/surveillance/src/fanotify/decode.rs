//! Decoder for the byte stream read from a fanotify descriptor.
//!
//! Layout (all fields native-endian):
//!
//! ```text
//! fanotify_event_metadata   event_len u32 | vers u8 | reserved u8 | metadata_len u16
//!                           mask u64 | fd i32 | pid i32
//! fanotify_event_info_fid   info_type u8 | pad u8 | len u16 | fsid [i32; 2]
//!                           handle_bytes u32 | handle_type i32 | f_handle[handle_bytes]
//!                           [name\0 for *_DFID_NAME]
//! ```
//!
//! Every read goes through [`Cursor`], which refuses to step outside the
//! record it was created for.

use crate::error::DecodeError;
use crate::event::Fsid;
use std::ffi::OsString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStringExt;

pub const METADATA_LEN: usize = 24;
const INFO_HEADER_LEN: usize = 4;
/// Info header, fsid and the `file_handle` header preceding the handle bytes.
const FID_FIXED_LEN: usize = INFO_HEADER_LEN + 8 + 8;

/// Which fid record variant an info record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FidKind {
    /// The object itself.
    Fid,
    /// The parent directory and the entry name.
    DfidName,
    /// The parent directory only.
    Dfid,
    OldDfidName,
    NewDfidName,
}

impl FidKind {
    fn from_info_type(info_type: u8) -> Option<Self> {
        match info_type {
            libc::FAN_EVENT_INFO_TYPE_FID => Some(FidKind::Fid),
            libc::FAN_EVENT_INFO_TYPE_DFID_NAME => Some(FidKind::DfidName),
            libc::FAN_EVENT_INFO_TYPE_DFID => Some(FidKind::Dfid),
            libc::FAN_EVENT_INFO_TYPE_OLD_DFID_NAME => Some(FidKind::OldDfidName),
            libc::FAN_EVENT_INFO_TYPE_NEW_DFID_NAME => Some(FidKind::NewDfidName),
            _ => None,
        }
    }

    pub fn carries_name(self) -> bool {
        matches!(
            self,
            FidKind::DfidName | FidKind::OldDfidName | FidKind::NewDfidName
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FidInfo {
    pub kind: FidKind,
    pub fsid: Fsid,
    pub handle_type: i32,
    pub handle: Vec<u8>,
    pub name: Option<OsString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub mask: u64,
    /// Descriptor opened by the kernel for this event. The caller owns it
    /// and must close it.
    pub fd: Option<RawFd>,
    pub pid: i32,
    /// Fid records following the metadata. A malformed info area fails
    /// only this record.
    pub fids: Result<Vec<FidInfo>, DecodeError>,
}

/// A record whose header could not be trusted. The batch ends here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct MalformedRecord {
    pub error: DecodeError,
    /// Descriptor named by the header, when the header was complete enough
    /// to carry one. The caller still owns it and must close it.
    pub fd: Option<RawFd>,
}

impl From<DecodeError> for MalformedRecord {
    fn from(error: DecodeError) -> Self {
        Self { error, fd: None }
    }
}

impl RawRecord {
    /// The fid record best suited to name the event's subject: one with an
    /// entry name if present, else the first one.
    pub fn primary_fid(&self) -> Option<&FidInfo> {
        let fids = self.fids.as_ref().ok()?;
        fids.iter()
            .find(|fid| fid.kind.carries_name())
            .or_else(|| fids.first())
    }

    pub fn is_overflow(&self) -> bool {
        self.mask & libc::FAN_Q_OVERFLOW != 0
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    /// Offset of `bytes` in the whole batch, for error messages.
    base: usize,
}

impl<'a> Cursor<'a> {
    fn take<const N: usize>(&self, at: usize) -> Result<[u8; N], DecodeError> {
        self.bytes
            .get(at..at + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(DecodeError::Truncated {
                offset: self.base + at,
                needed: N,
                available: self.bytes.len().saturating_sub(at),
            })
    }

    fn u8(&self, at: usize) -> Result<u8, DecodeError> {
        self.take::<1>(at).map(|b| b[0])
    }

    fn u16(&self, at: usize) -> Result<u16, DecodeError> {
        self.take(at).map(u16::from_ne_bytes)
    }

    fn u32(&self, at: usize) -> Result<u32, DecodeError> {
        self.take(at).map(u32::from_ne_bytes)
    }

    fn i32(&self, at: usize) -> Result<i32, DecodeError> {
        self.take(at).map(i32::from_ne_bytes)
    }

    fn u64(&self, at: usize) -> Result<u64, DecodeError> {
        self.take(at).map(u64::from_ne_bytes)
    }
}

/// Split one `read(2)` worth of fanotify output into records.
///
/// A header-level failure (short tail, unknown version, impossible length)
/// ends the batch with an `Err` entry since the remaining offsets cannot be
/// trusted.
pub fn decode_batch(bytes: &[u8]) -> Vec<Result<RawRecord, MalformedRecord>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        match decode_one(bytes, offset) {
            Ok((record, event_len)) => {
                records.push(Ok(record));
                offset += event_len;
            }
            Err(err) => {
                records.push(Err(err));
                break;
            }
        }
    }
    records
}

fn decode_one(bytes: &[u8], offset: usize) -> Result<(RawRecord, usize), MalformedRecord> {
    let remaining = &bytes[offset..];
    if remaining.len() < METADATA_LEN {
        return Err(DecodeError::Truncated {
            offset,
            needed: METADATA_LEN,
            available: remaining.len(),
        }
        .into());
    }
    let header = Cursor {
        bytes: remaining,
        base: offset,
    };

    // read first: every later failure must hand it back
    let fd = header.i32(16)?;
    let fd = (fd >= 0).then_some(fd);
    let malformed = |error| MalformedRecord { error, fd };

    let event_len = header.u32(0)? as usize;
    let version = header.u8(4)?;
    if version != libc::FANOTIFY_METADATA_VERSION {
        return Err(malformed(DecodeError::Version(version)));
    }
    let metadata_len = header.u16(6)? as usize;
    if event_len < METADATA_LEN || metadata_len < METADATA_LEN || metadata_len > event_len {
        return Err(malformed(DecodeError::InfoLength {
            offset,
            len: event_len,
        }));
    }
    if event_len > remaining.len() {
        return Err(malformed(DecodeError::Truncated {
            offset,
            needed: event_len,
            available: remaining.len(),
        }));
    }

    let mask = header.u64(8)?;
    let pid = header.i32(20)?;

    let info = Cursor {
        bytes: &remaining[metadata_len..event_len],
        base: offset + metadata_len,
    };
    let record = RawRecord {
        mask,
        fd,
        pid,
        fids: decode_infos(&info),
    };
    Ok((record, event_len))
}

fn decode_infos(area: &Cursor<'_>) -> Result<Vec<FidInfo>, DecodeError> {
    let mut fids = Vec::new();
    let mut at = 0;
    while at < area.bytes.len() {
        let info_type = area.u8(at)?;
        let len = area.u16(at + 2)? as usize;
        if len < INFO_HEADER_LEN || at + len > area.bytes.len() {
            return Err(DecodeError::InfoLength {
                offset: area.base + at,
                len,
            });
        }
        if let Some(kind) = FidKind::from_info_type(info_type) {
            let record = Cursor {
                bytes: &area.bytes[at..at + len],
                base: area.base + at,
            };
            fids.push(decode_fid(kind, &record)?);
        }
        at += len;
    }
    Ok(fids)
}

fn decode_fid(kind: FidKind, record: &Cursor<'_>) -> Result<FidInfo, DecodeError> {
    if record.bytes.len() < FID_FIXED_LEN {
        return Err(DecodeError::InfoLength {
            offset: record.base,
            len: record.bytes.len(),
        });
    }
    let fsid = Fsid([record.i32(4)?, record.i32(8)?]);
    let handle_bytes = record.u32(12)? as usize;
    let handle_type = record.i32(16)?;

    let available = record.bytes.len() - FID_FIXED_LEN;
    if handle_bytes > available {
        return Err(DecodeError::HandleOverrun {
            handle_bytes,
            available,
        });
    }
    let handle_end = FID_FIXED_LEN + handle_bytes;
    let handle = record.bytes[FID_FIXED_LEN..handle_end].to_vec();

    let name = if kind.carries_name() {
        let tail = &record.bytes[handle_end..];
        let nul = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::UnterminatedName)?;
        Some(OsString::from_vec(tail[..nul].to_vec()))
    } else {
        None
    };

    Ok(FidInfo {
        kind,
        fsid,
        handle_type,
        handle,
        name,
    })
}
