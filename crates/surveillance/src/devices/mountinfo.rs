//! Parser for `/proc/<pid>/mountinfo`.
//!
//! Each line looks like
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! Field 7 may appear any number of times, so the ` - ` separator is what
//! locates the filesystem half. Paths escape space, tab, newline and
//! backslash as three-digit octal (`\040`).

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub fs_type: String,
    /// Mount source, usually the device node (`/dev/sdb1`).
    pub source: String,
}

/// Undo the kernel's octal escaping of mountinfo paths.
pub fn unescape(field: &str) -> OsString {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            // three octal digits can exceed a byte; such input is not an escape
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    OsString::from_vec(out)
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

pub fn parse_line(line: &str) -> Option<MountInfo> {
    let (mount_half, fs_half) = line.split_once(" - ")?;
    let mount_point = mount_half.split_whitespace().nth(4)?;
    let mut fs_fields = fs_half.split_whitespace();
    let fs_type = fs_fields.next()?;
    let source = fs_fields.next()?;
    Some(MountInfo {
        mount_point: PathBuf::from(unescape(mount_point)),
        fs_type: fs_type.to_owned(),
        source: unescape(source).to_string_lossy().into_owned(),
    })
}

pub fn parse<R: BufRead>(reader: R) -> Vec<MountInfo> {
    reader
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| {
            let parsed = parse_line(&line);
            if parsed.is_none() {
                trace!(%line, "skipping malformed mountinfo line");
            }
            parsed
        })
        .collect()
}

pub fn read(path: &Path) -> io::Result<Vec<MountInfo>> {
    let file = std::fs::File::open(path)?;
    Ok(parse(BufReader::new(file)))
}

/// Where `device_node` is mounted, if anywhere. The first mount wins when a
/// device is mounted more than once.
pub fn mount_point_of<'a>(mounts: &'a [MountInfo], device_node: &str) -> Option<&'a Path> {
    mounts
        .iter()
        .find(|mount| mount.source == device_node)
        .map(|mount| mount.mount_point.as_path())
}
