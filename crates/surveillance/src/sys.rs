//! Thin wrappers over the few syscalls nix does not expose safely.

use crate::event::Fsid;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

fn fsid_from(stat: &nix::sys::statfs::Statfs) -> Fsid {
    let raw: libc::fsid_t = stat.filesystem_id();
    // fsid_t is two C ints with private fields.
    #[allow(unsafe_code)]
    let val = unsafe { std::mem::transmute::<libc::fsid_t, [i32; 2]>(raw) };
    Fsid(val)
}

/// Filesystem id of the filesystem holding `path`.
pub fn fsid_of(path: &Path) -> nix::Result<Fsid> {
    nix::sys::statfs::statfs(path).map(|stat| fsid_from(&stat))
}

/// Filesystem id of the filesystem an open descriptor lives on.
pub fn fsid_of_fd<Fd: AsFd>(fd: Fd) -> nix::Result<Fsid> {
    nix::sys::statfs::fstatfs(fd).map(|stat| fsid_from(&stat))
}

/// `open_by_handle_at(2)` relative to `mount_fd`.
///
/// Needs `CAP_DAC_READ_SEARCH`. The returned descriptor is owned and closed
/// on drop.
pub fn open_by_handle_at(
    mount_fd: BorrowedFd<'_>,
    handle_type: i32,
    handle: &[u8],
    flags: libc::c_int,
) -> io::Result<OwnedFd> {
    let handle_bytes = u32::try_from(handle.len())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

    // struct file_handle { unsigned int handle_bytes; int handle_type; unsigned char f_handle[]; }
    let mut raw = Vec::with_capacity(8 + handle.len());
    raw.extend_from_slice(&handle_bytes.to_ne_bytes());
    raw.extend_from_slice(&handle_type.to_ne_bytes());
    raw.extend_from_slice(handle);

    #[allow(unsafe_code)]
    let ret = unsafe {
        libc::syscall(
            libc::SYS_open_by_handle_at,
            mount_fd.as_raw_fd(),
            raw.as_mut_ptr(),
            flags,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // The kernel just handed us this descriptor; nothing else owns it.
    #[allow(unsafe_code)]
    let fd = unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) };
    Ok(fd)
}

/// Take ownership of a descriptor delivered in a fanotify event.
///
/// # Safety
///
/// `raw` must be an open descriptor that nothing else will close.
#[allow(unsafe_code)]
pub unsafe fn adopt_fd(raw: libc::c_int) -> OwnedFd {
    // SAFETY: upheld by the caller.
    unsafe { OwnedFd::from_raw_fd(raw) }
}
