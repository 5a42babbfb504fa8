use super::decode::FidInfo;
use crate::error::ResolutionError;
use crate::event::PATH_MAX;
use crate::sys;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

/// Turn a fid record into a path, using `mount_dir` (the mount the record's
/// fsid belongs to) as the anchor for `open_by_handle_at(2)`.
pub fn resolve_handle(fid: &FidInfo, mount_dir: &Path) -> Result<PathBuf, ResolutionError> {
    let mount_fd = open(
        mount_dir,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(std::io::Error::from)?;

    let object = sys::open_by_handle_at(
        mount_fd.as_fd(),
        fid.handle_type,
        &fid.handle,
        libc::O_PATH | libc::O_CLOEXEC,
    )
    .map_err(|err| match err.raw_os_error() {
        Some(libc::ESTALE) | Some(libc::ENOENT) => ResolutionError::Stale,
        _ => ResolutionError::Io(err),
    })?;

    let dir = resolve_fd(object.as_fd())?;
    let path = match &fid.name {
        Some(name) => join_child(&dir, name),
        None => dir,
    };
    check_length(path)
}

/// Path of an open descriptor, as `/proc/self/fd` reports it.
pub fn resolve_fd(fd: BorrowedFd<'_>) -> Result<PathBuf, ResolutionError> {
    let link = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let path = std::fs::read_link(link)?;
    check_length(path)
}

/// `dir/name`, except that the kernel's `.` (the directory itself) leaves
/// `dir` unchanged.
pub fn join_child(dir: &Path, name: &OsStr) -> PathBuf {
    if name.is_empty() || name == "." {
        dir.to_path_buf()
    } else {
        dir.join(name)
    }
}

fn check_length(path: PathBuf) -> Result<PathBuf, ResolutionError> {
    let len = path.as_os_str().len();
    if len >= PATH_MAX {
        return Err(ResolutionError::TooLong(len));
    }
    Ok(path)
}
