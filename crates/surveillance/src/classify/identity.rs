use crate::error::Error;
use procfs::process::Process;
use std::path::PathBuf;

/// Who a process is, as far as a verdict is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    pub ppid: i32,
    pub exe: PathBuf,
    pub cmdline: Vec<String>,
}

pub trait ProcessInspector: Send + Sync {
    /// Look up a live process. Fails once it has exited.
    fn inspect(&self, pid: i32) -> Result<ProcessIdentity, Error>;
}

/// Reads `/proc/<pid>` on every call; identities are never cached since pids
/// get reused.
#[derive(Debug, Default)]
pub struct ProcfsInspector;

impl ProcessInspector for ProcfsInspector {
    fn inspect(&self, pid: i32) -> Result<ProcessIdentity, Error> {
        let process = Process::new(pid)?;
        let exe = process.exe()?;
        let status = process.status()?;
        // kernel threads and zombies have no command line
        let cmdline = process.cmdline().unwrap_or_default();
        Ok(ProcessIdentity {
            pid,
            uid: status.ruid,
            gid: status.rgid,
            ppid: status.ppid,
            exe,
            cmdline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspects_current_process() {
        let pid = std::process::id() as i32;
        let identity = ProcfsInspector.inspect(pid).unwrap();
        assert_eq!(identity.pid, pid);
        assert_eq!(identity.exe, std::env::current_exe().unwrap());
        assert_eq!(identity.uid, nix::unistd::getuid().as_raw());
        assert!(!identity.cmdline.is_empty());
    }

    #[test]
    fn exited_process_is_an_error() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        assert!(ProcfsInspector.inspect(pid).is_err());
    }
}
