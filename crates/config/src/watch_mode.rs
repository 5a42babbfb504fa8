use serde::{Deserialize, Serialize};

/// How watches are armed on a removable mount.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchMode {
    /// Walk the whole tree and mark every directory and file individually.
    /// Needed on kernels where only per-inode marks report directory entry
    /// events. Costs one mark per inode.
    #[serde(rename = "recursive")]
    Recursive,

    /// One mount-scoped content mark plus one filesystem-scoped notification
    /// mark. Cheap, and new subtrees are covered for free.
    #[serde(rename = "mount_wide")]
    MountWide,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recursive" => Ok(Self::Recursive),
            "mount_wide" | "mount-wide" => Ok(Self::MountWide),
            other => Err(format!("`{other}` is not a watch mode (recursive, mount_wide)")),
        }
    }
}
