use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SHA-256 of the EICAR anti-malware test file.
pub const EICAR_SHA256: &str = "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Classifier {
    /// A list of executable path prefixes that are considered legitimate.
    /// Processes whose executable matches are trusted; everything else is
    /// reported as suspicious when it touches a watched device. For each
    /// item, if it appears at the beginning of the executable path a match
    /// occurs. If the item starts with an exclamation mark, the rest of the
    /// item is considered and a match rejects the executable instead. The
    /// longest matching item wins. An executable that matches nothing is
    /// untrusted.
    ///
    /// # Note
    ///
    /// `/usr/bin` matches `/usr/bin2` as well. Use `/usr/bin/` if only the
    /// directory itself is meant.
    pub trusted_prefixes: Vec<PathBuf>,

    /// Hex-encoded SHA-256 digests of known malware. A file whose content
    /// digest appears here is always reported as suspicious.
    pub malware_digests: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            trusted_prefixes: vec![
                PathBuf::from("/bin/"),
                PathBuf::from("/sbin/"),
                PathBuf::from("/usr/bin/"),
                PathBuf::from("/usr/sbin/"),
            ],
            malware_digests: vec![EICAR_SHA256.to_owned()],
        }
    }
}
