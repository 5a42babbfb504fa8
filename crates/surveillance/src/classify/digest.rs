use rustc_hash::FxHashSet;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::warn;

pub type Sha256Digest = [u8; 32];

const CHUNK: usize = 8192;

/// Stream a file through SHA-256.
pub fn sha256_file(path: &Path) -> io::Result<Sha256Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(hasher.finalize().into())
}

/// Known-malware content digests.
#[derive(Debug, Clone, Default)]
pub struct MalwareSignatures {
    digests: FxHashSet<Sha256Digest>,
}

impl MalwareSignatures {
    /// Parse hex digests; malformed entries are logged and skipped.
    pub fn from_hex<S: AsRef<str>>(entries: &[S]) -> Self {
        let digests = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                let mut digest = [0u8; 32];
                match hex::decode_to_slice(entry, &mut digest) {
                    Ok(()) => Some(digest),
                    Err(err) => {
                        warn!(entry, %err, "ignoring malformed malware digest");
                        None
                    }
                }
            })
            .collect();
        Self { digests }
    }

    pub fn contains(&self, digest: &Sha256Digest) -> bool {
        self.digests.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EICAR: &[u8] =
        br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    #[test]
    fn eicar_matches_default_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eicar.com");
        std::fs::write(&path, EICAR).unwrap();

        let digest = sha256_file(&path).unwrap();
        assert_eq!(hex::encode(digest), config::EICAR_SHA256);
        let signatures = MalwareSignatures::from_hex(&config::Classifier::default().malware_digests);
        assert!(signatures.contains(&digest));
    }

    #[test]
    fn large_files_hash_like_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..3 * CHUNK + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let expected: Sha256Digest = Sha256::digest(&content).into();
        assert_eq!(sha256_file(&path).unwrap(), expected);
    }

    #[test]
    fn malformed_digests_are_skipped() {
        let signatures = MalwareSignatures::from_hex(&[
            "zz",
            "275a021bbfb6489e54d471899f7db9d1663fc695ec2fe2a2c4538aabf651fd0f",
            "275a021b",
        ]);
        assert_eq!(signatures.len(), 1);
    }

    #[test]
    fn directories_cannot_be_hashed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sha256_file(dir.path()).is_err());
    }
}
