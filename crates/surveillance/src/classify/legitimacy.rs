use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Executable prefixes whose processes are considered legitimate.
///
/// The longest matching prefix decides; a leading `!` turns a prefix into an
/// exclusion. No match at all means untrusted.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    prefixes: Vec<(bool, Vec<u8>)>,
}

impl TrustPolicy {
    pub fn new<P: AsRef<Path>>(prefixes: &[P]) -> Self {
        let prefixes = prefixes
            .iter()
            .map(|prefix| {
                let raw = prefix.as_ref().as_os_str().as_bytes();
                match raw.strip_prefix(b"!") {
                    Some(rest) => (false, rest.to_vec()),
                    None => (true, raw.to_vec()),
                }
            })
            .collect();
        Self { prefixes }
    }

    pub fn is_trusted(&self, exe: &Path) -> bool {
        let exe = exe.as_os_str().as_bytes();
        let mut best: Option<(bool, usize)> = None;
        for (trust, prefix) in &self.prefixes {
            if exe.starts_with(prefix) && best.is_none_or(|(_, len)| len < prefix.len()) {
                best = Some((*trust, prefix.len()));
            }
        }
        best.is_some_and(|(trust, _)| trust)
    }

}
