mod channel;
mod decode;
mod resolve;

pub use channel::{FanotifyChannel, KernelEventSource};
pub use decode::{FidInfo, FidKind, METADATA_LEN, MalformedRecord, RawRecord, decode_batch};
pub use resolve::{join_child, resolve_fd, resolve_handle};

#[cfg(test)]
pub(crate) use decode::testing;
