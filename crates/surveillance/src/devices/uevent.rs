//! Kernel device notifications (`NETLINK_KOBJECT_UEVENT`).

use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, socket,
};
use rustc_hash::FxHashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// Multicast group the kernel broadcasts uevents on.
const KERNEL_GROUP: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
    Other(String),
}

impl UeventAction {
    fn parse(action: &str) -> Self {
        match action {
            "add" => UeventAction::Add,
            "remove" => UeventAction::Remove,
            "change" => UeventAction::Change,
            other => UeventAction::Other(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: UeventAction,
    pub devpath: String,
    pub env: FxHashMap<String, String>,
}

impl Uevent {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.get("SUBSYSTEM")
    }

    pub fn devname(&self) -> Option<&str> {
        self.get("DEVNAME")
    }

    /// Block disks and partitions; everything else is ignored.
    pub fn is_block_device(&self) -> bool {
        self.subsystem() == Some("block")
            && matches!(self.get("DEVTYPE"), Some("disk") | Some("partition"))
    }
}

/// Parse one kernel uevent datagram:
/// `action@devpath\0KEY=VALUE\0KEY=VALUE\0...`.
///
/// Messages rebroadcast by udev (they start with `libudev\0` and a binary
/// header) and anything without the `@` header yield `None`.
pub fn parse_uevent(datagram: &[u8]) -> Option<Uevent> {
    let mut fields = datagram
        .split(|b| *b == 0)
        .filter(|field| !field.is_empty())
        .map(String::from_utf8_lossy);

    let header = fields.next()?;
    let (header_action, header_path) = header.split_once('@')?;
    let env: FxHashMap<String, String> = fields
        .filter_map(|field| {
            field
                .split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
        })
        .collect();

    let action = UeventAction::parse(env.get("ACTION").map_or(header_action, String::as_str));
    let devpath = env
        .get("DEVPATH")
        .map_or(header_path, String::as_str)
        .to_owned();
    Some(Uevent {
        action,
        devpath,
        env,
    })
}

#[derive(Debug)]
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    /// Non-blocking socket subscribed to kernel uevents.
    pub fn open() -> nix::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_GROUP))?;
        Ok(Self { fd })
    }

    /// Receive one datagram. `EAGAIN` when nothing is pending.
    pub fn recv(&self, buf: &mut [u8]) -> nix::Result<usize> {
        recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())
    }
}

impl AsFd for UeventSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
