use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{pipe2, write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug)]
struct Inner {
    raised: AtomicBool,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

/// Shutdown flag that threads blocked in `poll(2)` can also wait on.
///
/// Raising it sets the flag and makes the read end of an internal pipe
/// readable, so any poll set including [`Shutdown::as_fd`] wakes up.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> nix::Result<Self> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            inner: Arc::new(Inner {
                raised: AtomicBool::new(false),
                read_end,
                write_end,
            }),
        })
    }

    pub fn raise(&self) {
        if self.inner.raised.swap(true, Ordering::SeqCst) {
            return;
        }
        // The pipe is never drained, so one byte keeps it readable for good.
        if let Err(err) = write(&self.inner.write_end, &[1]) {
            warn!(?err, "failed to signal shutdown pipe");
        }
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.read_end.as_fd()
    }

    /// Sleep for up to `timeout`, waking early on shutdown. Returns whether
    /// shutdown was raised.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_raised() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let mut fds = [PollFd::new(self.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::try_from(left).unwrap_or(PollTimeout::MAX)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(err) => {
                    warn!(?err, "poll on shutdown pipe failed, sleeping instead");
                    std::thread::sleep(left);
                }
            }
        }
        self.is_raised()
    }
}
