//! Thin poll(2) plumbing: the records handed to the syscall and the
//! eventfd used to interrupt a blocked iteration from another thread.

use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use log::warn;
use nix::poll::PollFlags;
use nix::sys::eventfd::{EfdFlags, EventFd};

/// One entry of the poll set. `revents` is filled in by [`poll`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollRec {
    pub fd: RawFd,
    pub events: PollFlags,
    pub revents: PollFlags,
}

impl PollRec {
    pub fn new(fd: RawFd, events: PollFlags) -> PollRec {
        PollRec {
            fd,
            events,
            revents: PollFlags::empty(),
        }
    }
}

/// Poll `recs` for at most `timeout` (`None` blocks indefinitely).
///
/// EINTR counts as "nothing ready". Other failures are logged and also
/// reported as "nothing ready" so a broken fd cannot wedge the caller in
/// a tight error loop forever; the owning source still sees the HUP/ERR
/// bits once the kernel reports them.
pub(crate) fn poll(recs: &mut [PollRec], timeout: Option<Duration>) -> usize {
    let mut fds: Vec<nix::libc::pollfd> = recs
        .iter()
        .map(|r| nix::libc::pollfd {
            fd: r.fd,
            events: r.events.bits(),
            revents: 0,
        })
        .collect();

    let n = unsafe {
        nix::libc::poll(
            fds.as_mut_ptr(),
            fds.len() as nix::libc::nfds_t,
            timeout_millis(timeout),
        )
    };

    if n < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(nix::libc::EINTR) {
            warn!("poll(2) failed: {}", err);
        }
        return 0;
    }

    for (rec, fd) in recs.iter_mut().zip(fds.iter()) {
        rec.revents = PollFlags::from_bits_truncate(fd.revents);
    }

    n as usize
}

/// Round up to whole milliseconds so short timeouts never busy-wait.
fn timeout_millis(timeout: Option<Duration>) -> nix::libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let mut ms = t.as_millis();
            if t.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(nix::libc::c_int::MAX as u128) as nix::libc::c_int
        }
    }
}

/// Cross-thread wakeup primitive backed by an eventfd.
///
/// `signal` is async-signal-safe and may be called from any thread; the
/// fd stays readable until `acknowledge` drains it, so a signal sent
/// before the next poll is never lost.
#[derive(Debug)]
pub(crate) struct Wakeup {
    fd: EventFd,
}

impl Wakeup {
    pub fn new() -> io::Result<Wakeup> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Wakeup { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    pub fn signal(&self) {
        // EAGAIN means the counter is already saturated, which still wakes
        // the poller; nothing to do.
        let _ = self.fd.arm();
    }

    pub fn acknowledge(&self) {
        // eventfd writes add to the counter; only a read drains it. The
        // fd is nonblocking, so EAGAIN on an unarmed wakeup is harmless.
        let mut buf = [0u8; 8];
        let _ = unsafe {
            nix::libc::read(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut nix::libc::c_void,
                buf.len(),
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use nix::poll::PollFlags;

    use super::{poll, timeout_millis, PollRec, Wakeup};

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_nanos(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(7))), 7);
        assert_eq!(timeout_millis(Some(Duration::from_micros(7_500))), 8);
    }

    #[test]
    fn wakeup_is_level_triggered() {
        let wakeup = Wakeup::new().unwrap();

        let mut recs = [PollRec::new(wakeup.raw_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut recs, Some(Duration::ZERO)), 0);

        wakeup.signal();
        wakeup.signal();

        // stays readable until acknowledged
        for _ in 0..2 {
            let mut recs = [PollRec::new(wakeup.raw_fd(), PollFlags::POLLIN)];
            assert_eq!(poll(&mut recs, Some(Duration::ZERO)), 1);
            assert!(recs[0].revents.contains(PollFlags::POLLIN));
        }

        wakeup.acknowledge();
        let mut recs = [PollRec::new(wakeup.raw_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut recs, Some(Duration::ZERO)), 0);
    }

    #[test]
    fn poll_honors_timeout() {
        let wakeup = Wakeup::new().unwrap();
        let mut recs = [PollRec::new(wakeup.raw_fd(), PollFlags::POLLIN)];

        let start = Instant::now();
        poll(&mut recs, Some(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
