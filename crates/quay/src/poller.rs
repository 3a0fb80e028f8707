//! Readiness poller: a thin level-triggered epoll wrapper.
//!
//! Registrations carry a caller-chosen `u64` token; [`Poller::wait`]
//! hands back `(token, readiness)` pairs. Tokens 0 and 1 are reserved by
//! the reactor for the listening socket and the wakeup pipe.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

/// Maximum events returned by a single wait.
pub(crate) const EVENT_BATCH: usize = 256;

/// Subscription interest for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub(crate) const READ: Self = Self {
        readable: true,
        writable: false,
    };

    fn events(self) -> u32 {
        let mut bits = 0;
        if self.readable {
            bits |= libc::EPOLLIN as u32;
        }
        if self.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

/// Readiness bits reported for one token.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    bits: u32,
}

const IN: u32 = libc::EPOLLIN as u32;
const OUT: u32 = libc::EPOLLOUT as u32;
const HUP: u32 = libc::EPOLLHUP as u32;

impl Readiness {
    pub(crate) fn readable(self) -> bool {
        self.bits & IN != 0
    }

    pub(crate) fn writable(self) -> bool {
        self.bits & OUT != 0
    }

    pub(crate) fn hangup(self) -> bool {
        self.bits & HUP != 0
    }

    /// Any bit outside readable/writable/hangup (EPOLLERR, EPOLLPRI, ...).
    pub(crate) fn unexpected(self) -> bool {
        self.bits & !(IN | OUT | HUP) != 0
    }

    /// True when the only interesting bit is hangup.
    pub(crate) fn hangup_only(self) -> bool {
        self.hangup() && !self.readable() && !self.writable() && !self.unexpected()
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u32, &str); 5] = [
            (IN, "IN"),
            (OUT, "OUT"),
            (HUP, "HUP"),
            (libc::EPOLLERR as u32, "ERR"),
            (libc::EPOLLPRI as u32, "PRI"),
        ];
        let mut remaining = self.bits;
        let mut first = true;
        for (bit, name) in NAMES {
            if remaining & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                remaining &= !bit;
                first = false;
            }
        }
        if remaining != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{remaining:#x}")?;
        } else if first {
            write!(f, "(none)")?;
        }
        Ok(())
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub token: u64,
    pub readiness: Readiness,
}

/// Level-triggered epoll instance.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.events(),
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness, filling `out`. Returns the batch size; an
    /// interrupted wait reports an empty batch.
    pub(crate) fn wait(&mut self, out: &mut Vec<PollEvent>, timeout_ms: i32) -> io::Result<usize> {
        out.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        for event in &self.events[..n as usize] {
            out.push(PollEvent {
                token: event.u64,
                readiness: Readiness { bits: event.events },
            });
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn poller_creation() {
        let poller = Poller::new().expect("create poller");
        drop(poller);
    }

    #[test]
    fn socket_read_readiness() {
        let mut poller = Poller::new().expect("create poller");
        let (reader, mut writer) =
            std::os::unix::net::UnixStream::pair().expect("create socket pair");
        poller
            .register(reader.as_raw_fd(), 42, Interest::READ)
            .expect("register");

        let mut events = Vec::new();
        let n = poller.wait(&mut events, 0).expect("wait");
        assert_eq!(n, 0, "nothing readable yet");

        writer.write_all(b"x").expect("write");
        let n = poller.wait(&mut events, 1000).expect("wait");
        assert_eq!(n, 1);
        assert_eq!(events[0].token, 42);
        assert!(events[0].readiness.readable());
        assert!(!events[0].readiness.unexpected());

        poller.deregister(reader.as_raw_fd()).expect("deregister");
    }

    #[test]
    fn readiness_display_names_bits() {
        let readiness = Readiness { bits: IN | HUP };
        assert_eq!(readiness.to_string(), "IN|HUP");
        let nothing = Readiness { bits: 0 };
        assert_eq!(nothing.to_string(), "(none)");
    }

    #[test]
    fn hangup_only_classification() {
        assert!(Readiness { bits: HUP }.hangup_only());
        assert!(!Readiness { bits: HUP | IN }.hangup_only());
        assert!(!Readiness {
            bits: HUP | libc::EPOLLERR as u32
        }
        .hangup_only());
    }
}
