//! Cross-thread wakeup via a non-blocking self-pipe.
//!
//! Producers write a single byte to the write end; the reactor has the
//! read end registered for readability and drains it fully on each
//! notification. A producer hitting would-block is fine: the pipe is
//! full, so a wakeup is already pending.

use std::io;
use std::os::unix::io::RawFd;

/// The reactor-owned self-pipe.
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Drain every pending byte from the read end.
    pub(crate) fn drain(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    scratch.as_mut_ptr().cast::<libc::c_void>(),
                    scratch.len(),
                )
            };
            if n > 0 {
                continue;
            }
            if n == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    tracing::error!(error = %err, "error draining wakeup pipe");
                    return;
                }
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Post a wakeup to `write_fd` (-1 means the pipe does not exist yet;
/// the wakeup is dropped since there is no loop to wake).
pub(crate) fn notify(write_fd: RawFd) {
    if write_fd == -1 {
        return;
    }
    let byte = [1u8];
    loop {
        let n = unsafe { libc::write(write_fd, byte.as_ptr().cast::<libc::c_void>(), 1) };
        if n >= 0 {
            return;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            // Pipe full: a wakeup is already pending.
            io::ErrorKind::WouldBlock => return,
            io::ErrorKind::Interrupted => continue,
            _ => {
                tracing::error!(error = %err, "unable to post a wake event");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_drain() {
        let pipe = WakePipe::new().expect("create pipe");
        notify(pipe.write_fd());
        notify(pipe.write_fd());

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(pipe.read_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 2, "both wakeup bytes arrive");

        // Drained pipe reads would-block, which drain() absorbs.
        pipe.drain();
    }

    #[test]
    fn drain_clears_backlog() {
        let pipe = WakePipe::new().expect("create pipe");
        for _ in 0..100 {
            notify(pipe.write_fd());
        }
        pipe.drain();
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(pipe.read_fd(), buf.as_mut_ptr().cast(), 1) };
        assert_eq!(n, -1, "nothing left after drain");
    }

    #[test]
    fn notify_without_pipe_is_a_noop() {
        notify(-1);
    }
}
