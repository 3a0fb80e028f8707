//! Listening-socket setup.
//!
//! The listener is built with raw calls so `SO_REUSEADDR` lands before
//! `bind`, then wrapped in a `std::net::TcpListener` for accepts.

use std::io;
use std::net::TcpListener;
use std::os::unix::io::{FromRawFd, RawFd};

fn last_error_and_close(fd: RawFd) -> io::Error {
    let err = io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    err
}

/// Create a non-blocking IPv4 listener on `INADDR_ANY:port`.
pub(crate) fn bind_listener(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let reuse: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(reuse).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(last_error_and_close(fd));
    }

    let mut address: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    address.sin_family = libc::AF_INET as libc::sa_family_t;
    address.sin_port = port.to_be();
    address.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(address).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(last_error_and_close(fd));
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        return Err(last_error_and_close(fd));
    }

    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Enable `SO_LINGER` so a close blocks (up to `secs`) while queued
/// output drains, instead of discarding it with a reset.
pub(crate) fn set_linger(fd: RawFd, secs: u16) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: libc::c_int::from(secs),
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            std::ptr::addr_of!(linger).cast::<libc::c_void>(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn listener_binds_and_accepts() {
        let listener = bind_listener(0, 5).expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        assert_ne!(port, 0);

        // Non-blocking: an accept with no client would-blocks.
        let err = listener.accept().expect_err("no pending client");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let mut client =
            std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect to listener");
        client.write_all(b"x").expect("client write");
        // The connection shows up eventually; poll briefly.
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (stream, _addr) = accepted.expect("client accepted");
        set_linger(stream.as_raw_fd(), 5).expect("set linger");
    }

    #[test]
    fn rebind_same_port_succeeds() {
        // SO_REUSEADDR means a fresh listener can take the port back
        // while the old socket lingers in TIME_WAIT.
        let first = bind_listener(0, 5).expect("bind");
        let port = first.local_addr().expect("local addr").port();
        drop(first);
        let second = bind_listener(port, 5).expect("rebind");
        drop(second);
    }
}
