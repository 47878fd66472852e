//! Socket options that `mio` does not expose: the listen backlog and TCP
//! keepalive timing.
//!
//! Both are set with raw `setsockopt`/`listen` calls through `libc` on Unix.
//! On other platforms they are accepted and ignored.

use std::io;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};

/// TCP keepalive timing applied to every accepted socket.
///
/// With the defaults a dead peer is detected after roughly
/// `idle + interval * retries` = 15 seconds of silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Time between unanswered probes.
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped.
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(10),
            interval: Duration::from_secs(1),
            retries: 5,
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::io;
    use std::os::unix::io::{AsRawFd, RawFd};

    use super::{Keepalive, TcpListener, TcpStream};

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn set_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        // SAFETY: `fd` is an open socket borrowed from its owner for the
        // duration of the call, and `value` outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                (&value as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        check(rc)
    }

    fn get_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `value` and `len` are valid for writes and sized for a
        // `c_int` option.
        let rc = unsafe {
            libc::getsockopt(fd, level, name, (&mut value as *mut libc::c_int).cast(), &mut len)
        };
        check(rc).map(|()| value)
    }

    fn secs(d: std::time::Duration) -> libc::c_int {
        libc::c_int::try_from(d.as_secs().max(1)).unwrap_or(libc::c_int::MAX)
    }

    pub fn set_backlog(listener: &TcpListener, backlog: u32) -> io::Result<()> {
        let backlog = libc::c_int::try_from(backlog).unwrap_or(libc::c_int::MAX);
        // SAFETY: the listener's descriptor is a bound, listening socket;
        // calling `listen` again only updates the queue length.
        check(unsafe { libc::listen(listener.as_raw_fd(), backlog) })
    }

    pub fn configure_keepalive(stream: &TcpStream, keepalive: &Keepalive) -> io::Result<()> {
        let fd = stream.as_raw_fd();
        set_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            set_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs(keepalive.idle))?;
            set_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs(keepalive.interval))?;
            let retries = libc::c_int::try_from(keepalive.retries).unwrap_or(libc::c_int::MAX);
            set_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, retries)?;
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = (keepalive, secs);

        Ok(())
    }

    pub fn keepalive_enabled(stream: &TcpStream) -> io::Result<bool> {
        get_int(stream.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE).map(|v| v != 0)
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    use super::{Keepalive, TcpListener, TcpStream};

    pub fn set_backlog(_listener: &TcpListener, _backlog: u32) -> io::Result<()> {
        Ok(())
    }

    pub fn configure_keepalive(_stream: &TcpStream, _keepalive: &Keepalive) -> io::Result<()> {
        Ok(())
    }

    pub fn keepalive_enabled(_stream: &TcpStream) -> io::Result<bool> {
        Ok(false)
    }
}

/// Re-applies `listen` with the given accept backlog.
///
/// # Errors
///
/// Returns the OS error from `listen(2)`.
pub fn set_backlog(listener: &TcpListener, backlog: u32) -> io::Result<()> {
    imp::set_backlog(listener, backlog)
}

/// Enables TCP keepalive on `stream` and, where supported, tunes its timing.
///
/// # Errors
///
/// Returns the OS error from `setsockopt(2)`.
pub fn configure_keepalive(stream: &TcpStream, keepalive: &Keepalive) -> io::Result<()> {
    imp::configure_keepalive(stream, keepalive)
}

/// Reads back whether `SO_KEEPALIVE` is set on `stream`.
///
/// # Errors
///
/// Returns the OS error from `getsockopt(2)`.
pub fn keepalive_enabled(stream: &TcpStream) -> io::Result<bool> {
    imp::keepalive_enabled(stream)
}
