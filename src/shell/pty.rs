//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd is owned by the
//! [`super::session::PtySession`] for the session lifetime; the slave fd is
//! handed to the child and closed in the parent right after spawn. Both are
//! close-on-exec so only the intended shell ever holds them.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Terminal attributes and window size of the worker's own controlling
/// terminal, captured before spawning so nested sessions render the same way.
#[derive(Clone, Copy)]
pub struct InheritedTerminal {
    termios: libc::termios,
    winsize: libc::winsize,
}

impl InheritedTerminal {
    /// Capture stdin's attributes, or `None` when stdin is not a terminal.
    pub fn capture() -> Option<Self> {
        let fd = libc::STDIN_FILENO;
        // SAFETY: isatty/tcgetattr/TIOCGWINSZ only write into the local
        // out-params, which are fully initialized on success.
        unsafe {
            if libc::isatty(fd) != 1 {
                return None;
            }
            let mut termios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut termios) != 0 {
                return None;
            }
            let mut winsize: libc::winsize = std::mem::zeroed();
            if libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize) != 0 {
                return None;
            }
            Some(Self { termios, winsize })
        }
    }

    pub fn rows(&self) -> u16 {
        self.winsize.ws_row
    }

    pub fn cols(&self) -> u16 {
        self.winsize.ws_col
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(&winsize, None)?;
    // Sessions spawned concurrently must not inherit each other's PTY fds,
    // or a reader would never see EOF after its own shell exits.
    set_cloexec(&master)?;
    set_cloexec(&slave)?;
    Ok(PtyPair { master, slave })
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), nix::Error> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

/// Put the master into non-blocking mode. The flag is shared by every dup
/// of the descriptor.
pub fn set_nonblocking(fd: &impl AsRawFd) -> Result<(), nix::Error> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map(drop)
}

/// Spawn `shell` on the slave side of the PTY.
///
/// The child becomes a session leader with the slave as its controlling
/// terminal. When `inherited` is set, its attributes and window size are
/// applied to the slave inside the child before the shell image replaces it.
pub fn spawn_shell_pty(
    pty: &PtyPair,
    shell: &str,
    inherited: Option<InheritedTerminal>,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.kill_on_drop(true);

    // stdio is wired to the slave in pre_exec.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if std::env::var_os("TERM").is_none() {
        cmd.env("TERM", "xterm-256color");
    }

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(term) = inherited {
                if libc::tcsetattr(slave_fd, libc::TCSANOW, &term.termios) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSWINSZ, &term.winsize) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &impl AsRawFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Read the current window size of a PTY.
pub fn window_size(master: &impl AsRawFd) -> Result<(u16, u16), nix::Error> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a Winsize struct into the provided pointer.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCGWINSZ,
            std::ptr::addr_of_mut!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok((winsize.ws_row, winsize.ws_col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_round_trips_through_the_master() {
        let pty = allocate_pty(24, 80).unwrap();
        assert_eq!(window_size(&pty.master).unwrap(), (24, 80));
        resize_pty(&pty.master, 40, 120).unwrap();
        assert_eq!(window_size(&pty.master).unwrap(), (40, 120));
    }

    #[test]
    fn allocated_fds_are_close_on_exec() {
        let pty = allocate_pty(24, 80).unwrap();
        for fd in [&pty.master, &pty.slave] {
            let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn nonblocking_master_reports_would_block() {
        use std::io::Read;

        let pty = allocate_pty(24, 80).unwrap();
        set_nonblocking(&pty.master).unwrap();
        let mut master = std::fs::File::from(pty.master);
        let err = master.read(&mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
