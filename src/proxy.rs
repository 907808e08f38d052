//! Bidirectional console proxy between the user's terminal and a PTY
//! master. Signal handling is folded into the epoll loop through a
//! signalfd; no signal handlers, no globals.

use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{read, write, Pid};

use crate::tty;

const STDIN_TOKEN: u64 = 0;
const MASTER_TOKEN: u64 = 1;
const SIGNAL_TOKEN: u64 = 2;

const BUF_SIZE: usize = 8192;

/// Runs the proxy loop until the master hangs up or `watch` exits.
///
/// * `master` — the console PTY master.
/// * `forward_to` — PID 1 of the container; receives SIGINT/SIGTERM typed
///   by the user.
/// * `watch` — the direct child whose exit ends the loop (the monitor for
///   foreground start, the intermediate for enter).
///
/// Returns the wait status of `watch` if it was reaped inside the loop.
pub fn proxy_console(
    master: RawFd,
    forward_to: Pid,
    watch: Pid,
) -> Result<Option<WaitStatus>> {
    let stdin = std::io::stdin();
    let stdin_fd = stdin.as_raw_fd();

    let saved_termios = if tty::is_terminal(stdin_fd) {
        let _ = tty::copy_winsize(stdin_fd, master);
        Some(tty::set_raw(stdin_fd)?)
    } else {
        None
    };

    let result = proxy_loop(stdin_fd, master, forward_to, watch);

    if let Some(saved) = &saved_termios {
        tty::restore(stdin_fd, saved);
    }
    result
}

fn proxy_loop(
    stdin_fd: RawFd,
    master: RawFd,
    forward_to: Pid,
    watch: Pid,
) -> Result<Option<WaitStatus>> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGWINCH);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGCHLD);
    mask.thread_block().context("failed to block signals")?;
    let mut sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
        .context("failed to create signalfd")?;

    let epoll = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
    let mut add = |fd: RawFd, token: u64| -> Result<()> {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, token);
        epoll_ctl(epoll, EpollOp::EpollCtlAdd, fd, &mut event)
            .with_context(|| format!("failed to register fd {} with epoll", fd))?;
        Ok(())
    };
    add(stdin_fd, STDIN_TOKEN)?;
    add(master, MASTER_TOKEN)?;
    add(sfd.as_raw_fd(), SIGNAL_TOKEN)?;

    let mut buf = [0u8; BUF_SIZE];
    let mut events = [EpollEvent::empty(); 8];
    let mut reaped = None;

    'outer: loop {
        let n = match epoll_wait(epoll, &mut events, -1) {
            Err(Errno::EINTR) => continue,
            other => other?,
        };

        for event in events.iter().take(n) {
            let flags = event.events();
            match event.data() {
                STDIN_TOKEN => {
                    if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                        break 'outer;
                    }
                    let count = read_ignoring_eintr(stdin_fd, &mut buf)?;
                    if count == 0 {
                        break 'outer;
                    }
                    write_all(master, &buf[..count])?;
                }
                MASTER_TOKEN => {
                    // The guest dropping its side of the console shows up
                    // as HUP here and ends the session.
                    if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                        break 'outer;
                    }
                    let count = read_ignoring_eintr(master, &mut buf)?;
                    if count == 0 {
                        break 'outer;
                    }
                    write_all(1, &buf[..count])?;
                }
                SIGNAL_TOKEN => {
                    while let Ok(Some(siginfo)) = sfd.read_signal() {
                        match siginfo.ssi_signo as i32 {
                            libc::SIGWINCH => {
                                let _ = tty::copy_winsize(stdin_fd, master);
                            }
                            libc::SIGINT => {
                                let _ = kill(forward_to, Signal::SIGINT);
                            }
                            libc::SIGTERM => {
                                let _ = kill(forward_to, Signal::SIGTERM);
                            }
                            libc::SIGCHLD => {
                                if let Some(status) = reap(watch)? {
                                    reaped = Some(status);
                                    break 'outer;
                                }
                            }
                            _ => (),
                        }
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    let _ = nix::unistd::close(epoll);
    let _ = mask.thread_unblock();
    Ok(reaped)
}

fn reap(watch: Pid) -> Result<Option<WaitStatus>> {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => {
                if status.pid() == Some(watch) {
                    return Ok(Some(status));
                }
            }
            Err(Errno::ECHILD) => return Ok(None),
            Err(e) => return Err(e).context("waitpid failed in proxy loop"),
        }
    }
}

fn read_ignoring_eintr(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        match read(fd, buf) {
            Err(Errno::EINTR) => continue,
            // EIO from a pty master means the slave side is gone.
            Err(Errno::EIO) => return Ok(0),
            other => return other.with_context(|| format!("read from fd {} failed", fd)),
        }
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match write(fd, data) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).with_context(|| format!("write to fd {} failed", fd)),
            Ok(n) => data = &data[n..],
        }
    }
    Ok(())
}
