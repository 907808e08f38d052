//! PTY plane: master/slave allocation, raw-mode termios, window-size
//! mirroring and FD passing over Unix sockets.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, SetArg, Termios,
};
use nix::sys::uio::IoVec;
use nix::unistd::{chown, dup2, setsid, Gid, Uid};

use crate::process::connect_stdio;
use crate::process::FileDescriptor;

/// Group owning slave device nodes, mirroring what login(1) does.
const TTY_GID: u32 = 5;

/// Wire prefix for the `enter` master handoff.
const FD_PASS_MAGIC: &[u8; 4] = b"DSPT";

/// One master/slave pair. The master stays with the parent or monitor; the
/// slave device path is bind-mounted into the container as `/dev/console`
/// or `/dev/ttyN`.
#[derive(Debug)]
pub struct Pty {
    pub master: RawFd,
    pub slave: RawFd,
    pub slave_path: PathBuf,
}

impl Pty {
    pub fn open() -> Result<Self> {
        let pair = openpty(None, None).context("could not create pseudo terminal")?;
        for fd in &[pair.master, pair.slave] {
            fcntl(*fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .context("failed to set FD_CLOEXEC on pty")?;
        }
        let slave_path = slave_device_path(pair.slave)?;
        chown(
            &slave_path,
            Some(Uid::from_raw(0)),
            Some(Gid::from_raw(TTY_GID)),
        )
        .with_context(|| format!("failed to chown {:?}", slave_path))?;
        fchmodat(
            None,
            &slave_path,
            Mode::from_bits_truncate(0o620),
            FchmodatFlags::FollowSymlink,
        )
        .with_context(|| format!("failed to chmod {:?}", slave_path))?;

        Ok(Pty {
            master: pair.master,
            slave: pair.slave,
            slave_path,
        })
    }
}

/// The `/dev/pts/N` path behind a slave fd.
fn slave_device_path(slave: RawFd) -> Result<PathBuf> {
    let mut buf = [0u8; 128];
    let rc = unsafe { libc::ttyname_r(slave, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        bail!("ttyname_r on fd {} failed: {}", slave, rc);
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let path = std::str::from_utf8(&buf[..end]).context("slave path is not utf-8")?;
    Ok(PathBuf::from(path))
}

/// Copies the window size of `from` onto `to`. Soft-fail when `from` is not
/// a terminal.
pub fn copy_winsize(from: RawFd, to: RawFd) -> Result<()> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(from, libc::TIOCGWINSZ, &mut ws) } < 0 {
        bail!("TIOCGWINSZ failed on fd {}", from);
    }
    if unsafe { libc::ioctl(to, libc::TIOCSWINSZ, &ws) } < 0 {
        bail!("TIOCSWINSZ failed on fd {}", to);
    }
    Ok(())
}

pub fn is_terminal(fd: RawFd) -> bool {
    nix::unistd::isatty(fd).unwrap_or(false)
}

/// Puts `fd` into raw mode and returns the previous termios so the caller
/// can restore it when the proxy loop ends. OPOST stays enabled: dropping
/// ONLCR produces staircase output once the guest stops sending `\r` during
/// shutdown.
pub fn set_raw(fd: RawFd) -> Result<Termios> {
    let saved = tcgetattr(fd).context("failed to read terminal attributes")?;
    let mut raw = saved.clone();
    raw.input_flags.remove(
        InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXOFF,
    );
    raw.local_flags.remove(
        LocalFlags::ISIG
            | LocalFlags::ICANON
            | LocalFlags::ECHO
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::ECHONL
            | LocalFlags::IEXTEN
            | LocalFlags::TOSTOP,
    );
    tcsetattr(fd, SetArg::TCSANOW, &raw).context("failed to enter raw mode")?;
    Ok(saved)
}

pub fn restore(fd: RawFd, saved: &Termios) {
    let _ = tcsetattr(fd, SetArg::TCSANOW, saved);
}

/// Makes `slave` the controlling terminal of the calling process and wires
/// it to stdin/stdout/stderr. Must run in the final process that execs the
/// payload: an ancestor holding the controlling TTY would leave the shell's
/// own setsid unable to re-acquire it.
pub fn set_controlling_tty(slave: RawFd) -> Result<()> {
    setsid().context("setsid failed")?;
    if unsafe { libc::ioctl(slave, libc::TIOCSCTTY, 0) } < 0 {
        bail!("could not acquire controlling terminal (TIOCSCTTY)");
    }
    let fd = FileDescriptor::from(slave);
    connect_stdio(&fd, &fd, &fd).context("could not dup tty onto stdio")?;
    Ok(())
}

/// Opens `path` and redirects stdio to it; used by the boot sequence on the
/// bound `/dev/console` after pivot_root.
pub fn adopt_console(path: &Path) -> Result<()> {
    let console = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {:?}", path))?;
    use std::os::unix::io::IntoRawFd;
    let fd = console.into_raw_fd();
    setsid().context("setsid failed")?;
    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) } < 0 {
        log::warn!("could not make {:?} the controlling terminal", path);
    }
    dup2(fd, 0).context("failed to dup console to stdin")?;
    dup2(fd, 1).context("failed to dup console to stdout")?;
    dup2(fd, 2).context("failed to dup console to stderr")?;
    if fd > 2 {
        let _ = nix::unistd::close(fd);
    }
    Ok(())
}

/// Sends a PTY master across a process boundary (SCM_RIGHTS with a 4-byte
/// magic payload).
pub fn send_master(socket_fd: RawFd, master: RawFd) -> Result<()> {
    let iov = [IoVec::from_slice(FD_PASS_MAGIC)];
    let fds = [master];
    let cmsg = ControlMessage::ScmRights(&fds);
    socket::sendmsg(socket_fd, &iov, &[cmsg], MsgFlags::empty(), None)
        .context("failed to send pty master")?;
    Ok(())
}

/// Receives the PTY master sent by [`send_master`].
pub fn recv_master(socket_fd: RawFd) -> Result<RawFd> {
    let mut buf = [0u8; 4];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = socket::recvmsg(socket_fd, &iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .context("failed to receive pty master")?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if buf != *FD_PASS_MAGIC {
                bail!("unexpected fd-pass payload {:?}", buf);
            }
            if let Some(fd) = fds.first() {
                return Ok(*fd);
            }
        }
    }
    bail!("no file descriptor in control message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::close;

    #[test]
    fn test_open_pty_pair() {
        let pty = Pty::open().unwrap();
        assert!(pty.master >= 0);
        assert!(pty.slave >= 0);
        assert!(pty.slave_path.starts_with("/dev/pts"));
        let _ = close(pty.master);
        let _ = close(pty.slave);
    }

    #[test]
    fn test_slave_permissions() {
        let pty = Pty::open().unwrap();
        let meta = std::fs::metadata(&pty.slave_path).unwrap();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(meta.permissions().mode() & 0o777, 0o620);
        let _ = close(pty.master);
        let _ = close(pty.slave);
    }

    #[test]
    fn test_fd_passing_roundtrip() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let pty = Pty::open().unwrap();
        send_master(a, pty.master).unwrap();
        let received = recv_master(b).unwrap();
        assert!(received >= 0);
        assert!(is_terminal(received));
        for fd in &[a, b, received, pty.master, pty.slave] {
            let _ = close(*fd);
        }
    }
}
