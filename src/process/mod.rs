//! Process topology: the monitor fork, the boot fork, and the pipe that
//! carries the init PID back to the parent.

pub mod boot;
pub mod channel;
pub mod monitor;

use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::unistd::{dup2, ForkResult};

#[derive(Debug, Clone, Copy)]
pub struct FileDescriptor(RawFd);

const STDIN: i32 = 0;
const STDOUT: i32 = 1;
const STDERR: i32 = 2;

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl From<RawFd> for FileDescriptor {
    fn from(fd: RawFd) -> Self {
        FileDescriptor(fd)
    }
}

pub fn connect_stdio(
    stdin: &FileDescriptor,
    stdout: &FileDescriptor,
    stderr: &FileDescriptor,
) -> Result<()> {
    dup2(stdin.as_raw_fd(), STDIN)?;
    dup2(stdout.as_raw_fd(), STDOUT)?;
    dup2(stderr.as_raw_fd(), STDERR)?;
    Ok(())
}

/// Thin wrapper so callers get an anyhow error with context instead of a
/// bare errno.
pub fn fork() -> Result<ForkResult> {
    unsafe { nix::unistd::fork() }.context("fork failed")
}

/// Redirects stdio to /dev/null; the detached monitor does this in
/// background mode.
pub fn detach_stdio() -> Result<()> {
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    let fd = FileDescriptor::from(devnull.as_raw_fd());
    connect_stdio(&fd, &fd, &fd)?;
    std::mem::forget(devnull);
    Ok(())
}
