//! Namespace handles for the enter/run paths. All five handles are opened
//! before the first setns so a dying container cannot leave the caller
//! half-entered.

use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, Pid};

/// Entry order: identity namespaces first, mount last, so proc paths stay
/// resolvable until nothing needs them.
const NAMESPACES: &[(&str, CloneFlags)] = &[
    ("cgroup", CloneFlags::CLONE_NEWCGROUP),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

pub struct NamespaceHandles {
    handles: Vec<(CloneFlags, RawFd)>,
}

impl NamespaceHandles {
    /// Opens the target's namespace files. The cgroup namespace is
    /// optional (kernels before 4.6); everything else is required.
    pub fn open(target: Pid) -> Result<Self> {
        let mut handles = vec![];
        for (name, flag) in NAMESPACES {
            let path = format!("/proc/{}/ns/{}", target, name);
            match open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
                Ok(fd) => handles.push((*flag, fd)),
                Err(e) if *name == "cgroup" => {
                    log::debug!("no cgroup namespace handle for {}: {}", target, e);
                }
                Err(e) => {
                    for (_, fd) in &handles {
                        let _ = close(*fd);
                    }
                    return Err(e).with_context(|| format!("failed to open {}", path));
                }
            }
        }
        Ok(Self { handles })
    }

    /// Joins every opened namespace. Entering the PID namespace only takes
    /// effect for children forked afterwards.
    pub fn enter(&self) -> Result<()> {
        for (flag, fd) in &self.handles {
            setns(*fd, *flag)
                .with_context(|| format!("setns({:?}) failed", flag))?;
        }
        Ok(())
    }
}

impl Drop for NamespaceHandles {
    fn drop(&mut self) {
        for (_, fd) in &self.handles {
            let _ = close(*fd);
        }
    }
}
