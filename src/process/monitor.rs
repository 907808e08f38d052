//! The monitor: reaper and cleanup agent for one container. It owns the
//! container's UTS/IPC/PID (and, where available, cgroup) namespaces and
//! runs detached from the user's terminal.

use std::process::exit;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, close, ForkResult, Pid};

use super::channel::InitPidSender;
use super::{boot, detach_stdio, fork};
use crate::cgroups;
use crate::container::{self, Container};
use crate::platform;

/// Entry point of the forked monitor; never returns.
pub fn run_monitor(cfg: &Container, sender: InitPidSender) -> ! {
    match monitor_main(cfg, sender) {
        Ok(status) => exit(status),
        Err(e) => {
            log::error!("monitor failed: {:?}", e);
            exit(1);
        }
    }
}

fn monitor_main(cfg: &Container, mut sender: InitPidSender) -> Result<i32> {
    // Detach from the caller's session; the console connection runs over
    // the PTY masters, not the terminal.
    if let Err(e) = unistd::setsid() {
        log::debug!("setsid in monitor failed: {}", e);
    }
    if let Err(e) = prctl::set_name(&format!("droidspaces: monitor {}", cfg.name)) {
        log::debug!("could not set monitor process title: {}", e);
    }

    // The monitor must sit inside the name-scoped cgroup before unsharing,
    // or the cgroup namespace would be rooted in the caller's cgroup.
    let hierarchies = cgroups::discover()?;
    cgroups::setup::create_runtime_scope(&cfg.name, &hierarchies)?;

    let mut flags =
        CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWPID;
    if platform::cgroup_ns_supported() {
        flags |= CloneFlags::CLONE_NEWCGROUP;
    }
    unshare(flags).context("failed to unshare container namespaces")?;

    let init_pid = match fork() {
        Err(e) => {
            let _ = sender.send_boot_failed();
            return Err(e);
        }
        Ok(ForkResult::Child) => {
            // PID 1 of the new namespace. internal_boot only returns on
            // error; the monitor observes the exit either way.
            let err = boot::internal_boot(cfg);
            log::error!("container boot failed: {:?}", err.unwrap_err());
            exit(1);
        }
        Ok(ForkResult::Parent { child }) => child,
    };

    if let Err(e) = sender.send_init_pid(init_pid) {
        log::warn!("could not deliver the init pid to the parent: {:?}", e);
    }

    // The init binds the slaves by device path; holding the fds here would
    // keep the console master from ever seeing hangup.
    for pty in &cfg.ttys {
        let _ = close(pty.slave);
    }

    unistd::chdir("/").context("monitor failed to chdir to /")?;
    if !cfg.flags.foreground {
        detach_stdio()?;
    }

    let status = wait_for_init(init_pid)?;
    log::debug!("container init exited with {}", status);

    if container::restart_marker(&cfg.name).exists() {
        // A restart is in flight; the marker tells us to leave the mount,
        // sidecars and PID file for the immediately following start.
        log::debug!("restart marker present, skipping cleanup for {}", cfg.name);
    } else {
        container::cleanup_artifacts(&cfg.name, Some(&cfg.rootfs_path))?;
    }

    Ok(status)
}

fn wait_for_init(init_pid: Pid) -> Result<i32> {
    loop {
        match waitpid(init_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("waitpid on container init failed"),
        }
    }
}
