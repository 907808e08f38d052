//! `stop`: signal escalation with hard timeouts, then host cleanup.

use std::os::linux::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::Settings;
use crate::container::{self, discovery};
use crate::platform;
use crate::utils;

/// Grace window for the guest's own shutdown.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(15);
/// After this much of the window, SIGTERM joins the poweroff signal.
const SIGTERM_AFTER: Duration = Duration::from_secs(2);
/// Post-SIGKILL wait before declaring the process unkillable.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(200);

pub fn exec(settings: &Settings, skip_unmount: bool) -> Result<()> {
    if settings.pidfile.is_some() {
        let (_, pid) = settings.resolve_target()?;
        return stop_one(None, pid, skip_unmount);
    }
    let names = match &settings.name {
        Some(list) => list
            .split(',')
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .collect::<Vec<_>>(),
        None => bail!("a container must be selected with --name or --pidfile"),
    };
    for name in &names {
        let pid = discovery::resolve_name(name)?
            .with_context(|| format!("no running container named {:?}", name))?;
        stop_one(Some(name), pid, skip_unmount)?;
    }
    Ok(())
}

pub fn stop_one(name: Option<&str>, pid: Pid, skip_unmount: bool) -> Result<()> {
    // The marker must exist before any signal: the monitor consults it the
    // moment the init exits.
    if skip_unmount {
        if let Some(name) = name {
            utils::atomic_write(container::restart_marker(name), "1\n")?;
        }
    }

    // Resolved while the process is still alive; gone afterwards.
    let rootfs = rootfs_of(pid, name);

    // SIGRTMIN+3 is systemd's external poweroff request; OpenRC and runit
    // inits installed by droidspaces wire it to their own shutdown.
    let poweroff = libc::SIGRTMIN() + 3;
    if unsafe { libc::kill(pid.as_raw(), poweroff) } != 0 {
        bail!(
            "could not signal pid {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }

    if !wait_for_exit(pid)? {
        log::warn!(
            "container init {} survived SIGKILL; the kernel likely wedged it \
             (a known Android zombie state), continuing with host cleanup",
            pid
        );
    }

    if skip_unmount {
        return Ok(());
    }

    if let Some(rootfs) = &rootfs {
        if let Err(e) = platform::firmware_path_remove(rootfs) {
            log::warn!("firmware path cleanup failed: {:?}", e);
        }
    }
    if let Some(name) = name {
        container::cleanup_artifacts(name, rootfs.as_deref())?;
    }
    Ok(())
}

/// Escalation: poweroff → SIGTERM at the 2 s mark → SIGKILL at 15 s → give
/// up 5 s later. Returns whether the process actually died.
fn wait_for_exit(pid: Pid) -> Result<bool> {
    let start = Instant::now();
    let mut sigterm_sent = false;
    while start.elapsed() < GRACEFUL_TIMEOUT {
        if kill(pid, None).is_err() {
            return Ok(true);
        }
        if !sigterm_sent && start.elapsed() >= SIGTERM_AFTER {
            let _ = kill(pid, Signal::SIGTERM);
            sigterm_sent = true;
        }
        std::thread::sleep(POLL);
    }

    let _ = kill(pid, Signal::SIGKILL);
    let killed_at = Instant::now();
    while killed_at.elapsed() < KILL_TIMEOUT {
        if kill(pid, None).is_err() {
            return Ok(true);
        }
        std::thread::sleep(POLL);
    }
    Ok(false)
}

/// Recovers the host-side rootfs path of a running container: the mount
/// sidecar when there is one, else the firmware search path entry whose
/// directory is the same inode as `/proc/<pid>/root`.
fn rootfs_of(pid: Pid, name: Option<&str>) -> Option<PathBuf> {
    if let Some(name) = name {
        if let Ok(mp) = utils::read_trimmed(container::mount_sidecar(name)) {
            return Some(PathBuf::from(mp));
        }
    }

    let proc_root = std::fs::metadata(format!("/proc/{}/root", pid)).ok()?;
    let fw = utils::read_trimmed("/sys/module/firmware_class/parameters/path").ok()?;
    for entry in fw.split(':').filter(|e| e.ends_with("/lib/firmware")) {
        let candidate = match Path::new(entry).parent().and_then(|p| p.parent()) {
            Some(c) => c,
            None => continue,
        };
        if let Ok(meta) = std::fs::metadata(candidate) {
            if meta.st_dev() == proc_root.st_dev() && meta.st_ino() == proc_root.st_ino() {
                return Some(candidate.to_path_buf());
            }
        }
    }
    None
}
