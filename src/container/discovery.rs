//! PID discovery: the aliveness predicate, name and UUID lookup, and the
//! orphan scan.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use procfs::process::Process;

use super::{image_mount_root, mount_sidecar, pid_file, pids_dir};
use crate::fsutil;
use crate::utils;
use crate::RUN_MARKER;

const UUID_RETRIES: u32 = 20;
const UUID_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A process is a droidspaces container init iff it is alive, carries the
/// run marker in its root, and its cmdline names an init. The marker and
/// the cmdline together keep an arbitrary PID-reuser from passing.
pub fn is_alive(pid: Pid) -> bool {
    if kill(pid, None).is_err() {
        return false;
    }
    let marker = PathBuf::from(format!("/proc/{}/root/run/{}", pid, RUN_MARKER));
    if !marker.exists() {
        return false;
    }
    match Process::new(pid.as_raw()).and_then(|p| p.cmdline()) {
        Ok(cmdline) => cmdline.iter().any(|arg| arg.contains("init")),
        Err(_) => false,
    }
}

/// Reads a PID file; an unparseable one is a resource-conflict error, a
/// missing one resolves to None.
pub fn read_pid_file(path: &Path) -> Result<Option<Pid>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = utils::read_trimmed(path)?;
    let raw: i32 = content
        .parse()
        .with_context(|| format!("PID file {:?} is unparseable", path))?;
    Ok(Some(Pid::from_raw(raw)))
}

/// Resolves a name to a live container init PID, or None when the name is
/// free or its PID file is stale.
pub fn resolve_name(name: &str) -> Result<Option<Pid>> {
    match read_pid_file(&pid_file(name))? {
        Some(pid) if is_alive(pid) => Ok(Some(pid)),
        _ => Ok(None),
    }
}

/// Resolves a custom PID file the same way.
pub fn resolve_pid_file(path: &Path) -> Result<Option<Pid>> {
    match read_pid_file(path)? {
        Some(pid) if is_alive(pid) => Ok(Some(pid)),
        _ => Ok(None),
    }
}

pub fn name_in_use(name: &str) -> Result<bool> {
    Ok(resolve_name(name)?.is_some())
}

fn proc_pids() -> Result<Vec<Pid>> {
    let mut pids = vec![];
    for entry in fs::read_dir("/proc").context("failed to read /proc")? {
        let entry = entry?;
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<i32>().ok())
        {
            pids.push(Pid::from_raw(pid));
        }
    }
    Ok(pids)
}

/// One pass over /proc looking for the freshly booted container by its
/// UUID marker.
pub fn find_by_uuid(uuid: &str) -> Result<Option<Pid>> {
    for pid in proc_pids()? {
        let marker = PathBuf::from(format!("/proc/{}/root/run/{}", pid, uuid));
        if marker.exists() {
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

/// Bounded retry wrapper around [`find_by_uuid`] used right after the boot
/// fork, before the init has necessarily written its markers.
pub fn wait_for_uuid(uuid: &str) -> Result<Pid> {
    for _ in 0..UUID_RETRIES {
        if let Some(pid) = find_by_uuid(uuid)? {
            return Ok(pid);
        }
        std::thread::sleep(UUID_RETRY_DELAY);
    }
    bail!("no container with uuid {} appeared", uuid)
}

/// True when `pid` is PID 1 of its own PID namespace: the last token of
/// the `NSpid:` status line equals 1.
pub fn is_container_init(pid: Pid) -> bool {
    let status = match fs::read_to_string(format!("/proc/{}/status", pid)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    status
        .lines()
        .find(|l| l.starts_with("NSpid:"))
        .and_then(|l| l.split_whitespace().last())
        .map(|last| last == "1")
        .unwrap_or(false)
}

/// All names with a PID file on disk, alive or not.
pub fn known_names() -> Result<Vec<String>> {
    let dir = pids_dir();
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "pid").unwrap_or(false) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub adopted: Vec<String>,
    pub removed_stale: Vec<String>,
    pub unmounted: Vec<PathBuf>,
}

/// Reconciles on-disk state with reality: adopts live container inits that
/// lost their PID file, garbage-collects stale PID files, and lazily
/// unmounts image slots no sidecar references.
pub fn scan() -> Result<ScanReport> {
    let mut report = ScanReport::default();

    // Stale PID files first so adoption below sees accurate ownership.
    let mut owned_pids = vec![];
    for name in known_names()? {
        match resolve_name(&name)? {
            Some(pid) => owned_pids.push(pid),
            None => {
                let _ = fs::remove_file(pid_file(&name));
                report.removed_stale.push(name);
            }
        }
    }

    for pid in proc_pids()? {
        if owned_pids.contains(&pid) {
            continue;
        }
        if is_alive(pid) && is_container_init(pid) {
            let name = super::name::allocate(&format!("recovered-{}", pid))?;
            utils::create_dir_all(pids_dir())?;
            utils::atomic_write(pid_file(&name), format!("{}\n", pid))?;
            log::info!("adopted orphan container init {} as {}", pid, name);
            report.adopted.push(name);
        }
    }

    report.unmounted = sweep_stray_mounts()?;
    Ok(report)
}

/// Image mount points not referenced by any sidecar are leftovers of a
/// crashed monitor; detach them lazily.
fn sweep_stray_mounts() -> Result<Vec<PathBuf>> {
    let root = image_mount_root();
    if !root.exists() {
        return Ok(vec![]);
    }
    let mut referenced = vec![];
    for name in known_names()? {
        if let Ok(mp) = utils::read_trimmed(mount_sidecar(&name)) {
            referenced.push(PathBuf::from(mp));
        }
    }

    let mut swept = vec![];
    for entry in fs::read_dir(&root)? {
        let path = entry?.path();
        if !path.is_dir() || referenced.contains(&path) {
            continue;
        }
        if fsutil::is_mountpoint(&path)? {
            if let Err(e) = fsutil::umount_lazy(&path) {
                log::warn!("could not unmount stray {:?}: {:?}", path, e);
            } else {
                let _ = fs::remove_dir(&path);
                swept.push(path);
            }
        }
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_read_pid_file_missing_is_none() {
        assert!(read_pid_file(Path::new("/nonexistent/x.pid"))
            .unwrap()
            .is_none());
    }

    #[test]
    #[serial]
    fn test_read_pid_file_unparseable_is_an_error() {
        let dir = crate::utils::create_temp_dir("test_bad_pid_file").unwrap();
        let path = dir.join("bad.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn test_read_pid_file_parses() {
        let dir = crate::utils::create_temp_dir("test_good_pid_file").unwrap();
        let path = dir.join("good.pid");
        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(Pid::from_raw(1234)));
    }

    #[test]
    fn test_ordinary_process_is_not_container_init() {
        // The test binary has no droidspaces run marker in its root.
        assert!(!is_alive(nix::unistd::getpid()));
    }

    #[test]
    fn test_host_pid1_nspid() {
        // Host init's NSpid is "1", so the predicate holds for it; any
        // other host process fails it.
        assert!(is_container_init(Pid::from_raw(1)));
        assert!(!is_container_init(nix::unistd::getpid()));
    }
}
