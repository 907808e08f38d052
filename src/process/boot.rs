//! The init-side boot sequence: turns a bare forked process into PID 1 of
//! a fully assembled container and execs the guest init. The step order is
//! load-bearing; later steps depend on the mount state of earlier ones.

use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::unistd::{self, chown, Gid, Uid};

use crate::cgroups;
use crate::container::Container;
use crate::devices;
use crate::fsutil;
use crate::network;
use crate::overlay;
use crate::platform;
use crate::seccomp;
use crate::tty;
use crate::utils::{self, PathBufExt};
use crate::{AUX_TTY_COUNT, CONTAINER_IDENT, RUN_MARKER, UUID_SYNC_FILE, VERSION};

const OLD_ROOT: &str = ".old_root";

pub fn internal_boot(cfg: &Container) -> Result<Infallible> {
    // 1. Private mount namespace; nothing below leaks to the host.
    unshare(CloneFlags::CLONE_NEWNS).context("failed to unshare the mount namespace")?;
    fsutil::make_mount_tree_private()?;

    // 2. Seccomp shield. Install failure is survivable, a missing shield
    // only matters on kernels that also tend to lack filter support.
    if platform::is_android() {
        if let Err(e) = seccomp::apply_shield(cfg.guest_init) {
            log::warn!("seccomp shield not installed: {:?}", e);
        }
    }

    // 3. Volatile overlay, mounted inside this namespace so its lifetime
    // is the container's.
    let rootfs = match &cfg.volatile_workspace {
        Some(workspace) => overlay::mount_overlay(workspace)?,
        None => cfg.rootfs_path.clone(),
    };

    // 4–5. pivot_root needs the new root to be a mount; everything after
    // this chdir is rootfs-relative.
    fsutil::bind_recursive(&rootfs, &rootfs)?;
    unistd::chdir(&rootfs).with_context(|| format!("failed to chdir into {:?}", rootfs))?;

    // 6. Consume the UUID sync file. The volatile lowerdir is read-only,
    // so in that mode the in-memory copy is authoritative.
    let uuid = consume_uuid_sync_file(cfg)?;

    // 7.
    fs::create_dir_all(OLD_ROOT).context("failed to prepare .old_root")?;

    // 8.
    if cfg.flags.hw_access {
        devices::setup_dev_hw(Path::new("dev"))?;
    } else {
        devices::setup_dev_isolated(Path::new("dev"), AUX_TTY_COUNT)?;
    }

    // 9.
    fs::create_dir_all("proc")?;
    fsutil::mount(
        None,
        Path::new("proc"),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )?;

    // 10.
    setup_sys(cfg.flags.hw_access)?;

    // 11.
    fs::create_dir_all("run")?;
    fsutil::mount(
        None,
        Path::new("run"),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=755"),
    )?;

    // 12. Bind the slave PTYs while their parent-side device paths are
    // still reachable.
    bind_console_ttys(cfg)?;

    // 13. Discovery markers.
    utils::write_file(format!("run/{}", uuid), "")?;
    utils::write_file(format!("run/{}", RUN_MARKER), format!("{}\n", VERSION))?;

    // 14.
    let hierarchies = cgroups::discover()?;
    let ns_active = cgroups::hierarchy::cgroup_ns_active()?;
    cgroups::setup::setup_container_cgroups(&hierarchies, ns_active)?;

    // 15.
    if cfg.flags.android_storage {
        bind_android_storage()?;
    }

    // 16.
    apply_custom_binds(cfg)?;

    // 17. Point of no return.
    unistd::pivot_root(".", OLD_ROOT).context("pivot_root failed")?;
    unistd::chdir("/").context("failed to chdir to the new root")?;

    // 18.
    devices::setup_devpts()?;

    // 19.
    network::configure_rootfs(&cfg.hostname, &cfg.resolv_conf)?;

    // 20.
    fsutil::umount_lazy(Path::new("/.old_root"))?;
    let _ = fs::remove_dir("/.old_root");

    // 21.
    utils::create_dir_all("/run/systemd")?;
    utils::write_file("/run/systemd/container", format!("{}\n", CONTAINER_IDENT))?;

    // 22.
    setup_environment()?;

    // 23.
    tty::adopt_console(Path::new("/dev/console"))?;
    // The guest's TTYReset may have raced us; re-assert login-style perms.
    let _ = chown(
        "/dev/console",
        Some(Uid::from_raw(0)),
        Some(Gid::from_raw(5)),
    );
    let _ = fchmodat(
        None,
        "/dev/console",
        Mode::from_bits_truncate(0o620),
        FchmodatFlags::FollowSymlink,
    );

    // 24.
    let init = CString::new("/sbin/init")?;
    let argv = [init.clone()];
    unistd::execv(&init, &argv).context("execve of /sbin/init failed")
}

fn consume_uuid_sync_file(cfg: &Container) -> Result<String> {
    if cfg.volatile_workspace.is_some() {
        return Ok(cfg.uuid.clone());
    }
    let sync_file = Path::new(UUID_SYNC_FILE);
    if sync_file.exists() {
        let uuid = utils::read_trimmed(sync_file)?;
        let _ = fs::remove_file(sync_file);
        Ok(uuid)
    } else {
        Ok(cfg.uuid.clone())
    }
}

/// `/sys` handling. The read-only postcondition matters: systemd 258+
/// treats a writable /sys as "not a container" and starts attaching getty
/// to the host's physical TTYs.
fn setup_sys(hw_access: bool) -> Result<()> {
    let sys = Path::new("sys");
    fs::create_dir_all(sys)?;
    // Pre-create before anything becomes read-only.
    fs::create_dir_all("sys/fs/cgroup")?;

    if hw_access {
        fsutil::mount(None, sys, Some("sysfs"), MsFlags::empty(), None)?;
        // Self-bind each top-level subtree so the ro remount of /sys
        // itself cannot demote them.
        for entry in fs::read_dir(sys)? {
            let path = entry?.path();
            if path.is_dir() {
                fsutil::bind_recursive(&path, &path)?;
            }
        }
    } else {
        // Self-bind first; a later bind would shadow the net sysfs below.
        fsutil::bind(sys, sys)?;
        fs::create_dir_all("sys/devices/virtual/net")?;
        fsutil::mount(
            None,
            Path::new("sys/devices/virtual/net"),
            Some("sysfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None,
        )?;
    }
    fsutil::remount_read_only(sys)?;

    // Break console discovery, or the guest attaches agetty to the host
    // console.
    let console_active = Path::new("sys/class/tty/console/active");
    if console_active.exists() {
        fsutil::mount(
            Some(Path::new("dev/null")),
            console_active,
            None,
            MsFlags::MS_BIND,
            None,
        )?;
    }
    Ok(())
}

fn bind_console_ttys(cfg: &Container) -> Result<()> {
    fsutil::ensure_mountpoint(Path::new("dev/console"), true)?;
    fsutil::bind(&cfg.console().slave_path, Path::new("dev/console"))?;
    for (n, pty) in cfg.ttys.iter().enumerate().skip(1) {
        let target = PathBuf::from(format!("dev/tty{}", n));
        fsutil::ensure_mountpoint(&target, true)?;
        fsutil::bind(&pty.slave_path, &target)?;
    }
    Ok(())
}

fn bind_android_storage() -> Result<()> {
    let source = Path::new("/storage/emulated/0");
    if !source.exists() {
        log::warn!("{:?} not present, skipping android storage bind", source);
        return Ok(());
    }
    let target = Path::new("storage/emulated/0");
    fsutil::ensure_mountpoint(target, false)?;
    fsutil::bind_recursive(source, target)?;
    Ok(())
}

/// Custom bind mounts. A missing source is a warning, not a boot failure;
/// a symlinked destination or an escape from the rootfs is rejected.
fn apply_custom_binds(cfg: &Container) -> Result<()> {
    let rootfs_real = fs::canonicalize(".").context("failed to resolve the rootfs")?;
    for bind in &cfg.binds {
        if !bind.source.exists() {
            log::warn!("bind source {:?} does not exist, skipping", bind.source);
            continue;
        }
        let dest = bind.dest.clone().as_in_rootfs()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create parent of bind target {:?}", dest))?;
        }
        if let Ok(meta) = fs::symlink_metadata(&dest) {
            if meta.file_type().is_symlink() {
                bail!(
                    "bind destination {:?} is a symlink inside the rootfs",
                    bind.dest
                );
            }
        }
        fsutil::ensure_mountpoint(&dest, bind.source.is_file())?;
        fsutil::bind_recursive(&bind.source, &dest)?;

        // A mount whose real path escaped the rootfs would survive the
        // pivot pointing at host state.
        let real = fs::canonicalize(&dest)?;
        if !real.starts_with(&rootfs_real) {
            log::warn!(
                "bind destination {:?} resolved outside the rootfs, detaching",
                bind.dest
            );
            let _ = fsutil::umount_lazy(&dest);
        }
    }
    Ok(())
}

fn setup_environment() -> Result<()> {
    let term = env::var("TERM").unwrap_or_else(|_| "linux".to_string());
    for (key, _) in env::vars_os() {
        env::remove_var(key);
    }
    env::set_var(
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );
    env::set_var("TERM", term);
    env::set_var("LANG", "C.UTF-8");
    env::set_var("HOME", "/root");
    env::set_var("container", CONTAINER_IDENT);

    if let Ok(content) = fs::read_to_string("/etc/environment") {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(idx) = line.find('=') {
                let key = &line[..idx];
                let value = line[idx + 1..].trim_matches('"');
                env::set_var(key, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_environment_is_minimal() {
        env::set_var("DROIDSPACES_TEST_LEAK", "1");
        env::set_var("TERM", "xterm-256color");
        setup_environment().unwrap();
        assert!(env::var("DROIDSPACES_TEST_LEAK").is_err());
        assert_eq!(env::var("container").unwrap(), CONTAINER_IDENT);
        assert_eq!(env::var("TERM").unwrap(), "xterm-256color");
        assert!(env::var("PATH").unwrap().contains("/sbin"));
    }
}
