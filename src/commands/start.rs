//! `start`: assembles the container record, forks the monitor and either
//! proxies the console (foreground) or waits for the boot marker.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::unistd::{close, ForkResult, Pid};

use super::Settings;
use crate::container::{self, discovery, name, Container};
use crate::image;
use crate::network;
use crate::overlay;
use crate::platform;
use crate::process::{channel, fork, monitor};
use crate::proxy;
use crate::tty::{self, Pty};
use crate::utils;
use crate::{AUX_TTY_COUNT, RUN_MARKER, UUID_SYNC_FILE, VERSION};

/// How long a background start waits for the boot marker.
const MARKER_WAIT: Duration = Duration::from_secs(5);
const MARKER_POLL: Duration = Duration::from_millis(200);

pub fn exec(mut settings: Settings) -> Result<()> {
    settings.validate()?;
    platform::validate_host()?;

    if settings.flags.android_storage && !platform::is_android() {
        log::warn!("--enable-android-storage is meaningless off Android, ignoring");
        settings.flags.android_storage = false;
    }

    container::ensure_workspace()?;

    if settings.flags.selinux_permissive {
        set_selinux_permissive();
    }

    let mut cfg = build_container(settings)?;

    // Sync file for PID discovery; the volatile lowerdir stays pristine.
    if cfg.volatile_workspace.is_none() {
        utils::write_file(cfg.rootfs_path.join(UUID_SYNC_FILE), &cfg.uuid)?;
    }

    verify_guest_init(&cfg.rootfs_path)?;

    // Parent-side PTY allocation: console plus the auxiliary TTYs, sized
    // to the caller's terminal before the guest init ever looks.
    for _ in 0..=AUX_TTY_COUNT {
        cfg.ttys.push(Pty::open()?);
    }
    if tty::is_terminal(0) {
        let _ = tty::copy_winsize(0, cfg.console().master);
    }

    let (sender, mut receiver) = channel::new()?;
    let monitor_pid = match fork()? {
        ForkResult::Child => monitor::run_monitor(&cfg, sender),
        ForkResult::Parent { child } => {
            // Our copy of the write end would mask a dying monitor.
            drop(sender);
            child
        }
    };

    // The slaves live on in the monitor/init side; holding them here would
    // keep the master from ever seeing HUP.
    for pty in &cfg.ttys {
        let _ = close(pty.slave);
    }

    let init_pid = receiver
        .wait_for_init_pid()
        .context("container failed to launch")?;
    cfg.container_pid = Some(init_pid);

    network::configure_host(cfg.flags.ipv6_enabled)?;
    if platform::is_android() && !cfg.is_img_mount {
        remount_data_suid();
    }
    if let Err(e) = platform::firmware_path_add(&cfg.rootfs_path) {
        log::warn!("firmware path update failed: {:?}", e);
    }

    cfg.write_pid_files(init_pid)?;
    if let Some(mount_point) = &cfg.img_mount_point {
        utils::atomic_write(
            container::mount_sidecar(&cfg.name),
            format!("{}\n", mount_point.display()),
        )?;
    }

    print_banner(&cfg, init_pid);

    if cfg.flags.foreground {
        let status = proxy::proxy_console(cfg.console().master, init_pid, monitor_pid)?;
        let code = match status {
            Some(nix::sys::wait::WaitStatus::Exited(_, code)) => code,
            Some(nix::sys::wait::WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
            _ => reap_monitor(monitor_pid),
        };
        std::process::exit(code);
    }

    let init_pid = wait_for_marker(&cfg, init_pid)?;
    println!(
        "{} is up (pid {}); enter it with: droidspaces -n {} enter",
        cfg.name, init_pid, cfg.name
    );
    Ok(())
}

/// Builds the container record: restart reuse, naming, image mount and
/// volatile preflight, in that order.
fn build_container(settings: Settings) -> Result<Container> {
    let Settings {
        rootfs,
        rootfs_img,
        name: requested_name,
        pidfile,
        hostname,
        dns_servers,
        flags,
        binds,
    } = settings;

    // Restart-reuse: a still-mounted image slot with a consumed marker
    // skips e2fsck and the loop mount, which is what keeps restart under
    // 200 ms.
    let mut reused_mount = None;
    if let Some(name) = &requested_name {
        let marker = container::restart_marker(name);
        if marker.exists() {
            fs::remove_file(&marker).context("failed to consume the restart marker")?;
            if let Ok(mount_point) = utils::read_trimmed(container::mount_sidecar(name)) {
                let mount_point = PathBuf::from(mount_point);
                if crate::fsutil::is_mountpoint(&mount_point)? {
                    log::debug!("reusing live image mount {:?}", mount_point);
                    reused_mount = Some(mount_point);
                }
            }
        }
    }

    let (name, rootfs_path, is_img_mount, img_mount_point) = match (&rootfs, &rootfs_img) {
        (Some(dir), None) => {
            let base = match requested_name {
                Some(n) => n,
                None => name::auto_name(dir),
            };
            (name::allocate(&base)?, dir.clone(), false, None)
        }
        (None, Some(img)) => {
            let name = requested_name
                .context("image mode requires an explicit --name")?;
            let name = name::allocate(&name)?;
            let mount_point = match reused_mount {
                Some(mp) => mp,
                None => image::mount_image(img, &name)?,
            };
            (name, mount_point.clone(), true, Some(mount_point))
        }
        _ => bail!("one of --rootfs or --rootfs-img is required"),
    };

    let mut dns_servers = dns_servers;
    if dns_servers.iter().all(|s| s.trim().is_empty()) && platform::is_android() {
        dns_servers = platform::android_dns_servers();
    }
    let resolv_conf = network::resolv_conf_content(&dns_servers);

    let volatile_workspace = if flags.volatile {
        overlay::preflight(&rootfs_path)?;
        Some(overlay::prepare_workspace(&name, &rootfs_path)?)
    } else {
        None
    };

    let hostname = hostname.unwrap_or_else(|| name.clone());
    let guest_init = platform::guest_init_kind(&rootfs_path);

    Ok(Container {
        hostname,
        rootfs_path,
        rootfs_img_path: rootfs_img,
        is_img_mount,
        img_mount_point,
        custom_pidfile: pidfile,
        uuid: utils::generate_uuid()?,
        flags,
        dns_servers,
        binds,
        ttys: vec![],
        resolv_conf,
        guest_init,
        volatile_workspace,
        container_pid: None,
        name,
    })
}

/// `/sbin/init` must exist. A dangling symlink is accepted: targets like
/// `../lib/systemd/systemd` only resolve inside the rootfs.
fn verify_guest_init(rootfs: &Path) -> Result<()> {
    let init = rootfs.join("sbin/init");
    match fs::symlink_metadata(&init) {
        Ok(_) => Ok(()),
        Err(_) => bail!(
            "{:?} has no /sbin/init; this does not look like a bootable rootfs",
            rootfs
        ),
    }
}

fn set_selinux_permissive() {
    let enforce = Path::new("/sys/fs/selinux/enforce");
    if !enforce.exists() {
        return;
    }
    if let Err(e) = utils::write_file(enforce, "0") {
        log::warn!("could not set SELinux permissive: {:?}", e);
    }
}

/// Android mounts /data nosuid; a directory rootfs under it needs suid back
/// for the guest's su/sudo to work.
fn remount_data_suid() {
    let status = Command::new("mount")
        .args(&["-o", "remount,suid", "/data"])
        .status();
    match status {
        Ok(s) if s.success() => (),
        other => log::warn!("could not remount /data with suid: {:?}", other),
    }
}

fn print_banner(cfg: &Container, init_pid: Pid) {
    let mode = if cfg.volatile_workspace.is_some() {
        "volatile"
    } else if cfg.is_img_mount {
        "image"
    } else {
        "directory"
    };
    println!(
        "droidspaces {} | {} | rootfs {} ({} mode, {} init)",
        VERSION,
        cfg.name,
        cfg.rootfs_path.display(),
        mode,
        cfg.guest_init
    );
    log::debug!("container init pid {}", init_pid);
}

/// Background start succeeds only once the boot marker is visible, so any
/// follow-up `enter`/`info` sees a fully assembled container. Returns the
/// confirmed init PID; when the pipe-delivered PID never shows the marker,
/// the UUID scan re-locates the init before giving up.
fn wait_for_marker(cfg: &Container, init_pid: Pid) -> Result<Pid> {
    let marker = PathBuf::from(format!("/proc/{}/root/run/{}", init_pid, RUN_MARKER));
    let deadline = Instant::now() + MARKER_WAIT;
    while Instant::now() < deadline {
        if marker.exists() {
            return Ok(init_pid);
        }
        if nix::sys::signal::kill(init_pid, None).is_err() {
            bail!(
                "container {} died during boot; run with --foreground to see the console",
                cfg.name
            );
        }
        std::thread::sleep(MARKER_POLL);
    }

    match discovery::wait_for_uuid(&cfg.uuid) {
        Ok(pid) => {
            log::debug!("uuid scan relocated {} at pid {}", cfg.name, pid);
            cfg.write_pid_files(pid)?;
            Ok(pid)
        }
        Err(_) => bail!(
            "container {} did not finish booting within {:?}",
            cfg.name,
            MARKER_WAIT
        ),
    }
}

fn reap_monitor(monitor_pid: Pid) -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};
    match waitpid(monitor_pid, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
        _ => 0,
    }
}
