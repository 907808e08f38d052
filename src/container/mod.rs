//! Container record and on-disk state layout: PID files, sidecars,
//! workspace directories.

pub mod discovery;
pub mod name;

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;
use path_clean::PathClean;

use crate::platform;
use crate::tty::Pty;
use crate::utils;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_BINDS: usize = 16;

/// Workspace root holding PID files and volatile workspaces.
pub fn workspace_root() -> PathBuf {
    if platform::is_android() {
        PathBuf::from("/data/local/Droidspaces")
    } else {
        PathBuf::from("/var/lib/Droidspaces")
    }
}

pub fn pids_dir() -> PathBuf {
    workspace_root().join("Pids")
}

pub fn image_mount_root() -> PathBuf {
    PathBuf::from("/mnt/Droidspaces")
}

pub fn volatile_dir(name: &str) -> PathBuf {
    workspace_root().join("Volatile").join(name)
}

pub fn pid_file(name: &str) -> PathBuf {
    pids_dir().join(format!("{}.pid", name))
}

/// Sidecar recording the loop mount point of an image-mode container.
pub fn mount_sidecar(name: &str) -> PathBuf {
    pids_dir().join(format!("{}.mount", name))
}

/// Marker telling the monitor to skip cleanup because a restart will reuse
/// the mount.
pub fn restart_marker(name: &str) -> PathBuf {
    pids_dir().join(format!("{}.restart", name))
}

/// A user-requested bind mount. The destination is container-absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl BindMount {
    /// Parses a single `SRC:DEST` entry. Traversal through `..` and
    /// relative destinations are configuration errors.
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.splitn(2, ':');
        let source = parts.next().unwrap_or_default();
        let dest = match parts.next() {
            Some(d) if !d.is_empty() => d,
            _ => bail!("bind mount {:?} is missing a destination (SRC:DEST)", entry),
        };
        if source.is_empty() {
            bail!("bind mount {:?} is missing a source (SRC:DEST)", entry);
        }
        let dest = PathBuf::from(dest);
        if !dest.is_absolute() {
            bail!("bind mount destination {:?} must be absolute", dest);
        }
        if dest.components().any(|c| c == Component::ParentDir) {
            bail!("bind mount destination {:?} must not contain '..'", dest);
        }
        Ok(BindMount {
            source: PathBuf::from(source),
            dest: dest.clean(),
        })
    }

    /// Parses the comma-separated `--bind-mount` list.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mounts: Vec<BindMount> = list
            .split(',')
            .filter(|e| !e.is_empty())
            .map(BindMount::parse)
            .collect::<Result<_>>()?;
        if mounts.len() > MAX_BINDS {
            bail!("at most {} bind mounts are supported", MAX_BINDS);
        }
        Ok(mounts)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub foreground: bool,
    pub hw_access: bool,
    pub volatile: bool,
    pub ipv6_enabled: bool,
    pub android_storage: bool,
    pub selinux_permissive: bool,
}

/// The central configuration and runtime state of one container, built by
/// the CLI and threaded through the fork topology.
#[derive(Debug)]
pub struct Container {
    pub name: String,
    pub hostname: String,
    pub rootfs_path: PathBuf,
    pub rootfs_img_path: Option<PathBuf>,
    pub is_img_mount: bool,
    pub img_mount_point: Option<PathBuf>,
    /// User-specified PID file, written in addition to the global one.
    pub custom_pidfile: Option<PathBuf>,
    pub uuid: String,
    pub flags: Flags,
    pub dns_servers: Vec<String>,
    pub binds: Vec<BindMount>,
    /// Console first, auxiliary TTYs after.
    pub ttys: Vec<Pty>,
    /// resolv.conf content stashed before the fork for transfer after
    /// pivot_root.
    pub resolv_conf: String,
    pub guest_init: platform::GuestInit,
    /// Present in volatile mode; the actual overlay mount happens inside
    /// the container's mount namespace.
    pub volatile_workspace: Option<crate::overlay::OverlayWorkspace>,
    pub container_pid: Option<Pid>,
}

impl Container {
    pub fn console(&self) -> &Pty {
        &self.ttys[0]
    }

    /// Writes the global PID file and, when configured, the user-specified
    /// one.
    pub fn write_pid_files(&self, pid: Pid) -> Result<()> {
        utils::create_dir_all(pids_dir())?;
        let content = format!("{}\n", pid);
        utils::atomic_write(pid_file(&self.name), &content)?;
        if let Some(custom) = &self.custom_pidfile {
            if let Some(parent) = custom.parent() {
                utils::create_dir_all(parent)?;
            }
            utils::atomic_write(custom, &content)?;
        }
        Ok(())
    }
}

/// Removes every on-disk artifact of a container: volatile workspace, loop
/// mount, sidecars, PID files, firmware path entry and the cgroup scope.
/// The restart path never calls this; the marker makes the monitor skip it.
pub fn cleanup_artifacts(name: &str, rootfs: Option<&Path>) -> Result<()> {
    if let Err(e) = crate::overlay::cleanup(name) {
        log::warn!("volatile cleanup for {} failed: {:?}", name, e);
    }

    let sidecar = mount_sidecar(name);
    if sidecar.exists() {
        match utils::read_trimmed(&sidecar) {
            Ok(mount_point) => {
                if let Err(e) = crate::image::unmount_image(Path::new(&mount_point)) {
                    log::warn!("could not unmount {}: {:?}", mount_point, e);
                }
            }
            Err(e) => log::warn!("unreadable mount sidecar {:?}: {:?}", sidecar, e),
        }
        let _ = std::fs::remove_file(&sidecar);
    }

    if let Some(rootfs) = rootfs {
        if let Err(e) = platform::firmware_path_remove(rootfs) {
            log::warn!("firmware path cleanup failed: {:?}", e);
        }
    }

    let _ = std::fs::remove_file(pid_file(name));
    let _ = std::fs::remove_file(restart_marker(name));
    crate::cgroups::setup::remove_runtime_scope(name);
    Ok(())
}

/// Ensures the workspace directory tree exists.
pub fn ensure_workspace() -> Result<()> {
    utils::create_dir_all(pids_dir()).context("failed to create the PID-file directory")?;
    utils::create_dir_all(workspace_root().join("Volatile"))?;
    utils::create_dir_all(image_mount_root())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_mount_parse() {
        let bind = BindMount::parse("/host/data:/srv/data").unwrap();
        assert_eq!(bind.source, PathBuf::from("/host/data"));
        assert_eq!(bind.dest, PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_bind_mount_rejects_traversal() {
        let err = BindMount::parse("/host:/foo/../etc/shadow").unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn test_bind_mount_rejects_relative_dest() {
        assert!(BindMount::parse("/host:relative/dest").is_err());
    }

    #[test]
    fn test_bind_mount_rejects_missing_parts() {
        assert!(BindMount::parse("/host").is_err());
        assert!(BindMount::parse(":/dest").is_err());
        assert!(BindMount::parse("/host:").is_err());
    }

    #[test]
    fn test_bind_mount_list_bound() {
        let list = (0..17)
            .map(|i| format!("/src{}:/dst{}", i, i))
            .collect::<Vec<_>>()
            .join(",");
        assert!(BindMount::parse_list(&list).is_err());
        let ok = BindMount::parse_list("/a:/b,/c:/d").unwrap();
        assert_eq!(ok.len(), 2);
    }

    #[test]
    fn test_state_paths_are_name_scoped() {
        assert_eq!(pid_file("web").file_name().unwrap(), "web.pid");
        assert_eq!(mount_sidecar("web").file_name().unwrap(), "web.mount");
        assert_eq!(restart_marker("web").file_name().unwrap(), "web.restart");
    }
}
