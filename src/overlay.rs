//! Volatile overlay: an OverlayFS whose upper layer lives on a tmpfs, so
//! every write of the session evaporates with the mount namespace.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;

use crate::container;
use crate::fsutil;
use crate::platform;
use crate::utils;

/// Settle time for the tmpfs backing store after unmounting leftovers.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct OverlayWorkspace {
    pub root: PathBuf,
    pub lower: PathBuf,
}

impl OverlayWorkspace {
    pub fn upper(&self) -> PathBuf {
        self.root.join("upper")
    }

    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn merged(&self) -> PathBuf {
        self.root.join("merged")
    }
}

/// Checks the host can run this rootfs volatile at all. OverlayFS over an
/// f2fs lower layer silently misbehaves or deadlocks on many Android
/// kernels, so that combination is refused up front.
pub fn preflight(rootfs: &Path) -> Result<()> {
    if !platform::overlayfs_supported() {
        bail!("volatile mode needs OverlayFS support in the kernel");
    }
    if let Some(fstype) = fsutil::filesystem_type_of(rootfs)? {
        if fstype == "f2fs" {
            bail!(
                "the rootfs at {:?} sits on f2fs, which breaks OverlayFS on \
                 many Android kernels; use an image rootfs (--rootfs-img) instead",
                rootfs
            );
        }
    }
    Ok(())
}

/// Creates the workspace directory skeleton before the boot fork. Only the
/// directory exists at this point; it doubles as the cleanup anchor.
pub fn prepare_workspace(name: &str, rootfs: &Path) -> Result<OverlayWorkspace> {
    let root = container::volatile_dir(name);
    utils::create_dir_all(&root)?;
    Ok(OverlayWorkspace {
        root,
        lower: rootfs.to_path_buf(),
    })
}

/// Mounts the tmpfs and the overlay. Must run inside the container's mount
/// namespace: mounted on the host side, later propagation changes on the
/// host root can sever the overlay from its lowerdir.
pub fn mount_overlay(workspace: &OverlayWorkspace) -> Result<PathBuf> {
    fsutil::mount(
        None,
        &workspace.root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=755,size=50%"),
    )?;
    for dir in &[workspace.upper(), workspace.work(), workspace.merged()] {
        utils::create_dir_all(dir)?;
    }

    let mut options = format!(
        "lowerdir={},upperdir={},workdir={}",
        workspace.lower.display(),
        workspace.upper().display(),
        workspace.work().display()
    );
    if platform::is_android() {
        // SELinux must see the upper layer as tmpfs-backed or writes
        // through the merged view are denied.
        options.push_str(",context=\"u:object_r:tmpfs:s0\"");
    }

    let merged = workspace.merged();
    fsutil::mount(
        Some(Path::new("overlay")),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(&options),
    )
    .context("failed to mount the volatile overlay")?;
    Ok(merged)
}

/// Host-side cleanup after the container is gone. The kernel already tore
/// the overlay down with the namespace; only a `stop` issued from outside a
/// live container leaves mounts to sweep here.
pub fn cleanup(name: &str) -> Result<()> {
    let root = container::volatile_dir(name);
    if !root.exists() {
        return Ok(());
    }
    let leftovers = fsutil::mountpoints_under(&root)?;
    for mount in &leftovers {
        if let Err(e) = fsutil::umount_lazy(mount) {
            log::warn!("could not unmount leftover {:?}: {:?}", mount, e);
        }
    }
    if !leftovers.is_empty() {
        std::thread::sleep(SETTLE_DELAY);
    }
    std::fs::remove_dir_all(&root)
        .with_context(|| format!("failed to remove volatile workspace {:?}", root))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_layout() {
        let ws = OverlayWorkspace {
            root: PathBuf::from("/ws/Volatile/t"),
            lower: PathBuf::from("/data/alpine"),
        };
        assert_eq!(ws.upper(), PathBuf::from("/ws/Volatile/t/upper"));
        assert_eq!(ws.work(), PathBuf::from("/ws/Volatile/t/work"));
        assert_eq!(ws.merged(), PathBuf::from("/ws/Volatile/t/merged"));
    }

    #[test]
    fn test_cleanup_of_absent_workspace_is_ok() {
        cleanup("never-existed-container").unwrap();
    }
}
