//! Safe wrappers around mount plumbing plus mountinfo-backed queries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::{umount2, MntFlags, MsFlags};
use procfs::process::{MountInfo, Process};

pub fn mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    nix::mount::mount(source, target, fstype, flags, data).with_context(|| {
        format!(
            "failed to mount {:?} at {:?} (type {:?}, flags {:?}, data {:?})",
            source, target, fstype, flags, data
        )
    })
}

pub fn bind(source: &Path, target: &Path) -> Result<()> {
    mount(Some(source), target, None, MsFlags::MS_BIND, None)
}

pub fn bind_recursive(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )
}

/// Re-binds an existing mount read-only in place.
pub fn remount_read_only(target: &Path) -> Result<()> {
    mount(
        None,
        target,
        None,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None,
    )
}

/// Marks the whole mount tree private so nothing the boot sequence does
/// propagates back to the host.
pub fn make_mount_tree_private() -> Result<()> {
    mount(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None,
    )
    .context("failed to make the mount tree private")
}

pub fn umount_lazy(target: &Path) -> Result<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .with_context(|| format!("failed to lazily unmount {:?}", target))
}

pub fn mount_entries() -> Result<Vec<MountInfo>> {
    Ok(Process::myself()
        .context("failed to open /proc/self")?
        .mountinfo()
        .context("failed to parse /proc/self/mountinfo")?)
}

/// A path is a mountpoint iff mountinfo lists it verbatim.
pub fn is_mountpoint(path: &Path) -> Result<bool> {
    Ok(mount_entries()?.iter().any(|m| m.mount_point == path))
}

/// The mountinfo entry whose mount point is the longest prefix of `path`.
pub fn mount_entry_for(path: &Path) -> Result<Option<MountInfo>> {
    let mut best: Option<MountInfo> = None;
    for entry in mount_entries()? {
        if path.starts_with(&entry.mount_point) {
            let better = match &best {
                Some(b) => entry.mount_point.as_os_str().len() > b.mount_point.as_os_str().len(),
                None => true,
            };
            if better {
                best = Some(entry);
            }
        }
    }
    Ok(best)
}

/// The filesystem type backing `path`, e.g. `ext4` or `f2fs`.
pub fn filesystem_type_of(path: &Path) -> Result<Option<String>> {
    Ok(mount_entry_for(path)?.map(|m| m.fs_type))
}

/// Creates the mount target if it does not exist; replaces a symlink with an
/// empty file when a file mount is requested.
pub fn ensure_mountpoint(path: &Path, is_file: bool) -> Result<()> {
    let is_symlink = fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_symlink && is_file {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove symlink at mount target {:?}", path))?;
    }
    if !path.exists() {
        if is_file {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create parent of {:?}", path))?;
            }
            File::create(path)
                .with_context(|| format!("failed to create mount target file {:?}", path))?;
        } else {
            fs::create_dir_all(path)
                .with_context(|| format!("failed to create mount target {:?}", path))?;
        }
    }
    Ok(())
}

/// All mountpoints strictly below `root`, deepest first, the order they must
/// be unmounted in.
pub fn mountpoints_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut points: Vec<PathBuf> = mount_entries()?
        .into_iter()
        .map(|m| m.mount_point)
        .filter(|p| p.starts_with(root))
        .collect();
    points.sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_mountpoint() {
        assert!(is_mountpoint(Path::new("/")).unwrap());
    }

    #[test]
    fn test_plain_dir_is_not_mountpoint() {
        let dir = crate::utils::create_temp_dir("test_not_mountpoint").unwrap();
        assert!(!is_mountpoint(dir.path()).unwrap());
    }

    #[test]
    fn test_mount_entry_for_picks_longest_prefix() {
        let entry = mount_entry_for(Path::new("/proc/self/status"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.fs_type, "proc");
    }

    #[test]
    fn test_ensure_mountpoint_replaces_symlink_for_file() {
        let dir = crate::utils::create_temp_dir("test_ensure_mountpoint").unwrap();
        let target = dir.join("resolv.conf");
        std::os::unix::fs::symlink("/nonexistent", &target).unwrap();
        ensure_mountpoint(&target, true).unwrap();
        assert!(target.is_file());
    }
}
