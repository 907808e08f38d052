//! Container-side cgroup reconstruction, called from the boot sequence
//! before pivot_root with the rootfs as the working directory.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;

use super::hierarchy::{
    self, membership_for, CgroupSetup, CgroupVersion, Hierarchy,
};
use super::{CGROUP_PROCS, RUNTIME_SCOPE};
use crate::fsutil;
use crate::utils::{self, PathBufExt};

/// Rootfs-relative cgroup root.
const REL_ROOT: &str = "sys/fs/cgroup";

/// Rebuilds the host's hierarchy topology under `sys/fs/cgroup`.
///
/// With an active cgroup namespace each hierarchy is a fresh mount, so the
/// guest sees itself at the root. Without one, the subtree this process
/// already occupies is bind-mounted instead, which is the best a 3.x kernel
/// can do.
pub fn setup_container_cgroups(hierarchies: &[Hierarchy], cgroup_ns: bool) -> Result<()> {
    let root = Path::new(REL_ROOT);
    fs::create_dir_all(root).context("failed to create sys/fs/cgroup")?;
    fsutil::mount(
        None,
        root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some("mode=755,size=16m"),
    )?;

    let memberships = if cgroup_ns {
        vec![]
    } else {
        hierarchy::memberships_of(None)?
    };

    for hierarchy in hierarchies {
        let leaf = hierarchy.leaf();
        let target = if leaf.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&leaf)
        };
        fs::create_dir_all(&target)
            .with_context(|| format!("failed to create {:?}", target))?;

        if cgroup_ns {
            let fstype = match hierarchy.version {
                CgroupVersion::V1 => "cgroup",
                CgroupVersion::V2 => "cgroup2",
            };
            let data = hierarchy.mount_data();
            fsutil::mount(
                None,
                &target,
                Some(fstype),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                data.as_deref(),
            )
            .with_context(|| format!("failed to mount {} hierarchy {:?}", hierarchy.version, leaf))?;
        } else {
            let membership = membership_for(hierarchy, &memberships);
            let mpath = membership.map(|m| m.path.as_str()).unwrap_or("/");
            let host_path = hierarchy
                .mount_point
                .join_absolute_path(Path::new(mpath))?;
            fsutil::mount(
                Some(&host_path),
                &target,
                None,
                MsFlags::MS_BIND
                    | MsFlags::MS_REC
                    | MsFlags::MS_NOSUID
                    | MsFlags::MS_NODEV
                    | MsFlags::MS_NOEXEC,
                None,
            )
            .with_context(|| {
                format!("failed to bind host cgroup {:?} into the container", host_path)
            })?;
        }
    }

    create_comount_symlinks(root, hierarchies)?;

    // systemd writes directly into the root tmpfs on pure v2, everywhere
    // else the per-hierarchy mounts carry the writes.
    if hierarchy::setup_kind(hierarchies) != CgroupSetup::Unified {
        fsutil::remount_read_only(root)?;
    }
    Ok(())
}

/// For comounted v1 hierarchies (`cpu,cpuacct`), each secondary controller
/// name becomes a symlink to the primary leaf.
fn create_comount_symlinks(root: &Path, hierarchies: &[Hierarchy]) -> Result<()> {
    for hierarchy in hierarchies {
        let leaf = hierarchy.leaf();
        if hierarchy.version != CgroupVersion::V1 || !leaf.contains(',') {
            continue;
        }
        for controller in &hierarchy.controllers {
            let link = root.join(controller);
            if link.exists() {
                continue;
            }
            symlink(&leaf, &link)
                .with_context(|| format!("failed to create cgroup symlink {:?}", link))?;
        }
    }
    Ok(())
}

/// Creates `droidspaces/<name>` under every host hierarchy and moves the
/// calling process (the monitor) into it. Without this the cgroup namespace
/// the monitor unshares would still be rooted in the caller's cgroup.
pub fn create_runtime_scope(name: &str, hierarchies: &[Hierarchy]) -> Result<()> {
    let pid = nix::unistd::getpid();
    for hierarchy in hierarchies {
        let scope = hierarchy
            .mount_point
            .join(RUNTIME_SCOPE)
            .join(name);
        if let Err(e) = fs::create_dir_all(&scope) {
            log::warn!("could not create cgroup scope {:?}: {}", scope, e);
            continue;
        }
        if let Err(e) = utils::write_file(scope.join(CGROUP_PROCS), pid.to_string()) {
            log::warn!("could not enter cgroup scope {:?}: {:?}", scope, e);
        }
    }
    Ok(())
}

/// Best-effort removal of the per-container scope directories.
pub fn remove_runtime_scope(name: &str) {
    let hierarchies = match hierarchy::discover() {
        Ok(h) => h,
        Err(_) => return,
    };
    for hierarchy in &hierarchies {
        let scope: PathBuf = hierarchy.mount_point.join(RUNTIME_SCOPE).join(name);
        let _ = fs::remove_dir(&scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comount_symlinks() {
        let dir = crate::utils::create_temp_dir("test_comount_symlinks").unwrap();
        let hierarchies = vec![Hierarchy {
            mount_point: PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"),
            version: CgroupVersion::V1,
            controllers: vec!["cpu".to_string(), "cpuacct".to_string()],
            name: None,
        }];
        create_comount_symlinks(dir.path(), &hierarchies).unwrap();
        for link in &["cpu", "cpuacct"] {
            let target = std::fs::read_link(dir.join(link)).unwrap();
            assert_eq!(target, PathBuf::from("cpu,cpuacct"));
        }
    }

    #[test]
    fn test_single_controller_gets_no_symlink() {
        let dir = crate::utils::create_temp_dir("test_single_controller").unwrap();
        let hierarchies = vec![Hierarchy {
            mount_point: PathBuf::from("/sys/fs/cgroup/memory"),
            version: CgroupVersion::V1,
            controllers: vec!["memory".to_string()],
            name: None,
        }];
        create_comount_symlinks(dir.path(), &hierarchies).unwrap();
        assert!(std::fs::read_link(dir.join("memory")).is_err());
    }
}
