//! Attach-before-setns: `enter` and `run` must move themselves into the
//! target container's cgroup on the host before opening namespace handles,
//! or the guest's session manager cannot place them into a scope and
//! `su`/`sudo`/login hang.

use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::Pid;

use super::hierarchy::{self, membership_for, CgroupVersion};
use super::{CGROUP_PROCS, CGROUP_TASKS};
use crate::utils::{self, PathBufExt};

/// Moves the calling process into `target`'s cgroup for every host
/// hierarchy. Individual hierarchies failing (a controller the kernel
/// refuses delegation for) is survivable and logged.
pub fn attach_to_container(target: Pid) -> Result<()> {
    let hierarchies = hierarchy::discover()?;
    let memberships = hierarchy::memberships_of(Some(target))
        .with_context(|| format!("failed to read cgroup membership of pid {}", target))?;
    let own_pid = nix::unistd::getpid();

    for h in &hierarchies {
        let membership = match membership_for(h, &memberships) {
            Some(m) => m,
            None => continue,
        };
        let procs_file = match h.version {
            CgroupVersion::V2 => CGROUP_PROCS,
            CgroupVersion::V1 => CGROUP_TASKS,
        };
        let path = h
            .mount_point
            .join_absolute_path(Path::new(&membership.path))?
            .join(procs_file);
        if let Err(e) = utils::write_file(&path, own_pid.to_string()) {
            log::warn!("could not attach to cgroup {:?}: {:?}", path, e);
        }
    }
    Ok(())
}
