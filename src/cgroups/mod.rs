//! Cgroup plane: discovering the host hierarchy layout and rebuilding it
//! inside the container so a guest systemd can create scopes and slices.

pub mod attach;
pub mod hierarchy;
pub mod setup;

pub use hierarchy::{discover, CgroupSetup, CgroupVersion, Hierarchy};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";

/// Host-side subtree that scopes each container's monitor and init.
pub const RUNTIME_SCOPE: &str = "droidspaces";
