//! Host cgroup topology discovery from `/proc/self/mountinfo`.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::CGROUP_ROOT;
use crate::container;
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CgroupVersion::V1 => write!(f, "v1"),
            CgroupVersion::V2 => write!(f, "v2"),
        }
    }
}

/// One mounted hierarchy on the host.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub mount_point: PathBuf,
    pub version: CgroupVersion,
    /// Controller names after Android remapping; empty for the unified
    /// hierarchy and for controller-less v1 mounts.
    pub controllers: Vec<String>,
    /// `name=` option of a named v1 hierarchy (e.g. `systemd`).
    pub name: Option<String>,
}

impl Hierarchy {
    /// Subdirectory under `/sys/fs/cgroup` this hierarchy occupies on the
    /// host; empty when it is mounted at the root directly (pure v2).
    pub fn leaf(&self) -> String {
        self.mount_point
            .strip_prefix(CGROUP_ROOT)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The option string a fresh mount of this hierarchy needs.
    pub fn mount_data(&self) -> Option<String> {
        match self.version {
            CgroupVersion::V2 => None,
            CgroupVersion::V1 => {
                if let Some(name) = &self.name {
                    Some(format!("none,name={}", name))
                } else if self.controllers.is_empty() {
                    // Android mounts controller-less hierarchies whose only
                    // identity is the directory name.
                    Some(self.leaf())
                } else {
                    Some(self.controllers.join(","))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupSetup {
    Legacy,
    Hybrid,
    Unified,
}

const KNOWN_CONTROLLERS: &[&str] = &[
    "cpu",
    "cpuacct",
    "cpuset",
    "memory",
    "devices",
    "freezer",
    "net_cls",
    "net_prio",
    "blkio",
    "pids",
    "perf_event",
    "hugetlb",
    "rdma",
    "misc",
    "debug",
    "schedtune",
    "memcg",
    "acct",
];

/// Android kernels expose some controllers under legacy names.
pub fn remap_controller(name: &str) -> &str {
    match name {
        "memcg" => "memory",
        "acct" => "cpuacct",
        other => other,
    }
}

/// Parses the host's cgroup mounts. Mounts under droidspaces-managed
/// prefixes (loop mounts, workspaces) are containers' own views and are
/// ignored.
pub fn discover() -> Result<Vec<Hierarchy>> {
    let managed = [container::image_mount_root(), container::workspace_root()];
    let mut hierarchies = vec![];

    for entry in fsutil::mount_entries()? {
        if managed.iter().any(|p| entry.mount_point.starts_with(p)) {
            continue;
        }
        let version = match entry.fs_type.as_str() {
            "cgroup" => CgroupVersion::V1,
            "cgroup2" => CgroupVersion::V2,
            _ => continue,
        };

        let mut controllers = vec![];
        let mut name = None;
        for (key, value) in &entry.super_options {
            if key == "name" {
                name = value.clone();
            } else if KNOWN_CONTROLLERS.contains(&key.as_str()) {
                controllers.push(remap_controller(key).to_string());
            }
        }
        controllers.sort();

        hierarchies.push(Hierarchy {
            mount_point: entry.mount_point,
            version,
            controllers,
            name,
        });
    }

    Ok(hierarchies)
}

pub fn setup_kind(hierarchies: &[Hierarchy]) -> CgroupSetup {
    let has_v1 = hierarchies.iter().any(|h| h.version == CgroupVersion::V1);
    let has_v2 = hierarchies.iter().any(|h| h.version == CgroupVersion::V2);
    match (has_v1, has_v2) {
        (true, true) => CgroupSetup::Hybrid,
        (false, true) => CgroupSetup::Unified,
        _ => CgroupSetup::Legacy,
    }
}

/// One line of `/proc/<pid>/cgroup`.
#[derive(Debug, Clone)]
pub struct CgroupMembership {
    pub controllers: Vec<String>,
    pub path: String,
}

pub fn memberships_of(pid: Option<nix::unistd::Pid>) -> Result<Vec<CgroupMembership>> {
    let path = match pid {
        Some(pid) => format!("/proc/{}/cgroup", pid),
        None => "/proc/self/cgroup".to_string(),
    };
    let content =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
    let mut result = vec![];
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next();
        let controllers = match fields.next() {
            Some(c) => c,
            None => continue,
        };
        let path = match fields.next() {
            Some(p) => p,
            None => continue,
        };
        result.push(CgroupMembership {
            controllers: controllers
                .split(',')
                .filter(|c| !c.is_empty())
                .map(|c| remap_controller(c).to_string())
                .collect(),
            path: path.to_string(),
        });
    }
    Ok(result)
}

/// A cgroup namespace is active when every hierarchy reports `/` as this
/// process's path.
pub fn cgroup_ns_active() -> Result<bool> {
    if !Path::new("/proc/self/ns/cgroup").exists() {
        return Ok(false);
    }
    Ok(memberships_of(None)?.iter().all(|m| m.path == "/"))
}

/// The membership entry matching a hierarchy: unified for v2, intersecting
/// controller set or matching `name=` for v1.
pub fn membership_for<'a>(
    hierarchy: &Hierarchy,
    memberships: &'a [CgroupMembership],
) -> Option<&'a CgroupMembership> {
    memberships.iter().find(|m| match hierarchy.version {
        CgroupVersion::V2 => m.controllers.is_empty(),
        CgroupVersion::V1 => {
            if let Some(name) = &hierarchy.name {
                m.controllers.iter().any(|c| c == &format!("name={}", name))
            } else {
                m.controllers
                    .iter()
                    .any(|c| hierarchy.controllers.contains(c))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1(leaf: &str, controllers: &[&str]) -> Hierarchy {
        Hierarchy {
            mount_point: PathBuf::from(CGROUP_ROOT).join(leaf),
            version: CgroupVersion::V1,
            controllers: controllers.iter().map(|c| c.to_string()).collect(),
            name: None,
        }
    }

    #[test]
    fn test_leaf_of_direct_v2_mount() {
        let h = Hierarchy {
            mount_point: PathBuf::from(CGROUP_ROOT),
            version: CgroupVersion::V2,
            controllers: vec![],
            name: None,
        };
        assert_eq!(h.leaf(), "");
        assert_eq!(h.mount_data(), None);
    }

    #[test]
    fn test_mount_data_for_comounted_v1() {
        let h = v1("cpu,cpuacct", &["cpu", "cpuacct"]);
        assert_eq!(h.mount_data().unwrap(), "cpu,cpuacct");
    }

    #[test]
    fn test_mount_data_falls_back_to_leaf_when_controller_less() {
        let h = v1("stune", &[]);
        assert_eq!(h.mount_data().unwrap(), "stune");
    }

    #[test]
    fn test_mount_data_for_named_hierarchy() {
        let mut h = v1("systemd", &[]);
        h.name = Some("systemd".to_string());
        assert_eq!(h.mount_data().unwrap(), "none,name=systemd");
    }

    #[test]
    fn test_android_remap() {
        assert_eq!(remap_controller("memcg"), "memory");
        assert_eq!(remap_controller("acct"), "cpuacct");
        assert_eq!(remap_controller("pids"), "pids");
    }

    #[test]
    fn test_setup_kind() {
        let unified = vec![Hierarchy {
            mount_point: PathBuf::from(CGROUP_ROOT),
            version: CgroupVersion::V2,
            controllers: vec![],
            name: None,
        }];
        assert_eq!(setup_kind(&unified), CgroupSetup::Unified);

        let legacy = vec![v1("memory", &["memory"])];
        assert_eq!(setup_kind(&legacy), CgroupSetup::Legacy);

        let mut hybrid = unified;
        hybrid.push(v1("memory", &["memory"]));
        assert_eq!(setup_kind(&hybrid), CgroupSetup::Hybrid);
    }

    #[test]
    fn test_membership_matching() {
        let memberships = vec![
            CgroupMembership {
                controllers: vec![],
                path: "/init.scope".to_string(),
            },
            CgroupMembership {
                controllers: vec!["cpu".to_string(), "cpuacct".to_string()],
                path: "/user.slice".to_string(),
            },
        ];
        let h = v1("cpu,cpuacct", &["cpu", "cpuacct"]);
        assert_eq!(
            membership_for(&h, &memberships).unwrap().path,
            "/user.slice"
        );
        let v2 = Hierarchy {
            mount_point: PathBuf::from(CGROUP_ROOT),
            version: CgroupVersion::V2,
            controllers: vec![],
            name: None,
        };
        assert_eq!(
            membership_for(&v2, &memberships).unwrap().path,
            "/init.scope"
        );
    }
}
