//! Device plane: assembling the container's `/dev`, either as a private
//! tmpfs populated by mknod or as the host's devtmpfs with the critical
//! nodes scrubbed, plus the devpts instance and ptmx virtualization.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};

use crate::fsutil;

struct DeviceNode {
    path: &'static str,
    major: u64,
    minor: u64,
    mode: u32,
}

/// The curated minimal node set. `/dev/console` gets login-style 0620
/// permissions; everything else is world usable.
const BASE_NODES: &[DeviceNode] = &[
    DeviceNode { path: "null", major: 1, minor: 3, mode: 0o666 },
    DeviceNode { path: "zero", major: 1, minor: 5, mode: 0o666 },
    DeviceNode { path: "full", major: 1, minor: 7, mode: 0o666 },
    DeviceNode { path: "random", major: 1, minor: 8, mode: 0o666 },
    DeviceNode { path: "urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceNode { path: "tty", major: 5, minor: 0, mode: 0o666 },
    DeviceNode { path: "console", major: 5, minor: 1, mode: 0o620 },
    DeviceNode { path: "ptmx", major: 5, minor: 2, mode: 0o666 },
    DeviceNode { path: "net/tun", major: 10, minor: 200, mode: 0o666 },
    DeviceNode { path: "fuse", major: 10, minor: 229, mode: 0o666 },
];

/// Nodes that must be rebuilt when the host devtmpfs is exposed, so the
/// guest cannot corrupt the host's view of them.
const SCRUB_NODES: &[&str] = &[
    "console", "tty", "ptmx", "full", "null", "zero", "random", "urandom",
];

const TTY_GID: u32 = 5;

fn create_node(dev_dir: &Path, node: &DeviceNode) -> Result<()> {
    let path = dev_dir.join(node.path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {:?}", parent))?;
    }
    mknod(
        &path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(node.mode),
        makedev(node.major, node.minor),
    )
    .with_context(|| format!("failed to mknod {:?}", path))?;
    if node.path == "console" || node.path == "tty" {
        chown(&path, Some(Uid::from_raw(0)), Some(Gid::from_raw(TTY_GID)))
            .with_context(|| format!("failed to chown {:?}", path))?;
    }
    Ok(())
}

fn create_std_symlinks(dev_dir: &Path) -> Result<()> {
    let links = [
        ("/proc/self/fd", "fd"),
        ("/proc/self/fd/0", "stdin"),
        ("/proc/self/fd/1", "stdout"),
        ("/proc/self/fd/2", "stderr"),
    ];
    for (target, name) in &links {
        symlink(target, dev_dir.join(name))
            .with_context(|| format!("failed to symlink /dev/{}", name))?;
    }
    Ok(())
}

/// Isolated mode: a private tmpfs populated with the curated node set.
/// `dev_dir` is rootfs-relative ("dev"); the caller has chdir'd into the
/// rootfs.
pub fn setup_dev_isolated(dev_dir: &Path, aux_ttys: usize) -> Result<()> {
    fs::create_dir_all(dev_dir)
        .with_context(|| format!("failed to create {:?}", dev_dir))?;
    fsutil::mount(
        None,
        dev_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=755,size=64m"),
    )?;

    for node in BASE_NODES {
        create_node(dev_dir, node)?;
    }
    for n in 1..=aux_ttys {
        let path = dev_dir.join(format!("tty{}", n));
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o620),
            makedev(4, n as u64),
        )
        .with_context(|| format!("failed to mknod {:?}", path))?;
        chown(&path, Some(Uid::from_raw(0)), Some(Gid::from_raw(TTY_GID)))?;
    }

    create_std_symlinks(dev_dir)?;

    fs::create_dir_all(dev_dir.join("pts"))?;
    fs::create_dir_all(dev_dir.join("shm"))?;
    fsutil::mount(
        None,
        &dev_dir.join("shm"),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )?;
    Ok(())
}

/// HW-access mode: the host's devtmpfs, with the conflict-prone nodes
/// unlinked and recreated as fresh character devices.
pub fn setup_dev_hw(dev_dir: &Path) -> Result<()> {
    fs::create_dir_all(dev_dir)
        .with_context(|| format!("failed to create {:?}", dev_dir))?;
    fsutil::mount(
        Some(Path::new("devtmpfs")),
        dev_dir,
        Some("devtmpfs"),
        MsFlags::MS_NOSUID,
        None,
    )?;

    for node in BASE_NODES
        .iter()
        .filter(|n| SCRUB_NODES.contains(&n.path))
    {
        let path = dev_dir.join(node.path);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to scrub {:?}", path))?;
        }
        create_node(dev_dir, node)?;
    }

    fs::create_dir_all(dev_dir.join("pts"))?;
    Ok(())
}

/// Mounts a new-instance devpts and virtualizes `/dev/ptmx`. Runs after
/// pivot_root with absolute paths.
pub fn setup_devpts() -> Result<()> {
    let pts = Path::new("/dev/pts");
    fs::create_dir_all(pts).context("failed to create /dev/pts")?;
    fsutil::mount(
        None,
        pts,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620,gid=5"),
    )?;

    let ptmx = PathBuf::from("/dev/ptmx");
    let pts_ptmx = pts.join("ptmx");
    // Prefer bind-mounting the instance ptmx over the node; fall back to a
    // symlink when no node is present to bind over.
    if ptmx.exists() {
        if let Err(e) = fsutil::bind(&pts_ptmx, &ptmx) {
            log::warn!("bind of {:?} failed, falling back to symlink: {:?}", ptmx, e);
            fs::remove_file(&ptmx).context("failed to remove stale /dev/ptmx")?;
            symlink("pts/ptmx", &ptmx).context("failed to symlink /dev/ptmx")?;
        }
    } else {
        symlink("pts/ptmx", &ptmx).context("failed to symlink /dev/ptmx")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curated_set_covers_spec_nodes() {
        let names: Vec<&str> = BASE_NODES.iter().map(|n| n.path).collect();
        for required in &[
            "null", "zero", "full", "random", "urandom", "tty", "console", "ptmx", "net/tun",
            "fuse",
        ] {
            assert!(names.contains(required), "missing node {}", required);
        }
    }

    #[test]
    fn test_console_is_login_style() {
        let console = BASE_NODES.iter().find(|n| n.path == "console").unwrap();
        assert_eq!(console.mode, 0o620);
        assert_eq!((console.major, console.minor), (5, 1));
    }

    #[test]
    fn test_scrub_set_is_a_subset_of_curated_set() {
        let names: Vec<&str> = BASE_NODES.iter().map(|n| n.path).collect();
        for scrub in SCRUB_NODES {
            assert!(names.contains(scrub));
        }
    }
}
