//! Host platform probing: Android vs desktop Linux, kernel version and
//! capability checks, guest init classification.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::sys::utsname;
use once_cell::sync::Lazy;

/// Oldest kernel the boot sequence is known to work on.
pub const MIN_KERNEL: KernelVersion = KernelVersion {
    major: 3,
    minor: 18,
};

/// Kernels at or above this major version do not need the seccomp shield.
pub const SHIELD_KERNEL_MAJOR: u32 = 5;

static IS_ANDROID: Lazy<bool> = Lazy::new(|| {
    Path::new("/system/build.prop").exists() || Path::new("/system/bin/getprop").exists()
});

static KERNEL_VERSION: Lazy<KernelVersion> =
    Lazy::new(|| KernelVersion::parse(utsname::uname().release()).unwrap_or(KernelVersion {
        major: 0,
        minor: 0,
    }));

pub fn is_android() -> bool {
    *IS_ANDROID
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    pub fn parse(release: &str) -> Result<Self> {
        let mut parts = release.split(|c: char| !c.is_ascii_digit());
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .with_context(|| format!("unparseable kernel release {:?}", release))?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Ok(Self { major, minor })
    }
}

impl Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub fn kernel_version() -> KernelVersion {
    *KERNEL_VERSION
}

/// True when the kernel can place the monitor in its own cgroup namespace
/// (Linux 4.6+).
pub fn cgroup_ns_supported() -> bool {
    Path::new("/proc/self/ns/cgroup").exists()
}

/// Validates the namespaces, seccomp and cgroup support a start needs.
/// `check`, `version`, `help` and `scan` skip this so they keep working on
/// unsupported hosts.
pub fn validate_host() -> Result<()> {
    let kernel = kernel_version();
    if kernel < MIN_KERNEL {
        bail!(
            "kernel {} is not supported, droidspaces needs at least {}",
            kernel,
            MIN_KERNEL
        );
    }

    for ns in &["pid", "mnt", "uts", "ipc"] {
        let path = format!("/proc/self/ns/{}", ns);
        if !Path::new(&path).exists() {
            bail!(
                "kernel lacks {} namespace support ({} is missing); \
                 rebuild the kernel with namespaces enabled",
                ns,
                path
            );
        }
    }

    let status = fs::read_to_string("/proc/self/status")
        .context("failed to read /proc/self/status")?;
    if !status.lines().any(|l| l.starts_with("Seccomp:")) {
        bail!("kernel lacks seccomp support (CONFIG_SECCOMP_FILTER)");
    }

    let cgroups = fs::read_to_string("/proc/cgroups").unwrap_or_default();
    let cgroup2 = fs::read_to_string("/proc/filesystems")
        .map(|f| f.contains("cgroup2"))
        .unwrap_or(false);
    if cgroups.lines().count() <= 1 && !cgroup2 {
        bail!("kernel exposes neither cgroup v1 controllers nor cgroup2");
    }

    Ok(())
}

/// True when OverlayFS is registered with the kernel.
pub fn overlayfs_supported() -> bool {
    fs::read_to_string("/proc/filesystems")
        .map(|f| f.lines().any(|l| l.trim().ends_with("overlay")))
        .unwrap_or(false)
}

/// The init system a rootfs will boot. Only the systemd verdict changes
/// runtime behavior (the namespace branch of the seccomp shield).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestInit {
    Systemd,
    OpenRc,
    Runit,
    Unknown,
}

impl Display for GuestInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GuestInit::Systemd => "systemd",
            GuestInit::OpenRc => "openrc",
            GuestInit::Runit => "runit",
            GuestInit::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

pub fn guest_init_kind(rootfs: &Path) -> GuestInit {
    let init = rootfs.join("sbin/init");
    if let Ok(target) = fs::read_link(&init) {
        let target = target.to_string_lossy().into_owned();
        if target.contains("systemd") {
            return GuestInit::Systemd;
        }
        if target.contains("openrc") {
            return GuestInit::OpenRc;
        }
        if target.contains("runit") {
            return GuestInit::Runit;
        }
    }
    if rootfs.join("lib/systemd/systemd").exists()
        || rootfs.join("usr/lib/systemd/systemd").exists()
    {
        return GuestInit::Systemd;
    }
    if rootfs.join("sbin/openrc-init").exists() || rootfs.join("sbin/openrc").exists() {
        return GuestInit::OpenRc;
    }
    if rootfs.join("sbin/runit-init").exists() {
        return GuestInit::Runit;
    }
    GuestInit::Unknown
}

/// Reads a single Android system property. Fork+exec with parsing of
/// `getprop` output lines; never goes through a shell.
pub fn getprop(key: &str) -> Option<String> {
    let output = Command::new("getprop").arg(key).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// DNS servers the Android resolver currently uses (`net.dns1`, `net.dns2`).
pub fn android_dns_servers() -> Vec<String> {
    ["net.dns1", "net.dns2"]
        .iter()
        .filter_map(|key| getprop(key))
        .collect()
}

const FIRMWARE_PATH_PARAM: &str = "/sys/module/firmware_class/parameters/path";

fn firmware_dir(rootfs: &Path) -> PathBuf {
    rootfs.join("lib/firmware")
}

/// Prepends the container's firmware directory to the kernel's colon
/// separated firmware search path. Soft-fail: hardware without the module
/// parameter simply skips this.
pub fn firmware_path_add(rootfs: &Path) -> Result<()> {
    let fw_dir = firmware_dir(rootfs);
    if !Path::new(FIRMWARE_PATH_PARAM).exists() || !fw_dir.exists() {
        return Ok(());
    }
    let current = crate::utils::read_trimmed(FIRMWARE_PATH_PARAM)?;
    let entry = fw_dir.to_string_lossy().into_owned();
    if current.split(':').any(|e| e == entry) {
        return Ok(());
    }
    let updated = if current.is_empty() {
        entry
    } else {
        format!("{}:{}", entry, current)
    };
    crate::utils::write_file(FIRMWARE_PATH_PARAM, updated)
}

/// Removes the entry added by [`firmware_path_add`], matching by suffix so a
/// stop that only knows the mount point still finds it.
pub fn firmware_path_remove(rootfs: &Path) -> Result<()> {
    if !Path::new(FIRMWARE_PATH_PARAM).exists() {
        return Ok(());
    }
    let entry = firmware_dir(rootfs).to_string_lossy().into_owned();
    let current = crate::utils::read_trimmed(FIRMWARE_PATH_PARAM)?;
    let updated: Vec<&str> = current.split(':').filter(|e| *e != entry).collect();
    crate::utils::write_file(FIRMWARE_PATH_PARAM, updated.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_parse() {
        let v = KernelVersion::parse("4.14.117-perf+").unwrap();
        assert_eq!(v, KernelVersion { major: 4, minor: 14 });
        let v = KernelVersion::parse("5.10.0-8-amd64").unwrap();
        assert_eq!(v, KernelVersion { major: 5, minor: 10 });
        assert!(KernelVersion::parse("garbage").is_err());
    }

    #[test]
    fn test_kernel_version_ordering() {
        let old = KernelVersion { major: 3, minor: 10 };
        let floor = KernelVersion { major: 3, minor: 18 };
        let new = KernelVersion { major: 4, minor: 14 };
        assert!(old < MIN_KERNEL);
        assert!(floor >= MIN_KERNEL);
        assert!(new >= MIN_KERNEL);
    }

    #[test]
    fn test_guest_init_kind_systemd_symlink() {
        let dir = crate::utils::create_temp_dir("test_guest_init_kind").unwrap();
        std::fs::create_dir_all(dir.join("sbin")).unwrap();
        std::os::unix::fs::symlink(
            "../lib/systemd/systemd",
            dir.join("sbin/init"),
        )
        .unwrap();
        assert_eq!(guest_init_kind(dir.path()), GuestInit::Systemd);
    }

    #[test]
    fn test_guest_init_kind_unknown() {
        let dir = crate::utils::create_temp_dir("test_guest_init_unknown").unwrap();
        assert_eq!(guest_init_kind(dir.path()), GuestInit::Unknown);
    }
}
