//! Rootfs image driver: filesystem check, loop mount with retry, unmount
//! with loop detach. Host utilities are always invoked argv-style.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::container;
use crate::fsutil;
use crate::platform;
use crate::utils;

/// Loop-device teardown is asynchronous on 4.14-era kernels; the first
/// mount after a stop can transiently fail with EBUSY.
const MOUNT_ATTEMPTS: u32 = 3;
const MOUNT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Mount slot derived from the container name; deriving it this way is what
/// enforces "one container per image".
pub fn mount_point_for(name: &str) -> PathBuf {
    container::image_mount_root().join(name)
}

/// Runs `e2fsck -f -y` on the image. Best-effort: a dirty-but-fixed image
/// (exit 1) is fine, anything else is logged and mounting proceeds.
fn check_filesystem(image: &Path) {
    match Command::new("e2fsck").arg("-f").arg("-y").arg(image).status() {
        Ok(status) => match status.code() {
            Some(0) => (),
            Some(1) => log::info!("e2fsck repaired {:?}", image),
            code => log::warn!("e2fsck on {:?} exited with {:?}", image, code),
        },
        Err(e) => log::warn!("could not run e2fsck on {:?}: {}", image, e),
    }
}

/// On Android the image file must carry the `vold_data_file` context or the
/// kernel rejects the loop attach under SELinux enforcement.
fn relabel_image(image: &Path) {
    let result = Command::new("chcon")
        .arg("u:object_r:vold_data_file:s0")
        .arg(image)
        .status();
    match result {
        Ok(status) if status.success() => (),
        other => log::warn!("could not relabel {:?}: {:?}", image, other),
    }
}

/// Loop-mounts `image` on the slot derived from `name` and returns the
/// mount point.
pub fn mount_image(image: &Path, name: &str) -> Result<PathBuf> {
    if !image.exists() {
        bail!("rootfs image {:?} does not exist", image);
    }
    let mount_point = mount_point_for(name);
    if fsutil::is_mountpoint(&mount_point)? {
        bail!(
            "{:?} is already mounted; another container is using this image slot",
            mount_point
        );
    }
    utils::create_dir_all(&mount_point)?;

    check_filesystem(image);
    if platform::is_android() {
        relabel_image(image);
    }

    let mut last_failure = None;
    for attempt in 1..=MOUNT_ATTEMPTS {
        let status = Command::new("mount")
            .arg("-o")
            .arg("loop")
            .arg(image)
            .arg(&mount_point)
            .status()
            .context("failed to spawn mount")?;
        if status.success() {
            return Ok(mount_point);
        }
        last_failure = Some(status);
        log::warn!(
            "loop mount of {:?} failed (attempt {}/{}), syncing and retrying",
            image,
            attempt,
            MOUNT_ATTEMPTS
        );
        nix::unistd::sync();
        std::thread::sleep(MOUNT_RETRY_DELAY);
    }

    bail!(
        "loop mount of {:?} on {:?} failed after {} attempts: {:?}",
        image,
        mount_point,
        MOUNT_ATTEMPTS,
        last_failure
    )
}

/// Unmounts an image slot, detaching the loop device (`umount -d -l`), and
/// removes the empty slot directory.
pub fn unmount_image(mount_point: &Path) -> Result<()> {
    if !fsutil::is_mountpoint(mount_point)? {
        let _ = std::fs::remove_dir(mount_point);
        return Ok(());
    }
    let status = Command::new("umount")
        .arg("-d")
        .arg("-l")
        .arg(mount_point)
        .status()
        .context("failed to spawn umount")?;
    if !status.success() {
        bail!("umount of {:?} exited with {:?}", mount_point, status.code());
    }
    let _ = utils::delete_with_retry(mount_point);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_point_is_name_scoped() {
        let a = mount_point_for("web");
        let b = mount_point_for("db");
        assert_ne!(a, b);
        assert!(a.starts_with(container::image_mount_root()));
        assert_eq!(a.file_name().unwrap(), "web");
    }

    #[test]
    fn test_mount_of_missing_image_fails() {
        let err = mount_image(Path::new("/nonexistent/disk.img"), "missing").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_unmount_of_non_mountpoint_is_ok() {
        let dir = crate::utils::create_temp_dir("test_unmount_plain_dir").unwrap();
        let slot = dir.join("slot");
        std::fs::create_dir(&slot).unwrap();
        unmount_image(&slot).unwrap();
        assert!(!slot.exists());
    }
}
