//! Utility functionality

use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::{bail, Result};
use nix::unistd;

pub trait PathBufExt {
    /// Strips the leading `/` so an absolute container path can be used
    /// relative to a rootfs the process has chdir'd into.
    fn as_in_rootfs(&self) -> Result<PathBuf>;
    fn join_absolute_path(&self, p: &Path) -> Result<PathBuf>;
}

impl PathBufExt for PathBuf {
    fn as_in_rootfs(&self) -> Result<PathBuf> {
        if self.is_relative() {
            bail!("relative path cannot be converted to a rootfs-relative path")
        } else {
            let path_string = self.to_string_lossy().into_owned();
            Ok(PathBuf::from(path_string[1..].to_string()))
        }
    }

    fn join_absolute_path(&self, p: &Path) -> Result<PathBuf> {
        if !p.is_absolute() && !p.as_os_str().is_empty() {
            bail!(
                "cannot join {:?} because it is not the absolute path.",
                p.display()
            )
        }
        Ok(PathBuf::from(format!("{}{}", self.display(), p.display())))
    }
}

pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, contents).with_context(|| format!("failed to write to {:?}", path))?;
    Ok(())
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written PID file or sidecar.
pub fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("failed to write to {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename {:?} into place", tmp))?;
    Ok(())
}

pub fn read_trimmed<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(content.trim().to_string())
}

pub fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).with_context(|| format!("failed to create directory {:?}", path))
}

pub fn open<P: AsRef<Path>>(path: P) -> Result<File> {
    let path = path.as_ref();
    File::open(path).with_context(|| format!("failed to open {:?}", path))
}

/// Exec the first candidate that resolves; never returns on success.
pub fn do_exec<P: AsRef<Path>>(path: P, args: &[String]) -> Result<()> {
    let p = CString::new(path.as_ref().to_string_lossy().to_string())?;
    let a: Vec<CString> = args
        .iter()
        .map(|s| CString::new(s.to_string()).unwrap_or_default())
        .collect();
    unistd::execvp(&p, &a)?;
    Ok(())
}

/// A 32-hex-char identifier from the kernel CSPRNG, used as the start-time
/// PID discovery marker under the container's `/run`.
pub fn generate_uuid() -> Result<String> {
    let mut buf = [0u8; 16];
    let mut urandom = open("/dev/urandom")?;
    urandom
        .read_exact(&mut buf)
        .context("failed to read from /dev/urandom")?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

pub fn delete_with_retry<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let mut delay = Duration::from_millis(10);

    for _ in 0..5 {
        if fs::remove_dir(path).is_ok() {
            return Ok(());
        }

        std::thread::sleep(delay);
        delay *= 2;
    }

    bail!("could not delete {:?}", path)
}

pub struct TempDir {
    path: Option<PathBuf>,
}

impl TempDir {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let p = path.into();
        std::fs::create_dir_all(&p)
            .with_context(|| format!("failed to create directory {}", p.display()))?;
        Ok(Self { path: Some(p) })
    }

    pub fn path(&self) -> &Path {
        self.path
            .as_ref()
            .expect("temp dir has already been removed")
    }

    pub fn remove(&mut self) {
        if let Some(p) = &self.path {
            let _ = fs::remove_dir_all(p);
            self.path = None;
        }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        self.remove();
    }
}

impl AsRef<Path> for TempDir {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

impl Deref for TempDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.path()
    }
}

pub fn create_temp_dir(test_name: &str) -> Result<TempDir> {
    let dir = TempDir::new(std::env::temp_dir().join(test_name))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_in_rootfs() {
        assert_eq!(
            PathBuf::from("/etc/resolv.conf").as_in_rootfs().unwrap(),
            PathBuf::from("etc/resolv.conf")
        );
        assert!(PathBuf::from("etc/resolv.conf").as_in_rootfs().is_err());
    }

    #[test]
    fn test_join_absolute_path() {
        assert_eq!(
            PathBuf::from("sample/a/")
                .join_absolute_path(&PathBuf::from("/b"))
                .unwrap(),
            PathBuf::from("sample/a/b")
        );
    }

    #[test]
    fn test_join_absolute_path_error() {
        assert!(PathBuf::from("sample/a/")
            .join_absolute_path(&PathBuf::from("b/c"))
            .is_err(),);
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid().unwrap();
        assert_eq!(uuid.len(), 32);
        assert!(uuid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(uuid, generate_uuid().unwrap());
    }

    #[test]
    fn test_atomic_write() {
        let dir = create_temp_dir("test_atomic_write").unwrap();
        let target = dir.join("value");
        atomic_write(&target, "123\n").unwrap();
        assert_eq!(read_trimmed(&target).unwrap(), "123");
        assert!(!dir.join("value.tmp").exists());
    }
}
