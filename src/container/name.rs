//! Container naming: validation, auto-derivation from the rootfs
//! os-release, and collision suffixing.

use std::fs;
use std::path::Path;

use anyhow::{bail, Result};

use super::discovery;
use super::MAX_NAME_LEN;

/// Bounded `-N` suffix attempts before giving up on a base name.
const COLLISION_RETRIES: u32 = 32;

pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("container name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("container name exceeds {} characters", MAX_NAME_LEN);
    }
    if name.contains('/') || name == "." || name == ".." {
        bail!("container name {:?} must not contain path separators", name);
    }
    Ok(())
}

/// Derives `ID-VERSION_ID` from the rootfs' `/etc/os-release`, e.g.
/// `ubuntu-22.04`. Falls back to `linux` when the file is absent.
pub fn auto_name(rootfs: &Path) -> String {
    let content = fs::read_to_string(rootfs.join("etc/os-release"))
        .or_else(|_| fs::read_to_string(rootfs.join("usr/lib/os-release")))
        .unwrap_or_default();

    let field = |key: &str| -> Option<String> {
        content
            .lines()
            .find(|l| l.starts_with(&format!("{}=", key)))
            .map(|l| l[key.len() + 1..].trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    };

    match (field("ID"), field("VERSION_ID")) {
        (Some(id), Some(version)) => format!("{}-{}", id, version),
        (Some(id), None) => id,
        _ => "linux".to_string(),
    }
}

/// Finds a name not taken by any currently running container. Crashed
/// containers do not hold their names.
pub fn allocate(base: &str) -> Result<String> {
    validate(base)?;
    if !discovery::name_in_use(base)? {
        return Ok(base.to_string());
    }
    for n in 1..=COLLISION_RETRIES {
        let candidate = format!("{}-{}", base, n);
        if candidate.len() > MAX_NAME_LEN {
            break;
        }
        if !discovery::name_in_use(&candidate)? {
            return Ok(candidate);
        }
    }
    bail!(
        "could not find a free name for {:?} after {} attempts",
        base,
        COLLISION_RETRIES
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::create_temp_dir;

    #[test]
    fn test_validate_rejects_oversized_names() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        assert!(validate(&long).is_err());
        assert!(validate(&"a".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_validate_rejects_path_separators() {
        assert!(validate("web/1").is_err());
        assert!(validate("..").is_err());
        assert!(validate("web").is_ok());
    }

    #[test]
    fn test_auto_name_from_os_release() {
        let dir = create_temp_dir("test_auto_name").unwrap();
        std::fs::create_dir_all(dir.join("etc")).unwrap();
        std::fs::write(
            dir.join("etc/os-release"),
            "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n",
        )
        .unwrap();
        assert_eq!(auto_name(dir.path()), "ubuntu-22.04");
    }

    #[test]
    fn test_auto_name_without_version() {
        let dir = create_temp_dir("test_auto_name_nover").unwrap();
        std::fs::create_dir_all(dir.join("etc")).unwrap();
        std::fs::write(dir.join("etc/os-release"), "ID=alpine\n").unwrap();
        assert_eq!(auto_name(dir.path()), "alpine");
    }

    #[test]
    fn test_auto_name_fallback() {
        let dir = create_temp_dir("test_auto_name_fallback").unwrap();
        assert_eq!(auto_name(dir.path()), "linux");
    }
}
