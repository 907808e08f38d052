//! One module per subcommand, plus the validated global settings every
//! command receives from the CLI layer.

pub mod check;
pub mod docs;
pub mod enter;
pub mod info;
pub mod pid;
pub mod restart;
pub mod run;
pub mod scan;
pub mod show;
pub mod start;
pub mod status;
pub mod stop;

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::container::{BindMount, Flags};

/// Global CLI options after parsing, shared by every command.
#[derive(Debug, Default)]
pub struct Settings {
    pub rootfs: Option<PathBuf>,
    pub rootfs_img: Option<PathBuf>,
    pub name: Option<String>,
    pub pidfile: Option<PathBuf>,
    pub hostname: Option<String>,
    pub dns_servers: Vec<String>,
    pub flags: Flags,
    pub binds: Vec<BindMount>,
}

impl Settings {
    /// The mutual-exclusion rules of the CLI surface.
    pub fn validate(&self) -> Result<()> {
        if self.rootfs.is_some() && self.rootfs_img.is_some() {
            bail!("--rootfs and --rootfs-img are mutually exclusive");
        }
        if self.name.is_some() && self.pidfile.is_some() {
            bail!("--name and --pidfile are mutually exclusive");
        }
        if self.rootfs_img.is_some() && self.name.is_none() {
            bail!("--rootfs-img requires an explicit --name");
        }
        if let Some(name) = &self.name {
            crate::container::name::validate(name)?;
        }
        Ok(())
    }

    /// Resolves the target of a lifecycle command (stop, enter, run, ...)
    /// to a live container init PID.
    pub fn resolve_target(&self) -> Result<(Option<String>, nix::unistd::Pid)> {
        use crate::container::discovery;
        if let Some(pidfile) = &self.pidfile {
            match discovery::resolve_pid_file(pidfile)? {
                Some(pid) => return Ok((None, pid)),
                None => bail!("no running container for PID file {:?}", pidfile),
            }
        }
        let name = match &self.name {
            Some(n) => n.clone(),
            None => bail!("a container must be selected with --name or --pidfile"),
        };
        match discovery::resolve_name(&name)? {
            Some(pid) => Ok((Some(name), pid)),
            None => bail!("no running container named {:?}", name),
        }
    }
}
