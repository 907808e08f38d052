//! `status`: one-line state report, exit 0 iff running.

use anyhow::{bail, Result};

use super::Settings;
use crate::container::discovery;

pub fn exec(settings: &Settings) -> Result<()> {
    if let Some(pidfile) = &settings.pidfile {
        match discovery::resolve_pid_file(pidfile)? {
            Some(pid) => {
                println!("running (pid {})", pid);
                return Ok(());
            }
            None => bail!("no running container for PID file {:?}", pidfile),
        }
    }
    let name = match &settings.name {
        Some(n) => n,
        None => bail!("a container must be selected with --name or --pidfile"),
    };
    match discovery::resolve_name(name)? {
        Some(pid) => {
            println!("{} is running (pid {})", name, pid);
            Ok(())
        }
        None => bail!("{} is not running", name),
    }
}
