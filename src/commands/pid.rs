//! `pid`: machine-readable PID lookup. Prints a single integer, or `NONE`
//! when the container is not running; scripts branch on the output rather
//! than the exit code.

use anyhow::Result;

use super::Settings;
use crate::container::discovery;

pub fn exec(settings: &Settings) -> Result<()> {
    let pid = if let Some(pidfile) = &settings.pidfile {
        discovery::resolve_pid_file(pidfile)?
    } else if let Some(name) = &settings.name {
        discovery::resolve_name(name)?
    } else {
        anyhow::bail!("a container must be selected with --name or --pidfile");
    };

    match pid {
        Some(pid) => println!("{}", pid),
        None => println!("NONE"),
    }
    Ok(())
}
