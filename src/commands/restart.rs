//! `restart`: stop with the mount-preservation marker, then start. With an
//! image rootfs the loop mount survives the cycle, which is what makes the
//! turnaround fast.

use anyhow::Result;

use super::{start, stop, Settings};

pub fn exec(settings: Settings) -> Result<()> {
    match settings.resolve_target() {
        Ok((name, pid)) => stop::stop_one(name.as_deref(), pid, true)?,
        Err(e) => log::debug!("restart found nothing to stop: {:?}", e),
    }
    start::exec(settings)
}
