//! `scan`: reconcile on-disk state with reality — adopt orphaned container
//! inits, drop stale PID files, sweep unreferenced image mounts.

use anyhow::Result;

use crate::container::discovery;

pub fn exec() -> Result<()> {
    let report = discovery::scan()?;

    for name in &report.adopted {
        println!("adopted orphan container as {}", name);
    }
    for name in &report.removed_stale {
        println!("removed stale PID file for {}", name);
    }
    for mount in &report.unmounted {
        println!("unmounted stray image mount {}", mount.display());
    }
    if report.adopted.is_empty()
        && report.removed_stale.is_empty()
        && report.unmounted.is_empty()
    {
        println!("nothing to reconcile");
    }
    Ok(())
}
