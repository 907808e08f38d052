//! `show`: tabular listing of every known container. Stale PID files are
//! garbage-collected along the way.

use std::fs;
use std::io::{self, Write};

use anyhow::Result;
use chrono::{DateTime, Local};
use tabwriter::TabWriter;

use crate::container::{self, discovery};
use crate::utils;

pub fn exec() -> Result<()> {
    let mut content = String::new();

    for name in discovery::known_names()? {
        let pid_file = container::pid_file(&name);
        let pid = match discovery::resolve_name(&name)? {
            Some(pid) => pid,
            None => {
                // Crashed container; reclaim the name.
                let _ = fs::remove_file(&pid_file);
                continue;
            }
        };

        let started = fs::metadata(&pid_file)
            .and_then(|m| m.modified())
            .map(|t| {
                let local: DateTime<Local> = DateTime::from(t);
                local.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
            })
            .unwrap_or_default();

        let rootfs = utils::read_trimmed(container::mount_sidecar(&name))
            .unwrap_or_else(|_| "directory".to_string());

        content.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            name, pid, "Running", rootfs, started
        ));
    }

    let mut tab_writer = TabWriter::new(io::stdout());
    writeln!(&mut tab_writer, "NAME\tPID\tSTATUS\tROOTFS\tSTARTED")?;
    write!(&mut tab_writer, "{}", content)?;
    tab_writer.flush()?;
    Ok(())
}
