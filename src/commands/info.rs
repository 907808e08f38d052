//! `info`: the detail panel for one container.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local};

use super::Settings;
use crate::container;
use crate::utils;

pub fn exec(settings: &Settings) -> Result<()> {
    let (name, pid) = settings.resolve_target()?;
    let name = name.unwrap_or_else(|| "-".to_string());

    println!("Name:      {}", name);
    println!("Status:    running");
    println!("PID:       {}", pid);

    if let Ok(meta) = fs::metadata(container::pid_file(&name)) {
        if let Ok(modified) = meta.modified() {
            let started: DateTime<Local> = DateTime::from(modified);
            println!(
                "Started:   {}",
                started.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
            );
        }
    }

    let hostname = utils::read_trimmed(PathBuf::from(format!(
        "/proc/{}/root/etc/hostname",
        pid
    )))
    .unwrap_or_else(|_| "-".to_string());
    println!("Hostname:  {}", hostname);

    let version = utils::read_trimmed(PathBuf::from(format!(
        "/proc/{}/root/run/{}",
        pid,
        crate::RUN_MARKER
    )))
    .unwrap_or_else(|_| "-".to_string());
    println!("Runtime:   droidspaces {}", version);

    match utils::read_trimmed(container::mount_sidecar(&name)) {
        Ok(mount_point) => println!("Rootfs:    {} (image mount)", mount_point),
        Err(_) => println!("Rootfs:    directory"),
    }
    Ok(())
}
