//! Logging backend. One logger serves the whole fork topology (parent,
//! monitor, boot child), so every line carries the pid of the process that
//! wrote it.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<DroidspacesLogger> = OnceCell::new();

const LEVEL_ENV: &str = "DROIDSPACES_LOG_LEVEL";

enum Sink {
    Stderr,
    File(File),
}

/// Level precedence: `DROIDSPACES_LOG_LEVEL` wins when it parses; with a
/// `--log` file the default is Info (boot diagnostics are the point of the
/// file), on stderr it is Warn so interactive sessions stay quiet.
fn resolve_level(env_value: Option<&str>, to_file: bool) -> LevelFilter {
    if let Some(value) = env_value {
        if let Ok(level) = LevelFilter::from_str(value) {
            return level;
        }
    }
    if to_file {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    }
}

pub fn init(log_file: Option<PathBuf>) -> Result<()> {
    let logger = LOGGER.get_or_try_init(|| -> Result<DroidspacesLogger> {
        let sink = match &log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {:?}", path))?;
                Sink::File(file)
            }
            None => Sink::Stderr,
        };
        let level = resolve_level(
            env::var(LEVEL_ENV).ok().as_deref(),
            matches!(sink, Sink::File(_)),
        );
        Ok(DroidspacesLogger { level, sink })
    })?;

    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
    Ok(())
}

pub struct DroidspacesLogger {
    level: LevelFilter,
    sink: Sink,
}

impl DroidspacesLogger {
    fn format(&self, record: &Record) -> String {
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        if record.level() >= log::Level::Debug {
            format!(
                "{} {:<5} pid {} {}:{} {}",
                timestamp,
                record.level(),
                std::process::id(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        } else {
            format!(
                "{} {:<5} pid {} {}",
                timestamp,
                record.level(),
                std::process::id(),
                record.args()
            )
        }
    }
}

impl Log for DroidspacesLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        match &self.sink {
            Sink::File(file) => {
                let mut file: &File = file;
                let _ = writeln!(file, "{}", line);
            }
            Sink::Stderr => {
                let _ = writeln!(stderr(), "{}", line);
            }
        }
    }

    fn flush(&self) {
        match &self.sink {
            Sink::File(file) => {
                let mut file: &File = file;
                let _ = file.flush();
            }
            Sink::Stderr => {
                let _ = stderr().flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_level_wins() {
        assert_eq!(resolve_level(Some("debug"), false), LevelFilter::Debug);
        assert_eq!(resolve_level(Some("error"), true), LevelFilter::Error);
    }

    #[test]
    fn test_file_defaults_to_info() {
        assert_eq!(resolve_level(None, true), LevelFilter::Info);
    }

    #[test]
    fn test_stderr_defaults_to_warn() {
        assert_eq!(resolve_level(None, false), LevelFilter::Warn);
    }

    #[test]
    fn test_garbage_env_falls_back() {
        assert_eq!(resolve_level(Some("chatty"), false), LevelFilter::Warn);
        assert_eq!(resolve_level(Some("chatty"), true), LevelFilter::Info);
    }
}
