//! # Droidspaces
//! Single-binary container runtime for stock Linux and Android kernels.
//! The CLI layer parses the surface and hands a validated [`Settings`] to
//! the command modules; everything interesting happens there.

use std::path::PathBuf;

use anyhow::Result;
use clap::{AppSettings, Clap};

use droidspaces::commands::{
    self, check, docs, enter, info, pid, restart, run, scan, show, start, status, stop,
};
use droidspaces::container::BindMount;
use droidspaces::container::Flags;
use droidspaces::VERSION;

/// Global options are order-independent relative to the command; `run` is
/// the exception, where parsing stops at the first positional so the
/// payload keeps its own flags.
#[derive(Clap, Debug)]
#[clap(
    name = "droidspaces",
    setting = AppSettings::NoAutoHelp,
    setting = AppSettings::NoAutoVersion
)]
struct Opts {
    /// Directory rootfs to boot
    #[clap(short = 'r', long, global = true)]
    rootfs: Option<PathBuf>,
    /// Image rootfs to loop-mount and boot; requires --name
    #[clap(short = 'i', long, global = true)]
    rootfs_img: Option<PathBuf>,
    /// Container identifier
    #[clap(short = 'n', long, global = true)]
    name: Option<String>,
    /// Custom PID file path instead of --name
    #[clap(short = 'p', long, global = true)]
    pidfile: Option<PathBuf>,
    /// Container hostname (defaults to the name)
    #[clap(short = 'h', long, global = true)]
    hostname: Option<String>,
    /// Comma-separated DNS servers
    #[clap(short = 'd', long, global = true)]
    dns: Option<String>,
    /// Stay attached to the console
    #[clap(short = 'f', long, global = true)]
    foreground: bool,
    /// Expose the host devtmpfs to the container
    #[clap(long, global = true)]
    hw_access: bool,
    /// Enable IPv6 inside the container
    #[clap(long, global = true)]
    enable_ipv6: bool,
    /// Bind Android shared storage into the container
    #[clap(long, global = true)]
    enable_android_storage: bool,
    /// Set host SELinux to permissive before booting
    #[clap(long, global = true)]
    selinux_permissive: bool,
    /// Ephemeral mode: writes go to RAM and vanish on stop
    #[clap(short = 'V', long, global = true)]
    volatile: bool,
    /// Custom bind mounts, SRC:DEST[,SRC:DEST...]
    #[clap(short = 'B', long, global = true)]
    bind_mount: Option<String>,
    /// Log to a file instead of stderr
    #[clap(long, global = true)]
    log: Option<PathBuf>,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Clap, Debug)]
enum SubCommand {
    /// Boot a container
    Start,
    /// Shut a container down (comma-separated names allowed)
    Stop,
    /// Stop preserving the image mount, then start again
    Restart,
    /// Interactive shell inside a running container
    Enter { user: Option<String> },
    /// One-shot command inside a running container
    #[clap(setting = AppSettings::TrailingVarArg, setting = AppSettings::AllowLeadingHyphen)]
    Run { command: Vec<String> },
    /// One-line state report
    Status,
    /// Detail panel for one container
    Info,
    /// Table of all running containers
    Show,
    /// Adopt orphans, drop stale state, sweep stray mounts
    Scan,
    /// Print the init PID, or NONE
    Pid,
    /// Host capability report
    Check,
    /// Built-in documentation
    Docs,
    /// Same as docs
    Help,
    /// Print the version
    Version,
}

fn settings_from(opts: &Opts) -> Result<commands::Settings> {
    let binds = match &opts.bind_mount {
        Some(list) => BindMount::parse_list(list)?,
        None => vec![],
    };
    let dns_servers = opts
        .dns
        .as_deref()
        .map(|d| d.split(',').map(|s| s.to_string()).collect())
        .unwrap_or_default();

    Ok(commands::Settings {
        rootfs: opts.rootfs.clone(),
        rootfs_img: opts.rootfs_img.clone(),
        name: opts.name.clone(),
        pidfile: opts.pidfile.clone(),
        hostname: opts.hostname.clone(),
        dns_servers,
        flags: Flags {
            foreground: opts.foreground,
            hw_access: opts.hw_access,
            volatile: opts.volatile,
            ipv6_enabled: opts.enable_ipv6,
            android_storage: opts.enable_android_storage,
            selinux_permissive: opts.selinux_permissive,
        },
        binds,
    })
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = droidspaces::logger::init(opts.log.clone()) {
        eprintln!("log init failed: {:?}", e);
    }

    let settings = settings_from(&opts)?;

    match opts.subcmd {
        SubCommand::Start => start::exec(settings),
        SubCommand::Stop => stop::exec(&settings, false),
        SubCommand::Restart => restart::exec(settings),
        SubCommand::Enter { user } => enter::exec(&settings, user),
        SubCommand::Run { command } => run::exec(&settings, command),
        SubCommand::Status => status::exec(&settings),
        SubCommand::Info => info::exec(&settings),
        SubCommand::Show => show::exec(),
        SubCommand::Scan => scan::exec(),
        SubCommand::Pid => pid::exec(&settings),
        SubCommand::Check => check::exec(),
        SubCommand::Docs | SubCommand::Help => docs::exec(),
        SubCommand::Version => {
            println!("droidspaces {}", VERSION);
            Ok(())
        }
    }
}
