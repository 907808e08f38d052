//! # Droidspaces
//! Single-binary container runtime that boots complete Linux distributions
//! (systemd, OpenRC or runit as PID 1) from a root filesystem on a stock
//! Linux kernel, including Android kernels as old as 3.18.

pub mod cgroups;
pub mod commands;
pub mod container;
pub mod devices;
pub mod fsutil;
pub mod image;
pub mod logger;
pub mod namespaces;
pub mod network;
pub mod overlay;
pub mod platform;
pub mod process;
pub mod proxy;
pub mod seccomp;
pub mod tty;
pub mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker file created under the container's `/run`; its presence (together
/// with a live PID and an init cmdline) attests that a process is a
/// droidspaces-owned init. It contains the runtime version string.
pub const RUN_MARKER: &str = "droidspaces";

/// Value written to `/run/systemd/container` so guest init systems detect
/// the virtualization environment.
pub const CONTAINER_IDENT: &str = "droidspaces";

/// Transient sync file left at the rootfs top level by the parent before the
/// boot fork; the boot sequence consumes and unlinks it.
pub const UUID_SYNC_FILE: &str = ".droidspaces-uuid";

/// Number of auxiliary TTYs bound into the container besides the console.
pub const AUX_TTY_COUNT: usize = 6;
