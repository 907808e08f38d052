//! `docs`: the built-in command reference as plain text.

use anyhow::Result;

use crate::VERSION;

const REFERENCE: &str = "\
COMMANDS
  start                 boot a container from --rootfs or --rootfs-img
  stop                  shut a container down (comma-separated names allowed)
  restart               stop preserving the image mount, then start again
  enter [user]          interactive shell inside a running container
  run <cmd> [args...]   one-shot command inside a running container
  status                one-line state report
  info                  detail panel for one container
  show                  table of all running containers
  scan                  adopt orphans, drop stale state, sweep stray mounts
  pid                   print the init PID, or NONE
  check                 host capability report
  docs | help           this text
  version               print the version

OPTIONS
  -r, --rootfs <path>           directory rootfs
  -i, --rootfs-img <path>       image rootfs (requires --name)
  -n, --name <name>             container name
  -p, --pidfile <path>          custom PID file (instead of --name)
  -h, --hostname <name>         container hostname (defaults to the name)
  -d, --dns <a,b>               DNS servers for the container
  -f, --foreground              stay attached to the console
      --hw-access               expose the host devtmpfs
      --enable-ipv6             enable IPv6 inside the container
      --enable-android-storage  bind /storage/emulated/0 into the container
      --selinux-permissive      set host SELinux to permissive first
  -V, --volatile                ephemeral mode, all writes vanish on stop
  -B, --bind-mount SRC:DEST[,...]  up to 16 custom bind mounts
";

pub fn exec() -> Result<()> {
    println!("droidspaces {}", VERSION);
    println!();
    print!("{}", REFERENCE);
    Ok(())
}
