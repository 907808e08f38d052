//! `enter`: an interactive shell inside a running container. The PTY is
//! allocated inside the target's namespaces so the device exists in the
//! container's devpts, and the master travels back over SCM_RIGHTS.

use std::env;
use std::process::exit;

use anyhow::{Context, Result};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, close, ForkResult, Pid};

use super::Settings;
use crate::cgroups::attach;
use crate::namespaces::NamespaceHandles;
use crate::process::fork;
use crate::proxy;
use crate::tty::{self, Pty};
use crate::utils;
use crate::CONTAINER_IDENT;

pub fn exec(settings: &Settings, user: Option<String>) -> Result<()> {
    let (_, target) = settings.resolve_target()?;

    // Cgroup attach strictly before any setns, or the guest's session
    // manager cannot scope us and su/login hang.
    attach::attach_to_container(target)?;
    let handles = NamespaceHandles::open(target)?;

    let (parent_sock, child_sock) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .context("failed to create the fd-passing socketpair")?;

    match fork()? {
        ForkResult::Child => {
            let _ = close(parent_sock);
            run_intermediate(handles, child_sock, user);
        }
        ForkResult::Parent { child } => {
            let _ = close(child_sock);
            drop(handles);
            let master = tty::recv_master(parent_sock)
                .context("the container side failed to allocate a terminal")?;
            let _ = close(parent_sock);

            // Signals go to the container's PID 1; the intermediate is
            // only watched for exit.
            let status = proxy::proxy_console(master, target, child)?;
            let code = match status {
                Some(WaitStatus::Exited(_, code)) => code,
                Some(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                _ => match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => code,
                    _ => 0,
                },
            };
            exit(code);
        }
    }
}

/// The intermediate: joins the namespaces, allocates the interior PTY and
/// forks the shell. The extra fork is what actually lands us in the PID
/// namespace.
fn run_intermediate(handles: NamespaceHandles, sock: i32, user: Option<String>) -> ! {
    let inner = || -> Result<i32> {
        handles.enter()?;
        unistd::chdir("/").context("failed to chdir into the container")?;

        let pty = Pty::open().context("failed to allocate a container-side pty")?;
        tty::send_master(sock, pty.master)?;
        let _ = close(sock);
        let _ = close(pty.master);

        match fork()? {
            ForkResult::Child => run_shell(pty, user),
            ForkResult::Parent { child } => {
                let _ = close(pty.slave);
                reap_shell(child)
            }
        }
    };
    match inner() {
        Ok(code) => exit(code),
        Err(e) => {
            log::error!("enter failed: {:?}", e);
            exit(1);
        }
    }
}

fn reap_shell(child: Pid) -> Result<i32> {
    match waitpid(child, None)? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
        _ => Ok(0),
    }
}

/// The final process: claim the controlling terminal here, never in an
/// ancestor, then become the shell.
fn run_shell(pty: Pty, user: Option<String>) -> ! {
    let term = env::var("TERM").unwrap_or_else(|_| "linux".to_string());
    env::set_var(
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );
    env::set_var("TERM", term);
    env::set_var("HOME", "/root");
    env::set_var("container", CONTAINER_IDENT);

    if let Err(e) = tty::set_controlling_tty(pty.slave) {
        log::error!("could not take the controlling terminal: {:?}", e);
        exit(1);
    }

    if let Some(user) = user {
        let _ = utils::do_exec("su", &["su".to_string(), "-".to_string(), user]);
    } else {
        let _ = utils::do_exec("/bin/bash", &["-bash".to_string()]);
        let _ = utils::do_exec("/bin/sh", &["-sh".to_string()]);
    }
    // Forwarded to the caller as the canonical exec-failure code.
    exit(127);
}
