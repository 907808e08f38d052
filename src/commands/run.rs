//! `run`: a one-shot command inside a running container, stdio inherited,
//! exit status forwarded verbatim.

use std::env;
use std::process::exit;

use anyhow::{bail, Context, Result};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use super::Settings;
use crate::cgroups::attach;
use crate::namespaces::NamespaceHandles;
use crate::process::fork;
use crate::utils;
use crate::CONTAINER_IDENT;

pub fn exec(settings: &Settings, command: Vec<String>) -> Result<()> {
    if command.is_empty() {
        bail!("run needs a command to execute");
    }
    let (_, target) = settings.resolve_target()?;

    attach::attach_to_container(target)?;
    let handles = NamespaceHandles::open(target)?;

    match fork()? {
        ForkResult::Child => run_intermediate(handles, command),
        ForkResult::Parent { child } => {
            drop(handles);
            let code = wait_code(child)?;
            exit(code);
        }
    }
}

fn run_intermediate(handles: NamespaceHandles, command: Vec<String>) -> ! {
    let inner = || -> Result<i32> {
        handles.enter()?;
        unistd::chdir("/").context("failed to chdir into the container")?;
        match fork()? {
            ForkResult::Child => {
                env::set_var(
                    "PATH",
                    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                );
                env::set_var("container", CONTAINER_IDENT);
                let _ = utils::do_exec(&command[0], &command);
                exit(127);
            }
            ForkResult::Parent { child } => wait_code(child),
        }
    };
    match inner() {
        Ok(code) => exit(code),
        Err(e) => {
            log::error!("run failed: {:?}", e);
            exit(1);
        }
    }
}

fn wait_code(child: Pid) -> Result<i32> {
    match waitpid(child, None).context("waitpid failed")? {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
        _ => Ok(0),
    }
}
