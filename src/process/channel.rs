//! Synchronization pipe between the monitor and the parent. The monitor
//! sends exactly one message: the PID of the container init it forked.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mio::unix::pipe::{self, Receiver, Sender};
use mio::{Events, Interest, Poll, Token};
use nix::unistd::Pid;

const MONITOR: Token = Token(0);
const MAX_EVENTS: usize = 8;
const WAIT_FOR_INIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum Message {
    InitPid = 0x01,
    BootFailed = 0x02,
}

pub struct InitPidSender {
    sender: Sender,
}

pub struct InitPidReceiver {
    receiver: Receiver,
}

pub fn new() -> Result<(InitPidSender, InitPidReceiver)> {
    let (sender, receiver) = pipe::new().context("failed to create sync pipe")?;
    Ok((InitPidSender { sender }, InitPidReceiver { receiver }))
}

impl InitPidSender {
    pub fn send_init_pid(&mut self, pid: Pid) -> Result<()> {
        log::debug!("[monitor to parent] init pid {}", pid);
        let mut buf = [0u8; 5];
        buf[0] = Message::InitPid as u8;
        buf[1..].copy_from_slice(&pid.as_raw().to_be_bytes());
        self.sender
            .write_all(&buf)
            .context("failed to write init pid to sync pipe")?;
        Ok(())
    }

    pub fn send_boot_failed(&mut self) -> Result<()> {
        let buf = [Message::BootFailed as u8, 0, 0, 0, 0];
        self.sender
            .write_all(&buf)
            .context("failed to write boot failure to sync pipe")?;
        Ok(())
    }
}

impl InitPidReceiver {
    /// Blocks until the monitor delivers the init PID or the pipe closes.
    pub fn wait_for_init_pid(&mut self) -> Result<Pid> {
        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut self.receiver, MONITOR, Interest::READABLE)?;
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut buf = [0u8; 5];
        let mut filled = 0usize;

        loop {
            poll.poll(&mut events, Some(WAIT_FOR_INIT))?;
            if events.is_empty() {
                bail!("timed out waiting for the monitor to deliver the init pid");
            }
            for event in events.iter() {
                if event.token() != MONITOR {
                    unreachable!()
                }
                match self.receiver.read(&mut buf[filled..]) {
                    Ok(0) => bail!("monitor exited before delivering the init pid"),
                    Ok(n) => filled += n,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => (),
                    Err(e) => bail!("failed to read from sync pipe: {:?}", e),
                }
            }
            if filled == buf.len() {
                break;
            }
        }

        match buf[0] {
            b if b == Message::InitPid as u8 => {
                let raw = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                Ok(Pid::from_raw(raw))
            }
            b if b == Message::BootFailed as u8 => {
                bail!("container init failed before it could be started")
            }
            other => bail!("unexpected message {:#x} on sync pipe", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_pid_roundtrip() {
        let (mut tx, mut rx) = new().unwrap();
        tx.send_init_pid(Pid::from_raw(4242)).unwrap();
        let pid = rx.wait_for_init_pid().unwrap();
        assert_eq!(pid.as_raw(), 4242);
    }

    #[test]
    fn test_boot_failure_is_an_error() {
        let (mut tx, mut rx) = new().unwrap();
        tx.send_boot_failed().unwrap();
        assert!(rx.wait_for_init_pid().is_err());
    }

    #[test]
    fn test_closed_pipe_is_an_error() {
        let (tx, mut rx) = new().unwrap();
        drop(tx);
        assert!(rx.wait_for_init_pid().is_err());
    }
}
