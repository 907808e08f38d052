//! Networking setup. The container shares the host stack; this is sysctl
//! and file plumbing, not namespace isolation.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use nix::unistd::sethostname;

use crate::platform;
use crate::utils;

const FALLBACK_DNS: &[&str] = &["1.1.1.1", "8.8.8.8"];

/// Android group memberships required for sockets when
/// CONFIG_ANDROID_PARANOID_NETWORK is set.
const AID_GROUPS: &[(&str, u32)] = &[
    ("aid_inet", 3003),
    ("aid_net_raw", 3004),
    ("aid_net_admin", 3005),
];

/// Builds the `resolv.conf` content: custom servers when given, public
/// fallback otherwise. Empty entries in the custom list are dropped.
pub fn resolv_conf_content(dns_servers: &[String]) -> String {
    let servers: Vec<&str> = dns_servers
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let mut content = String::new();
    if servers.is_empty() {
        for server in FALLBACK_DNS {
            content.push_str(&format!("nameserver {}\n", server));
        }
    } else {
        for server in servers {
            content.push_str(&format!("nameserver {}\n", server));
        }
    }
    content
}

fn write_sysctl(path: &str, value: &str) {
    if let Err(e) = utils::write_file(path, value) {
        log::warn!("sysctl write {} = {} failed: {:?}", path, value, e);
    }
}

/// Host-side setup: forwarding sysctls, IPv6 policy, and on Android the
/// fixed iptables policy. The iptables rules are idempotent and never
/// tracked for removal.
pub fn configure_host(ipv6_enabled: bool) -> Result<()> {
    write_sysctl("/proc/sys/net/ipv4/ip_forward", "1");
    let disable_ipv6 = if ipv6_enabled { "0" } else { "1" };
    write_sysctl("/proc/sys/net/ipv6/conf/all/disable_ipv6", disable_ipv6);
    write_sysctl("/proc/sys/net/ipv6/conf/default/disable_ipv6", disable_ipv6);

    if platform::is_android() {
        apply_android_iptables();
    }
    Ok(())
}

fn iptables(args: &[&str]) {
    match Command::new("iptables").args(args).status() {
        Ok(status) if status.success() => (),
        other => log::warn!("iptables {:?} failed: {:?}", args, other),
    }
}

fn apply_android_iptables() {
    iptables(&["-F"]);
    iptables(&["-P", "FORWARD", "ACCEPT"]);
    iptables(&[
        "-t", "nat", "-A", "POSTROUTING", "-s", "10.0.3.0/24", "-j", "MASQUERADE",
    ]);
    for proto in &["tcp", "udp"] {
        iptables(&[
            "-t", "nat", "-A", "OUTPUT", "-d", "127.0.0.1", "-p", proto, "-j", "REDIRECT",
            "--to-ports", "1-65535",
        ]);
    }
}

/// Rootfs-side setup, after pivot_root: hostname, `/etc/hosts`, the
/// resolv.conf indirection through `/run`, and the Android socket groups.
pub fn configure_rootfs(hostname: &str, resolv_conf: &str) -> Result<()> {
    sethostname(hostname)
        .with_context(|| format!("failed to set hostname to {:?}", hostname))?;
    utils::write_file("/etc/hostname", format!("{}\n", hostname))?;

    let hosts = format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{}\n\
         ::1\tlocalhost ip6-localhost ip6-loopback\n\
         ff02::1\tip6-allnodes\n\
         ff02::2\tip6-allrouters\n",
        hostname
    );
    utils::write_file("/etc/hosts", hosts)?;

    // /etc may be read-only in volatile lowerdir terms, but /run is our
    // tmpfs, so the content lives there and /etc only holds a symlink.
    utils::create_dir_all("/run/resolvconf")?;
    utils::write_file("/run/resolvconf/resolv.conf", resolv_conf)?;
    let etc_resolv = Path::new("/etc/resolv.conf");
    if fs::symlink_metadata(etc_resolv).is_ok() {
        fs::remove_file(etc_resolv).context("failed to replace /etc/resolv.conf")?;
    }
    symlink("../run/resolvconf/resolv.conf", etc_resolv)
        .context("failed to symlink /etc/resolv.conf")?;

    if platform::is_android() {
        setup_android_groups();
    }
    Ok(())
}

/// Appends the AID groups to the guest's `/etc/group` and, when the guest
/// ships usermod, puts root into the socket-creating ones. Soft-fail.
fn setup_android_groups() {
    let group_file = Path::new("/etc/group");
    let content = match fs::read_to_string(group_file) {
        Ok(c) => c,
        Err(_) => return,
    };
    if !content.contains("aid_inet") {
        let mut appended = content.clone();
        if !appended.ends_with('\n') {
            appended.push('\n');
        }
        for (name, gid) in AID_GROUPS {
            appended.push_str(&format!("{}:x:{}:root\n", name, gid));
        }
        if let Err(e) = utils::write_file(group_file, appended) {
            log::warn!("could not append AID groups: {:?}", e);
            return;
        }
    }
    let usermod = Command::new("usermod")
        .args(&["-aG", "aid_inet,aid_net_raw", "root"])
        .status();
    if let Err(e) = usermod {
        log::debug!("usermod not available in the guest: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_dns_wins() {
        let content = resolv_conf_content(&["10.0.0.53".to_string()]);
        assert_eq!(content, "nameserver 10.0.0.53\n");
    }

    #[test]
    fn test_fallback_dns_applied_when_empty() {
        let content = resolv_conf_content(&[]);
        assert!(content.contains("nameserver 1.1.1.1"));
        assert!(content.contains("nameserver 8.8.8.8"));
    }

    #[test]
    fn test_single_empty_entry_is_ignored() {
        let content = resolv_conf_content(&["".to_string()]);
        assert!(content.contains("nameserver 1.1.1.1"));
    }

    #[test]
    fn test_whitespace_entries_are_trimmed() {
        let content = resolv_conf_content(&[" 9.9.9.9 ".to_string()]);
        assert_eq!(content, "nameserver 9.9.9.9\n");
    }
}
