//! `check`: itemized host capability report against the kernel
//! requirements. Works on unsupported hosts; that is its point.

use std::fs;
use std::path::Path;
use std::process::exit;

use anyhow::Result;

use crate::platform;

struct Item {
    label: &'static str,
    ok: bool,
    required: bool,
    hint: &'static str,
}

pub fn exec() -> Result<()> {
    let kernel = platform::kernel_version();
    let cgroups = fs::read_to_string("/proc/cgroups").unwrap_or_default();
    let filesystems = fs::read_to_string("/proc/filesystems").unwrap_or_default();
    let has_controller = |name: &str| cgroups.lines().any(|l| l.starts_with(name));
    let has_ns = |name: &str| Path::new(&format!("/proc/self/ns/{}", name)).exists();

    let cgroup_v1_ok =
        has_controller("devices") && has_controller("pids") && has_controller("memory");
    let cgroup2_ok = filesystems.contains("cgroup2");

    let items = vec![
        Item {
            label: "kernel >= 3.18",
            ok: kernel >= platform::MIN_KERNEL,
            required: true,
            hint: "droidspaces cannot run on this kernel",
        },
        Item {
            label: "PID namespaces",
            ok: has_ns("pid"),
            required: true,
            hint: "CONFIG_PID_NS",
        },
        Item {
            label: "mount namespaces",
            ok: has_ns("mnt"),
            required: true,
            hint: "CONFIG_NAMESPACES",
        },
        Item {
            label: "UTS namespaces",
            ok: has_ns("uts"),
            required: true,
            hint: "CONFIG_UTS_NS",
        },
        Item {
            label: "IPC namespaces",
            ok: has_ns("ipc"),
            required: true,
            hint: "CONFIG_IPC_NS",
        },
        Item {
            label: "seccomp BPF filters",
            ok: fs::read_to_string("/proc/self/status")
                .map(|s| s.lines().any(|l| l.starts_with("Seccomp:")))
                .unwrap_or(false),
            required: true,
            hint: "CONFIG_SECCOMP_FILTER",
        },
        Item {
            label: "cgroups (v1 devices+pids+memory, or cgroup2)",
            ok: cgroup_v1_ok || cgroup2_ok,
            required: true,
            hint: "guest systemd cannot manage services without these",
        },
        Item {
            label: "devtmpfs",
            ok: filesystems.contains("devtmpfs"),
            required: true,
            hint: "CONFIG_DEVTMPFS, needed for --hw-access",
        },
        Item {
            label: "cgroup namespaces",
            ok: platform::cgroup_ns_supported(),
            required: false,
            hint: "Linux 4.6+; without it the guest sees the host hierarchy",
        },
        Item {
            label: "OverlayFS",
            ok: platform::overlayfs_supported(),
            required: false,
            hint: "needed for --volatile",
        },
    ];

    let mut missing_required = false;
    for item in &items {
        let verdict = if item.ok {
            "ok"
        } else if item.required {
            missing_required = true;
            "MISSING"
        } else {
            "missing (optional)"
        };
        if item.ok {
            println!("[{}] {}", verdict, item.label);
        } else {
            println!("[{}] {} — {}", verdict, item.label, item.hint);
        }
    }

    if platform::is_android() {
        println!(
            "[note] Android host: the kernel must be built with \
             CONFIG_ANDROID_PARANOID_NETWORK=n or guest networking will fail"
        );
    }

    if missing_required {
        exit(1);
    }
    Ok(())
}
