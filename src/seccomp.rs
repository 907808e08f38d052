//! Adaptive seccomp shield. On legacy kernels (major < 5) a small BPF
//! program neutralizes syscalls that a modern guest init can use to
//! deadlock the host or evict the FBE session keyring:
//!
//! * `keyctl`/`add_key`/`request_key` return ENOSYS, so systemd keeps the
//!   existing keyring instead of replacing the one that decrypts the
//!   rootfs on file-based-encryption devices.
//! * For systemd guests only, `unshare`/`clone` with namespace flags
//!   return EPERM: service sandboxing (`PrivateTmp`, `ProtectSystem`)
//!   races `grab_super` on kernels up to 4.19 and can hang the host.
//!   OpenRC and runit guests keep unrestricted unshare for legitimate
//!   nested containers.

use anyhow::{bail, Result};
use libc::{sock_filter, sock_fprog};

use crate::platform::{self, GuestInit};

// Classic BPF opcode pieces (linux/bpf_common.h).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// Offsets into struct seccomp_data. args[0] is read as its low 32-bit word;
// every supported target is little-endian and the namespace mask fits in 32
// bits.
const OFF_NR: u32 = 0;
const OFF_ARCH: u32 = 4;
const OFF_ARG0_LO: u32 = 16;

/// CLONE_NEWNS | CLONE_NEWUTS | CLONE_NEWIPC | CLONE_NEWUSER |
/// CLONE_NEWPID | CLONE_NEWNET | CLONE_NEWCGROUP
const NAMESPACE_MASK: u32 = 0x7E02_0000;

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const AUDIT_ARCH: u32 = 0xC000_003E;
    pub const NR_ADD_KEY: u32 = 248;
    pub const NR_REQUEST_KEY: u32 = 249;
    pub const NR_KEYCTL: u32 = 250;
    pub const NR_CLONE: u32 = 56;
    pub const NR_UNSHARE: u32 = 272;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const AUDIT_ARCH: u32 = 0xC000_00B7;
    pub const NR_ADD_KEY: u32 = 217;
    pub const NR_REQUEST_KEY: u32 = 218;
    pub const NR_KEYCTL: u32 = 219;
    pub const NR_CLONE: u32 = 220;
    pub const NR_UNSHARE: u32 = 97;
}

#[cfg(target_arch = "arm")]
mod arch {
    pub const AUDIT_ARCH: u32 = 0x4000_0028;
    pub const NR_ADD_KEY: u32 = 309;
    pub const NR_REQUEST_KEY: u32 = 310;
    pub const NR_KEYCTL: u32 = 311;
    pub const NR_CLONE: u32 = 120;
    pub const NR_UNSHARE: u32 = 337;
}

#[cfg(target_arch = "x86")]
mod arch {
    pub const AUDIT_ARCH: u32 = 0x4000_0003;
    pub const NR_ADD_KEY: u32 = 286;
    pub const NR_REQUEST_KEY: u32 = 287;
    pub const NR_KEYCTL: u32 = 288;
    pub const NR_CLONE: u32 = 120;
    pub const NR_UNSHARE: u32 = 310;
}

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

fn ret_errno(errno: u32) -> sock_filter {
    stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | (errno & 0xffff))
}

fn ret_allow() -> sock_filter {
    stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW)
}

/// Assembles the shield program. Layout (systemd variant):
///
/// ```text
///  0 ld arch            7 jeq unshare ? 8 : 12
///  1 jeq AUDIT ? 3 : 2  8 ld arg0
///  2 ret ALLOW          9 jset NSMASK ? 11 : 10
///  3 ld nr             10 ret ALLOW
///  4 jeq keyctl -> 18  11 ret EPERM
///  5 jeq add_key -> 18 12 jeq clone ? 13 : 17
///  6 jeq request -> 18 13 ld arg0
///                      14 jset NSMASK ? 16 : 15
///                      15 ret ALLOW
///                      16 ret EPERM
///                      17 ret ALLOW
///                      18 ret ENOSYS
/// ```
fn build_program(guest: GuestInit) -> Vec<sock_filter> {
    let ld_nr = stmt(BPF_LD | BPF_W | BPF_ABS, OFF_NR);
    let ld_arg0 = stmt(BPF_LD | BPF_W | BPF_ABS, OFF_ARG0_LO);
    let ld_arch = stmt(BPF_LD | BPF_W | BPF_ABS, OFF_ARCH);

    if guest == GuestInit::Systemd {
        vec![
            /*  0 */ ld_arch,
            /*  1 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::AUDIT_ARCH, 1, 0),
            /*  2 */ ret_allow(),
            /*  3 */ ld_nr,
            /*  4 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_KEYCTL, 13, 0),
            /*  5 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_ADD_KEY, 12, 0),
            /*  6 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_REQUEST_KEY, 11, 0),
            /*  7 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_UNSHARE, 0, 4),
            /*  8 */ ld_arg0,
            /*  9 */ jump(BPF_JMP | BPF_JSET | BPF_K, NAMESPACE_MASK, 1, 0),
            /* 10 */ ret_allow(),
            /* 11 */ ret_errno(libc::EPERM as u32),
            /* 12 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_CLONE, 0, 4),
            /* 13 */ ld_arg0,
            /* 14 */ jump(BPF_JMP | BPF_JSET | BPF_K, NAMESPACE_MASK, 1, 0),
            /* 15 */ ret_allow(),
            /* 16 */ ret_errno(libc::EPERM as u32),
            /* 17 */ ret_allow(),
            /* 18 */ ret_errno(libc::ENOSYS as u32),
        ]
    } else {
        vec![
            /* 0 */ ld_arch,
            /* 1 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::AUDIT_ARCH, 1, 0),
            /* 2 */ ret_allow(),
            /* 3 */ ld_nr,
            /* 4 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_KEYCTL, 3, 0),
            /* 5 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_ADD_KEY, 2, 0),
            /* 6 */ jump(BPF_JMP | BPF_JEQ | BPF_K, arch::NR_REQUEST_KEY, 1, 0),
            /* 7 */ ret_allow(),
            /* 8 */ ret_errno(libc::ENOSYS as u32),
        ]
    }
}

/// Installs the shield when the host kernel needs it. On kernels >= 5 this
/// is a no-op so nested containerization tools inside the guest keep
/// working. The process runs with CAP_SYS_ADMIN, so the filter loads
/// without PR_SET_NO_NEW_PRIVS; setting that flag here would leak into the
/// guest init.
pub fn apply_shield(guest: GuestInit) -> Result<()> {
    if platform::kernel_version().major >= platform::SHIELD_KERNEL_MAJOR {
        log::debug!("kernel is modern, skipping the seccomp shield");
        return Ok(());
    }

    let program = build_program(guest);
    let prog = sock_fprog {
        len: program.len() as u16,
        filter: program.as_ptr() as *mut sock_filter,
    };

    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &prog as *const sock_fprog,
            0,
            0,
        )
    };
    if rc != 0 {
        bail!(
            "failed to install seccomp filter: {}",
            std::io::Error::last_os_error()
        );
    }
    log::debug!(
        "seccomp shield installed ({} instructions, guest {})",
        program.len(),
        guest
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulate(program: &[sock_filter], nr: u32, arch_token: u32, arg0: u32) -> u32 {
        let mut pc = 0usize;
        let mut acc = 0u32;
        loop {
            let insn = &program[pc];
            match insn.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    acc = match insn.k {
                        OFF_NR => nr,
                        OFF_ARCH => arch_token,
                        OFF_ARG0_LO => arg0,
                        other => panic!("unexpected load offset {}", other),
                    };
                    pc += 1;
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += 1 + if acc == insn.k {
                        insn.jt as usize
                    } else {
                        insn.jf as usize
                    };
                }
                c if c == BPF_JMP | BPF_JSET | BPF_K => {
                    pc += 1 + if acc & insn.k != 0 {
                        insn.jt as usize
                    } else {
                        insn.jf as usize
                    };
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                other => panic!("unexpected opcode {:#x}", other),
            }
        }
    }

    const ALLOW: u32 = SECCOMP_RET_ALLOW;

    fn errno(e: i32) -> u32 {
        SECCOMP_RET_ERRNO | e as u32
    }

    #[test]
    fn test_foreign_arch_is_allowed() {
        let p = build_program(GuestInit::Systemd);
        assert_eq!(simulate(&p, arch::NR_KEYCTL, 0xdead_beef, 0), ALLOW);
    }

    #[test]
    fn test_keyring_calls_return_enosys() {
        for guest in &[GuestInit::Systemd, GuestInit::OpenRc] {
            let p = build_program(*guest);
            for nr in &[arch::NR_KEYCTL, arch::NR_ADD_KEY, arch::NR_REQUEST_KEY] {
                assert_eq!(
                    simulate(&p, *nr, arch::AUDIT_ARCH, 0),
                    errno(libc::ENOSYS),
                    "nr {} should be neutralized",
                    nr
                );
            }
        }
    }

    #[test]
    fn test_systemd_namespace_unshare_is_denied() {
        let p = build_program(GuestInit::Systemd);
        assert_eq!(
            simulate(&p, arch::NR_UNSHARE, arch::AUDIT_ARCH, 0x0002_0000),
            errno(libc::EPERM)
        );
        assert_eq!(
            simulate(&p, arch::NR_CLONE, arch::AUDIT_ARCH, NAMESPACE_MASK),
            errno(libc::EPERM)
        );
    }

    #[test]
    fn test_systemd_plain_clone_is_allowed() {
        let p = build_program(GuestInit::Systemd);
        // fork-style clone: SIGCHLD only, no namespace bits
        assert_eq!(simulate(&p, arch::NR_CLONE, arch::AUDIT_ARCH, 17), ALLOW);
        assert_eq!(simulate(&p, arch::NR_UNSHARE, arch::AUDIT_ARCH, 0), ALLOW);
    }

    #[test]
    fn test_non_systemd_guest_keeps_namespaces() {
        for guest in &[GuestInit::OpenRc, GuestInit::Runit, GuestInit::Unknown] {
            let p = build_program(*guest);
            assert_eq!(
                simulate(&p, arch::NR_UNSHARE, arch::AUDIT_ARCH, NAMESPACE_MASK),
                ALLOW
            );
        }
    }

    #[test]
    fn test_ordinary_syscalls_are_allowed() {
        let p = build_program(GuestInit::Systemd);
        // syscall 63 is nowhere near the filtered set on any supported arch
        assert_eq!(simulate(&p, 63, arch::AUDIT_ARCH, 0), ALLOW);
    }
}
