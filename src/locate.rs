use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Conventional install locations searched after `PATH`.
const QEMU_SEARCH_PATHS: &[&str] = &[
    "/pkg/main/app-emulation.qemu.core/bin",
    "/usr/bin",
    "/usr/local/bin",
];

/// Rust target-arch names mapped to QEMU system-emulator suffixes.
const ARCH_TO_QEMU: &[(&str, &str)] = &[
    ("x86_64", "x86_64"),
    ("x86", "i386"),
    ("aarch64", "aarch64"),
    ("arm", "arm"),
    ("riscv64", "riscv64"),
    ("powerpc64", "ppc64"),
    ("mips", "mips"),
    ("mips64", "mips64"),
    ("s390x", "s390x"),
];

/// Maps an architecture name onto the QEMU binary suffix, e.g.
/// `x86_64` → `x86_64`, `x86` → `i386`.
pub fn qemu_arch_name(arch: &str) -> Option<&'static str> {
    ARCH_TO_QEMU
        .iter()
        .find(|(name, _)| *name == arch)
        .map(|(_, qemu)| *qemu)
}

/// Architecture names [`locate_qemu`] accepts.
pub fn supported_arches() -> Vec<&'static str> {
    ARCH_TO_QEMU.iter().map(|(name, _)| *name).collect()
}

/// Finds the QEMU system emulator for an architecture.
///
/// Search order: the override (a binary, or a directory containing the
/// binary), `PATH`, then the conventional install directories. An empty
/// architecture means the host architecture.
pub fn locate_qemu(arch: &str, custom_path: Option<&Path>) -> Result<PathBuf> {
    let arch = if arch.is_empty() {
        std::env::consts::ARCH
    } else {
        arch
    };

    let Some(qemu_arch) = qemu_arch_name(arch) else {
        return Err(Error::UnsupportedArch {
            arch: arch.to_string(),
        });
    };
    let binary_name = format!("qemu-system-{qemu_arch}");

    if let Some(custom) = custom_path {
        if custom.is_file() {
            return Ok(custom.to_path_buf());
        }
        let nested = custom.join(&binary_name);
        if nested.is_file() {
            return Ok(nested);
        }
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&binary_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for dir in QEMU_SEARCH_PATHS {
        let candidate = Path::new(dir).join(&binary_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(Error::QemuNotFound)
}
