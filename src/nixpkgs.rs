//! Kernel resolution from nixpkgs.
//!
//! `kdf run --release [VERSION]` boots a stock nixpkgs kernel instead of a
//! local build. The kernel and its modules come from `nix-build`; unless the
//! user supplies an initramfs, one is built with the prebuilt init and the
//! modules virtiofs needs.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Error;
use crate::initramfs::{create_initramfs_archive, DEFAULT_MODDIR};
use crate::process::Cmd;

/// Modules needed to mount virtiofs, relative to `lib/modules/<ver>/kernel`.
/// Listed in any order; the initramfs builder sorts them.
pub const VIRTIOFS_MODULES: &[&str] = &[
    "drivers/virtio/virtio.ko",
    "drivers/virtio/virtio_ring.ko",
    "drivers/virtio/virtio_pci_modern_dev.ko",
    "drivers/virtio/virtio_pci_legacy_dev.ko",
    "drivers/virtio/virtio_pci.ko",
    "fs/fuse/fuse.ko",
    "fs/fuse/virtiofs.ko",
];

/// Kernel image names, in the order they are tried.
const KERNEL_IMAGES: &[&str] = &["bzImage", "Image", "vmlinuz", "zImage"];

/// Suffixes tried for each module, in order.
const MODULE_SUFFIXES: &[&str] = &[".xz", ".gz", ""];

/// nixpkgs attribute set for a kernel version.
///
/// `None` or `""` selects the default `linuxPackages`; `"6.6"` or
/// `"6.12.3"` select `linuxPackages_6_6` / `linuxPackages_6_12`.
/// Major and minor must be numeric; `6.x` or `latest` are rejected here
/// rather than left for `nix-build` to fail on.
pub fn kernel_attribute(version: Option<&str>) -> Result<String, Error> {
    let version = match version.map(str::trim) {
        None | Some("") => return Ok("linuxPackages".to_string()),
        Some(v) => v,
    };

    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if is_number(major) && is_number(minor) => {
            Ok(format!("linuxPackages_{}_{}", major, minor))
        }
        _ => Err(Error::InvalidInput(format!(
            "Invalid kernel version format: {} (need at least major.minor, e.g. '6.6')",
            version
        ))),
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Build `expr` (optionally one of its outputs) and return the store path.
pub fn nix_build(expr: &str, output: Option<&str>) -> Result<PathBuf> {
    let full = match output {
        Some(out) => format!("({}).{}", expr, out),
        None => expr.to_string(),
    };

    let result = Cmd::new("nix-build")
        .args(["--no-out-link", "-E", &full])
        .error_msg(format!("nix-build failed for {}", full))
        .run()?;

    // Progress goes to stderr; the store path is the last stdout line
    let path = result
        .stdout_trimmed()
        .lines()
        .last()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .with_context(|| format!("nix-build printed no store path for {}", full))?;
    Ok(PathBuf::from(path))
}

/// Kernel and modules store paths for `version`.
pub fn kernel_derivations(version: Option<&str>) -> Result<(PathBuf, PathBuf)> {
    let attr = kernel_attribute(version)?;
    tracing::info!("Using {} from nixpkgs", attr);

    let expr = format!("with import <nixpkgs> {{}}; {}.kernel", attr);
    let kernel = nix_build(&expr, None)?;
    let modules = nix_build(&expr, Some("modules"))?;

    tracing::info!("Kernel derivation: {}", kernel.display());
    tracing::info!("Modules derivation: {}", modules.display());
    Ok((kernel, modules))
}

/// Find the bootable image inside a kernel derivation.
pub fn kernel_image(kernel_drv: &Path) -> Result<PathBuf> {
    let image = KERNEL_IMAGES
        .iter()
        .map(|name| kernel_drv.join(name))
        .find(|p| p.exists())
        .ok_or_else(|| Error::not_found("Kernel image", kernel_drv))?;

    tracing::info!("Found kernel image: {}", image.display());
    Ok(image)
}

/// Locate `patterns` under `<modules_drv>/lib/modules/<version>/kernel/`,
/// accepting `.xz`, `.gz` or uncompressed variants.
pub fn find_modules(modules_drv: &Path, patterns: &[&str]) -> Result<Vec<PathBuf>> {
    let modules_dir = modules_drv.join("lib/modules");
    let version_dir = fs::read_dir(&modules_dir)
        .with_context(|| format!("Failed to read {}", modules_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
        .ok_or_else(|| Error::not_found("Kernel version directory", &modules_dir))?;
    let kernel_base = version_dir.join("kernel");

    patterns
        .iter()
        .map(|pattern| {
            let base = kernel_base.join(pattern);
            let found = MODULE_SUFFIXES
                .iter()
                .map(|suffix| PathBuf::from(format!("{}{}", base.display(), suffix)))
                .find(|p| p.exists())
                .ok_or_else(|| Error::not_found("Kernel module", &base))?;
            tracing::info!("Found module: {}", found.display());
            Ok(found)
        })
        .collect()
}

/// Resolve a nixpkgs kernel, plus either `custom_initramfs` or a fresh
/// initramfs with the virtiofs modules.
///
/// A built initramfs is left in the system temp directory for QEMU to read.
pub fn resolve_kernel_and_initramfs(
    version: Option<&str>,
    custom_initramfs: Option<&Path>,
    config: &Config,
) -> Result<(PathBuf, PathBuf)> {
    let (kernel_drv, modules_drv) = kernel_derivations(version)?;
    let kernel = kernel_image(&kernel_drv)?;

    if let Some(initramfs) = custom_initramfs {
        return Ok((kernel, initramfs.to_path_buf()));
    }

    let init = config.prebuilt_init().ok_or_else(|| {
        anyhow::anyhow!(
            "No prebuilt init binary available. \
             Build kdf from the Nix package (KDF_RESOURCE_DIR) or pass --initramfs."
        )
    })?;
    let modules = find_modules(&modules_drv, VIRTIOFS_MODULES)?;

    let (_, initramfs) = tempfile::Builder::new()
        .prefix("kdf-initramfs-")
        .suffix(".cpio")
        .tempfile()
        .context("Failed to create initramfs file")?
        .keep()
        .context("Failed to keep initramfs file")?;

    tracing::info!("Building initramfs with {} virtiofs modules", modules.len());
    create_initramfs_archive(&init, &initramfs, &modules, DEFAULT_MODDIR)?;
    Ok((kernel, initramfs))
}
