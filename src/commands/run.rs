//! Run command - boots a kernel in QEMU.

use anyhow::{Context, Result};
use std::path::PathBuf;

use kdf::config::Config;
use kdf::nixpkgs;
use kdf::qemu::LaunchConfig;
use kdf::task::BackgroundTaskManager;
use kdf::virtiofs;
use kdf::Error;

/// Where the kernel comes from.
pub enum KernelSource {
    /// A local kernel image
    Local(PathBuf),
    /// A nixpkgs kernel; empty means the default version
    Release(String),
}

/// Arguments for `kdf run`.
pub struct RunArgs {
    pub source: KernelSource,
    pub initramfs: Option<PathBuf>,
    pub virtiofs: Vec<String>,
    pub cmdline: Option<String>,
    pub memory: String,
    pub virtiofs_dax: bool,
    pub moddir: String,
}

/// Execute the run command.
pub fn cmd_run(args: RunArgs, config: &Config) -> Result<()> {
    // First, so the teardown hook masks signals before anything spawns
    let tasks = BackgroundTaskManager::new();

    let (kernel, initramfs) = resolve_boot_files(&args, config)?;

    virtiofs::register_shares(&args.virtiofs, &tasks, &config.virtiofsd)?;
    tasks.start_all()?;

    let dax = args.virtiofs_dax && !args.virtiofs.is_empty();
    let mut launch = LaunchConfig::new(kernel, initramfs, &args.memory)
        .with_qemu(&config.qemu)
        .with_dax(dax);
    tasks.contribute_all(&mut launch)?;

    if !args.moddir.is_empty() {
        launch.init.moddir = Some(args.moddir.clone());
    }
    if let Some(cmdline) = &args.cmdline {
        launch.add_cmdline(cmdline);
    }

    launch.run(&tasks)
    // `tasks` drops here and stops every virtiofsd
}

fn resolve_boot_files(args: &RunArgs, config: &Config) -> Result<(PathBuf, PathBuf)> {
    match &args.source {
        KernelSource::Release(version) => {
            let version = Some(version.as_str()).filter(|v| !v.is_empty());
            let (kernel, initramfs) =
                nixpkgs::resolve_kernel_and_initramfs(version, args.initramfs.as_deref(), config)
                    .context("Failed to resolve kernel from nixpkgs")?;
            tracing::info!("Resolved kernel: {}", kernel.display());
            tracing::info!("Resolved initramfs: {}", initramfs.display());
            Ok((kernel, initramfs))
        }
        KernelSource::Local(kernel) => {
            if !kernel.exists() {
                return Err(Error::not_found("Kernel", kernel).into());
            }

            let initramfs = match &args.initramfs {
                Some(initramfs) => initramfs.clone(),
                None => {
                    let prebuilt = config.prebuilt_initramfs().context(
                        "No --initramfs given and no prebuilt initramfs available. \
                         Pass --initramfs or set KDF_RESOURCE_DIR.",
                    )?;
                    tracing::info!("Using prebuilt initramfs: {}", prebuilt.display());
                    prebuilt
                }
            };
            if !initramfs.exists() {
                return Err(Error::not_found("Initramfs", initramfs).into());
            }

            Ok((kernel.clone(), initramfs))
        }
    }
}
