//! Build command - builds an initramfs archive.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use kdf::config::Config;
use kdf::initramfs::create_initramfs_archive;
use kdf::Error;

/// Arguments for `kdf build initramfs`.
pub struct InitramfsArgs {
    pub init: Option<PathBuf>,
    pub output: PathBuf,
    pub modules: Vec<PathBuf>,
    pub moddir: String,
}

/// Execute `kdf build initramfs`.
pub fn cmd_build_initramfs(args: InitramfsArgs, config: &Config) -> Result<()> {
    // Nothing to customize: the packaged archive is exactly what we'd build
    if args.modules.is_empty() && args.init.is_none() {
        if let Some(prebuilt) = config.prebuilt_initramfs() {
            tracing::info!("Copying prebuilt initramfs to: {}", args.output.display());
            fs::copy(&prebuilt, &args.output).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    prebuilt.display(),
                    args.output.display()
                )
            })?;
            return Ok(());
        }
    }

    let init = match args.init {
        Some(init) => init,
        None => {
            let prebuilt = config.prebuilt_init().ok_or_else(|| {
                anyhow::Error::new(Error::not_found(
                    "Init binary",
                    config.resource_dir.clone().unwrap_or_default(),
                ))
                .context("No init binary given and no prebuilt init available")
            })?;
            tracing::info!("Using prebuilt init binary: {}", prebuilt.display());
            prebuilt
        }
    };

    create_initramfs_archive(&init, &args.output, &args.modules, &args.moddir)?;
    Ok(())
}
