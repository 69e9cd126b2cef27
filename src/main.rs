//! kdf - kernel development flake.
//!
//! Builds minimal initramfs archives and boots kernels in QEMU with host
//! directories shared over virtiofs.

mod commands;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use kdf::common::parent_dir;
use kdf::config::Config;
use kdf::initramfs::{DEFAULT_MODDIR, DEFAULT_OUTPUT};
use kdf::qemu::DEFAULT_MEMORY;

#[derive(Parser)]
#[command(name = "kdf")]
#[command(about = "Kernel development flake: initramfs builder and QEMU session runner")]
#[command(
    after_help = "QUICK START:\n  kdf build initramfs ./init -m virtio.ko\n  kdf run --kernel bzImage --initramfs initramfs.cpio\n  kdf run --release 6.6 -v src:$PWD:/src"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build artifacts
    Build {
        #[command(subcommand)]
        target: BuildTarget,
    },

    /// Boot a kernel in QEMU
    #[command(group(ArgGroup::new("source").required(true).args(["kernel", "release"])))]
    Run {
        /// Kernel image to boot
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Boot a nixpkgs kernel (default version, or e.g. 6.6)
        #[arg(short, long, value_name = "VERSION", num_args = 0..=1, default_missing_value = "")]
        release: Option<String>,

        /// Initramfs archive (default: the prebuilt initramfs, if installed)
        #[arg(long)]
        initramfs: Option<PathBuf>,

        /// Share a host directory: tag:host_path:guest_path[:overlay]
        #[arg(short, long = "virtiofs")]
        virtiofs: Vec<String>,

        /// Extra kernel command line
        #[arg(long)]
        cmdline: Option<String>,

        /// Guest memory
        #[arg(short, long, default_value = DEFAULT_MEMORY)]
        memory: String,

        /// Enable the DAX window on virtiofs devices
        #[arg(long)]
        virtiofs_dax: bool,

        /// Guest directory holding modules for init to load
        #[arg(long, default_value = DEFAULT_MODDIR)]
        moddir: String,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum BuildTarget {
    /// Build an initramfs with an init binary and kernel modules
    Initramfs {
        /// Init binary (default: the prebuilt init, if installed)
        init: Option<PathBuf>,

        /// Output archive
        #[arg(short, long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,

        /// Kernel module to include (repeatable, .ko/.ko.xz/.ko.gz)
        #[arg(short = 'm', long = "module")]
        modules: Vec<PathBuf>,

        /// Directory inside the archive for modules
        #[arg(long, default_value = DEFAULT_MODDIR)]
        moddir: String,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load();

    init_tracing(&config);

    match run(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: &Config) -> Result<()> {
    match cli.command {
        Commands::Build { target } => match target {
            BuildTarget::Initramfs {
                init,
                output,
                modules,
                moddir,
            } => commands::cmd_build_initramfs(
                commands::build::InitramfsArgs {
                    init,
                    output,
                    modules,
                    moddir,
                },
                config,
            ),
        },

        Commands::Run {
            kernel,
            release,
            initramfs,
            virtiofs,
            cmdline,
            memory,
            virtiofs_dax,
            moddir,
        } => {
            // clap guarantees exactly one of the two
            let source = match kernel {
                Some(kernel) => commands::run::KernelSource::Local(kernel),
                None => commands::run::KernelSource::Release(release.unwrap_or_default()),
            };
            commands::cmd_run(
                commands::run::RunArgs {
                    source,
                    initramfs,
                    virtiofs,
                    cmdline,
                    memory,
                    virtiofs_dax,
                    moddir,
                },
                config,
            )
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
            };
            commands::cmd_show(show_target, config)
        }
    }
}

/// Log to stderr and to the configured log file.
///
/// The file writer is blocking: a background writer thread would exist
/// before the teardown hook masks termination signals.
fn init_tracing(config: &Config) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file_layer, file_error) = match log_file_writer(&config.log_file) {
        Ok(writer) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!("File logging disabled: {:#}", e);
    }
}

fn log_file_writer(path: &Path) -> Result<RollingFileAppender> {
    // rolling::never panics if it cannot open the file, so check first
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let name = path.file_name().context("Log file path has no file name")?;
    Ok(tracing_appender::rolling::never(parent_dir(path), name))
}
