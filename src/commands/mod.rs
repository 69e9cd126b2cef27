//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build an initramfs archive
//! - `run` - Boot a kernel in QEMU
//! - `show` - Display information

pub mod build;
pub mod run;
pub mod show;

pub use build::cmd_build_initramfs;
pub use run::cmd_run;
pub use show::cmd_show;
