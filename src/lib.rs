//! kdf library exports.
//!
//! The binary is a thin CLI over these modules; integration tests drive
//! them directly.

pub mod common;
pub mod config;
pub mod error;
pub mod initramfs;
pub mod nixpkgs;
pub mod process;
pub mod qemu;
pub mod task;
pub mod virtiofs;

pub use error::Error;
