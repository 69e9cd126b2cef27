//! Shared utilities across kdf modules.

pub mod files;

pub use files::{copy_with_mode, parent_dir, EXECUTABLE_MODE};
