//! Initramfs builder.
//!
//! Produces an uncompressed newc cpio archive containing only:
//! - `/init` (the guest init binary)
//! - optional kernel modules under a module directory, named
//!   `NN-<module>.ko` so the guest init can load them in file-name order
//!
//! # Load order
//!
//! The guest has no `modprobe` and no `modules.dep`. Load order is fixed at
//! build time: module dependencies are read with `modinfo`, the set is
//! ordered so dependencies come first, and the position becomes the file
//! name prefix.

pub mod builder;
pub mod cpio;
pub mod deps;
pub mod kmod;

pub use builder::{create_initramfs_archive, BuildReport, InitramfsBuilder, StagedModule};
pub use deps::{resolve_load_order, DependencyQuery, Modinfo};
pub use kmod::{canonical_name, Compression};

/// Default archive path for `kdf build initramfs`.
pub const DEFAULT_OUTPUT: &str = "./initramfs.cpio";

/// Default module directory inside the archive.
pub const DEFAULT_MODDIR: &str = "/init-modules";

/// Name of the init binary at the archive root.
pub const INIT_NAME: &str = "init";
