//! Kernel module file names and compression.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::process::Cmd;

/// Module file suffix.
const KO_SUFFIX: &str = ".ko";

/// Compression schemes recognized by file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Gzip,
}

impl Compression {
    /// Detect compression from a file name suffix.
    pub fn detect(file_name: &str) -> Option<Self> {
        if file_name.ends_with(".xz") {
            Some(Self::Xz)
        } else if file_name.ends_with(".gz") {
            Some(Self::Gzip)
        } else {
            None
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
        }
    }

    /// Decompress `src` into `dest`.
    ///
    /// xz goes through the `xz` tool; gzip is handled in-process.
    pub fn decompress(self, src: &Path, dest: &Path) -> Result<()> {
        match self {
            Self::Xz => Cmd::new("xz")
                .arg("-dc")
                .arg_path(src)
                .error_msg(format!("Failed to decompress {}", src.display()))
                .run_to_file(dest),
            Self::Gzip => {
                let input = File::open(src)
                    .with_context(|| format!("Failed to open {}", src.display()))?;
                let mut output = File::create(dest)
                    .with_context(|| format!("Failed to create {}", dest.display()))?;
                io::copy(&mut GzDecoder::new(input), &mut output)
                    .with_context(|| format!("Failed to decompress {}", src.display()))?;
                Ok(())
            }
        }
    }
}

/// Strip one compression suffix, if any.
pub fn strip_compression(file_name: &str) -> &str {
    match Compression::detect(file_name) {
        Some(c) => &file_name[..file_name.len() - c.suffix().len()],
        None => file_name,
    }
}

/// Canonical module name: `.xz`, `.gz` and `.ko` stripped, in that order,
/// each only if present.
///
/// `virtio_pci.ko.xz` -> `virtio_pci`
///
/// One pass only, so it is idempotent for real module file names but not for
/// stacked suffixes: `a.ko.ko` -> `a.ko`, `a.ko.xz.gz` -> `a.ko.xz`.
pub fn canonical_name(file_name: &str) -> &str {
    let name = file_name.strip_suffix(".xz").unwrap_or(file_name);
    let name = name.strip_suffix(".gz").unwrap_or(name);
    name.strip_suffix(KO_SUFFIX).unwrap_or(name)
}

/// Name of a module inside the archive: two-digit load-order index, a dash,
/// and the file name without its compression suffix.
pub fn staged_name(index: usize, file_name: &str) -> String {
    format!("{:02}-{}", index, strip_compression(file_name))
}
