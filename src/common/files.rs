//! Utilities for file operations.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Unix mode for executables placed in the initramfs.
pub const EXECUTABLE_MODE: u32 = 0o755;

/// Copy `src` to `dst` and set `dst` to exactly `mode`.
///
/// `fs::copy` carries over the source permissions, which for files coming
/// out of a read-only store are often 0o444.
pub fn copy_with_mode(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", dst.display()))?;
    Ok(())
}

/// Directory a file lives in, with "" (a bare relative name) meaning ".".
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_with_mode_overrides_source_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o444)).unwrap();

        copy_with_mode(&src, &dst, EXECUTABLE_MODE).unwrap();

        let mode = fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read(&dst).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("initramfs.cpio")), Path::new("."));
        assert_eq!(parent_dir(Path::new("out/initramfs.cpio")), Path::new("out"));
        assert_eq!(parent_dir(Path::new("/tmp/x.cpio")), Path::new("/tmp"));
    }
}
