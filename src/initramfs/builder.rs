//! Initramfs archive assembly.
//!
//! ```text
//! <staging>/
//!   init                      (0755, copied from the init binary)
//!   init-modules/             (only when modules were given)
//!     00-virtio.ko            (decompressed, load order prefix)
//!     01-virtio_ring.ko
//!     ...
//! ```
//!
//! The staging tree lives in a private temporary directory and is packed
//! into a newc cpio archive. The archive is written next to the output path
//! and renamed into place, so a failed build never leaves a truncated file
//! behind.

use anyhow::{Context, Result};
use std::fs;
use std::io::BufWriter;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};

use super::cpio;
use super::deps::{resolve_load_order, DependencyQuery, Modinfo};
use super::kmod::{staged_name, Compression};
use super::{DEFAULT_MODDIR, INIT_NAME};
use crate::common::{copy_with_mode, parent_dir, EXECUTABLE_MODE};
use crate::error::Error;

const ARCHIVE_MODE: u32 = 0o644;

/// A module as placed in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedModule {
    pub source: PathBuf,
    /// File name inside the module directory, e.g. `02-fuse.ko`.
    pub name: String,
}

/// What a build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output: PathBuf,
    /// Modules in load order.
    pub modules: Vec<StagedModule>,
    /// Archive entries, trailer excluded.
    pub entries: usize,
}

/// Builds one initramfs archive.
pub struct InitramfsBuilder {
    init: PathBuf,
    output: PathBuf,
    modules: Vec<PathBuf>,
    moddir: String,
    query: Box<dyn DependencyQuery>,
}

impl InitramfsBuilder {
    pub fn new(init: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            init: init.into(),
            output: output.into(),
            modules: Vec::new(),
            moddir: DEFAULT_MODDIR.to_string(),
            query: Box::new(Modinfo),
        }
    }

    /// Kernel modules to include, in any order.
    pub fn modules<I, P>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.modules.extend(modules.into_iter().map(Into::into));
        self
    }

    /// Module directory inside the archive. A leading `/` is allowed.
    pub fn moddir(mut self, moddir: impl Into<String>) -> Self {
        self.moddir = moddir.into();
        self
    }

    /// Replace `modinfo` as the source of module dependencies.
    pub fn dependency_query(mut self, query: impl DependencyQuery + 'static) -> Self {
        self.query = Box::new(query);
        self
    }

    pub fn build(self) -> Result<BuildReport> {
        if !self.init.is_file() {
            return Err(Error::not_found("Init binary", &self.init).into());
        }
        let moddir = if self.modules.is_empty() {
            PathBuf::new()
        } else {
            module_dir(&self.moddir)?
        };

        let staging: TempDir = tempfile::Builder::new()
            .prefix("kdf-initramfs-")
            .tempdir()
            .context("Failed to create staging directory")?;
        let root = staging.path();

        copy_with_mode(&self.init, &root.join(INIT_NAME), EXECUTABLE_MODE)?;

        let modules = if self.modules.is_empty() {
            Vec::new()
        } else {
            let ordered = resolve_load_order(&self.modules, self.query.as_ref());
            tracing::info!("Module load order after dependency resolution:");
            for (idx, module) in ordered.iter().enumerate() {
                tracing::info!("  {}. {}", idx + 1, file_name(module));
            }

            if let Some(missing) = ordered.iter().find(|m| !m.exists()) {
                return Err(Error::not_found("Kernel module", missing).into());
            }

            stage_modules(root, &moddir, &ordered)?
        };

        let entries = write_archive(root, &self.output)?;
        tracing::info!("Created initramfs: {} ({} entries)", self.output.display(), entries);

        // `staging` is dropped here, removing the tree
        Ok(BuildReport {
            output: self.output,
            modules,
            entries,
        })
    }
}

/// Build an archive with `modinfo` as the dependency source.
pub fn create_initramfs_archive(
    init: &Path,
    output: &Path,
    modules: &[PathBuf],
    moddir: &str,
) -> Result<BuildReport> {
    InitramfsBuilder::new(init, output)
        .modules(modules.iter().cloned())
        .moddir(moddir)
        .build()
}

/// Module directory relative to the archive root.
///
/// A leading `/` is dropped. Anything but plain names (`..`, `.`, an empty
/// path) is rejected so staging cannot leave the staging directory.
fn module_dir(moddir: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(moddir.trim_start_matches('/'));
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    if !plain || relative.as_os_str().is_empty() {
        return Err(Error::InvalidInput(format!(
            "module directory '{}' must be a path of plain names inside the archive",
            moddir
        )));
    }
    Ok(relative.to_path_buf())
}

fn stage_modules(root: &Path, moddir: &Path, ordered: &[PathBuf]) -> Result<Vec<StagedModule>> {
    let modules_dir = root.join(moddir);
    fs::create_dir_all(&modules_dir)
        .with_context(|| format!("Failed to create {}", modules_dir.display()))?;

    let mut staged = Vec::with_capacity(ordered.len());
    for (idx, source) in ordered.iter().enumerate() {
        let original = file_name(source);
        let name = staged_name(idx, &original);
        let dest = modules_dir.join(&name);

        match Compression::detect(&original) {
            Some(compression) => compression.decompress(source, &dest)?,
            None => {
                fs::copy(source, &dest).with_context(|| {
                    format!("Failed to copy {} to {}", source.display(), dest.display())
                })?;
            }
        }
        tracing::info!("Added module: {} -> {}", original, name);

        staged.push(StagedModule {
            source: source.clone(),
            name,
        });
    }
    Ok(staged)
}

/// Serialize `root` into `output`, replacing it only once complete.
fn write_archive(root: &Path, output: &Path) -> Result<usize> {
    let dir = parent_dir(output);
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary archive in {}", dir.display()))?;

    let mut out = BufWriter::new(tmp);
    let entries = cpio::write_tree(root, &mut out)?;
    let tmp = out
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush archive")?;

    // NamedTempFile is created 0600
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(ARCHIVE_MODE))
        .context("Failed to chmod archive")?;
    tmp.as_file().sync_all().context("Failed to sync archive")?;
    tmp.persist(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
