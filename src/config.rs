//! Configuration management for kdf.
//!
//! Reads configuration from a `.env` file and environment variables.
//! Environment variables take precedence over the `.env` file.

use std::path::{Path, PathBuf};

/// Default log file, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "kdf.log";

/// Default QEMU binary.
pub const DEFAULT_QEMU: &str = "qemu-system-x86_64";

/// Default virtiofsd binary.
pub const DEFAULT_VIRTIOFSD: &str = "virtiofsd";

/// Name of the prebuilt init binary inside the resource directory.
const PREBUILT_INIT: &str = "init";

/// Name of the prebuilt initramfs inside the resource directory.
const PREBUILT_INITRAMFS: &str = "initramfs.cpio";

/// kdf configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding prebuilt `init` and `initramfs.cpio` (KDF_RESOURCE_DIR).
    /// Set when running from the packaged build.
    pub resource_dir: Option<PathBuf>,
    /// Log file path (KDF_LOG_FILE)
    pub log_file: PathBuf,
    /// QEMU binary (KDF_QEMU)
    pub qemu: String,
    /// virtiofsd binary (KDF_VIRTIOFSD)
    pub virtiofsd: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resource_dir: None,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            qemu: DEFAULT_QEMU.to_string(),
            virtiofsd: DEFAULT_VIRTIOFSD.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `.env` in the current directory and the
    /// process environment.
    pub fn load() -> Self {
        // A missing .env is normal
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            resource_dir: non_empty("KDF_RESOURCE_DIR").map(PathBuf::from),
            log_file: non_empty("KDF_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            qemu: non_empty("KDF_QEMU").unwrap_or(defaults.qemu),
            virtiofsd: non_empty("KDF_VIRTIOFSD").unwrap_or(defaults.virtiofsd),
        }
    }

    /// Prebuilt init binary, if the resource directory has one.
    pub fn prebuilt_init(&self) -> Option<PathBuf> {
        self.resource(PREBUILT_INIT)
    }

    /// Prebuilt initramfs archive, if the resource directory has one.
    pub fn prebuilt_initramfs(&self) -> Option<PathBuf> {
        self.resource(PREBUILT_INITRAMFS)
    }

    fn resource(&self, name: &str) -> Option<PathBuf> {
        let path = self.resource_dir.as_deref().map(|dir| dir.join(name))?;
        path.exists().then_some(path)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        match &self.resource_dir {
            Some(dir) => println!("  KDF_RESOURCE_DIR: {}", dir.display()),
            None => println!("  KDF_RESOURCE_DIR: (unset)"),
        }
        println!("  KDF_LOG_FILE: {}", self.log_file.display());
        println!("  KDF_QEMU: {}", self.qemu);
        println!("  KDF_VIRTIOFSD: {}", self.virtiofsd);
        print_resource("Prebuilt init", self.prebuilt_init().as_deref());
        print_resource("Prebuilt initramfs", self.prebuilt_initramfs().as_deref());
    }
}

fn print_resource(label: &str, path: Option<&Path>) {
    match path {
        Some(p) => println!("  {}: FOUND ({})", label, p.display()),
        None => println!("  {}: NOT FOUND", label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert!(config.resource_dir.is_none());
        assert_eq!(config.log_file, PathBuf::from("kdf.log"));
        assert_eq!(config.qemu, "qemu-system-x86_64");
        assert_eq!(config.virtiofsd, "virtiofsd");
        assert!(config.prebuilt_init().is_none());
        assert!(config.prebuilt_initramfs().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("KDF_RESOURCE_DIR", "/nix/store/res"),
            ("KDF_LOG_FILE", "/tmp/k.log"),
            ("KDF_QEMU", "qemu-system-aarch64"),
            ("KDF_VIRTIOFSD", "/usr/libexec/virtiofsd"),
        ]));
        assert_eq!(config.resource_dir, Some(PathBuf::from("/nix/store/res")));
        assert_eq!(config.log_file, PathBuf::from("/tmp/k.log"));
        assert_eq!(config.qemu, "qemu-system-aarch64");
        assert_eq!(config.virtiofsd, "/usr/libexec/virtiofsd");
    }

    #[test]
    fn test_empty_values_fall_back() {
        let config = Config::from_lookup(lookup(&[("KDF_RESOURCE_DIR", ""), ("KDF_QEMU", " ")]));
        assert!(config.resource_dir.is_none());
        assert_eq!(config.qemu, DEFAULT_QEMU);
    }

    #[test]
    fn test_prebuilt_resources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("init"), b"init").unwrap();

        let config = Config::from_lookup(lookup(&[(
            "KDF_RESOURCE_DIR",
            dir.path().to_str().unwrap(),
        )]));
        assert_eq!(config.prebuilt_init(), Some(dir.path().join("init")));
        // Only init was provided
        assert!(config.prebuilt_initramfs().is_none());
    }
}
