//! Configuration loaded from the process environment.
//!
//! These tests mutate environment variables and run serially.

use kdf::config::Config;
use serial_test::serial;
use std::env;
use std::path::PathBuf;

const VARS: [&str; 4] = ["KDF_RESOURCE_DIR", "KDF_LOG_FILE", "KDF_QEMU", "KDF_VIRTIOFSD"];

fn clear_vars() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_load_reads_environment() {
    clear_vars();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("initramfs.cpio"), b"").unwrap();

    env::set_var("KDF_RESOURCE_DIR", dir.path());
    env::set_var("KDF_QEMU", "qemu-system-aarch64");
    let config = Config::load();
    clear_vars();

    assert_eq!(config.resource_dir.as_deref(), Some(dir.path()));
    assert_eq!(config.qemu, "qemu-system-aarch64");
    assert_eq!(config.prebuilt_initramfs(), Some(dir.path().join("initramfs.cpio")));
    assert!(config.prebuilt_init().is_none());
}

#[test]
#[serial]
fn test_load_defaults() {
    clear_vars();
    let config = Config::load();

    assert!(config.resource_dir.is_none());
    assert_eq!(config.log_file, PathBuf::from("kdf.log"));
    assert_eq!(config.virtiofsd, "virtiofsd");
}
