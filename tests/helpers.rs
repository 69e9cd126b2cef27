//! Shared test utilities for kdf tests.

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Test environment with a temporary directory for inputs and outputs.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Where mock modules and the init binary are created
    pub inputs: PathBuf,
    /// Where archives are written
    pub out_dir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment with temporary directories.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let inputs = temp_dir.path().join("inputs");
        let out_dir = temp_dir.path().join("out");

        fs::create_dir_all(&inputs).expect("Failed to create inputs dir");
        fs::create_dir_all(&out_dir).expect("Failed to create out dir");

        Self {
            _temp_dir: temp_dir,
            inputs,
            out_dir,
        }
    }

    /// Path for an output archive.
    pub fn output(&self, name: &str) -> PathBuf {
        self.out_dir.join(name)
    }

    /// Create a mock init binary (mode 0644, so the builder must fix it).
    pub fn create_init(&self) -> PathBuf {
        let path = self.inputs.join("init");
        fs::write(&path, b"#!/bin/sh\necho init\n").expect("Failed to create init");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
            .expect("Failed to set init mode");
        path
    }

    /// Create an uncompressed module whose content is its own name.
    pub fn create_module(&self, file_name: &str) -> PathBuf {
        let path = self.inputs.join(file_name);
        fs::write(&path, module_content(file_name)).expect("Failed to create module");
        path
    }

    /// Create `<name>.gz` holding `module_content(name)`.
    pub fn create_gz_module(&self, name: &str) -> PathBuf {
        let path = self.inputs.join(format!("{}.gz", name));
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&module_content(name)).unwrap();
        fs::write(&path, enc.finish().unwrap()).expect("Failed to create gz module");
        path
    }

    /// Create `<name>.xz` with the host `xz`. None if `xz` is not installed.
    pub fn create_xz_module(&self, name: &str) -> Option<PathBuf> {
        which::which("xz").ok()?;
        let plain = self.inputs.join(name);
        fs::write(&plain, module_content(name)).expect("Failed to create module");
        let status = Command::new("xz")
            .args(["-z", "-f"])
            .arg(&plain)
            .status()
            .expect("Failed to run xz");
        assert!(status.success(), "xz failed");
        Some(self.inputs.join(format!("{}.xz", name)))
    }
}

/// Content written for a mock module.
pub fn module_content(name: &str) -> Vec<u8> {
    format!("\x7fELF mock module {}\n", name).into_bytes()
}

/// Dependency query backed by a map of file name -> dependency names.
pub fn fake_query(pairs: &[(&str, &[&str])]) -> impl Fn(&Path) -> Vec<String> + 'static {
    let map: HashMap<String, Vec<String>> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect();
    move |path: &Path| {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        map.get(&name).cloned().unwrap_or_default()
    }
}

/// One entry read back from a newc archive.
#[derive(Debug, Clone)]
pub struct CpioEntry {
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

impl CpioEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    pub fn is_file(&self) -> bool {
        self.mode & 0o170000 == 0o100000
    }

    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Parse a newc archive, stopping at the trailer.
pub fn read_archive(path: &Path) -> Vec<CpioEntry> {
    let bytes = fs::read(path).expect("Failed to read archive");
    let mut entries = Vec::new();
    let mut pos = 0;

    loop {
        let header = &bytes[pos..pos + 110];
        assert_eq!(&header[..6], b"070701", "bad magic at offset {}", pos);
        let field = |i: usize| {
            let start = 6 + i * 8;
            let hex = std::str::from_utf8(&header[start..start + 8]).unwrap();
            u32::from_str_radix(hex, 16).unwrap() as usize
        };
        let mode = field(1) as u32;
        let filesize = field(6);
        let namesize = field(11);

        let name_start = pos + 110;
        let name = std::str::from_utf8(&bytes[name_start..name_start + namesize - 1])
            .unwrap()
            .to_string();
        assert_eq!(bytes[name_start + namesize - 1], 0, "name not NUL-terminated");

        let data_start = align4(name_start + namesize);
        let data = bytes[data_start..data_start + filesize].to_vec();
        pos = align4(data_start + filesize);

        if name == "TRAILER!!!" {
            assert_eq!(pos, bytes.len(), "bytes after trailer");
            break;
        }
        entries.push(CpioEntry { name, mode, data });
    }
    entries
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Find an entry by name or panic with the list of names.
pub fn entry<'a>(entries: &'a [CpioEntry], name: &str) -> &'a CpioEntry {
    entries.iter().find(|e| e.name == name).unwrap_or_else(|| {
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        panic!("{} not in archive: {:?}", name, names)
    })
}
