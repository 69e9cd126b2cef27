//! QEMU launch command assembly.
//!
//! [`LaunchConfig`] is built once the kernel and initramfs are known, then
//! handed to every background task so they can add devices and kernel
//! parameters (see [`crate::task::BackgroundTaskManager::contribute_all`]).
//! [`LaunchConfig::build`] renders the final argv.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_QEMU;
use crate::process::Cmd;
use crate::task::BackgroundTaskManager;

/// Default guest memory.
pub const DEFAULT_MEMORY: &str = "512M";

/// Kernel parameters every session gets.
const BASE_CMDLINE: &[&str] = &["console=ttyS0", "rdinit=/init", "panic=-1"];

/// A virtiofs share the guest init should mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMount {
    pub tag: String,
    pub path: String,
    /// Mount read-only with a writable overlay on top.
    pub overlay: bool,
}

/// Parameters for the guest init, passed as `init.*` kernel arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitConfig {
    pub virtiofs_mounts: Vec<InitMount>,
    /// Directory the init loads modules from.
    pub moddir: Option<String>,
}

impl InitConfig {
    pub fn add_virtiofs_mount(&mut self, tag: &str, path: &str, overlay: bool) {
        self.virtiofs_mounts.push(InitMount {
            tag: tag.to_string(),
            path: path.to_string(),
            overlay,
        });
    }

    /// Render as kernel parameters.
    ///
    /// `init.virtiofs=tag:/path[:Y],...` and `init.moddir=/dir`.
    pub fn to_cmdline(&self) -> Vec<String> {
        let mut params = Vec::new();

        if !self.virtiofs_mounts.is_empty() {
            let mounts: Vec<String> = self
                .virtiofs_mounts
                .iter()
                .map(|m| {
                    if m.overlay {
                        format!("{}:{}:Y", m.tag, m.path)
                    } else {
                        format!("{}:{}", m.tag, m.path)
                    }
                })
                .collect();
            params.push(format!("init.virtiofs={}", mounts.join(",")));
        }

        if let Some(ref moddir) = self.moddir {
            params.push(format!("init.moddir={}", moddir));
        }

        params
    }
}

/// Everything needed to start the VM.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub qemu: String,
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
    pub memory: String,
    /// Back guest RAM with a shareable memfd (vhost-user devices need it).
    pub shared_memory: bool,
    /// virtiofs DAX window requested by the user.
    pub dax: bool,
    pub init: InitConfig,
    args: Vec<String>,
    cmdline: Vec<String>,
}

impl LaunchConfig {
    pub fn new(kernel: impl Into<PathBuf>, initramfs: impl Into<PathBuf>, memory: &str) -> Self {
        Self {
            qemu: DEFAULT_QEMU.to_string(),
            kernel: kernel.into(),
            initramfs: initramfs.into(),
            memory: memory.to_string(),
            shared_memory: false,
            dax: false,
            init: InitConfig::default(),
            args: Vec::new(),
            cmdline: Vec::new(),
        }
    }

    /// Use a different QEMU binary.
    pub fn with_qemu(mut self, qemu: impl Into<String>) -> Self {
        self.qemu = qemu.into();
        self
    }

    pub fn with_dax(mut self, dax: bool) -> Self {
        self.dax = dax;
        self
    }

    /// Append raw QEMU arguments.
    pub fn add_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    /// Append kernel command line fragments. Blank input is ignored.
    pub fn add_cmdline(&mut self, fragment: &str) {
        self.cmdline
            .extend(fragment.split_whitespace().map(str::to_string));
    }

    pub fn require_shared_memory(&mut self) {
        self.shared_memory = true;
    }

    /// Full kernel command line.
    pub fn kernel_cmdline(&self) -> String {
        BASE_CMDLINE
            .iter()
            .map(|s| s.to_string())
            .chain(self.init.to_cmdline())
            .chain(self.cmdline.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Render the argv, program first.
    pub fn build(&self) -> Vec<String> {
        let mut argv = vec![
            self.qemu.clone(),
            "-enable-kvm".into(),
            "-cpu".into(),
            "host".into(),
            "-m".into(),
            self.memory.clone(),
            "-nographic".into(),
            "-serial".into(),
            "mon:stdio".into(),
            "-no-reboot".into(),
        ];

        if self.shared_memory {
            argv.extend([
                "-object".into(),
                format!("memory-backend-memfd,id=mem,size={},share=on", self.memory),
                "-numa".into(),
                "node,memdev=mem".into(),
            ]);
        }

        argv.extend([
            "-kernel".into(),
            path_arg(&self.kernel),
            "-initrd".into(),
            path_arg(&self.initramfs),
        ]);
        argv.extend(self.args.iter().cloned());
        argv.extend(["-append".into(), self.kernel_cmdline()]);
        argv
    }

    /// Run QEMU in the foreground of `tasks` until the guest powers off.
    pub fn run(&self, tasks: &BackgroundTaskManager) -> Result<()> {
        let argv = self.build();
        tracing::info!("Running QEMU with command:");
        tracing::info!("{}", argv.join(" "));

        let cmd = Cmd::new(&argv[0])
            .args(&argv[1..])
            .error_msg("QEMU exited with an error");
        let status = tasks.run_foreground(&cmd)?;
        cmd.check_status(status)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(argv: &[String], arg: &str) -> usize {
        argv.iter()
            .position(|a| a == arg)
            .unwrap_or_else(|| panic!("{} missing from {:?}", arg, argv))
    }

    #[test]
    fn test_minimal_command() {
        let cfg = LaunchConfig::new("/k/bzImage", "/tmp/initramfs.cpio", DEFAULT_MEMORY);
        let argv = cfg.build();

        assert_eq!(argv[0], "qemu-system-x86_64");
        assert_eq!(argv[position(&argv, "-m") + 1], "512M");
        assert_eq!(argv[position(&argv, "-kernel") + 1], "/k/bzImage");
        assert_eq!(argv[position(&argv, "-initrd") + 1], "/tmp/initramfs.cpio");
        assert!(!argv.iter().any(|a| a.starts_with("memory-backend-memfd")));
        assert_eq!(argv.last().unwrap(), "console=ttyS0 rdinit=/init panic=-1");
    }

    #[test]
    fn test_shared_memory_uses_memory_size() {
        let mut cfg = LaunchConfig::new("k", "i", "2G");
        cfg.require_shared_memory();
        let argv = cfg.build();
        assert_eq!(
            argv[position(&argv, "-object") + 1],
            "memory-backend-memfd,id=mem,size=2G,share=on"
        );
        assert_eq!(argv[position(&argv, "-numa") + 1], "node,memdev=mem");
    }

    #[test]
    fn test_task_args_and_cmdline() {
        let mut cfg = LaunchConfig::new("k", "i", DEFAULT_MEMORY).with_qemu("qemu-kvm");
        cfg.add_args(["-device", "virtio-rng-pci"]);
        cfg.add_cmdline("quiet  loglevel=3");
        cfg.add_cmdline("   ");
        cfg.init.add_virtiofs_mount("share", "/mnt/share", false);
        cfg.init.add_virtiofs_mount("src", "/src", true);
        cfg.init.moddir = Some("/init-modules".into());

        let argv = cfg.build();
        assert_eq!(argv[0], "qemu-kvm");
        assert_eq!(argv[position(&argv, "-device") + 1], "virtio-rng-pci");
        // Task args come before -append
        assert!(position(&argv, "-device") < position(&argv, "-append"));
        assert_eq!(
            cfg.kernel_cmdline(),
            "console=ttyS0 rdinit=/init panic=-1 \
             init.virtiofs=share:/mnt/share,src:/src:Y init.moddir=/init-modules \
             quiet loglevel=3"
        );
    }

    #[test]
    fn test_init_config_empty() {
        assert!(InitConfig::default().to_cmdline().is_empty());
    }
}
