//! virtiofs shares backed by `virtiofsd`.
//!
//! Each share runs its own `virtiofsd` listening on a vhost-user socket in a
//! private temporary directory. QEMU connects to that socket through a
//! `vhost-user-fs-pci` device, and the guest init mounts the share by tag.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::error::Error;
use crate::process::Cmd;
use crate::qemu::LaunchConfig;
use crate::task::{BackgroundTask, BackgroundTaskManager};

/// How long virtiofsd gets to create its socket.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// DAX window size for `vhost-user-fs-pci`.
const DAX_CACHE_SIZE: &str = "2G";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A parsed `tag:host_path:guest_path[:overlay]` share spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtiofsShare {
    pub tag: String,
    pub host_path: PathBuf,
    pub guest_path: String,
    pub overlay: bool,
}

impl VirtiofsShare {
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let invalid = |why: &str| {
            Error::InvalidInput(format!(
                "virtiofs share '{}': {} (expected tag:host_path:guest_path[:overlay])",
                spec, why
            ))
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let (tag, host, guest, overlay) = match parts.as_slice() {
            [tag, host, guest] => (*tag, *host, *guest, false),
            [tag, host, guest, "overlay"] => (*tag, *host, *guest, true),
            [_, _, _, other] => return Err(invalid(&format!("unknown option '{}'", other))),
            _ => return Err(invalid("wrong number of fields")),
        };

        if tag.is_empty() || host.is_empty() || guest.is_empty() {
            return Err(invalid("empty field"));
        }
        // The guest side is passed as a comma-separated kernel parameter
        if tag.contains(',') || guest.contains(',') || tag.contains(char::is_whitespace) || guest.contains(char::is_whitespace) {
            return Err(invalid("tag and guest path may not contain ',' or whitespace"));
        }
        if !guest.starts_with('/') {
            return Err(invalid("guest path must be absolute"));
        }

        Ok(Self {
            tag: tag.to_string(),
            host_path: PathBuf::from(host),
            guest_path: guest.to_string(),
            overlay,
        })
    }
}

/// One `virtiofsd` process serving one share.
pub struct VirtiofsTask {
    share: VirtiofsShare,
    virtiofsd: String,
    socket_timeout: Duration,
    name: String,
    socket_dir: Option<TempDir>,
    child: Option<Child>,
}

impl VirtiofsTask {
    pub fn new(share: VirtiofsShare, virtiofsd: impl Into<String>) -> Self {
        let name = format!("virtiofsd[{}]", share.tag);
        Self {
            share,
            virtiofsd: virtiofsd.into(),
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            name,
            socket_dir: None,
            child: None,
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn share(&self) -> &VirtiofsShare {
        &self.share
    }

    /// Socket path, once started.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_dir
            .as_ref()
            .map(|d| d.path().join(format!("{}.sock", self.share.tag)))
    }

    fn chardev_id(&self) -> String {
        format!("vfs-{}", self.share.tag)
    }

    fn wait_for_socket(&mut self, socket: &Path) -> Result<()> {
        let deadline = Instant::now() + self.socket_timeout;
        loop {
            if socket.exists() {
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    bail!("{} exited before creating its socket ({})", self.name, status);
                }
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} did not create {} within {:?}",
                    self.name,
                    socket.display(),
                    self.socket_timeout
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl BackgroundTask for VirtiofsTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        if !self.share.host_path.is_dir() {
            return Err(Error::not_found("Shared directory", &self.share.host_path).into());
        }

        let dir = tempfile::Builder::new()
            .prefix("kdf-virtiofs-")
            .tempdir()
            .context("Failed to create socket directory")?;
        self.socket_dir = Some(dir);
        let socket = self
            .socket_path()
            .context("socket directory disappeared")?;

        let cmd = Cmd::new(&self.virtiofsd)
            .arg(format!("--socket-path={}", socket.display()))
            .arg(format!("--shared-dir={}", self.share.host_path.display()))
            .arg("--cache=auto");
        tracing::info!("Starting {}: {}", self.name, cmd.display());
        self.child = Some(cmd.spawn()?);

        self.wait_for_socket(&socket)?;
        tracing::info!("{} listening on {}", self.name, socket.display());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let result = match self.child.take() {
            Some(mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!("{} already exited ({})", self.name, status);
                    Ok(())
                }
                _ => {
                    tracing::info!("Stopping {}", self.name);
                    child
                        .kill()
                        .and_then(|_| child.wait())
                        .map(|_| ())
                        .with_context(|| format!("Failed to stop {}", self.name))
                }
            },
            None => Ok(()),
        };

        // Dropping the TempDir removes the socket
        self.socket_dir = None;
        result
    }

    fn contribute_launch_config(&self, launch: &mut LaunchConfig) -> Result<()> {
        let socket = match self.socket_path() {
            Some(s) if self.child.is_some() => s,
            _ => bail!("{} is not running", self.name),
        };
        let id = self.chardev_id();

        let mut device = format!("vhost-user-fs-pci,chardev={},tag={}", id, self.share.tag);
        if launch.dax {
            device.push_str(&format!(",cache-size={}", DAX_CACHE_SIZE));
        }

        launch.require_shared_memory();
        launch.add_args([
            "-chardev".to_string(),
            format!("socket,id={},path={}", id, socket.display()),
            "-device".to_string(),
            device,
        ]);
        launch
            .init
            .add_virtiofs_mount(&self.share.tag, &self.share.guest_path, self.share.overlay);
        Ok(())
    }
}

/// Parse every share spec, then register one task per share.
///
/// Nothing is registered if any spec is invalid.
pub fn register_shares<S: AsRef<str>>(
    specs: &[S],
    manager: &BackgroundTaskManager,
    virtiofsd: &str,
) -> Result<()> {
    let shares = specs
        .iter()
        .map(|s| VirtiofsShare::parse(s.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    for share in shares {
        manager.register(VirtiofsTask::new(share, virtiofsd));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in for virtiofsd that touches its socket path and sleeps.
    fn fake_virtiofsd(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-virtiofsd");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    const TOUCH_AND_SLEEP: &str = r#"for a in "$@"; do
  case "$a" in --socket-path=*) touch "${a#--socket-path=}" ;; esac
done
exec sleep 30"#;

    #[test]
    fn test_parse_basic() {
        let share = VirtiofsShare::parse("src:/home/me/src:/src").unwrap();
        assert_eq!(share.tag, "src");
        assert_eq!(share.host_path, PathBuf::from("/home/me/src"));
        assert_eq!(share.guest_path, "/src");
        assert!(!share.overlay);
    }

    #[test]
    fn test_parse_overlay() {
        let share = VirtiofsShare::parse("nix:/nix/store:/nix/store:overlay").unwrap();
        assert!(share.overlay);
    }

    #[test]
    fn test_parse_invalid() {
        for spec in [
            "",
            "tag",
            "tag:/host",
            "tag:/host:/guest:ro",
            "tag:/host:/guest:overlay:extra",
            ":/host:/guest",
            "tag:/host:relative",
            "a,b:/host:/guest",
        ] {
            let err = VirtiofsShare::parse(spec).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{} should be invalid", spec);
        }
    }

    #[test]
    fn test_register_shares_all_or_nothing() {
        let mgr = BackgroundTaskManager::new();
        let err = register_shares(&["a:/x:/a", "broken"], &mgr, "virtiofsd").unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
        assert!(mgr.is_empty());

        register_shares(&["a:/x:/a", "b:/y:/b:overlay"], &mgr, "virtiofsd").unwrap();
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_missing_host_dir() {
        let share = VirtiofsShare::parse("x:/nonexistent_dir_12345:/x").unwrap();
        let mut task = VirtiofsTask::new(share, "virtiofsd");
        let err = task.start().unwrap_err();
        assert!(err.downcast_ref::<Error>().unwrap().is_not_found());
        // Never started, stop is a no-op
        task.stop().unwrap();
    }

    #[test]
    fn test_start_contribute_stop() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = fake_virtiofsd(dir.path(), TOUCH_AND_SLEEP);
        let spec = format!("share:{}:/mnt/share:overlay", dir.path().display());

        let mut task = VirtiofsTask::new(VirtiofsShare::parse(&spec).unwrap(), daemon);
        task.start().unwrap();
        let socket = task.socket_path().unwrap();
        assert!(socket.exists());

        let mut launch = LaunchConfig::new("k", "i", "1G").with_dax(true);
        task.contribute_launch_config(&mut launch).unwrap();
        let argv = launch.build();
        assert!(argv.contains(&format!("socket,id=vfs-share,path={}", socket.display())));
        assert!(argv.contains(&"vhost-user-fs-pci,chardev=vfs-share,tag=share,cache-size=2G".to_string()));
        assert!(launch.shared_memory);
        assert!(launch.kernel_cmdline().contains("init.virtiofs=share:/mnt/share:Y"));

        task.stop().unwrap();
        assert!(!socket.exists());
        assert!(task.contribute_launch_config(&mut launch).is_err());
        // Second stop has nothing left to do
        task.stop().unwrap();
    }

    #[test]
    fn test_daemon_exits_early() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = fake_virtiofsd(dir.path(), "exit 3");
        let spec = format!("s:{}:/s", dir.path().display());

        let mut task = VirtiofsTask::new(VirtiofsShare::parse(&spec).unwrap(), daemon);
        let err = task.start().unwrap_err();
        assert!(err.to_string().contains("exited before creating its socket"));
        task.stop().unwrap();
    }

    #[test]
    fn test_socket_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = fake_virtiofsd(dir.path(), "exec sleep 30");
        let spec = format!("s:{}:/s", dir.path().display());

        let mut task = VirtiofsTask::new(VirtiofsShare::parse(&spec).unwrap(), daemon)
            .with_socket_timeout(Duration::from_millis(200));
        let err = task.start().unwrap_err();
        assert!(err.to_string().contains("did not create"));
        // The hung daemon is still ours to kill
        task.stop().unwrap();
    }
}
