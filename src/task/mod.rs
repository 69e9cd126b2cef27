//! Background tasks that run alongside the VM.
//!
//! Some devices need a host-side process before QEMU can reference them
//! (a virtiofs share needs a running `virtiofsd` and its socket path).
//! Those processes are modeled as [`BackgroundTask`]s owned by a
//! [`BackgroundTaskManager`], which starts them, lets them add their bits
//! to the [`LaunchConfig`], and stops them on every way out of the process.

mod manager;
mod teardown;

pub use manager::BackgroundTaskManager;

use anyhow::Result;

use crate::qemu::LaunchConfig;

/// A host-side process or resource tied to a VM session.
///
/// Started once, stopped at most once, never restarted. `stop` may be
/// called on a task whose `start` never ran or failed, and must treat that
/// as a no-op.
pub trait BackgroundTask: Send {
    /// Short name for log lines.
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Add devices, arguments or kernel parameters to the launch. Only called
    /// after every task has started.
    fn contribute_launch_config(&self, launch: &mut LaunchConfig) -> Result<()>;
}
