use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::process::ExitStatus;
use std::sync::Arc;

use super::{teardown, BackgroundTask};
use crate::process::Cmd;
use crate::qemu::LaunchConfig;

struct Entry {
    task: Box<dyn BackgroundTask>,
    stopped: bool,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    started: bool,
    /// Set by the first cleanup; nothing starts after that.
    closed: bool,
}

/// State shared between a manager and the process-wide teardown hook.
#[derive(Default)]
pub(super) struct Shared {
    registry: Mutex<Registry>,
}

impl Shared {
    /// Stop every task not yet stopped, in registration order.
    ///
    /// Registration order matches the behavior this tool has always had.
    /// Reverse order would be the usual choice for teardown; nothing in the
    /// current tasks depends on either.
    pub(super) fn cleanup(&self) {
        let mut reg = self.registry.lock();
        reg.closed = true;

        for entry in reg.entries.iter_mut().filter(|e| !e.stopped) {
            entry.stopped = true;
            tracing::debug!("Stopping {}", entry.task.name());
            if let Err(e) = entry.task.stop() {
                tracing::warn!("Failed to stop {}: {:#}", entry.task.name(), e);
            }
        }
    }
}

/// Owns the session's background tasks.
///
/// Cleanup runs when the manager is dropped (normal return, `?`, panic
/// unwinding), from an `atexit` handler (`std::process::exit`), and on
/// SIGINT/SIGTERM/SIGHUP. Every path funnels into the same idempotent
/// [`cleanup`](Self::cleanup), so each task is stopped at most once.
pub struct BackgroundTaskManager {
    shared: Arc<Shared>,
}

impl BackgroundTaskManager {
    /// Create a manager and make sure the process-wide teardown hook is
    /// installed.
    ///
    /// Signals are blocked in the calling thread, so create the manager
    /// from the main thread before spawning other threads.
    pub fn new() -> Self {
        teardown::install();
        let shared = Arc::new(Shared::default());
        teardown::track(&shared);
        Self { shared }
    }

    /// Add a task. Tasks start in the order they are registered.
    pub fn register(&self, task: impl BackgroundTask + 'static) {
        self.register_boxed(Box::new(task));
    }

    pub fn register_boxed(&self, task: Box<dyn BackgroundTask>) {
        self.shared.registry.lock().entries.push(Entry {
            task,
            stopped: false,
        });
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start every task in registration order.
    ///
    /// Stops at the first failure and returns it. Tasks that already started
    /// keep running until [`cleanup`](Self::cleanup).
    pub fn start_all(&self) -> Result<()> {
        let mut reg = self.shared.registry.lock();
        if reg.closed {
            bail!("Background tasks were already shut down");
        }

        for entry in reg.entries.iter_mut() {
            tracing::info!("Starting {}", entry.task.name());
            entry
                .task
                .start()
                .with_context(|| format!("Failed to start {}", entry.task.name()))?;
        }
        reg.started = true;
        Ok(())
    }

    /// Let every task add to the launch configuration, in registration order.
    pub fn contribute_all(&self, launch: &mut LaunchConfig) -> Result<()> {
        let reg = self.shared.registry.lock();
        if !reg.started {
            bail!("Background tasks must be started before configuring the launch");
        }
        if reg.closed {
            bail!("Background tasks were already shut down");
        }

        for entry in &reg.entries {
            entry
                .task
                .contribute_launch_config(launch)
                .with_context(|| format!("{} could not configure the launch", entry.task.name()))?;
        }
        Ok(())
    }

    /// Run `cmd` with the terminal attached and wait for it.
    ///
    /// While it runs, a termination signal sends it SIGTERM before the
    /// background tasks are stopped, so it does not outlive the session.
    pub fn run_foreground(&self, cmd: &Cmd) -> Result<ExitStatus> {
        let mut child = cmd.spawn_interactive()?;
        let _foreground = teardown::ForegroundGuard::new(child.id());
        child
            .wait()
            .with_context(|| format!("Failed to wait for {}", cmd.display()))
    }

    /// Stop all tasks. Safe to call any number of times; stop failures are
    /// logged and do not keep the remaining tasks from stopping.
    pub fn cleanup(&self) {
        self.shared.cleanup();
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
