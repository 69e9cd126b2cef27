//! Process-wide teardown hook.
//!
//! Installed once, on first manager construction:
//! - SIGINT, SIGTERM and SIGHUP are blocked in the installing thread and
//!   collected by a dedicated thread with `sigwait`. On delivery the
//!   foreground child (QEMU), if any, gets SIGTERM, every live manager is
//!   cleaned up and the process exits with `128 + signo`.
//! - an `atexit` handler cleans up live managers when the process exits
//!   through `std::process::exit`, which skips destructors.
//!
//! Child processes are unaffected by the blocked mask: `std::process::Command`
//! resets it in the child.

use nix::sys::signal::{self, SigSet, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::sync::{Arc, Once, Weak};

use super::manager::Shared;

const TEARDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

static INSTALL: Once = Once::new();
static LIVE: Mutex<Vec<Weak<Shared>>> = parking_lot::const_mutex(Vec::new());
/// Pid of the child currently running in the foreground.
static FOREGROUND: Mutex<Option<Pid>> = parking_lot::const_mutex(None);

/// Install the hook. Later calls do nothing.
pub(super) fn install() {
    INSTALL.call_once(|| {
        install_signal_thread();

        // SAFETY: `run_at_exit` is a plain extern "C" fn with no arguments and
        // never unwinds across the FFI boundary.
        if unsafe { libc::atexit(run_at_exit) } != 0 {
            tracing::warn!("Failed to register exit handler for background tasks");
        }
    });
}

/// Make `shared` visible to the hook for as long as its manager lives.
pub(super) fn track(shared: &Arc<Shared>) {
    let mut live = LIVE.lock();
    live.retain(|w| w.strong_count() > 0);
    live.push(Arc::downgrade(shared));
}

/// Marks a child as the foreground process until dropped.
pub(super) struct ForegroundGuard;

impl ForegroundGuard {
    pub(super) fn new(pid: u32) -> Self {
        *FOREGROUND.lock() = i32::try_from(pid).ok().map(Pid::from_raw);
        Self
    }
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        *FOREGROUND.lock() = None;
    }
}

/// Ask the foreground child to terminate. It is not waited for.
fn terminate_foreground() {
    // Held across kill so the guard cannot clear a reaped pid under us
    let foreground = FOREGROUND.lock();
    if let Some(pid) = *foreground {
        tracing::info!("Terminating foreground process {}", pid);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            tracing::warn!("Failed to terminate process {}: {}", pid, e);
        }
    }
}

/// Clean up every manager that is still alive.
fn cleanup_live() {
    // Take the list out of the lock before stopping anything
    let live: Vec<Arc<Shared>> = LIVE.lock().iter().filter_map(Weak::upgrade).collect();
    for shared in live {
        shared.cleanup();
    }
}

fn install_signal_thread() {
    let mut set = SigSet::empty();
    for sig in TEARDOWN_SIGNALS {
        set.add(sig);
    }

    if let Err(e) = set.thread_block() {
        tracing::warn!("Failed to block termination signals: {}", e);
        return;
    }

    let waiting = set.clone();
    let spawned = std::thread::Builder::new()
        .name("kdf-teardown".into())
        .spawn(move || match waiting.wait() {
            Ok(sig) => {
                tracing::warn!("Received {}, stopping background tasks", sig);
                terminate_foreground();
                cleanup_live();
                std::process::exit(128 + sig as i32);
            }
            Err(e) => tracing::warn!("Waiting for termination signals failed: {}", e),
        });

    if let Err(e) = spawned {
        tracing::warn!("Failed to start signal thread: {}", e);
        // Nobody would collect blocked signals; restore default delivery
        let _ = set.thread_unblock();
    }
}

extern "C" fn run_at_exit() {
    let _ = std::panic::catch_unwind(cleanup_live);
}
