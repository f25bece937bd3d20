//! Resident memory guard.
//!
//! [`MemoryGuard`] only answers whether the process is over its memory
//! ceiling. What happens next belongs to a [`PressureHook`]; in production
//! that is [`TerminateProcess`], which leaves recovery to whatever supervises
//! the process.

use std::sync::{Arc, Mutex, PoisonError};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{error, warn};

use crate::error::{GatewayError, Result};

const MEGABYTE: u64 = 1024 * 1024;

type RssReader = Box<dyn Fn() -> Option<u64> + Send + Sync>;

pub struct MemoryGuard {
    threshold_bytes: u64,
    read_rss: RssReader,
}

impl MemoryGuard {
    /// Guard that measures this process through `sysinfo`.
    pub fn new(threshold_bytes: u64) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(error = err, "cannot resolve own pid, memory guard disabled");
                None
            }
        };
        let system = Mutex::new(System::new());
        Self::with_reader(threshold_bytes, move || {
            pid.and_then(|pid| process_rss(&system, pid))
        })
    }

    pub fn with_reader(
        threshold_bytes: u64,
        read_rss: impl Fn() -> Option<u64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            threshold_bytes,
            read_rss: Box::new(read_rss),
        }
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    pub fn resident_bytes(&self) -> Option<u64> {
        (self.read_rss)()
    }

    /// Resident size when it is strictly above the threshold.
    pub fn over_threshold(&self) -> Option<u64> {
        match self.resident_bytes() {
            Some(rss) if rss > self.threshold_bytes => Some(rss),
            Some(_) => None,
            None => {
                warn!("resident memory unavailable, skipping pressure check");
                None
            }
        }
    }

    pub fn check_resource_pressure(&self) -> bool {
        self.over_threshold().is_some()
    }
}

fn process_rss(system: &Mutex<System>, pid: Pid) -> Option<u64> {
    let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory())
}

/// Receives the fatal outcome of a failed pressure check.
pub trait PressureHook: Send + Sync {
    fn fatal(&self, rss_bytes: u64, threshold_bytes: u64);
}

/// Kills the process outright: no graceful shutdown, no response.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminateProcess;

impl PressureHook for TerminateProcess {
    fn fatal(&self, rss_bytes: u64, threshold_bytes: u64) {
        error!(
            rss_mb = rss_bytes / MEGABYTE,
            threshold_mb = threshold_bytes / MEGABYTE,
            "memory ceiling exceeded, terminating process to force restart"
        );
        std::process::abort();
    }
}

/// Guard plus hook, checked at fixed points of a request.
pub struct Supervisor {
    guard: MemoryGuard,
    hook: Arc<dyn PressureHook>,
}

impl Supervisor {
    pub fn new(guard: MemoryGuard, hook: Arc<dyn PressureHook>) -> Self {
        Self { guard, hook }
    }

    /// Fires the hook when over the ceiling. If the hook returns, the
    /// request is refused instead of continuing.
    pub fn checkpoint(&self, stage: &'static str) -> Result<()> {
        let Some(rss) = self.guard.over_threshold() else {
            return Ok(());
        };
        let threshold = self.guard.threshold_bytes();
        warn!(stage, rss_mb = rss / MEGABYTE, "memory pressure detected");
        self.hook.fatal(rss, threshold);
        Err(GatewayError::ResourcePressure {
            rss_mb: rss / MEGABYTE,
            threshold_mb: threshold / MEGABYTE,
        })
    }
}
