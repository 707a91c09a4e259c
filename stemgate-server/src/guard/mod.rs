//! Resource guard: admission gate for resource-intensive work
//!
//! Two checks sit in front of every job:
//! - a host load check ([`ResourceGuard::check_resources`]) against the RAM and
//!   CPU ceilings, run by the protection middleware
//! - a concurrency slot ([`ResourceGuard::try_acquire`]) held for the whole job
//!
//! Admission is a hard gate: when every slot is taken the caller is rejected
//! immediately instead of queueing. Slots are released by dropping the
//! [`SlotPermit`], so every exit path (success, `?`, panic unwinding, a
//! cancelled future) gives the slot back.

pub mod sampler;

pub use sampler::{
    CachedSampler, FixedSampler, HostSample, HostSampler, SampleError, SysinfoSampler,
};

use std::sync::{Arc, Mutex, MutexGuard};
use stemgate_common::ResourceLimits;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a job was refused admission
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapacityRejection {
    #[error("RAM usage too high: {used_mb:.0} MB in use (limit {limit_mb} MB)")]
    Memory { used_mb: f64, limit_mb: u64 },

    #[error("CPU usage too high: {used_percent:.1}% (limit {limit_percent:.1}%)")]
    Cpu {
        used_percent: f64,
        limit_percent: f64,
    },

    #[error("Too many concurrent requests: {active} of {max} slots in use")]
    Concurrency { active: usize, max: usize },
}

impl CapacityRejection {
    /// Machine-readable reason returned to clients
    pub fn reason(&self) -> &'static str {
        match self {
            CapacityRejection::Memory { .. } => "ram_limit",
            CapacityRejection::Cpu { .. } => "cpu_limit",
            CapacityRejection::Concurrency { .. } => "concurrency_limit",
        }
    }
}

#[derive(Debug)]
struct SlotCounter {
    active: Mutex<usize>,
    max: usize,
}

impl SlotCounter {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Concurrency slot held by one in-flight job; released on drop
#[derive(Debug)]
pub struct SlotPermit {
    slots: Arc<SlotCounter>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let mut active = self.slots.lock();
        *active = active.saturating_sub(1);
        debug!(active = *active, max = self.slots.max, "Concurrency slot released");
    }
}

/// Admission gate shared by all request handlers
#[derive(Clone)]
pub struct ResourceGuard {
    limits: Arc<ResourceLimits>,
    sampler: Arc<dyn HostSampler>,
    slots: Arc<SlotCounter>,
}

impl ResourceGuard {
    pub fn new(limits: Arc<ResourceLimits>, sampler: Arc<dyn HostSampler>) -> Self {
        let slots = Arc::new(SlotCounter {
            active: Mutex::new(0),
            max: limits.max_concurrent_requests,
        });
        Self {
            limits,
            sampler,
            slots,
        }
    }

    /// Compare current host load against the RAM and CPU ceilings
    ///
    /// Never blocks. If the host cannot be sampled the check passes.
    pub fn check_resources(&self) -> Result<(), CapacityRejection> {
        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Host sampling failed, admitting without load check");
                return Ok(());
            }
        };

        if sample.ram_used_mb > self.limits.max_ram_mb as f64 {
            return Err(CapacityRejection::Memory {
                used_mb: sample.ram_used_mb,
                limit_mb: self.limits.max_ram_mb,
            });
        }

        if sample.cpu_percent > self.limits.max_cpu_percent {
            return Err(CapacityRejection::Cpu {
                used_percent: sample.cpu_percent,
                limit_percent: self.limits.max_cpu_percent,
            });
        }

        Ok(())
    }

    /// Take a concurrency slot, or fail at once when all are in use
    pub fn try_acquire(&self) -> Result<SlotPermit, CapacityRejection> {
        let mut active = self.slots.lock();
        if *active >= self.slots.max {
            return Err(CapacityRejection::Concurrency {
                active: *active,
                max: self.slots.max,
            });
        }
        *active += 1;
        debug!(active = *active, max = self.slots.max, "Concurrency slot acquired");

        Ok(SlotPermit {
            slots: Arc::clone(&self.slots),
        })
    }

    /// Jobs currently holding a slot
    pub fn active_slots(&self) -> usize {
        *self.slots.lock()
    }

    pub fn max_slots(&self) -> usize {
        self.slots.max
    }

    /// Best-effort host reading for status surfaces
    pub fn sample_host(&self) -> Option<HostSample> {
        self.sampler.sample().ok()
    }

    pub fn sampler(&self) -> Arc<dyn HostSampler> {
        Arc::clone(&self.sampler)
    }
}
