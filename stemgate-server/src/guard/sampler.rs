//! Host resource sampling
//!
//! One capability, two implementations: [`SysinfoSampler`] reads the live host,
//! [`FixedSampler`] returns whatever a test put into it. [`CachedSampler`]
//! sits in front of either and rate-limits refreshes.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;
use thiserror::Error;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time host utilization
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostSample {
    /// Host memory in use, in MB
    pub ram_used_mb: f64,
    /// Sum of per-core CPU usage (400.0 = four fully busy cores)
    pub cpu_percent: f64,
}

/// Host metrics could not be read
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Host metrics are not supported on this platform")]
    Unsupported,

    #[error("Host metrics unavailable: {0}")]
    Unavailable(String),
}

/// Source of host utilization readings
pub trait HostSampler: Send + Sync {
    fn sample(&self) -> Result<HostSample, SampleError>;
}

/// Production sampler backed by `sysinfo`
///
/// Keeps one `System` between calls so CPU usage is measured as the delta since
/// the previous sample rather than a meaningless first reading.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&self) -> Result<HostSample, SampleError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(SampleError::Unsupported);
        }

        let mut system = self
            .system
            .lock()
            .map_err(|_| SampleError::Unavailable("sampler lock poisoned".to_string()))?;
        system.refresh_memory();
        system.refresh_cpu_usage();

        if system.total_memory() == 0 {
            return Err(SampleError::Unavailable(
                "total memory reported as zero".to_string(),
            ));
        }

        let ram_used_mb = system.used_memory() as f64 / BYTES_PER_MB;
        let cpu_percent = system
            .cpus()
            .iter()
            .map(|cpu| f64::from(cpu.cpu_usage()))
            .sum();

        Ok(HostSample {
            ram_used_mb,
            cpu_percent,
        })
    }
}

/// Reuses the last successful reading for `min_interval`
///
/// Admission, `/health`, `/admin/metrics` and the background loop share one
/// sampler. sysinfo measures CPU as the delta since the previous refresh; the
/// wrapper keeps that delta at least `min_interval` long however often callers
/// poll. Failures are not cached.
pub struct CachedSampler<S> {
    inner: S,
    min_interval: Duration,
    last: Mutex<Option<(Instant, HostSample)>>,
}

impl<S: HostSampler> CachedSampler<S> {
    pub fn new(inner: S, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: HostSampler> HostSampler for CachedSampler<S> {
    fn sample(&self) -> Result<HostSample, SampleError> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((taken_at, sample)) = *last {
            if taken_at.elapsed() < self.min_interval {
                return Ok(sample);
            }
        }

        let sample = self.inner.sample()?;
        *last = Some((Instant::now(), sample));
        Ok(sample)
    }
}

/// Sampler returning fixed readings, or failing on demand
#[derive(Debug)]
pub struct FixedSampler {
    reading: Mutex<Option<HostSample>>,
}

impl FixedSampler {
    pub fn new(ram_used_mb: f64, cpu_percent: f64) -> Self {
        Self {
            reading: Mutex::new(Some(HostSample {
                ram_used_mb,
                cpu_percent,
            })),
        }
    }

    /// A sampler whose every call fails
    pub fn failing() -> Self {
        Self {
            reading: Mutex::new(None),
        }
    }

    pub fn set(&self, ram_used_mb: f64, cpu_percent: f64) {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner()) = Some(HostSample {
            ram_used_mb,
            cpu_percent,
        });
    }

    pub fn fail(&self) {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl HostSampler for FixedSampler {
    fn sample(&self) -> Result<HostSample, SampleError> {
        let reading = *self.reading.lock().unwrap_or_else(|e| e.into_inner());
        reading.ok_or_else(|| SampleError::Unavailable("fixed sampler set to fail".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sampler_returns_set_values() {
        let sampler = FixedSampler::new(512.0, 25.0);
        assert_eq!(
            sampler.sample().unwrap(),
            HostSample {
                ram_used_mb: 512.0,
                cpu_percent: 25.0
            }
        );

        sampler.set(1024.0, 50.0);
        assert_eq!(sampler.sample().unwrap().ram_used_mb, 1024.0);

        sampler.fail();
        assert!(sampler.sample().is_err());
    }

    #[test]
    fn test_cached_sampler_reuses_reading_within_window() {
        let cached = CachedSampler::new(FixedSampler::new(100.0, 10.0), Duration::from_secs(3600));
        assert_eq!(cached.sample().unwrap().cpu_percent, 10.0);

        cached.inner().set(900.0, 390.0);
        let reused = cached.sample().unwrap();
        assert_eq!(reused.ram_used_mb, 100.0);
        assert_eq!(reused.cpu_percent, 10.0);
    }

    #[test]
    fn test_cached_sampler_refreshes_after_window() {
        let cached = CachedSampler::new(FixedSampler::new(100.0, 10.0), Duration::ZERO);
        cached.sample().unwrap();

        cached.inner().set(900.0, 390.0);
        assert_eq!(cached.sample().unwrap().cpu_percent, 390.0);
    }

    #[test]
    fn test_cached_sampler_does_not_cache_failures() {
        let cached = CachedSampler::new(FixedSampler::failing(), Duration::from_secs(3600));
        assert!(cached.sample().is_err());

        cached.inner().set(256.0, 5.0);
        assert_eq!(cached.sample().unwrap().ram_used_mb, 256.0);
    }

    #[test]
    fn test_sysinfo_sampler_reports_plausible_values() {
        let sampler = SysinfoSampler::new();
        match sampler.sample() {
            Ok(sample) => {
                assert!(sample.ram_used_mb >= 0.0);
                assert!(sample.cpu_percent >= 0.0);
            }
            // Sandboxed CI hosts may hide /proc
            Err(_) => {}
        }
    }
}
