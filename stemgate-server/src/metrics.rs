//! Process-wide metrics: completed job counter and resource history
//!
//! Nothing here is persisted; a restart begins from zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::guard::HostSampler;
use crate::storage::StorageAccountant;

/// One reading of RAM, CPU and managed storage
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub ram_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub storage_mb: f64,
}

/// Point-in-time copy of the recorder
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_count: u64,
    pub ram_usage: Vec<TimedValue>,
    pub cpu_usage: Vec<TimedValue>,
    pub storage_usage: Vec<TimedValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimedValue {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Counters and bounded sample history
#[derive(Debug)]
pub struct MetricsRecorder {
    requests_count: AtomicU64,
    history: Mutex<VecDeque<ResourceSample>>,
    capacity: usize,
}

impl MetricsRecorder {
    /// `capacity` bounds the history; the oldest sample is evicted first
    pub fn new(capacity: usize) -> Self {
        Self {
            requests_count: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    /// Count one successfully completed job
    pub fn record_request(&self) {
        self.requests_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_count(&self) -> u64 {
        self.requests_count.load(Ordering::Relaxed)
    }

    pub fn record_sample(&self, sample: ResourceSample) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(sample);
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());

        let series = |pick: fn(&ResourceSample) -> Option<f64>| -> Vec<TimedValue> {
            history
                .iter()
                .filter_map(|s| {
                    pick(s).map(|value| TimedValue {
                        timestamp: s.timestamp,
                        value,
                    })
                })
                .collect()
        };

        MetricsSnapshot {
            requests_count: self.requests_count(),
            ram_usage: series(|s| s.ram_mb),
            cpu_usage: series(|s| s.cpu_percent),
            storage_usage: series(|s| Some(s.storage_mb)),
        }
    }
}

/// Take one sample of host load and managed storage
pub async fn collect_sample(
    sampler: &Arc<dyn HostSampler>,
    storage: &Arc<StorageAccountant>,
) -> ResourceSample {
    let host = sampler.sample().ok();
    let storage = Arc::clone(storage);
    let storage_mb = tokio::task::spawn_blocking(move || storage.current_usage_mb())
        .await
        .unwrap_or(0.0);

    ResourceSample {
        timestamp: Utc::now(),
        ram_mb: host.map(|h| h.ram_used_mb),
        cpu_percent: host.map(|h| h.cpu_percent),
        storage_mb,
    }
}

/// Background task appending a sample every `interval` until cancelled
pub async fn run_sampling_loop(
    recorder: Arc<MetricsRecorder>,
    sampler: Arc<dyn HostSampler>,
    storage: Arc<StorageAccountant>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "Metrics sampler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let sample = collect_sample(&sampler, &storage).await;
                debug!(
                    ram_mb = ?sample.ram_mb,
                    cpu_percent = ?sample.cpu_percent,
                    storage_mb = sample.storage_mb,
                    "Resource sample recorded"
                );
                recorder.record_sample(sample);
            }
        }
    }

    info!("Metrics sampler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::FixedSampler;
    use tempfile::TempDir;

    fn sample(ram: f64, cpu: f64, storage: f64) -> ResourceSample {
        ResourceSample {
            timestamp: Utc::now(),
            ram_mb: Some(ram),
            cpu_percent: Some(cpu),
            storage_mb: storage,
        }
    }

    #[test]
    fn test_request_counter_increments() {
        let recorder = MetricsRecorder::new(10);
        assert_eq!(recorder.requests_count(), 0);
        recorder.record_request();
        recorder.record_request();
        assert_eq!(recorder.requests_count(), 2);
        assert_eq!(recorder.snapshot().requests_count, 2);
    }

    #[test]
    fn test_history_is_bounded_and_drops_oldest() {
        let recorder = MetricsRecorder::new(3);
        for i in 0..5 {
            recorder.record_sample(sample(i as f64, 0.0, 0.0));
        }

        let snapshot = recorder.snapshot();
        let ram: Vec<f64> = snapshot.ram_usage.iter().map(|v| v.value).collect();
        assert_eq!(ram, vec![2.0, 3.0, 4.0]);
        assert_eq!(recorder.latest_sample().unwrap().ram_mb, Some(4.0));
    }

    #[test]
    fn test_missing_host_readings_are_skipped_in_series() {
        let recorder = MetricsRecorder::new(10);
        recorder.record_sample(ResourceSample {
            timestamp: Utc::now(),
            ram_mb: None,
            cpu_percent: None,
            storage_mb: 12.5,
        });

        let snapshot = recorder.snapshot();
        assert!(snapshot.ram_usage.is_empty());
        assert!(snapshot.cpu_usage.is_empty());
        assert_eq!(snapshot.storage_usage.len(), 1);
        assert_eq!(snapshot.storage_usage[0].value, 12.5);
    }

    #[tokio::test]
    async fn test_sampling_loop_records_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageAccountant::new(
            dir.path().join("uploads"),
            dir.path().join("outputs"),
            50,
            100,
        ));
        storage.ensure_directories().unwrap();
        std::fs::write(storage.upload_dir().join("a.mp3"), vec![0u8; 1024 * 1024]).unwrap();

        let recorder = Arc::new(MetricsRecorder::new(100));
        let sampler: Arc<dyn HostSampler> = Arc::new(FixedSampler::new(256.0, 12.0));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_sampling_loop(
            Arc::clone(&recorder),
            sampler,
            storage,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap();

        let latest = recorder.latest_sample().expect("at least one sample");
        assert_eq!(latest.ram_mb, Some(256.0));
        assert_eq!(latest.cpu_percent, Some(12.0));
        assert_eq!(latest.storage_mb, 1.0);
    }
}
