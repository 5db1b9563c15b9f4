//! Resource monitor
//!
//! Reduces a sandbox's live statistics stream into one finalized
//! [`ResourceMetrics`] record. Monitoring is best-effort and must never
//! make an execution hang: the orchestrator races finalization against a
//! short grace window and accepts zeroed metrics when the window is missed.

use std::time::Duration;

use bollard::container::{MemoryStatsStats, Stats, StatsOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CpuUsagePolicy;
use crate::types::ResourceMetrics;

/// Subscribes to container statistics streams
pub struct ResourceMonitor {
    docker: Docker,
    policy: CpuUsagePolicy,
}

impl ResourceMonitor {
    pub fn new(docker: Docker, policy: CpuUsagePolicy) -> Self {
        Self { docker, policy }
    }

    /// Start monitoring `container_id`. The stream ends when the container
    /// exits; the handle finalizes earlier when told to stop.
    pub fn start(&self, container_id: &str) -> MonitorHandle {
        let docker = self.docker.clone();
        let id = container_id.to_string();
        let policy = self.policy;
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut stream = docker.stats(
                &id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );
            let mut acc = MetricsAccumulator::new(policy);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    next = stream.next() => match next {
                        Some(Ok(stats)) => acc.record(&StatsSample::from(&stats)),
                        Some(Err(e)) => {
                            debug!("Stats stream for {} ended: {}", id, e);
                            break;
                        }
                        None => break,
                    }
                }
            }

            acc.finish()
        });

        MonitorHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Live handle to one monitoring task
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<ResourceMetrics>,
}

impl MonitorHandle {
    /// A handle reporting zeroed metrics; for runtimes without a stats stream
    pub fn noop() -> Self {
        let (stop, _rx) = watch::channel(false);
        let task = tokio::spawn(async { ResourceMetrics::default() });
        Self { stop, task }
    }

    /// Signal the monitor to stop and wait at most `grace` for the
    /// finalized record. Missing the window yields zeroed metrics,
    /// never an error.
    pub async fn finish(mut self, grace: Duration) -> ResourceMetrics {
        let _ = self.stop.send(true);

        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(e)) => {
                debug!("Monitor task failed: {}", e);
                ResourceMetrics::default()
            }
            Err(_) => {
                self.task.abort();
                ResourceMetrics::default()
            }
        }
    }
}

/// The counters one reduction step needs, lifted out of the engine's
/// stats payload
#[derive(Debug, Default, Clone)]
struct StatsSample {
    cpu_total: u64,
    cpu_system: Option<u64>,
    precpu_total: u64,
    precpu_system: Option<u64>,
    online_cpus: Option<u64>,
    memory_usage: Option<u64>,
    /// Page cache bytes (cgroup v1 `cache`, v2 `inactive_file`)
    memory_cache: u64,
    disk_read: u64,
    disk_write: u64,
}

impl From<&Stats> for StatsSample {
    fn from(stats: &Stats) -> Self {
        let memory_cache = match &stats.memory_stats.stats {
            Some(MemoryStatsStats::V1(v1)) => v1.cache,
            Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
            None => 0,
        };

        let (disk_read, disk_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_deref()
            .map(|entries| {
                let mut read = 0u64;
                let mut write = 0u64;
                for entry in entries {
                    if entry.op.eq_ignore_ascii_case("read") {
                        read += entry.value;
                    } else if entry.op.eq_ignore_ascii_case("write") {
                        write += entry.value;
                    }
                }
                (read, write)
            })
            .unwrap_or((0, 0));

        Self {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            cpu_system: stats.cpu_stats.system_cpu_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            precpu_system: stats.precpu_stats.system_cpu_usage,
            online_cpus: stats.cpu_stats.online_cpus,
            memory_usage: stats.memory_stats.usage,
            memory_cache,
            disk_read,
            disk_write,
        }
    }
}

/// Instantaneous CPU percentage for one sample, or None when the deltas
/// are unusable (first sample, missing system counters, zero interval)
fn cpu_percent(sample: &StatsSample) -> Option<f64> {
    let cpu_delta = sample.cpu_total.checked_sub(sample.precpu_total)?;
    let system_delta = sample.cpu_system?.checked_sub(sample.precpu_system?)?;
    if system_delta == 0 {
        return None;
    }

    let cpus = sample.online_cpus.unwrap_or(1).max(1) as f64;
    Some(cpu_delta as f64 / system_delta as f64 * cpus * 100.0)
}

/// Monotonically-refined running record, finalized once on stop
struct MetricsAccumulator {
    policy: CpuUsagePolicy,
    cpu_peak: f64,
    cpu_sum: f64,
    cpu_samples: u32,
    memory_latest: u64,
    memory_peak: u64,
    disk_read: u64,
    disk_write: u64,
}

impl MetricsAccumulator {
    fn new(policy: CpuUsagePolicy) -> Self {
        Self {
            policy,
            cpu_peak: 0.0,
            cpu_sum: 0.0,
            cpu_samples: 0,
            memory_latest: 0,
            memory_peak: 0,
            disk_read: 0,
            disk_write: 0,
        }
    }

    fn record(&mut self, sample: &StatsSample) {
        if let Some(pct) = cpu_percent(sample) {
            self.cpu_peak = self.cpu_peak.max(pct);
            self.cpu_sum += pct;
            self.cpu_samples += 1;
        }

        if let Some(usage) = sample.memory_usage {
            // Cache should not count against the workload
            let corrected = usage.saturating_sub(sample.memory_cache);
            self.memory_latest = corrected;
            self.memory_peak = self.memory_peak.max(corrected);
        }

        // The engine reports cumulative totals; overwrite, never accumulate
        self.disk_read = self.disk_read.max(sample.disk_read);
        self.disk_write = self.disk_write.max(sample.disk_write);
    }

    fn finish(self) -> ResourceMetrics {
        let cpu_usage = match self.policy {
            CpuUsagePolicy::Peak => self.cpu_peak,
            CpuUsagePolicy::Average => {
                if self.cpu_samples > 0 {
                    self.cpu_sum / self.cpu_samples as f64
                } else {
                    0.0
                }
            }
        };

        ResourceMetrics {
            cpu_usage,
            memory_usage: self.memory_latest,
            peak_memory: self.memory_peak,
            disk_read: self.disk_read,
            disk_write: self.disk_write,
        }
    }
}
