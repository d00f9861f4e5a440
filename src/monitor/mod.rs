//! Resource monitor: host CPU/memory sampling and parallelism policy.
//!
//! Samples land in a fixed-capacity ring buffer. The scheduler consults the
//! latest snapshot for a recommended concurrency level and a throttle factor;
//! a cooperative background loop keeps the buffer fresh. Measurement failures
//! degrade to conservative fixed estimates, never errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{
    CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind,
    System,
};
use tokio::sync::mpsc;

use crate::config::MonitorConfig;
use crate::id::now_secs;
use crate::scheduler::ConvoyEvent;
use crate::scheduler::events::EventSink;

/// Availability score at or above which the full parallelism ceiling applies.
const SCORE_FULL: f64 = 60.0;
/// Availability score below which only the baseline applies.
const SCORE_FLOOR: f64 = 30.0;
/// Conservative estimate used when a measurement fails.
const DEGRADED_USAGE_PERCENT: f64 = 50.0;

/// Point-in-time resource measurement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    /// Host CPU usage percent (0-100).
    pub cpu_percent: f64,
    /// Host memory usage percent (0-100).
    pub memory_percent: f64,
    /// Host available memory in MB.
    pub available_memory_mb: f64,
    /// This process's resident memory in MB.
    pub process_memory_mb: f64,
    /// This process's CPU usage percent.
    pub process_cpu_percent: f64,
    /// Logical CPU count.
    pub cpu_count: usize,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl ResourceSnapshot {
    /// Conservative snapshot used when measurement fails.
    fn degraded() -> Self {
        Self {
            cpu_percent: DEGRADED_USAGE_PERCENT,
            memory_percent: DEGRADED_USAGE_PERCENT,
            available_memory_mb: 0.0,
            process_memory_mb: 0.0,
            process_cpu_percent: 0.0,
            cpu_count: 1,
            timestamp: now_secs(),
        }
    }
}

/// Samples host CPU/memory and derives safe concurrency recommendations.
///
/// Internally synchronized; safe for concurrent callers without external
/// locking.
pub struct ResourceMonitor {
    config: MonitorConfig,
    pid: Pid,
    system: Mutex<System>,
    samples: Mutex<VecDeque<ResourceSnapshot>>,
    sampling: AtomicBool,
    epoch: AtomicU64,
    events: EventSink,
}

impl ResourceMonitor {
    /// Create a monitor with the given configuration.
    pub fn new(config: MonitorConfig) -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything())
                .with_processes(ProcessRefreshKind::everything()),
        );

        Self {
            config,
            pid,
            system: Mutex::new(system),
            samples: Mutex::new(VecDeque::new()),
            sampling: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            events: EventSink::default(),
        }
    }

    /// Attach a telemetry sink; every measurement is mirrored to it as a
    /// `ConvoyEvent::ResourceSampled`, best-effort and never blocking.
    pub fn with_event_sink(mut self, tx: mpsc::Sender<ConvoyEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Take one measurement, record it, and return it.
    ///
    /// Never fails: a measurement that cannot be taken degrades to a fixed
    /// conservative estimate.
    pub fn sample(&self) -> ResourceSnapshot {
        let snapshot = self.measure();
        self.record(snapshot);
        self.events.emit(ConvoyEvent::ResourceSampled { snapshot });
        snapshot
    }

    /// Record a caller-supplied snapshot (degraded path and test injection).
    pub fn record(&self, snapshot: ResourceSnapshot) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() >= self.config.sample_capacity {
            samples.pop_front();
        }
        samples.push_back(snapshot);
    }

    fn measure(&self) -> ResourceSnapshot {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        system.refresh_cpu_usage();
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let total_memory = system.total_memory();
        if total_memory == 0 {
            return ResourceSnapshot::degraded();
        }

        let cpu_percent = sanitize_percent(system.global_cpu_usage() as f64);
        let used_memory = system.used_memory();
        let memory_percent = sanitize_percent(used_memory as f64 / total_memory as f64 * 100.0);
        let available_memory_mb = system.available_memory() as f64 / (1024.0 * 1024.0);

        let (process_memory_mb, process_cpu_percent) = match system.process(self.pid) {
            Some(process) => (
                process.memory() as f64 / (1024.0 * 1024.0),
                sanitize_percent(process.cpu_usage() as f64),
            ),
            None => (0.0, 0.0),
        };

        ResourceSnapshot {
            cpu_percent,
            memory_percent,
            available_memory_mb,
            process_memory_mb,
            process_cpu_percent,
            cpu_count: system.cpus().len().max(1),
            timestamp: now_secs(),
        }
    }

    /// Latest snapshot, or `None` before the first sample.
    pub fn current_metrics(&self) -> Option<ResourceSnapshot> {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.back().copied()
    }

    /// Mean of samples newer than `now - window_secs`, or `None` when the
    /// window holds nothing.
    pub fn average_metrics(&self, window_secs: u64) -> Option<ResourceSnapshot> {
        let cutoff = now_secs() - window_secs as i64;
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());

        let recent: Vec<&ResourceSnapshot> =
            samples.iter().filter(|s| s.timestamp >= cutoff).collect();
        if recent.is_empty() {
            return None;
        }

        let n = recent.len() as f64;
        Some(ResourceSnapshot {
            cpu_percent: recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
            memory_percent: recent.iter().map(|s| s.memory_percent).sum::<f64>() / n,
            available_memory_mb: recent.iter().map(|s| s.available_memory_mb).sum::<f64>() / n,
            process_memory_mb: recent.iter().map(|s| s.process_memory_mb).sum::<f64>() / n,
            process_cpu_percent: recent.iter().map(|s| s.process_cpu_percent).sum::<f64>() / n,
            cpu_count: recent.last().map(|s| s.cpu_count).unwrap_or(1),
            timestamp: recent.last().map(|s| s.timestamp).unwrap_or(0),
        })
    }

    /// Number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Recommended parallelism given the latest availability.
    ///
    /// Availability score is the weighted average of `(100 - cpu%)` and
    /// `(100 - mem%)`. Score >= 60 grants `max_parallel`; [30, 60) linearly
    /// interpolates between `baseline` and `max_parallel`; below 30 only the
    /// baseline applies. The three tiers avoid oscillation at the extremes.
    /// With no samples the baseline is returned.
    pub fn optimal_parallelism(
        &self,
        max_parallel: usize,
        baseline: usize,
        cpu_weight: f64,
        memory_weight: f64,
    ) -> usize {
        let baseline = baseline.min(max_parallel);
        let Some(snapshot) = self.current_metrics() else {
            return baseline;
        };

        let weight_sum = cpu_weight + memory_weight;
        if weight_sum <= 0.0 {
            return baseline;
        }

        let score = (cpu_weight * (100.0 - snapshot.cpu_percent)
            + memory_weight * (100.0 - snapshot.memory_percent))
            / weight_sum;

        if score >= SCORE_FULL {
            max_parallel
        } else if score >= SCORE_FLOOR {
            let span = (max_parallel - baseline) as f64;
            let fraction = (score - SCORE_FLOOR) / (SCORE_FULL - SCORE_FLOOR);
            baseline + (fraction * span).round() as usize
        } else {
            baseline
        }
    }

    /// True when either metric exceeds its threshold.
    pub fn should_throttle(&self, cpu_threshold: f64, memory_threshold: f64) -> bool {
        match self.current_metrics() {
            Some(s) => s.cpu_percent > cpu_threshold || s.memory_percent > memory_threshold,
            None => false,
        }
    }

    /// Concurrency multiplier in [0, 1] derived from the worse overage ratio.
    ///
    /// `1.0` means no throttle; the factor falls toward `0.0` as usage
    /// exceeds the thresholds.
    pub fn throttle_factor(&self, cpu_threshold: f64, memory_threshold: f64) -> f64 {
        let Some(snapshot) = self.current_metrics() else {
            return 1.0;
        };

        let cpu_overage = overage_ratio(snapshot.cpu_percent, cpu_threshold);
        let memory_overage = overage_ratio(snapshot.memory_percent, memory_threshold);

        (1.0 - cpu_overage.max(memory_overage)).max(0.0)
    }

    /// Start the cooperative background sampling loop.
    ///
    /// Starting twice is a warned no-op. Each start opens a new sampling
    /// epoch; a loop from an earlier epoch exits on its next wakeup without
    /// touching the current one, so stop-then-start restarts immediately.
    pub fn start_sampling(self: &Arc<Self>) {
        if self.sampling.swap(true, Ordering::SeqCst) {
            tracing::warn!("background sampling already running");
            return;
        }
        let my_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sample_interval_secs.max(1));
        tokio::spawn(async move {
            tracing::debug!(interval_secs = interval.as_secs(), "resource sampling started");
            loop {
                if monitor.epoch.load(Ordering::SeqCst) != my_epoch {
                    break;
                }
                let snapshot = monitor.sample();
                tracing::trace!(
                    cpu = snapshot.cpu_percent,
                    memory = snapshot.memory_percent,
                    "resource sample"
                );
                tokio::time::sleep(interval).await;
            }
            tracing::debug!("resource sampling stopped");
        });
    }

    /// Request the background loop to stop. Idempotent.
    pub fn stop_sampling(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sampling.store(false, Ordering::SeqCst);
    }

    /// Whether the background loop is active.
    pub fn is_sampling(&self) -> bool {
        self.sampling.load(Ordering::SeqCst)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

fn sanitize_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        DEGRADED_USAGE_PERCENT
    }
}

fn overage_ratio(usage: f64, threshold: f64) -> f64 {
    if threshold >= 100.0 || usage <= threshold {
        return 0.0;
    }
    (usage - threshold) / (100.0 - threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu: f64, memory: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            available_memory_mb: 1024.0,
            process_memory_mb: 64.0,
            process_cpu_percent: 5.0,
            cpu_count: 8,
            timestamp: now_secs(),
        }
    }

    #[test]
    fn test_sample_records_snapshot() {
        let monitor = ResourceMonitor::default();
        let snap = monitor.sample();
        assert!(snap.cpu_percent >= 0.0 && snap.cpu_percent <= 100.0);
        assert!(snap.memory_percent >= 0.0 && snap.memory_percent <= 100.0);
        assert_eq!(monitor.sample_count(), 1);
        assert_eq!(monitor.current_metrics(), Some(snap));
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let monitor = ResourceMonitor::new(MonitorConfig {
            sample_capacity: 3,
            sample_interval_secs: 5,
        });
        for cpu in [10.0, 20.0, 30.0, 40.0] {
            monitor.record(snapshot(cpu, 50.0));
        }
        assert_eq!(monitor.sample_count(), 3);
        assert_eq!(monitor.current_metrics().unwrap().cpu_percent, 40.0);
    }

    #[test]
    fn test_average_metrics_windowed() {
        let monitor = ResourceMonitor::default();
        let mut old = snapshot(90.0, 90.0);
        old.timestamp = now_secs() - 600;
        monitor.record(old);
        monitor.record(snapshot(10.0, 20.0));
        monitor.record(snapshot(30.0, 40.0));

        let avg = monitor.average_metrics(60).unwrap();
        assert!((avg.cpu_percent - 20.0).abs() < 1e-9);
        assert!((avg.memory_percent - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_metrics_no_data() {
        let monitor = ResourceMonitor::default();
        assert!(monitor.average_metrics(60).is_none());

        let mut old = snapshot(50.0, 50.0);
        old.timestamp = now_secs() - 600;
        monitor.record(old);
        assert!(monitor.average_metrics(60).is_none());
    }

    #[test]
    fn test_optimal_parallelism_high_availability() {
        let monitor = ResourceMonitor::default();
        monitor.record(snapshot(20.0, 20.0)); // score 80
        assert_eq!(monitor.optimal_parallelism(20, 2, 0.5, 0.5), 20);
    }

    #[test]
    fn test_optimal_parallelism_low_availability() {
        let monitor = ResourceMonitor::default();
        monitor.record(snapshot(90.0, 90.0)); // score 10
        assert_eq!(monitor.optimal_parallelism(20, 2, 0.5, 0.5), 2);
    }

    #[test]
    fn test_optimal_parallelism_midrange_interpolates() {
        let monitor = ResourceMonitor::default();
        monitor.record(snapshot(55.0, 55.0)); // score 45, halfway through [30, 60)
        let result = monitor.optimal_parallelism(20, 2, 0.5, 0.5);
        assert_eq!(result, 11); // 2 + 0.5 * 18
    }

    #[test]
    fn test_optimal_parallelism_monotonic_in_score() {
        let monitor = ResourceMonitor::default();
        let mut previous = 0;
        for usage in (0..=100).rev() {
            monitor.record(snapshot(usage as f64, usage as f64));
            let parallel = monitor.optimal_parallelism(16, 2, 0.5, 0.5);
            assert!(
                parallel >= previous,
                "parallelism dropped from {} to {} at usage {}",
                previous,
                parallel,
                usage
            );
            previous = parallel;
        }
        assert_eq!(previous, 16);
    }

    #[test]
    fn test_optimal_parallelism_no_data_returns_baseline() {
        let monitor = ResourceMonitor::default();
        assert_eq!(monitor.optimal_parallelism(20, 3, 0.5, 0.5), 3);
    }

    #[test]
    fn test_optimal_parallelism_clamps_baseline() {
        let monitor = ResourceMonitor::default();
        monitor.record(snapshot(95.0, 95.0));
        assert_eq!(monitor.optimal_parallelism(4, 10, 0.5, 0.5), 4);
    }

    #[test]
    fn test_should_throttle() {
        let monitor = ResourceMonitor::default();
        assert!(!monitor.should_throttle(85.0, 85.0));

        monitor.record(snapshot(90.0, 50.0));
        assert!(monitor.should_throttle(85.0, 85.0));

        monitor.record(snapshot(50.0, 90.0));
        assert!(monitor.should_throttle(85.0, 85.0));

        monitor.record(snapshot(50.0, 50.0));
        assert!(!monitor.should_throttle(85.0, 85.0));
    }

    #[test]
    fn test_throttle_factor_no_overage() {
        let monitor = ResourceMonitor::default();
        assert_eq!(monitor.throttle_factor(85.0, 85.0), 1.0);

        monitor.record(snapshot(50.0, 50.0));
        assert_eq!(monitor.throttle_factor(85.0, 85.0), 1.0);
    }

    #[test]
    fn test_throttle_factor_scales_with_overage() {
        let monitor = ResourceMonitor::default();
        // cpu halfway between threshold 80 and 100
        monitor.record(snapshot(90.0, 50.0));
        let factor = monitor.throttle_factor(80.0, 80.0);
        assert!((factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_throttle_factor_takes_worse_overage() {
        let monitor = ResourceMonitor::default();
        monitor.record(snapshot(85.0, 95.0));
        let factor = monitor.throttle_factor(80.0, 80.0);
        // memory overage (0.75) dominates cpu overage (0.25)
        assert!((factor - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_throttle_factor_floors_at_zero() {
        let monitor = ResourceMonitor::default();
        monitor.record(snapshot(100.0, 100.0));
        assert_eq!(monitor.throttle_factor(80.0, 80.0), 0.0);
    }

    #[tokio::test]
    async fn test_background_sampling_collects() {
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig {
            sample_capacity: 10,
            sample_interval_secs: 1,
        }));
        monitor.start_sampling();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_sampling());
        assert!(monitor.sample_count() >= 1);

        monitor.stop_sampling();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_background_sampling_double_start_is_noop() {
        let monitor = Arc::new(ResourceMonitor::default());
        monitor.start_sampling();
        monitor.start_sampling(); // warned no-op
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop_sampling();
    }

    #[tokio::test]
    async fn test_restart_after_stop_resumes_sampling() {
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig {
            sample_capacity: 10,
            sample_interval_secs: 1,
        }));
        monitor.start_sampling();
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.stop_sampling();
        assert!(!monitor.is_sampling());

        // Restart before the old loop's sleep elapses; the new epoch takes
        // over and the stale loop exits on its next wakeup.
        monitor.start_sampling();
        assert!(monitor.is_sampling());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.sample_count() >= 2);

        monitor.stop_sampling();
    }

    #[test]
    fn test_sample_emits_telemetry_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = ResourceMonitor::default().with_event_sink(tx);

        let snap = monitor.sample();
        match rx.try_recv() {
            Ok(ConvoyEvent::ResourceSampled { snapshot }) => assert_eq!(snapshot, snap),
            other => panic!("expected ResourceSampled, got {:?}", other),
        }
    }

    #[test]
    fn test_sample_without_sink_records_only() {
        let monitor = ResourceMonitor::default();
        monitor.sample();
        assert_eq!(monitor.sample_count(), 1);
    }
}
