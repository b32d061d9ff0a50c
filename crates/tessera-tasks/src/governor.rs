//! Resource-aware admission control
//!
//! The governor keeps a cached host snapshot that a background sampler
//! refreshes, and answers whether one more task may start without pushing
//! CPU, memory or disk past the configured thresholds.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tessera_core::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::task::Task;

/// Point-in-time host usage, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceSnapshot {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }
}

/// Errors while reading host metrics
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("I/O error reading host metrics: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse {source_name}: {message}")]
    Parse {
        source_name: &'static str,
        message: String,
    },

    #[error("Resource sampling is not supported on this platform")]
    Unsupported,

    #[error("Resource sampling unavailable: {0}")]
    Unavailable(String),

    #[error("No resource sample has been taken yet")]
    NotYetSampled,
}

impl SamplingError {
    fn parse(source_name: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name,
            message: message.into(),
        }
    }
}

/// Source of host usage readings
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSnapshot, SamplingError>;
}

/// Cumulative CPU counters from `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Parse the aggregate `cpu` line of `/proc/stat`
pub fn parse_cpu_times(stat: &str) -> Result<CpuTimes, SamplingError> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| SamplingError::parse("/proc/stat", "missing aggregate cpu line"))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|e| SamplingError::parse("/proc/stat", format!("{}", e)))?;
    if fields.len() < 4 {
        return Err(SamplingError::parse("/proc/stat", "too few cpu fields"));
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user
    let total = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes { idle, total })
}

/// Busy percentage between two counter readings, `None` when no time elapsed
pub fn cpu_percent_between(previous: CpuTimes, current: CpuTimes) -> Option<f64> {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return None;
    }
    let idle = current.idle.saturating_sub(previous.idle).min(total);
    Some((total - idle) as f64 * 100.0 / total as f64)
}

/// Turns successive `/proc/stat` readings into usage percentages.
///
/// The baseline only moves forward when a reading spans some CPU time, so two
/// back-to-back readings never produce a fake idle host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuMeter {
    baseline: Option<CpuTimes>,
    last_percent: Option<f64>,
}

impl CpuMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Meter starting from an already taken reading
    pub fn with_baseline(times: CpuTimes) -> Self {
        Self {
            baseline: Some(times),
            last_percent: None,
        }
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    /// Feed a reading. Returns the usage since the baseline, or the last
    /// measured usage when the reading spans no CPU time.
    pub fn observe(&mut self, current: CpuTimes) -> Option<f64> {
        let Some(baseline) = self.baseline else {
            self.baseline = Some(current);
            return None;
        };
        match cpu_percent_between(baseline, current) {
            Some(percent) => {
                self.baseline = Some(current);
                self.last_percent = Some(percent);
                Some(percent)
            }
            None => self.last_percent,
        }
    }
}

/// Used memory percentage from `/proc/meminfo`
pub fn parse_memory_percent(meminfo: &str) -> Result<f64, SamplingError> {
    let mut total = None;
    let mut available = None;
    let mut free_estimate = 0u64;

    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = Some(kb),
            "MemAvailable:" => available = Some(kb),
            "MemFree:" | "Buffers:" | "Cached:" => free_estimate += kb,
            _ => {}
        }
    }

    let total = total.ok_or_else(|| SamplingError::parse("/proc/meminfo", "missing MemTotal"))?;
    if total == 0 {
        return Err(SamplingError::parse("/proc/meminfo", "MemTotal is zero"));
    }
    // Kernels before 3.14 have no MemAvailable
    let available = available.unwrap_or(free_estimate).min(total);
    Ok((total - available) as f64 * 100.0 / total as f64)
}

/// Used percentage as `df` reports it: used / (used + available to users)
pub fn disk_percent(used_bytes: f64, available_bytes: f64) -> f64 {
    let usable = used_bytes + available_bytes;
    if usable <= 0.0 {
        return 0.0;
    }
    used_bytes * 100.0 / usable
}

#[cfg(unix)]
fn disk_usage(path: &std::path::Path) -> Result<f64, SamplingError> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SamplingError::parse("statvfs", "path contains a NUL byte"))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is NUL-terminated and stat points to writable storage.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: statvfs returned 0, so the struct is initialised.
    let stat = unsafe { stat.assume_init() };

    let fragment = stat.f_frsize as f64;
    let used = (stat.f_blocks as f64 - stat.f_bfree as f64) * fragment;
    let available = stat.f_bavail as f64 * fragment;
    Ok(disk_percent(used, available))
}

#[cfg(not(unix))]
fn disk_usage(_path: &std::path::Path) -> Result<f64, SamplingError> {
    Err(SamplingError::Unsupported)
}

/// Shortest window the first CPU reading is measured over
const CPU_WARMUP: Duration = Duration::from_millis(250);

fn read_cpu_times() -> Result<CpuTimes, SamplingError> {
    parse_cpu_times(&std::fs::read_to_string("/proc/stat")?)
}

/// Samples the local host through procfs and `statvfs`
#[derive(Debug)]
pub struct SystemSampler {
    disk_path: PathBuf,
    cpu: Mutex<CpuMeter>,
}

impl SystemSampler {
    /// Sampler measuring disk usage of the filesystem holding `disk_path`.
    ///
    /// Takes the CPU baseline right away so the first sample covers real time.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let meter = match read_cpu_times() {
            Ok(times) => CpuMeter::with_baseline(times),
            Err(e) => {
                debug!(error = %e, "no CPU baseline");
                CpuMeter::new()
            }
        };
        Self {
            disk_path: disk_path.into(),
            cpu: Mutex::new(meter),
        }
    }

    /// CPU usage since the previous measurement.
    ///
    /// Blocks for up to [`CPU_WARMUP`] when nothing has been measured yet.
    fn cpu_percent(&self) -> Result<f64, SamplingError> {
        let mut meter = self.cpu.lock().unwrap_or_else(PoisonError::into_inner);
        if !meter.has_baseline() {
            meter.observe(read_cpu_times()?);
        }
        if let Some(percent) = meter.observe(read_cpu_times()?) {
            return Ok(percent);
        }

        std::thread::sleep(CPU_WARMUP);
        meter
            .observe(read_cpu_times()?)
            .ok_or(SamplingError::NotYetSampled)
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceSnapshot, SamplingError> {
        if !cfg!(target_os = "linux") {
            return Err(SamplingError::Unsupported);
        }
        let cpu_percent = self.cpu_percent()?;
        let memory_percent = parse_memory_percent(&std::fs::read_to_string("/proc/meminfo")?)?;
        let disk_percent = disk_usage(&self.disk_path)?;
        Ok(ResourceSnapshot {
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }
}

/// Sampler whose readings are set by hand
#[derive(Debug)]
pub struct ManualSampler {
    reading: Mutex<Result<ResourceSnapshot, String>>,
}

impl ManualSampler {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            reading: Mutex::new(Ok(snapshot)),
        }
    }

    /// Sampler reporting an idle host
    pub fn idle() -> Self {
        Self::new(ResourceSnapshot::default())
    }

    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = Ok(snapshot);
    }

    /// Make subsequent samples fail
    pub fn fail(&self, message: impl Into<String>) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = Err(message.into());
    }
}

impl ResourceSampler for ManualSampler {
    fn sample(&self) -> Result<ResourceSnapshot, SamplingError> {
        self.reading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map_err(SamplingError::Unavailable)
    }
}

/// Admission thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_parallel: usize,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
}

impl ResourceLimits {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_parallel: config.max_parallel,
            cpu_threshold: config.cpu_threshold,
            memory_threshold: config.memory_threshold,
            disk_threshold: config.disk_threshold,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Admission decision for one candidate task
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit,
    ConcurrencyLimit { running: usize, max_parallel: usize },
    Cpu { projected: f64, threshold: f64 },
    Memory { projected: f64, threshold: f64 },
    Disk { usage: f64, threshold: f64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Refused because of host usage rather than the concurrency cap
    pub fn is_resource_pressure(&self) -> bool {
        matches!(self, Self::Cpu { .. } | Self::Memory { .. } | Self::Disk { .. })
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admit => write!(f, "admitted"),
            Self::ConcurrencyLimit {
                running,
                max_parallel,
            } => write!(f, "{} of {} slots in use", running, max_parallel),
            Self::Cpu {
                projected,
                threshold,
            } => write!(f, "CPU would reach {:.1}% (limit {:.1}%)", projected, threshold),
            Self::Memory {
                projected,
                threshold,
            } => write!(
                f,
                "memory would reach {:.1}% (limit {:.1}%)",
                projected, threshold
            ),
            Self::Disk { usage, threshold } => {
                write!(f, "disk at {:.1}% (limit {:.1}%)", usage, threshold)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum SampleState {
    Pending,
    Ready(ResourceSnapshot),
    Failed(String),
}

/// Answers admission questions from a cached host snapshot
pub struct ResourceGovernor {
    limits: ResourceLimits,
    sampler: Arc<dyn ResourceSampler>,
    latest: watch::Sender<SampleState>,
}

impl ResourceGovernor {
    pub fn new(limits: ResourceLimits, sampler: Arc<dyn ResourceSampler>) -> Self {
        let (latest, _) = watch::channel(SampleState::Pending);
        Self {
            limits,
            sampler,
            latest,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Take a fresh sample and cache it
    pub fn refresh(&self) -> Option<ResourceSnapshot> {
        let state = match self.sampler.sample() {
            Ok(snapshot) => {
                debug!(
                    cpu = snapshot.cpu_percent,
                    memory = snapshot.memory_percent,
                    disk = snapshot.disk_percent,
                    "resource sample"
                );
                SampleState::Ready(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "resource sampling failed, admitting on concurrency only");
                SampleState::Failed(e.to_string())
            }
        };
        let snapshot = match &state {
            SampleState::Ready(s) => Some(*s),
            _ => None,
        };
        self.latest.send_replace(state);
        snapshot
    }

    /// Latest cached snapshot
    pub fn sample(&self) -> Result<ResourceSnapshot, SamplingError> {
        match &*self.latest.borrow() {
            SampleState::Pending => Err(SamplingError::NotYetSampled),
            SampleState::Ready(snapshot) => Ok(*snapshot),
            SampleState::Failed(message) => Err(SamplingError::Unavailable(message.clone())),
        }
    }

    /// Decide whether `task` may start while `in_flight` tasks are running.
    ///
    /// Without a usable sample only the concurrency cap applies.
    #[instrument(skip_all, fields(task = %task.id, in_flight = in_flight))]
    pub fn can_admit(&self, task: &Task, in_flight: usize) -> Admission {
        if in_flight >= self.limits.max_parallel {
            return Admission::ConcurrencyLimit {
                running: in_flight,
                max_parallel: self.limits.max_parallel,
            };
        }

        let Ok(snapshot) = self.sample() else {
            return Admission::Admit;
        };

        let cpu = snapshot.cpu_percent + task.resource_estimate.cpu_percent;
        if cpu >= self.limits.cpu_threshold {
            return Admission::Cpu {
                projected: cpu,
                threshold: self.limits.cpu_threshold,
            };
        }

        let memory = snapshot.memory_percent + task.resource_estimate.memory_percent;
        if memory >= self.limits.memory_threshold {
            return Admission::Memory {
                projected: memory,
                threshold: self.limits.memory_threshold,
            };
        }

        if snapshot.disk_percent >= self.limits.disk_threshold {
            return Admission::Disk {
                usage: snapshot.disk_percent,
                threshold: self.limits.disk_threshold,
            };
        }

        Admission::Admit
    }

    /// Refresh the cached snapshot every `interval` until `cancel` fires
    pub fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            // The caller has just refreshed; the first tick waits a full interval
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let governor = Arc::clone(&governor);
                        if let Err(e) = tokio::task::spawn_blocking(move || governor.refresh()).await {
                            warn!(error = %e, "resource sampler task failed");
                        }
                    }
                }
            }
            debug!("resource sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    fn task(cpu: f64, memory: f64) -> Task {
        TaskSpec::new("blog-unit")
            .with_command("npm test")
            .with_resource_estimate(cpu, memory)
            .into_task(Duration::from_secs(60), 0)
    }

    fn governor(snapshot: ResourceSnapshot) -> (ResourceGovernor, Arc<ManualSampler>) {
        let sampler = Arc::new(ManualSampler::new(snapshot));
        let governor = ResourceGovernor::new(ResourceLimits::default(), sampler.clone());
        governor.refresh();
        (governor, sampler)
    }

    #[test]
    fn test_parse_cpu_times() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_cpu_times(stat).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.idle, 850);
        assert!(parse_cpu_times("intr 1 2 3").is_err());
    }

    #[test]
    fn test_cpu_percent_between() {
        let previous = CpuTimes {
            idle: 800,
            total: 1000,
        };
        let current = CpuTimes {
            idle: 850,
            total: 1200,
        };
        assert!((cpu_percent_between(previous, current).unwrap() - 75.0).abs() < 1e-9);
        assert_eq!(cpu_percent_between(current, current), None);
    }

    #[test]
    fn test_cpu_meter_ignores_back_to_back_readings() {
        let boot = CpuTimes {
            idle: 900,
            total: 1000,
        };
        let mut meter = CpuMeter::with_baseline(boot);

        // Same counters again: no time has passed, so no reading at all
        assert_eq!(meter.observe(boot), None);

        // Fully busy interval
        let busy = CpuTimes {
            idle: 900,
            total: 1100,
        };
        assert_eq!(meter.observe(busy), Some(100.0));

        // A zero-length window keeps the last real reading instead of 0%
        assert_eq!(meter.observe(busy), Some(100.0));

        let half = CpuTimes {
            idle: 950,
            total: 1200,
        };
        assert_eq!(meter.observe(half), Some(50.0));
    }

    #[test]
    fn test_cpu_meter_without_baseline() {
        let mut meter = CpuMeter::new();
        assert!(!meter.has_baseline());
        assert_eq!(
            meter.observe(CpuTimes {
                idle: 10,
                total: 20
            }),
            None
        );
        assert!(meter.has_baseline());
    }

    #[test]
    fn test_parse_memory_percent() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert!((parse_memory_percent(meminfo).unwrap() - 75.0).abs() < 1e-9);

        let old_kernel = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 100 kB\nCached: 300 kB\n";
        assert!((parse_memory_percent(old_kernel).unwrap() - 50.0).abs() < 1e-9);

        assert!(parse_memory_percent("MemFree: 1 kB\n").is_err());
    }

    #[test]
    fn test_disk_percent() {
        assert!((disk_percent(90.0, 10.0) - 90.0).abs() < 1e-9);
        assert_eq!(disk_percent(0.0, 0.0), 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_sampler_reads_host() {
        let sampler = SystemSampler::new(std::env::temp_dir());
        let snapshot = sampler.sample().unwrap();
        assert!((0.0..=100.0).contains(&snapshot.cpu_percent));
        assert!((0.0..=100.0).contains(&snapshot.memory_percent));
        assert!((0.0..=100.0).contains(&snapshot.disk_percent));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_sampler_first_sample_is_measured() {
        let sampler = SystemSampler::new(std::env::temp_dir());
        let first = sampler.sample().unwrap();
        let second = sampler.sample().unwrap();
        assert!((0.0..=100.0).contains(&first.cpu_percent));
        assert!((0.0..=100.0).contains(&second.cpu_percent));
    }

    #[tokio::test]
    async fn test_sampler_waits_an_interval_before_first_refresh() {
        let sampler = Arc::new(ManualSampler::new(ResourceSnapshot::new(95.0, 10.0, 10.0)));
        let governor = Arc::new(ResourceGovernor::new(
            ResourceLimits::default(),
            sampler.clone(),
        ));
        governor.refresh();

        sampler.set(ResourceSnapshot::new(5.0, 10.0, 10.0));
        let cancel = CancellationToken::new();
        let handle = governor.spawn_sampler(Duration::from_millis(300), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(governor.sample().unwrap().cpu_percent, 95.0);
        assert!(governor.can_admit(&task(1.0, 0.0), 0).is_resource_pressure());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(governor.sample().unwrap().cpu_percent, 5.0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_admits_idle_host() {
        let (governor, _) = governor(ResourceSnapshot::new(10.0, 20.0, 30.0));
        assert_eq!(governor.can_admit(&task(10.0, 10.0), 0), Admission::Admit);
    }

    #[test]
    fn test_concurrency_limit() {
        let (governor, _) = governor(ResourceSnapshot::default());
        let decision = governor.can_admit(&task(0.0, 0.0), 4);
        assert!(matches!(decision, Admission::ConcurrencyLimit { .. }));
        assert!(!decision.is_resource_pressure());
    }

    #[test]
    fn test_cpu_pressure_until_sample_drops() {
        let (governor, sampler) = governor(ResourceSnapshot::new(85.0, 10.0, 10.0));
        let decision = governor.can_admit(&task(0.0, 0.0), 0);
        assert!(matches!(decision, Admission::Cpu { .. }));
        assert!(decision.is_resource_pressure());

        sampler.set(ResourceSnapshot::new(40.0, 10.0, 10.0));
        // cached snapshot is still the old one
        assert!(!governor.can_admit(&task(0.0, 0.0), 0).is_admitted());
        governor.refresh();
        assert!(governor.can_admit(&task(0.0, 0.0), 0).is_admitted());
    }

    #[test]
    fn test_projection_includes_task_estimate() {
        let (governor, _) = governor(ResourceSnapshot::new(50.0, 60.0, 10.0));
        assert!(matches!(
            governor.can_admit(&task(30.0, 0.0), 0),
            Admission::Cpu { .. }
        ));
        assert!(matches!(
            governor.can_admit(&task(0.0, 25.0), 0),
            Admission::Memory { .. }
        ));
        assert!(governor.can_admit(&task(20.0, 20.0), 0).is_admitted());
    }

    #[test]
    fn test_disk_pressure() {
        let (governor, _) = governor(ResourceSnapshot::new(0.0, 0.0, 95.0));
        let decision = governor.can_admit(&task(0.0, 0.0), 0);
        assert!(matches!(decision, Admission::Disk { .. }));
        assert_eq!(decision.to_string(), "disk at 95.0% (limit 90.0%)");
    }

    #[test]
    fn test_sampling_failure_is_permissive() {
        let (governor, sampler) = governor(ResourceSnapshot::new(99.0, 99.0, 99.0));
        sampler.fail("no procfs");
        assert!(governor.refresh().is_none());
        assert!(matches!(
            governor.sample(),
            Err(SamplingError::Unavailable(_))
        ));
        assert!(governor.can_admit(&task(50.0, 50.0), 0).is_admitted());
        assert!(!governor.can_admit(&task(0.0, 0.0), 4).is_admitted());
    }

    #[test]
    fn test_unsampled_governor() {
        let sampler = Arc::new(ManualSampler::idle());
        let governor = ResourceGovernor::new(ResourceLimits::default(), sampler);
        assert!(matches!(governor.sample(), Err(SamplingError::NotYetSampled)));
    }

    #[tokio::test]
    async fn test_background_sampler_refreshes() {
        let sampler = Arc::new(ManualSampler::new(ResourceSnapshot::new(90.0, 0.0, 0.0)));
        let governor = Arc::new(ResourceGovernor::new(
            ResourceLimits::default(),
            sampler.clone(),
        ));
        let cancel = CancellationToken::new();
        let handle = governor.spawn_sampler(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(governor.sample().unwrap().cpu_percent, 90.0);

        sampler.set(ResourceSnapshot::new(5.0, 0.0, 0.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(governor.sample().unwrap().cpu_percent, 5.0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
