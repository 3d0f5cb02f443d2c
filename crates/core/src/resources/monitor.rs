use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sysinfo::{Disks, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{ResourceSnapshot, ResourceStatus};
use crate::config::ResourcesConfig;
use crate::error::SchedulerError;
use crate::job::Priority;
use crate::metrics;

/// Latest resource pressure level, read by the scheduler on every
/// submission and dispatch.
///
/// Starts Healthy. The level only changes through [`observe`](Self::observe),
/// fed by the sampling task from [`spawn`](Self::spawn).
pub struct ResourceMonitor {
    config: ResourcesConfig,
    status: AtomicU8,
    last: Mutex<Option<ResourceSnapshot>>,
}

impl ResourceMonitor {
    pub fn new(config: ResourcesConfig) -> Self {
        Self {
            config,
            status: AtomicU8::new(ResourceStatus::Healthy.as_u8()),
            last: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ResourcesConfig {
        &self.config
    }

    pub fn status(&self) -> ResourceStatus {
        ResourceStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn last_snapshot(&self) -> Option<ResourceSnapshot> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sample and return the level it maps to.
    pub fn observe(&self, snapshot: ResourceSnapshot) -> ResourceStatus {
        let status = snapshot.status(&self.config);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        let previous = ResourceStatus::from_u8(self.status.swap(status.as_u8(), Ordering::SeqCst));
        metrics::RESOURCE_STATUS.set(i64::from(status.as_u8()));

        if previous != status {
            info!(
                from = %previous,
                to = %status,
                cpu = snapshot.cpu_percent,
                memory = snapshot.memory_percent,
                disk = snapshot.disk_percent.unwrap_or(0.0),
                "Resource status changed"
            );
        }
        status
    }

    /// Concurrent jobs allowed right now.
    pub fn effective_capacity(&self, cap: usize) -> usize {
        self.status().effective_capacity(cap)
    }

    /// Refuse new work the current level does not admit.
    pub fn check_admission(&self, priority: Priority) -> Result<(), SchedulerError> {
        let status = self.status();
        if status.admits(priority) {
            return Ok(());
        }
        warn!(%priority, %status, "Job rejected under resource pressure");
        Err(SchedulerError::ResourcePressure { status })
    }

    /// Sample the host every `check_interval_secs` until `shutdown` fires.
    /// Disk usage is read for the filesystem holding `disk_path`.
    pub fn spawn(
        self: &Arc<Self>,
        disk_path: PathBuf,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = monitor.config.check_interval();
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                disk_path = %disk_path.display(),
                "Resource monitoring started"
            );
            let sampler = Arc::new(Mutex::new(HostSampler::new(disk_path)));
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sampler = sampler.clone();
                        let sampled = tokio::task::spawn_blocking(move || {
                            let snapshot =
                                sampler.lock().unwrap_or_else(PoisonError::into_inner).sample();
                            snapshot
                        })
                        .await;
                        match sampled {
                            Ok(snapshot) => {
                                monitor.observe(snapshot);
                            }
                            Err(e) => warn!("Resource sampling failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Resource monitoring stopped");
        })
    }
}

/// Reads host usage through sysinfo. CPU usage is measured between two
/// refreshes, so the first sample reports zero.
struct HostSampler {
    system: System,
    disk_path: PathBuf,
}

impl HostSampler {
    fn new(disk_path: PathBuf) -> Self {
        let disk_path = std::fs::canonicalize(&disk_path)
            .or_else(|_| std::env::current_dir().map(|dir| dir.join(&disk_path)))
            .unwrap_or(disk_path);
        Self {
            system: System::new(),
            disk_path,
        }
    }

    fn sample(&mut self) -> ResourceSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disk_usage(
            &self.disk_path,
            disks
                .list()
                .iter()
                .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space())),
        );

        ResourceSnapshot {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent,
            disk_percent,
        }
    }
}

/// Percent used of the mount holding `path`: the longest mount point that
/// prefixes it.
fn disk_usage<'a>(
    path: &Path,
    mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>,
) -> Option<f32> {
    let (_, total, available) = mounts
        .into_iter()
        .filter(|(mount, total, _)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())?;
    let used = total.saturating_sub(available);
    Some((used as f64 / total as f64 * 100.0) as f32)
}
