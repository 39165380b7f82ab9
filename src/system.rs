//! Host resource snapshots.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use sysinfo::{Disks, System};

use crate::docker::DockerFacade;
use crate::sse;

/// Cadence of the resource stream.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuStats {
    pub cores: usize,
    /// Global usage in percent since the previous sample.
    pub used: f64,
    pub model_name: String,
    /// Per-core frequency in MHz.
    pub frequencies: Vec<u64>,
    pub architecture: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DockerStats {
    pub running_containers: usize,
    pub total_containers: usize,
    pub total_images: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostInfo {
    pub os: String,
    pub platform: String,
    pub kernel_version: String,
    /// Seconds since boot.
    pub uptime: u64,
    pub last_update: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub docker: DockerStats,
    pub disk: DiskStats,
    pub system: HostInfo,
}

/// Samples memory, CPU and disk usage of the host.
///
/// CPU usage is a delta, so one monitor is kept for the life of the process
/// and every sample measures the time since the previous one.
pub struct SystemMonitor {
    sys: Mutex<System>,
    disk_path: PathBuf,
}

impl SystemMonitor {
    /// `disk_path` selects the filesystem reported under `disk`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        Self {
            sys: Mutex::new(sys),
            disk_path: disk_path.into(),
        }
    }

    /// Host-only part of a snapshot; the `docker` section is left zeroed.
    pub fn sample_host(&self) -> ResourceSnapshot {
        let (memory, cpu) = {
            let mut sys = match self.sys.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sys.refresh_memory();
            sys.refresh_cpu_all();

            let memory = MemoryStats {
                total: sys.total_memory(),
                used: sys.used_memory(),
                free: sys.free_memory(),
                available: sys.available_memory(),
                used_percent: percent(sys.used_memory(), sys.total_memory()),
            };
            let cpus = sys.cpus();
            let cpu = CpuStats {
                cores: cpus.len(),
                used: f64::from(sys.global_cpu_usage()),
                model_name: cpus.first().map(|c| c.brand().to_string()).unwrap_or_default(),
                frequencies: cpus.iter().map(|c| c.frequency()).collect(),
                architecture: std::env::consts::ARCH.to_string(),
            };
            (memory, cpu)
        };

        ResourceSnapshot {
            memory,
            cpu,
            docker: DockerStats::default(),
            disk: disk_usage(&self.disk_path),
            system: HostInfo {
                os: std::env::consts::OS.to_string(),
                platform: System::long_os_version()
                    .or_else(System::name)
                    .unwrap_or_default(),
                kernel_version: System::kernel_version().unwrap_or_default(),
                uptime: System::uptime(),
                last_update: Utc::now().to_rfc3339(),
            },
        }
    }

    /// Full snapshot including container and image counts.
    ///
    /// A daemon failure leaves the `docker` section zeroed.
    pub async fn snapshot(self: &Arc<Self>, docker: &dyn DockerFacade) -> ResourceSnapshot {
        let mut snapshot = self.sample_host_blocking().await;
        snapshot.docker = docker_stats(docker).await;
        snapshot
    }

    /// [`Self::sample_host`] on the blocking pool. sysinfo reads procfs and
    /// the sampler is behind a mutex shared by every stream.
    pub async fn sample_host_blocking(self: &Arc<Self>) -> ResourceSnapshot {
        let monitor = Arc::clone(self);
        match tokio::task::spawn_blocking(move || monitor.sample_host()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Host sampling task failed");
                ResourceSnapshot::default()
            }
        }
    }

    /// One SSE `message` frame per [`SNAPSHOT_INTERVAL`], starting immediately.
    pub fn frames(
        self: Arc<Self>,
        docker: Arc<dyn DockerFacade>,
    ) -> impl Stream<Item = Result<Bytes, serde_json::Error>> + Send + 'static {
        let ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        futures::stream::unfold(
            (self, docker, ticker),
            |(monitor, docker, mut ticker)| async move {
                ticker.tick().await;
                let snapshot = monitor.snapshot(docker.as_ref()).await;
                let frame = sse::message_frame(&snapshot);
                Some((frame, (monitor, docker, ticker)))
            },
        )
    }
}

async fn docker_stats(docker: &dyn DockerFacade) -> DockerStats {
    let containers = match docker.list_containers(true).await {
        Ok(containers) => containers,
        Err(e) => {
            tracing::warn!(error = %e, "Container count unavailable");
            return DockerStats::default();
        }
    };
    let total_images = match docker.list_images().await {
        Ok(images) => images.len(),
        Err(e) => {
            tracing::warn!(error = %e, "Image count unavailable");
            0
        }
    };
    DockerStats {
        running_containers: containers.iter().filter(|c| c.state == "running").count(),
        total_containers: containers.len(),
        total_images,
    }
}

/// Usage of the filesystem with the longest mount point containing `path`.
fn disk_usage(path: &Path) -> DiskStats {
    let disks = Disks::new_with_refreshed_list();
    let Some(disk) = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
    else {
        return DiskStats::default();
    };
    let total = disk.total_space();
    let free = disk.available_space();
    let used = total.saturating_sub(free);
    DiskStats {
        total,
        used,
        free,
        used_percent: percent(used, total),
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
