//! sysinfo-backed providers for the host's own resources

use super::{Domain, ResourceStats, ResourceStatsProvider};
use crate::config::SystemLimits;
use crate::errors::ResourceError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Networks, Pid, ProcessesToUpdate, System};

/// Run a blocking counter read off the async workers.
async fn blocking<T, F>(domain: Domain, read: F) -> Result<T, ResourceError>
where
    F: FnOnce() -> Result<T, ResourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(read)
        .await
        .map_err(|e| ResourceError::read(domain, format!("reader task failed: {}", e)))?
}

/// Physical memory in use across the system.
pub struct MemoryProvider {
    system: Arc<Mutex<System>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceStatsProvider for MemoryProvider {
    fn domain(&self) -> Domain {
        Domain::Memory
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        let system = Arc::clone(&self.system);
        blocking(Domain::Memory, move || {
            let mut system = system.lock();
            system.refresh_memory();
            let total = system.total_memory();
            if total == 0 {
                return Err(ResourceError::read(Domain::Memory, "total memory reported as 0"));
            }
            Ok(
                ResourceStats::new(system.used_memory() as f64, total as f64, "bytes")
                    .with_meta("available", system.available_memory()),
            )
        })
        .await
    }
}

/// Global CPU utilisation. The first reading after construction is 0 because
/// sysinfo needs two refreshes to compute a delta.
pub struct CpuProvider {
    system: Arc<Mutex<System>>,
}

impl CpuProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for CpuProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceStatsProvider for CpuProvider {
    fn domain(&self) -> Domain {
        Domain::Cpu
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        let system = Arc::clone(&self.system);
        blocking(Domain::Cpu, move || {
            let mut system = system.lock();
            system.refresh_cpu_usage();
            Ok(
                ResourceStats::new(system.global_cpu_usage() as f64, 100.0, "percent")
                    .with_meta("cores", system.cpus().len()),
            )
        })
        .await
    }
}

struct RateState<T> {
    source: T,
    last: Instant,
}

/// Aggregate network throughput against a configured bandwidth.
pub struct NetworkProvider {
    state: Arc<Mutex<RateState<Networks>>>,
    max_bytes_per_sec: u64,
}

impl NetworkProvider {
    pub fn new(max_bytes_per_sec: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateState {
                source: Networks::new_with_refreshed_list(),
                last: Instant::now(),
            })),
            max_bytes_per_sec,
        }
    }
}

#[async_trait::async_trait]
impl ResourceStatsProvider for NetworkProvider {
    fn domain(&self) -> Domain {
        Domain::Network
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        let state = Arc::clone(&self.state);
        let max = self.max_bytes_per_sec as f64;
        blocking(Domain::Network, move || {
            let mut state = state.lock();
            state.source.refresh(true);
            let elapsed = state.last.elapsed().as_secs_f64().max(1e-3);
            state.last = Instant::now();

            let (rx, tx) = state
                .source
                .iter()
                .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                    (rx + data.received(), tx + data.transmitted())
                });
            let rate = (rx + tx) as f64 / elapsed;
            Ok(ResourceStats::new(rate, max, "bytes/s")
                .with_meta("received", rx)
                .with_meta("transmitted", tx))
        })
        .await
    }
}

/// Disk throughput of this process against a configured budget.
pub struct DiskIoProvider {
    state: Arc<Mutex<RateState<System>>>,
    pid: Pid,
    max_bytes_per_sec: u64,
}

impl DiskIoProvider {
    pub fn new(max_bytes_per_sec: u64) -> Result<Self, ResourceError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| ResourceError::Unavailable(format!("current pid: {}", e)))?;
        Ok(Self {
            state: Arc::new(Mutex::new(RateState {
                source: System::new(),
                last: Instant::now(),
            })),
            pid,
            max_bytes_per_sec,
        })
    }
}

#[async_trait::async_trait]
impl ResourceStatsProvider for DiskIoProvider {
    fn domain(&self) -> Domain {
        Domain::DiskIo
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        let state = Arc::clone(&self.state);
        let pid = self.pid;
        let max = self.max_bytes_per_sec as f64;
        blocking(Domain::DiskIo, move || {
            let mut state = state.lock();
            state
                .source
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            let elapsed = state.last.elapsed().as_secs_f64().max(1e-3);
            state.last = Instant::now();

            let process = state
                .source
                .process(pid)
                .ok_or_else(|| ResourceError::read(Domain::DiskIo, "own process not listed"))?;
            let usage = process.disk_usage();
            let rate = (usage.read_bytes + usage.written_bytes) as f64 / elapsed;
            Ok(ResourceStats::new(rate, max, "bytes/s")
                .with_meta("read_bytes", usage.read_bytes)
                .with_meta("written_bytes", usage.written_bytes))
        })
        .await
    }
}

/// Open file descriptors of this process against the soft rlimit.
pub struct FileHandleProvider {
    fallback_max: u64,
}

impl FileHandleProvider {
    pub fn new(fallback_max: u64) -> Self {
        Self { fallback_max }
    }

    fn limit(&self) -> u64 {
        #[cfg(unix)]
        {
            use nix::sys::resource::{getrlimit, Resource};
            if let Ok((soft, _hard)) = getrlimit(Resource::RLIMIT_NOFILE) {
                let soft = soft as u64;
                // RLIM_INFINITY reads as u64::MAX
                if soft > 0 && soft < u64::MAX / 2 {
                    return soft;
                }
            }
        }
        self.fallback_max
    }
}

#[cfg(target_os = "linux")]
const FD_DIR: Option<&str> = Some("/proc/self/fd");
#[cfg(target_os = "macos")]
const FD_DIR: Option<&str> = Some("/dev/fd");
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const FD_DIR: Option<&str> = None;

fn open_handles() -> Result<u64, ResourceError> {
    let dir = FD_DIR.ok_or_else(|| {
        ResourceError::Unavailable("open handle count not supported on this platform".to_string())
    })?;
    std::fs::read_dir(dir)
        .map(|entries| entries.count() as u64)
        .map_err(|e| ResourceError::read(Domain::FileHandles, e.to_string()))
}

#[async_trait::async_trait]
impl ResourceStatsProvider for FileHandleProvider {
    fn domain(&self) -> Domain {
        Domain::FileHandles
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        let limit = self.limit();
        let open = blocking(Domain::FileHandles, open_handles).await?;
        // the read_dir handle itself is counted; it is closed again by now
        Ok(ResourceStats::new(open as f64, limit as f64, "handles"))
    }
}

/// Providers for every OS-backed domain. Connections come from the host's
/// [`ConcurrencyLimiter`](super::ConcurrencyLimiter) and are not included.
pub fn system_providers(limits: &SystemLimits) -> Vec<Arc<dyn ResourceStatsProvider>> {
    let mut providers: Vec<Arc<dyn ResourceStatsProvider>> = vec![
        Arc::new(MemoryProvider::new()),
        Arc::new(CpuProvider::new()),
        Arc::new(NetworkProvider::new(limits.network_bytes_per_sec)),
        Arc::new(FileHandleProvider::new(limits.max_file_handles)),
    ];
    match DiskIoProvider::new(limits.disk_io_bytes_per_sec) {
        Ok(disk) => providers.push(Arc::new(disk)),
        Err(e) => tracing::warn!(error = %e, "Disk I/O provider unavailable"),
    }
    providers
}
