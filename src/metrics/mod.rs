use crate::model::{CpuTimes, CpuUsage, DiskUsage, MemoryUsage, Uptime};
use crate::platform::CollaboratorError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Disks, System};

pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org";

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn disk_usage(&self) -> Result<DiskUsage, CollaboratorError>;
    async fn memory_usage(&self) -> Result<MemoryUsage, CollaboratorError>;
    async fn uptime(&self) -> Result<Uptime, CollaboratorError>;
    /// Raw cumulative counters. Targets without them report `Unavailable`.
    async fn cpu_times(&self) -> Result<CpuTimes, CollaboratorError>;
    /// Usage since the previous refresh, used when counters are unavailable.
    async fn cpu_usage(&self) -> Result<CpuUsage, CollaboratorError>;
    async fn public_ip(&self) -> Result<String, CollaboratorError>;
}

pub struct SystemMetrics {
    sys: Mutex<System>,
    http: reqwest::Client,
    public_ip_url: String,
}

impl SystemMetrics {
    pub fn new(public_ip_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            sys: Mutex::new(System::new()),
            http,
            public_ip_url: public_ip_url.into(),
        })
    }
}

#[async_trait]
impl MetricsSource for SystemMetrics {
    async fn disk_usage(&self) -> Result<DiskUsage, CollaboratorError> {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()))
            .ok_or_else(|| CollaboratorError::unavailable("disk list"))?;
        let total = root.total_space();
        let free = root.available_space();
        Ok(disk_usage_from(total, free))
    }

    async fn memory_usage(&self) -> Result<MemoryUsage, CollaboratorError> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err(CollaboratorError::unavailable("memory stats"));
        }
        let used = sys.used_memory();
        let free = total.saturating_sub(used);
        let used_percent = used as f64 / total as f64 * 100.0;
        Ok(MemoryUsage {
            total,
            used,
            free,
            used_percent,
            free_percent: 100.0 - used_percent,
        })
    }

    async fn uptime(&self) -> Result<Uptime, CollaboratorError> {
        Ok(Uptime::from_secs(System::uptime()))
    }

    async fn cpu_times(&self) -> Result<CpuTimes, CollaboratorError> {
        read_cpu_times()
    }

    async fn cpu_usage(&self) -> Result<CpuUsage, CollaboratorError> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu();
        let used = f64::from(sys.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
        Ok(CpuUsage {
            used_percent: used,
            free_percent: 100.0 - used,
        })
    }

    async fn public_ip(&self) -> Result<String, CollaboratorError> {
        let resp = self
            .http
            .get(&self.public_ip_url)
            .send()
            .await
            .map_err(|err| CollaboratorError::failed("public ip lookup", err))?;
        if !resp.status().is_success() {
            return Err(CollaboratorError::failed("public ip lookup", resp.status()));
        }
        let body = resp
            .text()
            .await
            .map_err(|err| CollaboratorError::failed("public ip lookup", err))?;
        parse_public_ip(&body)
    }
}

fn disk_usage_from(total: u64, free: u64) -> DiskUsage {
    let used = total.saturating_sub(free);
    let (used_percent, free_percent) = if total == 0 {
        (0.0, 0.0)
    } else {
        let used_percent = used as f64 / total as f64 * 100.0;
        (used_percent, 100.0 - used_percent)
    };
    DiskUsage {
        total,
        used,
        free,
        used_percent,
        free_percent,
    }
}

pub fn parse_public_ip(body: &str) -> Result<String, CollaboratorError> {
    let candidate = body.trim();
    candidate
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| CollaboratorError::parse("public ip lookup", format!("not an address: {candidate:?}")))
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Result<CpuTimes, CollaboratorError> {
    let contents = std::fs::read_to_string("/proc/stat")
        .map_err(|err| CollaboratorError::failed("/proc/stat", err))?;
    parse_proc_stat(&contents).ok_or_else(|| CollaboratorError::parse("/proc/stat", "no cpu line"))
}

/// Aggregate tick counters from `host_statistics(HOST_CPU_LOAD_INFO)`.
#[cfg(target_os = "macos")]
#[allow(deprecated)]
fn read_cpu_times() -> Result<CpuTimes, CollaboratorError> {
    // mach/host_info.h and mach/machine.h
    const HOST_CPU_LOAD_INFO: libc::c_int = 3;
    const CPU_STATE_USER: usize = 0;
    const CPU_STATE_SYSTEM: usize = 1;
    const CPU_STATE_IDLE: usize = 2;
    const CPU_STATE_NICE: usize = 3;

    let mut info = std::mem::MaybeUninit::<libc::host_cpu_load_info>::zeroed();
    let mut count = (std::mem::size_of::<libc::host_cpu_load_info>()
        / std::mem::size_of::<libc::integer_t>()) as libc::mach_msg_type_number_t;
    // SAFETY: `info` is a zeroed host_cpu_load_info and `count` is its size
    // in integer_t units, which is what the kernel writes at most.
    let result = unsafe {
        libc::host_statistics(
            libc::mach_host_self(),
            HOST_CPU_LOAD_INFO,
            info.as_mut_ptr() as libc::host_info_t,
            &mut count,
        )
    };
    if result != libc::KERN_SUCCESS {
        return Err(CollaboratorError::failed(
            "host_statistics",
            format!("kern_return_t {result}"),
        ));
    }
    // SAFETY: zero-initialised and filled in by a successful call.
    let ticks = unsafe { info.assume_init() }.cpu_ticks;
    Ok(CpuTimes {
        user: u64::from(ticks[CPU_STATE_USER]),
        sys: u64::from(ticks[CPU_STATE_SYSTEM]),
        idle: u64::from(ticks[CPU_STATE_IDLE]),
        nice: u64::from(ticks[CPU_STATE_NICE]),
        ..CpuTimes::default()
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_cpu_times() -> Result<CpuTimes, CollaboratorError> {
    Err(CollaboratorError::unavailable("cpu counters"))
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
pub fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().unwrap_or(0))
        .collect();
    let field = |i: usize| fields.get(i).copied().unwrap_or(0);
    if fields.len() < 4 {
        return None;
    }
    Some(CpuTimes {
        user: field(0),
        nice: field(1),
        sys: field(2),
        idle: field(3),
        wait: field(4),
        irq: field(5),
        soft_irq: field(6),
        stolen: field(7),
    })
}
