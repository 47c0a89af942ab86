//! Host resource snapshot shared by heartbeats and the health monitor.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sysinfo::System;

use hostlink_core::now_millis;

/// Point-in-time host resource usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub load_average: [f64; 3],
    pub uptime_secs: u64,
    /// Unix milliseconds.
    pub collected_at: i64,
}

/// Supplies the current [`SystemHealth`]. Swapped for a fixed value in tests.
pub type HealthProvider = Arc<dyn Fn() -> SystemHealth + Send + Sync>;

/// A provider that always returns `health`.
pub fn fixed_provider(health: SystemHealth) -> HealthProvider {
    Arc::new(move || health.clone())
}

/// Samples the host through `sysinfo`.
///
/// CPU usage is computed between consecutive samples, so the first reading
/// after construction is zero.
pub struct SystemProbe {
    sys: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
        }
    }

    pub fn sample(&self) -> SystemHealth {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();
        #[allow(clippy::cast_precision_loss)]
        let memory_percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0) as f32
        };
        let load_average = if cfg!(unix) {
            let load = System::load_average();
            [load.one, load.five, load.fifteen]
        } else {
            [0.0; 3]
        };

        SystemHealth {
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            memory_percent,
            memory_used_bytes: used,
            memory_total_bytes: total,
            load_average,
            uptime_secs: System::uptime(),
            collected_at: now_millis(),
        }
    }

    /// Wrap the probe as a [`HealthProvider`].
    pub fn provider(self: Arc<Self>) -> HealthProvider {
        Arc::new(move || self.sample())
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Host name, falling back to `"unknown"`.
pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Operating system description, e.g. `"Linux 22.04 Ubuntu"`.
pub fn os_description() -> String {
    System::long_os_version()
        .or_else(System::name)
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}
