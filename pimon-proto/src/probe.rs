use std::{path::Path, time::Duration};

use sysinfo::{Disks, System};

/// Blocking sampler for host CPU, memory and disk utilization.
///
/// Every call refreshes only what it reads, so one probe can be kept around
/// for the lifetime of a sampling loop.
#[derive(Debug)]
pub struct HostProbe {
    system: System,
}

impl HostProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Global CPU usage in percent, measured over `window`.
    ///
    /// Blocks the calling thread for at least `window` (and never less than
    /// the minimum interval sysinfo needs between two CPU refreshes).
    pub fn cpu_usage(&mut self, window: Duration) -> f64 {
        self.system.refresh_cpu_usage();
        std::thread::sleep(window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        self.system.refresh_cpu_usage();
        clamp_percent(self.system.global_cpu_usage() as f64)
    }

    /// Global CPU usage in percent since the previous call, without blocking.
    ///
    /// The first call has no baseline and reads 0.
    pub fn cpu_usage_since_last(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        clamp_percent(self.system.global_cpu_usage() as f64)
    }

    /// Used memory in percent of total memory.
    pub fn memory_usage(&mut self) -> f64 {
        self.system.refresh_memory();
        percent(self.system.used_memory(), self.system.total_memory())
    }

    /// Used space in percent of the filesystem mounted at `mount_point`.
    ///
    /// Returns `None` if no disk is mounted there.
    pub fn disk_usage(&self, mount_point: &Path) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == mount_point)
            .map(|disk| {
                let total = disk.total_space();
                percent(total.saturating_sub(disk.available_space()), total)
            })
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    clamp_percent(used as f64 / total as f64 * 100.0)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
