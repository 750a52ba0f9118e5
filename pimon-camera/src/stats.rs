use std::{path::Path, time::Duration};

use pimon_proto::{SystemStatsSnapshot, probe::HostProbe};
use time::{OffsetDateTime, UtcOffset, macros::format_description};
use tracing::warn;

pub const CPU_WINDOW: Duration = Duration::from_secs(1);

/// Take a snapshot of the host. Blocks for `cpu_window`.
pub fn sample_stats(
    probe: &mut HostProbe,
    disk_mount: &Path,
    cpu_window: Duration,
    offset: UtcOffset,
) -> SystemStatsSnapshot {
    let ram_usage = probe.memory_usage();
    let disk_usage = probe.disk_usage(disk_mount).unwrap_or_else(|| {
        warn!("no filesystem mounted at {}", disk_mount.display());
        0.0
    });
    let cpu_usage = probe.cpu_usage(cpu_window);

    SystemStatsSnapshot {
        cpu_usage,
        ram_usage,
        disk_usage,
        current_time: current_time(offset),
    }
}

/// Wall clock time as `YYYY-MM-DD HH:MM:SS` in the given offset.
pub fn current_time(offset: UtcOffset) -> String {
    OffsetDateTime::now_utc()
        .to_offset(offset)
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_default()
}
