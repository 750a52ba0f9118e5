use serde::{Deserialize, Serialize};

pub mod msg;
#[cfg(feature = "probe")]
pub mod probe;

/// One resource usage report submitted by an agent.
///
/// Percentages are in `[0, 100]`, network counters are cumulative bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_sent: f64,
    pub network_received: f64,
}

impl MetricSample {
    /// Check the value ranges that deserialization alone cannot enforce.
    pub fn validate(&self) -> Result<(), SampleError> {
        let fields = [
            ("cpu_usage", self.cpu_usage, true),
            ("memory_usage", self.memory_usage, true),
            ("disk_usage", self.disk_usage, true),
            ("network_sent", self.network_sent, false),
            ("network_received", self.network_received, false),
        ];

        for (field, value, is_percent) in fields {
            if !value.is_finite() {
                return Err(SampleError::NonFinite { field });
            }
            if value < 0.0 {
                return Err(SampleError::Negative { field, value });
            }
            if is_percent && value > 100.0 {
                return Err(SampleError::PercentOutOfRange { field, value });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SampleError {
    #[error("field `{field}` must be a finite number")]
    NonFinite { field: &'static str },
    #[error("field `{field}` must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("field `{field}` must be a percentage in [0, 100], got {value}")]
    PercentOutOfRange { field: &'static str, value: f64 },
}

/// Point-in-time utilization of the camera host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatsSnapshot {
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    pub current_time: String,
}
