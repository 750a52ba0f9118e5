//! Sustained high CPU detection.
//!
//! The monitor only raises [`CpuAlert`]s; acting on them is the job of
//! [`crate::remediation`].

use std::time::Duration;

use pimon_proto::probe::HostProbe;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuAlert {
    /// The sample that completed the streak
    pub cpu_usage: f64,
    pub consecutive: u32,
    pub threshold: f64,
}

/// Counter of consecutive samples above `threshold`.
#[derive(Debug, Clone)]
pub struct CpuAlertState {
    threshold: f64,
    duration: u32,
    count: u32,
}

impl CpuAlertState {
    /// `duration` is the number of consecutive samples needed, at least one.
    pub fn new(threshold: f64, duration: u32) -> Self {
        Self {
            threshold,
            duration: duration.max(1),
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Feed one sample. Returns an alert, and resets the counter, once the
    /// streak reaches `duration`.
    pub fn observe(&mut self, cpu_usage: f64) -> Option<CpuAlert> {
        if cpu_usage > self.threshold {
            self.count += 1;
        } else {
            self.count = 0;
        }

        if self.count >= self.duration {
            let alert = CpuAlert {
                cpu_usage,
                consecutive: self.count,
                threshold: self.threshold,
            };
            self.count = 0;
            Some(alert)
        } else {
            None
        }
    }
}

/// Blocking CPU usage measurement.
pub trait CpuSampler: Send + 'static {
    fn sample(&mut self) -> f64;
}

pub struct HostCpuSampler {
    probe: HostProbe,
    window: Duration,
}

impl HostCpuSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            probe: HostProbe::new(),
            window,
        }
    }
}

impl CpuSampler for HostCpuSampler {
    fn sample(&mut self) -> f64 {
        self.probe.cpu_usage(self.window)
    }
}

/// Sample forever, one measurement followed by `poll_interval` of sleep,
/// until `token` is cancelled.
pub async fn run_monitor<S: CpuSampler>(
    mut sampler: S,
    mut state: CpuAlertState,
    poll_interval: Duration,
    alerts: mpsc::Sender<CpuAlert>,
    token: CancellationToken,
) {
    debug!("cpu monitor started");

    loop {
        let measured = tokio::select! {
            _ = token.cancelled() => break,
            res = tokio::task::spawn_blocking(move || {
                let usage = sampler.sample();
                (sampler, usage)
            }) => res,
        };

        let usage = match measured {
            Ok((returned, usage)) => {
                sampler = returned;
                usage
            }
            Err(e) => {
                error!("cpu sampler failed, monitor stopped: {e}");
                return;
            }
        };

        if let Some(alert) = state.observe(usage) {
            warn!(
                cpu_usage = alert.cpu_usage,
                threshold = alert.threshold,
                consecutive = alert.consecutive,
                "sustained high cpu usage"
            );
            match alerts.try_send(alert) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("remediation still busy, alert dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("no remediation handler, alert dropped");
                }
            }
        } else {
            trace!(usage, count = state.count(), "cpu sampled");
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!("cpu monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<f64>);

    impl CpuSampler for Scripted {
        fn sample(&mut self) -> f64 {
            self.0.pop_front().unwrap_or(0.0)
        }
    }

    fn fired(state: &mut CpuAlertState, samples: &[f64]) -> Vec<usize> {
        samples
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| state.observe(s).map(|_| i))
            .collect()
    }

    #[test]
    fn three_consecutive_samples_fire_once() {
        let mut state = CpuAlertState::new(45.0, 3);
        assert_eq!(fired(&mut state, &[50.0, 50.0, 50.0]), vec![2]);
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn dip_below_threshold_restarts_streak() {
        let mut state = CpuAlertState::new(45.0, 3);
        assert_eq!(fired(&mut state, &[50.0, 40.0, 50.0, 50.0, 50.0]), vec![4]);
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn threshold_itself_is_not_over() {
        let mut state = CpuAlertState::new(45.0, 3);
        assert!(fired(&mut state, &[45.0, 45.0, 45.0, 45.0]).is_empty());
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn long_streak_fires_every_duration_samples() {
        let mut state = CpuAlertState::new(45.0, 3);
        assert_eq!(fired(&mut state, &[90.0; 7]), vec![2, 5]);
        assert_eq!(state.count(), 1);
    }

    #[test]
    fn alert_carries_streak_details() {
        let mut state = CpuAlertState::new(45.0, 2);
        state.observe(60.0);
        assert_eq!(
            state.observe(70.0),
            Some(CpuAlert {
                cpu_usage: 70.0,
                consecutive: 2,
                threshold: 45.0
            })
        );
    }

    #[tokio::test]
    async fn monitor_emits_alerts_and_stops_on_cancel() {
        let sampler = Scripted(VecDeque::from([50.0, 40.0, 50.0, 50.0, 50.0]));
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let task = tokio::spawn(run_monitor(
            sampler,
            CpuAlertState::new(45.0, 3),
            Duration::from_millis(1),
            tx,
            token.clone(),
        ));

        let alert = rx.recv().await.expect("one alert");
        assert_eq!(alert.consecutive, 3);

        token.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
