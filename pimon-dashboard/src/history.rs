use std::{collections::VecDeque, sync::Arc};

use pimon_proto::{MetricSample, msg::LiveUpdate};
use tokio::sync::{RwLock, broadcast};

/// Bounded FIFO of the most recent samples.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl MetricHistory {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        MetricHistory {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the evicted one when the buffer was full.
    pub fn push(&mut self, sample: MetricSample) -> Option<MetricSample> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn to_vec(&self) -> Vec<MetricSample> {
        self.samples.iter().copied().collect()
    }
}

/// Shared handle over the history and the live-update channel.
///
/// Appending holds the write lock while broadcasting, so subscribers see
/// updates in the same order as the history stores them.
#[derive(Debug, Clone)]
pub struct HistoryHandle {
    history: Arc<RwLock<MetricHistory>>,
    updates: broadcast::Sender<LiveUpdate>,
}

impl HistoryHandle {
    pub fn new(capacity: usize, live_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(live_buffer.max(1));
        HistoryHandle {
            history: Arc::new(RwLock::new(MetricHistory::new(capacity))),
            updates,
        }
    }

    /// Store the sample and push it to every live subscriber.
    ///
    /// Returns the number of subscribers the update was delivered to.
    pub async fn append(&self, sample: MetricSample) -> usize {
        let mut history = self.history.write().await;
        history.push(sample);
        // no receivers is not an error here
        self.updates.send(LiveUpdate::update(sample)).unwrap_or(0)
    }

    pub async fn snapshot(&self) -> Vec<MetricSample> {
        self.history.read().await.to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_usage: f64) -> MetricSample {
        MetricSample {
            cpu_usage,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_sent: 0.0,
            network_received: 0.0,
        }
    }

    #[test]
    fn keeps_last_capacity_samples_in_order() {
        let mut history = MetricHistory::new(100);
        for i in 0..250 {
            history.push(sample(i as f64));
            assert!(history.to_vec().len() <= 100);
        }

        let expected: Vec<f64> = (150..250).map(|i| i as f64).collect();
        let stored: Vec<f64> = history.to_vec().iter().map(|s| s.cpu_usage).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn push_reports_eviction() {
        let mut history = MetricHistory::new(2);
        assert_eq!(history.push(sample(1.0)), None);
        assert_eq!(history.push(sample(2.0)), None);
        assert_eq!(history.push(sample(3.0)), Some(sample(1.0)));
        assert_eq!(history.to_vec(), vec![sample(2.0), sample(3.0)]);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut history = MetricHistory::new(0);
        history.push(sample(1.0));
        history.push(sample(2.0));
        assert_eq!(history.to_vec(), vec![sample(2.0)]);
    }

    #[tokio::test]
    async fn append_without_subscribers_is_noop_broadcast() {
        let handle = HistoryHandle::new(10, 4);
        assert_eq!(handle.append(sample(5.0)).await, 0);
        assert_eq!(handle.snapshot().await, vec![sample(5.0)]);
    }

    #[tokio::test]
    async fn subscribers_receive_updates_in_order() {
        let handle = HistoryHandle::new(10, 4);
        let mut rx = handle.subscribe();

        assert_eq!(handle.append(sample(1.0)).await, 1);
        handle.append(sample(2.0)).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, "update");
        assert_eq!(first.data, sample(1.0));
        assert_eq!(second.data, sample(2.0));
    }

    #[tokio::test]
    async fn concurrent_appends_respect_capacity() {
        let handle = HistoryHandle::new(100, 4);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..300 {
            let handle = handle.clone();
            tasks.spawn(async move { handle.append(sample(i as f64)).await });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(handle.snapshot().await.len(), 100);
    }
}
