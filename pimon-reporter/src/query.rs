use std::path::PathBuf;

use pimon_proto::{MetricSample, probe::HostProbe};

#[derive(Debug)]
pub struct MetricsQuerent {
    probe: HostProbe,
    net_interface: Option<netdev::Interface>,
    disk_mount: PathBuf,
}

impl MetricsQuerent {
    /// With `if_name` unset the default interface is used, and network
    /// counters read 0 if there is none.
    pub fn try_new(if_name: Option<&str>, disk_mount: PathBuf) -> anyhow::Result<Self> {
        let net_interface = match if_name {
            Some(name) => Some(
                netdev::get_interfaces()
                    .into_iter()
                    .find(|iface| iface.name == name)
                    .ok_or_else(|| anyhow::anyhow!("Network interface '{}' not found", name))?,
            ),
            None => match netdev::get_default_interface() {
                Ok(iface) => Some(iface),
                Err(e) => {
                    log::warn!("No default network interface, reporting 0 bytes: {e}");
                    None
                }
            },
        };

        let mut probe = HostProbe::new();
        // baseline for the first sample
        probe.cpu_usage_since_last();

        Ok(Self {
            probe,
            net_interface,
            disk_mount,
        })
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.net_interface.as_ref().map(|iface| iface.name.as_str())
    }

    /// CPU usage covers the time since the previous query.
    pub fn query(&mut self) -> MetricSample {
        let (network_sent, network_received) = self.query_network_bytes();
        let disk_usage = self.probe.disk_usage(&self.disk_mount).unwrap_or_else(|| {
            log::debug!("no filesystem mounted at {}", self.disk_mount.display());
            0.0
        });

        MetricSample {
            cpu_usage: self.probe.cpu_usage_since_last(),
            memory_usage: self.probe.memory_usage(),
            disk_usage,
            network_sent,
            network_received,
        }
    }

    /// Total bytes (sent, received) on the interface since boot.
    fn query_network_bytes(&mut self) -> (f64, f64) {
        let Some(iface) = self.net_interface.as_mut() else {
            return (0.0, 0.0);
        };
        if let Err(e) = iface.update_stats() {
            log::debug!("failed to update stats of {}: {e}", iface.name);
        }
        iface
            .stats
            .as_ref()
            .map(|stats| (stats.tx_bytes as f64, stats.rx_bytes as f64))
            .unwrap_or((0.0, 0.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_query_is_valid_sample() {
        let mut querent =
            MetricsQuerent::try_new(None, PathBuf::from("/")).expect("Failed to create querent");
        std::thread::sleep(std::time::Duration::from_millis(250));
        let sample = querent.query();

        println!("{:?}", sample);
        sample.validate().expect("sample passes ingest validation");
    }

    #[test]
    fn test_unknown_interface_is_rejected() {
        let res = MetricsQuerent::try_new(Some("definitely-not-an-iface0"), PathBuf::from("/"));
        assert!(res.is_err());
    }

    #[test]
    fn test_network_counters_do_not_go_backwards() {
        let mut querent =
            MetricsQuerent::try_new(None, PathBuf::from("/")).expect("Failed to create querent");
        let first = querent.query();
        let second = querent.query();

        assert!(second.network_sent >= first.network_sent);
        assert!(second.network_received >= first.network_received);
    }
}
