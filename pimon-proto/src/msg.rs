use serde::{Deserialize, Serialize};

use crate::MetricSample;

/// Event name used on the live-update channel.
pub const UPDATE_EVENT: &str = "update";

/// Envelope pushed to live-update subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub event: String,
    pub data: MetricSample,
}

impl LiveUpdate {
    pub fn update(data: MetricSample) -> Self {
        LiveUpdate {
            event: UPDATE_EVENT.to_owned(),
            data,
        }
    }
}

/// Acknowledgement returned by the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
}

impl IngestAck {
    pub fn received() -> Self {
        IngestAck {
            status: "received".to_owned(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn live_update_wire_shape() {
        let update = LiveUpdate::update(MetricSample {
            cpu_usage: 1.0,
            memory_usage: 2.0,
            disk_usage: 3.0,
            network_sent: 4.0,
            network_received: 5.0,
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["event"], "update");
        assert_eq!(value["data"]["disk_usage"], 3.0);
    }

    #[test]
    fn ack_wire_shape() {
        let json = serde_json::to_string(&IngestAck::received()).unwrap();
        assert_eq!(json, r#"{"status":"received"}"#);
    }
}
