use std::time::Duration;

use log::{debug, info, warn};
use pimon_proto::{MetricSample, msg::IngestAck};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::{ReconnectTimer, query::MetricsQuerent, transport::Endpoint};

pub const INGEST_PATH: &str = "/data";

/// Submit one sample per `interval` until `token` is cancelled.
///
/// Failed submissions are retried after the reconnect timer, the sample
/// that failed is dropped.
pub async fn run_push(
    querent: &mut MetricsQuerent,
    interval: Duration,
    endpoint: &Endpoint,
    mut retry: ReconnectTimer,
    token: &CancellationToken,
) {
    loop {
        let started = Instant::now();
        let sample = querent.query();

        let res = tokio::select! {
            _ = token.cancelled() => return,
            res = push_sample(endpoint, &sample) => res,
        };

        match res {
            Ok(()) => {
                debug!("sample pushed: {sample:?}");
                retry.reset();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep_until(started + interval) => {}
                }
            }
            Err(e) => {
                warn!("Error occurred: {e}");
                info!("Retrying in {} seconds...", retry.interval().as_secs());
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = retry.wait() => {}
                }
            }
        }
    }
}

pub async fn push_sample(endpoint: &Endpoint, sample: &MetricSample) -> anyhow::Result<()> {
    let resp = endpoint.post_json(INGEST_PATH, sample).await?;

    if !resp.status().is_success() {
        anyhow::bail!(
            "Ingest error: [{}]{}",
            resp.status().as_u16(),
            String::from_utf8_lossy(resp.body())
        );
    }

    let ack: IngestAck = serde_json::from_slice(resp.body())?;
    if ack != IngestAck::received() {
        anyhow::bail!("Ingest error: unexpected acknowledgement {:?}", ack.status);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::test::{local_endpoint, serve_once};
    use tokio::net::TcpListener;

    fn sample() -> MetricSample {
        MetricSample {
            cpu_usage: 12.5,
            memory_usage: 40.0,
            disk_usage: 70.0,
            network_sent: 1024.0,
            network_received: 2048.0,
        }
    }

    #[tokio::test]
    async fn push_sends_json_sample() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = local_endpoint(&listener);
        let server = tokio::spawn(serve_once(
            listener,
            b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 21\r\n\r\n{\"status\":\"received\"}",
        ));

        push_sample(&endpoint, &sample()).await.unwrap();

        let request = server.await.unwrap();
        let request = String::from_utf8(request).unwrap();
        let (_, body) = request.split_once("\r\n\r\n").unwrap();
        let sent: MetricSample = serde_json::from_str(body).unwrap();
        assert_eq!(sent, sample());
    }

    #[tokio::test]
    async fn rejected_sample_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = local_endpoint(&listener);
        tokio::spawn(serve_once(
            listener,
            b"HTTP/1.1 400 Bad Request\r\ncontent-length: 12\r\n\r\ninvalid data",
        ));

        let err = push_sample(&endpoint, &sample()).await.unwrap_err();
        assert!(err.to_string().contains("[400]invalid data"), "{err}");
    }
}
