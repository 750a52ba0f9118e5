use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use pimon_proto::msg::{LiveUpdate, UPDATE_EVENT};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Message, client::IntoClientRequest, protocol::CloseFrame},
};
use tokio_util::sync::CancellationToken;

use crate::{ReconnectTimer, transport::Endpoint};

pub const LIVE_PATH: &str = "/ws";

/// Follow the live-update channel, reconnecting on errors, until `token`
/// is cancelled.
pub async fn run_watch(endpoint: &Endpoint, mut retry: ReconnectTimer, token: &CancellationToken) {
    loop {
        let res: anyhow::Result<()> = async {
            let req = endpoint.ws_url(LIVE_PATH).into_client_request()?;
            let stream = endpoint.connect(req.uri()).await?;
            let (socket, _) = tokio_tungstenite::client_async(req, stream).await?;
            info!("subscribed to {}", endpoint.ws_url(LIVE_PATH));
            retry.reset();

            follow_updates(socket, token, log_update).await
        }
        .await;

        match res {
            Ok(()) => return,
            Err(e) => {
                warn!("Error occurred: {e}");
                info!("Reconnecting in {} seconds...", retry.interval().as_secs());
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = retry.wait() => {}
                }
            }
        }
    }
}

fn log_update(update: LiveUpdate) {
    let sample = update.data;
    info!(
        "cpu {:.1}% | memory {:.1}% | disk {:.1}% | sent {} B | received {} B",
        sample.cpu_usage,
        sample.memory_usage,
        sample.disk_usage,
        sample.network_sent,
        sample.network_received
    );
}

/// Hand every update event to `on_update`.
///
/// Returns `Ok` once `token` is cancelled and the socket is closed, and an
/// error if the server goes away first.
pub async fn follow_updates<S, F>(
    mut socket: WebSocketStream<S>,
    token: &CancellationToken,
    mut on_update: F,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(LiveUpdate),
{
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => {
                let _ = socket.close(None).await;
                return Ok(());
            }
            msg = socket.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<LiveUpdate>(&text) {
                Ok(update) if update.event == UPDATE_EVENT => on_update(update),
                Ok(update) => debug!("ignoring event {:?}", update.event),
                Err(e) => warn!("malformed live update: {e}"),
            },
            Some(Ok(Message::Close(frame))) => {
                let _ = socket.flush().await;
                match frame {
                    Some(CloseFrame { code, reason }) => {
                        anyhow::bail!("WebSocket closed by server: code={code:?}, reason={reason}")
                    }
                    None => anyhow::bail!("WebSocket closed by server"),
                }
            }
            Some(Ok(_)) => {} // pings are answered by tungstenite
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("WebSocket stream ended"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pimon_proto::MetricSample;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn update(cpu_usage: f64) -> Message {
        let update = LiveUpdate::update(MetricSample {
            cpu_usage,
            memory_usage: 1.0,
            disk_usage: 2.0,
            network_sent: 3.0,
            network_received: 4.0,
        });
        Message::text(serde_json::to_string(&update).unwrap())
    }

    /// Accept one subscriber, send `messages`, optionally close, then wait
    /// for the subscriber to go away.
    async fn serve(listener: TcpListener, messages: Vec<Message>, close: bool) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for msg in messages {
            ws.send(msg).await.unwrap();
        }
        if close {
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "server shutdown".into(),
            }))
            .await
            .unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    }

    async fn subscribe(addr: std::net::SocketAddr) -> WebSocketStream<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = tokio_tungstenite::client_async(format!("ws://{addr}{LIVE_PATH}"), stream)
            .await
            .unwrap();
        socket
    }

    #[tokio::test]
    async fn updates_until_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![
                update(10.0),
                Message::text(r#"{"event":"other","data":{"cpu_usage":0,"memory_usage":0,"disk_usage":0,"network_sent":0,"network_received":0}}"#),
                Message::text("not json"),
                update(20.0),
            ],
            true,
        ));

        let mut seen = Vec::new();
        let res = follow_updates(subscribe(addr).await, &CancellationToken::new(), |u| {
            seen.push(u.data.cpu_usage)
        })
        .await;

        let err = res.unwrap_err();
        assert!(err.to_string().contains("server shutdown"), "{err}");
        assert_eq!(seen, vec![10.0, 20.0]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_closes_the_subscription() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, vec![update(42.0)], false));

        let token = CancellationToken::new();
        let mut seen = 0;
        follow_updates(subscribe(addr).await, &token, |_| {
            seen += 1;
            token.cancel();
        })
        .await
        .unwrap();

        assert_eq!(seen, 1);
        server.await.unwrap();
    }
}
