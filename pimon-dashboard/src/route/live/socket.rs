use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::SinkExt;
use pimon_proto::msg::LiveUpdate;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::AppState;

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let _tracker_token = state.live_shutdown.tracker.token();
    let cancellation_token = state.live_shutdown.token.child_token();

    debug!("live subscriber connected");
    let mut controller = LiveController {
        ws: socket,
        updates: state.history.subscribe(),
        cancellation_token,
    };

    while controller.next().await {}
    controller.ws.close().await.ok();
    debug!("live subscriber disconnected");
}

struct LiveController {
    ws: WebSocket,
    updates: broadcast::Receiver<LiveUpdate>,
    cancellation_token: CancellationToken,
}

impl LiveController {
    async fn close<T: IntoCloseFrame>(&mut self, msg: T) -> anyhow::Result<()> {
        let msg = msg.into_close_frame();
        match msg {
            Some(CloseFrame { code, ref reason }) if code != close_code::NORMAL => {
                debug!(
                    code,
                    %reason,
                    "closing websocket with error"
                );
            }
            _ => {}
        }
        self.ws.send(Message::Close(msg)).await?;
        Ok(())
    }

    async fn next(&mut self) -> bool {
        tokio::select! {
            msg = self.ws.recv() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        trace!(?frame, "websocket closed by subscriber");
                        false
                    }
                    Some(Ok(_)) => true, // subscribers have nothing to say
                    Some(Err(e)) => {
                        self.close(LiveWsError::Internal(e.to_string())).await.ok();
                        false
                    }
                    None => false,
                }
            }
            update = self.updates.recv() => {
                match update {
                    Ok(update) => {
                        if let Err(e) = self.push(&update).await {
                            self.close(e).await.ok();
                            return false;
                        }
                        true
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "live subscriber lagging, dropped oldest updates");
                        true
                    }
                    Err(RecvError::Closed) => {
                        self.close(LiveWsError::Shutdown).await.ok();
                        false
                    }
                }
            }
            _ = self.cancellation_token.cancelled() => {
                self.close(LiveWsError::Shutdown).await.ok();
                false
            }
        }
    }

    async fn push(&mut self, update: &LiveUpdate) -> Result<(), LiveWsError> {
        let text =
            serde_json::to_string(update).map_err(|e| LiveWsError::Internal(e.to_string()))?;
        trace!("pushing {text}");
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| LiveWsError::Internal(e.to_string()))
    }
}

trait IntoCloseFrame {
    fn into_close_frame(self) -> Option<CloseFrame>;
}

#[derive(Debug, thiserror::Error)]
enum LiveWsError {
    #[error("server is shutting down")]
    Shutdown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoCloseFrame for LiveWsError {
    fn into_close_frame(self) -> Option<CloseFrame> {
        Some(match self {
            LiveWsError::Shutdown => CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            },
            LiveWsError::Internal(reason) => CloseFrame {
                code: close_code::ERROR,
                reason: format!("internal error: {reason}").into(),
            },
        })
    }
}
