mod video;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use pimon_proto::{SystemStatsSnapshot, probe::HostProbe};
use serde_json::{Value, json};

use crate::{
    AppState,
    stats::{CPU_WINDOW, sample_stats},
};

pub use video::video_feed;

const INDEX_PAGE: &str = include_str!("../../assets/index.html");

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Blocks for the CPU measurement window on the blocking pool.
pub async fn system_stats(
    State(state): State<AppState>,
) -> Result<Json<SystemStatsSnapshot>, StatsError> {
    let settings = state.settings.clone();
    let snapshot = tokio::task::spawn_blocking(move || {
        let mut probe = HostProbe::new();
        sample_stats(
            &mut probe,
            &settings.disk_mount,
            CPU_WINDOW,
            settings.local_offset,
        )
    })
    .await?;

    Ok(Json(snapshot))
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("stats sampling failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for StatsError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
