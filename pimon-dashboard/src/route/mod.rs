mod live;

use axum::{
    Json,
    extract::State,
    response::{Html, Redirect},
};
use pimon_proto::msg::IngestAck;
use serde_json::{Value, json};
use tracing::trace;

use crate::{
    AppState,
    extract::ValidSample,
    render::{Dashboard, render_dashboard},
};

pub use live::live_ws;

const DASHBOARD_PAGE: &str = include_str!("../../assets/dashboard.html");

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn ingest(
    State(state): State<AppState>,
    ValidSample(sample): ValidSample,
) -> Json<IngestAck> {
    let subscribers = state.history.append(sample).await;
    trace!(subscribers, ?sample, "sample received");
    Json(IngestAck::received())
}

pub async fn dashboard_page(State(state): State<AppState>) -> Html<String> {
    Html(render_page(state.settings.refresh_interval_ms))
}

pub async fn dashboard_redirect() -> Redirect {
    Redirect::permanent("/dashboard/")
}

pub async fn figures(State(state): State<AppState>) -> Json<Dashboard> {
    let samples = state.history.snapshot().await;
    Json(render_dashboard(
        &samples,
        state.settings.malicious_cpu_threshold,
    ))
}

fn render_page(refresh_interval_ms: u64) -> String {
    DASHBOARD_PAGE.replace("{{refresh_interval_ms}}", &refresh_interval_ms.to_string())
}
