use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use confique::Config;
use tokio::{net::TcpListener, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::history::HistoryHandle;

mod extract;
mod history;
mod render;
mod route;

#[derive(Debug, Parser)]
#[command(name = "pimon-dashboard")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config_path: Option<String>,
}

#[derive(Config, Debug)]
struct Conf {
    /// Port to listen on
    #[config(env = "PIMON_DASHBOARD_PORT", default = 5000)]
    port: u16,

    /// Bind address
    #[config(env = "PIMON_DASHBOARD_ADDRESS", default = "0.0.0.0")]
    address: IpAddr,

    /// Number of samples kept for the charts
    #[config(default = 100)]
    history_capacity: usize,

    /// CPU usage above which the malicious activity bar turns red
    #[config(default = 60.0)]
    malicious_cpu_threshold: f64,

    /// Chart refresh period of the dashboard page
    #[config(default = 1000)]
    refresh_interval_ms: u64,

    /// Updates buffered per live subscriber before it starts lagging
    #[config(default = 64)]
    live_update_buffer: usize,
}

fn config(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub history: HistoryHandle,
    pub settings: Arc<DashboardSettings>,
    pub live_shutdown: LiveShutdown,
}

#[derive(Debug)]
pub(crate) struct DashboardSettings {
    pub malicious_cpu_threshold: f64,
    pub refresh_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct LiveShutdown {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

impl AppState {
    fn new(conf: &Conf) -> Self {
        AppState {
            history: HistoryHandle::new(conf.history_capacity, conf.live_update_buffer),
            settings: Arc::new(DashboardSettings {
                malicious_cpu_threshold: conf.malicious_cpu_threshold,
                refresh_interval_ms: conf.refresh_interval_ms,
            }),
            live_shutdown: LiveShutdown {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
        }
    }
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(route::health))
        .route("/data", post(route::ingest))
        .route("/ws", get(route::live_ws))
        .route("/dashboard", get(route::dashboard_redirect))
        .route("/dashboard/", get(route::dashboard_page))
        .route("/dashboard/figures", get(route::figures))
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::new(Duration::from_secs(60)),
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    let config = config(&cli.config_path.unwrap_or("config.toml".to_owned()))?;
    trace!("using config {:?}", config);

    let addr = SocketAddr::from((config.address, config.port));
    info!("listening on {addr}");
    let listener = TcpListener::bind(addr).await?;

    let state = AppState::new(&config);

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state.live_shutdown.token.clone()))
        .await?;

    let live_tracker = state.live_shutdown.tracker.clone();
    live_tracker.close();

    trace!("waiting {} live connection shutdown", live_tracker.len());
    live_tracker.wait().await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                #[cfg(debug_assertions)]
                let default_log_level = format!(
                    "{}=debug,tower_http=debug,axum=trace",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                #[cfg(not(debug_assertions))]
                let default_log_level = format!(
                    "{}=info,tower_http=info,axum=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                default_log_level
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

async fn shutdown_signal(live_token: CancellationToken) {
    let _live_shutdown_guard = live_token.drop_guard();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
