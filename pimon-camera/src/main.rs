use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use time::UtcOffset;
use tokio::{net::TcpListener, signal, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    camera::FrameReceiver,
    config::Conf,
    monitor::{CpuAlertState, HostCpuSampler},
};

mod camera;
mod config;
mod monitor;
mod remediation;
mod route;
mod stats;

const ALERT_BUFFER: usize = 4;
const CAPTURE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "pimon-camera")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config_path: Option<String>,
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the video and stats server
    Serve,

    /// Run the configured restore actions once and exit
    Remediate,
}

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub frames: FrameReceiver,
    pub settings: Arc<StatsSettings>,
    pub shutdown: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct StatsSettings {
    pub disk_mount: PathBuf,
    pub local_offset: UtcOffset,
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(route::index))
        .route("/health", get(route::health))
        .route("/video_feed", get(route::video_feed))
        .route("/system_stats", get(route::system_stats))
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::new(Duration::from_secs(60)),
        ))
        .with_state(state)
}

fn main() -> anyhow::Result<()> {
    // reading the local offset is only sound while the process is single threaded
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(local_offset))
}

async fn run(local_offset: UtcOffset) -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    let config = config::load(&cli.config_path.unwrap_or("config.toml".to_owned()))?;
    trace!("using config {:?}", config);

    match cli.commands {
        Commands::Serve => serve(config, local_offset).await?,
        Commands::Remediate => {
            let remediator = config.remediation.remediator();
            let failures = remediator.remediate().await;
            if failures > 0 {
                anyhow::bail!(
                    "{failures} of {} restore actions failed",
                    remediator.actions().len()
                );
            }
        }
    }

    Ok(())
}

async fn serve(config: Conf, local_offset: UtcOffset) -> anyhow::Result<()> {
    let settings = config.camera.settings();
    info!(source = ?settings.source, device = %settings.device, "opening camera");
    let capture = camera::spawn_capture(move || camera::open_source(&settings)).await?;

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (alert_tx, alert_rx) = mpsc::channel(ALERT_BUFFER);
    tracker.spawn(monitor::run_monitor(
        HostCpuSampler::new(stats::CPU_WINDOW),
        CpuAlertState::new(config.monitor.threshold, config.monitor.duration),
        config.monitor.poll_interval(),
        alert_tx,
        shutdown.child_token(),
    ));
    tracker.spawn(remediation::run_remediation(
        config
            .remediation
            .enabled
            .then(|| config.remediation.remediator()),
        alert_rx,
        shutdown.child_token(),
    ));

    let addr = SocketAddr::from((config.address, config.port));
    info!("listening on {addr}");
    let listener = TcpListener::bind(addr).await?;

    let state = AppState {
        frames: capture.frames(),
        settings: Arc::new(StatsSettings {
            disk_mount: config.stats.disk_mount.clone(),
            local_offset,
        }),
        shutdown: shutdown.clone(),
    };

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    tracker.close();
    trace!("waiting {} background tasks shutdown", tracker.len());
    tracker.wait().await;

    capture.stop(CAPTURE_STOP_TIMEOUT).await;

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

async fn shutdown_signal(token: CancellationToken) {
    let _shutdown_guard = token.drop_guard();

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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use pimon_proto::SystemStatsSnapshot;
    use tokio::sync::watch;
    use tower::ServiceExt;

    const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    fn test_state(frames: FrameReceiver) -> AppState {
        AppState {
            frames,
            settings: Arc::new(StatsSettings {
                disk_mount: PathBuf::from("/"),
                local_offset: UtcOffset::UTC,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn video_feed_streams_jpeg_parts() {
        let rgb = vec![200u8; 8 * 8 * 3];
        let jpeg = camera::encode_jpeg(&rgb, 8, 8, 80).unwrap();
        let (_tx, rx) = watch::channel(Some(jpeg));

        let res = app(test_state(rx)).oneshot(get("/video_feed")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = res.into_body();
        let part: Bytes = body
            .frame()
            .await
            .expect("a first part")
            .unwrap()
            .into_data()
            .unwrap();

        assert!(part.starts_with(PART_HEADER));
        assert!(part.ends_with(b"\r\n"));
        let jpeg = &part[PART_HEADER.len()..part.len() - 2];
        let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[tokio::test]
    async fn video_feed_from_capture_thread() {
        let capture = camera::spawn_capture(|| Ok(camera::TestPattern::new(32, 24, 70)))
            .await
            .unwrap();
        let state = test_state(capture.frames());
        let shutdown = state.shutdown.clone();

        let res = app(state).oneshot(get("/video_feed")).await.unwrap();
        let mut body = res.into_body();
        for _ in 0..2 {
            let part = body.frame().await.unwrap().unwrap().into_data().unwrap();
            assert!(part.starts_with(PART_HEADER));
        }

        shutdown.cancel();
        assert!(body.frame().await.is_none());
        capture.stop(CAPTURE_STOP_TIMEOUT).await;
    }

    #[tokio::test]
    async fn system_stats_reports_percentages() {
        let (_tx, rx) = watch::channel(None);
        let res = app(test_state(rx)).oneshot(get("/system_stats")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        for field in ["cpu_usage", "ram_usage", "disk_usage", "current_time"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }

        let stats: SystemStatsSnapshot = serde_json::from_value(value).unwrap();
        assert!((0.0..=100.0).contains(&stats.cpu_usage));
        assert!((0.0..=100.0).contains(&stats.ram_usage));
        assert!((0.0..=100.0).contains(&stats.disk_usage));
    }

    #[tokio::test]
    async fn index_embeds_stream_and_stats_polling() {
        let (_tx, rx) = watch::channel(None);
        let res = app(test_state(rx)).oneshot(get("/")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8_lossy(&body);
        assert!(page.contains(r#"src="/video_feed""#));
        assert!(page.contains("setInterval(fetchSystemStats, 2000)"));
    }
}
