#![forbid(unsafe_code)]

use std::{path::PathBuf, time::Duration};

use argh::FromArgs;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::transport::Endpoint;

mod push;
mod query;
mod transport;
mod watch;

#[derive(FromArgs, Debug)]
#[argh(description = "Reporting agent for the pimon metrics dashboard.")]
struct ReporterConfig {
    #[argh(
        option,
        short = 'a',
        default = "\"127.0.0.1:5000\".to_string()",
        description = "dashboard address to connect to"
    )]
    pub server_addr: String,
    #[argh(
        switch,
        short = 't',
        description = "use TLS to connect to the dashboard (https/wss instead of http/ws)"
    )]
    pub tls: bool,
    #[argh(
        switch,
        short = '6',
        description = "prefer IPv6 when resolving the dashboard address"
    )]
    pub prefer_ipv6: bool,
    #[argh(
        option,
        default = "1",
        description = "minimum interval between two retries in seconds"
    )]
    pub retry_minimum_interval: u64, // in seconds
    #[argh(
        option,
        default = "300",
        description = "maximum interval between two retries in seconds"
    )]
    pub retry_maximum_interval: u64, // in seconds
    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Push(PushArgs),
    Watch(WatchArgs),
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "push",
    description = "sample this machine and submit the samples to the dashboard"
)]
struct PushArgs {
    #[argh(
        option,
        short = 'i',
        default = "1",
        description = "interval between two samples in seconds"
    )]
    pub interval: u64,
    #[argh(
        option,
        description = "network interface to count bytes on, the default interface if omitted"
    )]
    pub interface: Option<String>,
    #[argh(
        option,
        default = "PathBuf::from(\"/\")",
        description = "mount point reported as disk usage"
    )]
    pub disk_mount: PathBuf,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "watch",
    description = "print samples as the dashboard receives them"
)]
struct WatchArgs {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    let cfg: ReporterConfig = argh::from_env();
    log::debug!("Reporter config: {cfg:#?}");

    let endpoint = Endpoint {
        server_addr: cfg.server_addr,
        tls: cfg.tls,
        prefer_ipv6: cfg.prefer_ipv6,
    };
    let retry = ReconnectTimer::new(
        Duration::from_secs(cfg.retry_minimum_interval),
        Duration::from_secs(cfg.retry_maximum_interval.max(cfg.retry_minimum_interval)),
    );

    let shutdown_token = CancellationToken::new();
    tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            shutdown_token.cancel();
        }
    });

    match cfg.command {
        Command::Push(args) => {
            let mut querent =
                query::MetricsQuerent::try_new(args.interface.as_deref(), args.disk_mount)?;
            log::info!(
                "pushing samples to {} every {}s (interface {})",
                endpoint.http_url(push::INGEST_PATH),
                args.interval.max(1),
                querent.interface_name().unwrap_or("<none>")
            );
            push::run_push(
                &mut querent,
                Duration::from_secs(args.interval.max(1)),
                &endpoint,
                retry,
                &shutdown_token,
            )
            .await;
        }
        Command::Watch(WatchArgs {}) => watch::run_watch(&endpoint, retry, &shutdown_token).await,
    }

    Ok(()) // means graceful shutdown
}

pub struct ReconnectTimer {
    minimal_interval: Duration,
    maximal_interval: Duration,
    curr_interval: Duration,
}

impl ReconnectTimer {
    pub fn new(minimal_interval: Duration, maximal_interval: Duration) -> Self {
        debug_assert!(minimal_interval <= maximal_interval);

        Self {
            minimal_interval,
            maximal_interval,
            curr_interval: minimal_interval,
        }
    }

    pub async fn wait(&mut self) {
        sleep(self.curr_interval).await;
        self.curr_interval = (self.curr_interval * 2).min(self.maximal_interval);
    }

    pub fn reset(&mut self) {
        self.curr_interval = self.minimal_interval;
    }

    pub fn interval(&self) -> Duration {
        self.curr_interval
    }
}
