use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = routeplane::config::Cli::parse();
    let cmd = cli.command.clone().unwrap_or(routeplane::config::Command::Run);

    match cmd {
        routeplane::config::Command::Run => run_server(cli.config).await,
        routeplane::config::Command::Status(args) => {
            routeplane::status::run(&args.url, args.json).await
        }
    }
}

async fn run_server(config: routeplane::config::Config) -> Result<()> {
    let settings = routeplane::raft::RaftSettings::from_config(&config);
    let network = routeplane::raft::network_http::HttpNetworkFactory::try_new()?;
    let runtime =
        routeplane::raft::start_raft(&config.data_dir, config.node_id, &settings, network).await?;

    if config.bootstrap {
        runtime
            .raft
            .bootstrap_cluster(config.initial_members())
            .await?;
    }

    let _snapshots = routeplane::raft::snapshot_manager::spawn_snapshot_ticker(
        runtime.raft.raft(),
        settings.snapshot,
    );

    let control = routeplane::control::ControlApi::new(
        Arc::new(runtime.raft.clone()),
        runtime.fsm.clone(),
        config.write_timeout(),
    );
    let app = routeplane::http::build_router(control, Some(runtime.raft.raft()))
        .layer(TraceLayer::new_for_http());

    info!(
        node_id = config.node_id,
        bind = %config.bind,
        api_base_url = %config.api_base_url,
        data_dir = %config.data_dir.display(),
        version = routeplane::version::VERSION,
        "starting routeplane"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = runtime.raft.shutdown().await {
        warn!(error = %err, "raft shutdown");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
