use clap::Parser;
use solverbot_ingest::{intake::Intake, server::router};
use std::{io, net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Receives solver results and serves the bot catalog
#[derive(Parser, Debug)]
#[command(name = "solverbot-ingest", version)]
struct Cli {
    /// address to serve on
    #[arg(long, default_value = "0.0.0.0:7319")]
    addr: SocketAddr,

    /// result dir, also holds config.json, server.json and the `seen` log
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        }))
        .with_writer(io::stderr)
        .init();

    let intake = match Intake::open(&cli.dir) {
        Ok(intake) => Arc::new(intake),
        Err(error) => {
            error!(error = ?error, dir = ?cli.dir, "{error}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        dir = ?cli.dir,
        seen = intake.seen().committed_len(),
        "Result dir ready"
    );

    let listener = match tokio::net::TcpListener::bind(cli.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(error = ?error, addr = %cli.addr, "Could not bind: {error}");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %cli.addr, "Serving");

    let served = axum::serve(
        listener,
        router(intake).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupted, shutting down");
    })
    .await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "Server failed: {error}");
            ExitCode::FAILURE
        }
    }
}
