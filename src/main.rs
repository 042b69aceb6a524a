use clap::Parser;
use plotpull::api::ApiClient;
use plotpull::cli::Cli;
use plotpull::config::Config;
use plotpull::processor::{Processor, ProcessorConfig, RecheckIntervals};
use plotpull::{logging, status};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = config.ensure_directories() {
        eprintln!("{err}");
        std::process::exit(1);
    }
    if let Err(err) = logging::init(&config.logs_dir, config.verbose) {
        eprintln!("failed to initialise logging: {err}");
        std::process::exit(1);
    }

    tracing::info!(
        api_key = %logging::redact_token(&config.api_key),
        api_url = %config.api_url,
        plot_dirs = ?config.plot_dirs,
        logs_dir = %config.logs_dir.display(),
        "plotpull starting"
    );

    let root = CancellationToken::new();
    spawn_signal_watcher(root.clone());
    spawn_stdin_watcher(root.clone());

    let (status_tx, status_rx) = status::channel();
    tokio::spawn(status::log_summaries(status_rx, root.child_token()));

    let api = ApiClient::new(config.api_key.clone(), config.api_url.clone());
    let mut processor = Processor::new(
        api,
        ProcessorConfig {
            plot_dirs: config.plot_dirs.clone(),
            frequency: config.check_frequency,
            max_downloads: config.max_downloads,
            recheck: RecheckIntervals::default(),
        },
        status_tx,
    );

    tracing::info!(order = %config.order_id, "loading plots, please wait");
    match processor.start(root.clone(), &config.order_id).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, "error in the plot processor");
            std::process::exit(1);
        }
    }
}

/// SIGINT and SIGTERM request a graceful shutdown: in-flight downloads are
/// cancelled, flushed and resumed on the next run.
fn spawn_signal_watcher(root: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutting down");
        root.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::warn!(error = %err, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Typing `q` followed by ENTER also requests a graceful shutdown.
fn spawn_stdin_watcher(root: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == "q" {
                tracing::info!("shutting down");
                root.cancel();
                return;
            }
        }
    });
}
