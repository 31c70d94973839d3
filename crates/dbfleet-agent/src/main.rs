// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::{env, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use dbfleet_logs::{
    config,
    gcp::GooglePubSubSubscriber,
    parser::PostgresLineParser,
    pipeline::setup_log_subscriber,
    stream::ParsedLogStreamItem,
    subscriber::LogSubscriber,
};

const CONFIG_PATH_ENV: &str = "DBFLEET_CONFIG";
const OUTPUT_BUFFER_LEN: usize = 1000;

#[tokio::main]
pub async fn main() -> ExitCode {
    let config_path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_FILE));

    let config = match config::get_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("Error loading config from {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level);
    debug!("Logging subsystem enabled");

    if config.servers.is_empty() {
        info!("No servers configured, nothing to do");
        return ExitCode::SUCCESS;
    }

    let cancel_token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (out, rx) = mpsc::channel(OUTPUT_BUFFER_LEN);
    tracker.spawn(write_output(rx));

    let subscribers: Vec<Arc<dyn LogSubscriber>> =
        vec![Arc::new(GooglePubSubSubscriber::from_config(&config))];

    let result = setup_log_subscriber(
        &config,
        &subscribers,
        Arc::new(PostgresLineParser),
        out,
        &cancel_token,
        &tracker,
    );

    let exit_code = match (result, config.test_run) {
        (Err(e), _) => {
            error!("Log subscriber setup failed: {e}");
            ExitCode::FAILURE
        }
        (Ok(()), true) => {
            info!(
                "Test run successful, log subscribers set up for {} servers",
                config.servers.len()
            );
            ExitCode::SUCCESS
        }
        (Ok(()), false) => {
            info!("Receiving logs for {} servers", config.servers.len());
            wait_for_shutdown_signal().await;
            ExitCode::SUCCESS
        }
    };

    shutdown(&cancel_token, &tracker).await;
    exit_code
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Writes each routed line as one JSON object per line on stdout.
async fn write_output(mut rx: mpsc::Receiver<ParsedLogStreamItem>) {
    while let Some(item) = rx.recv().await {
        let line = match serde_json::to_string(&item) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize log line for {}: {e}", item.identifier);
                continue;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}") {
            error!("Failed to write log line, stopping output: {e}");
            break;
        }
    }
    debug!("Output writer stopped");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                }
                return;
            }
            Err(e) => error!("Failed to listen for SIGTERM: {e}"),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
    }
}

async fn shutdown(cancel_token: &CancellationToken, tracker: &TaskTracker) {
    cancel_token.cancel();
    tracker.close();
    tracker.wait().await;
    debug!("All log subscribers stopped");
}
