use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleet_watcher::command::{CommandHandler, CommandOutcome};
use fleet_watcher::config;
use fleet_watcher::container_driver::BollardDriver;
use fleet_watcher::notifier::Notifier;
use fleet_watcher::supervisor::Supervisor;

const CONFIG_FILE_PATH: &str = "config.json";
const LOG_DIR: &str = "restart_logs";
const WATCHER_LOG_FILE: &str = "watcher_events.log";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    info!("starting fleet watcher");

    let (config, shared) = config::load_and_validate(Path::new(CONFIG_FILE_PATH))
        .map_err(|e| format!("fatal startup error: {e}"))?;

    let driver = BollardDriver::connect().map_err(|e| format!("could not reach container runtime: {e}"))?;
    driver
        .ping()
        .await
        .map_err(|e| format!("could not reach container runtime: {e}"))?;
    let driver: Arc<dyn fleet_watcher::container_driver::ContainerDriver> = Arc::new(driver);

    let notifier = Notifier::new(
        config.secrets.telegram_bot_token.clone(),
        config.secrets.telegram_chat_id.clone(),
    );
    if let Notifier::Enabled(client) = &notifier {
        client
            .validate_token()
            .await
            .map_err(|e| format!("chat bot token rejected: {e}"))?;
    }
    let notifier = Arc::new(notifier);

    let command_handler = Arc::new(CommandHandler::new(Arc::clone(&driver), Arc::clone(&shared)));
    let command_config = config.clone();

    let mut supervisor = Supervisor::new(
        config,
        Arc::clone(&shared),
        Arc::clone(&driver),
        Arc::clone(&notifier),
        PathBuf::from(LOG_DIR),
        PathBuf::from(WATCHER_LOG_FILE),
    );

    let stop = CancellationToken::new();

    let supervisor_task = {
        let stop = stop.clone();
        tokio::spawn(async move { supervisor.run(stop).await })
    };

    let chat_task = notifier.spawn_update_listener(stop.clone()).map(|(handle, mut rx)| {
        let notifier = Arc::clone(&notifier);
        let command_handler = Arc::clone(&command_handler);
        let command_config = command_config.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match command_handler.handle(&msg.text, &command_config).await {
                    CommandOutcome::Response(text) => notifier.send_command_response(&text).await,
                    CommandOutcome::Help => notifier.send_help_response().await,
                    CommandOutcome::Unknown => notifier.send_unknown_command_response().await,
                }
            }
        });
        handle
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");
    stop.cancel();

    let _ = supervisor_task.await;
    if let Some(handle) = chat_task {
        let _ = handle.await;
    }

    info!("fleet watcher shut down cleanly");
    Ok(())
}

/// Orderly shutdown on SIGINT/SIGTERM. Only these signals trigger a clean
/// exit; any other unhandled error in a loop is self-healing and never
/// reaches this point.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
