use std::sync::Arc;

use anyhow::Context;
use botpanel_agent::{ClientOptions, CommandMessenger, LogSink, Supervisor};
use botpanel_control::{
    api, credential_store::CredentialStore, lifecycle::LifecycleManager, settings::Settings,
    state::AppState,
};
use tracing_subscriber::prelude::*;

fn init_tracing(settings: &Settings) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(log_dir) = &settings.log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "botpanel.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(Some(guard))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let _log_guard = init_tracing(&settings)?;

    let store = CredentialStore::open(&settings.data_root)
        .await
        .context("data root is unusable")?;
    let logs = LogSink::with_file(settings.console_log_path())
        .await
        .with_context(|| format!("open {}", settings.console_log_path().display()))?;

    let messenger = Arc::new(CommandMessenger::new(settings.client.clone(), logs.clone()));
    let supervisor = Supervisor::new(messenger, settings.supervisor, logs.clone());
    let manager = LifecycleManager::open(store, supervisor, logs, ClientOptions::default()).await;
    manager.recover(settings.resume_on_boot).await;

    let app = api::router(AppState {
        manager: manager.clone(),
    });
    tracing::info!(
        addr = %settings.bind,
        data_root = %settings.data_root.display(),
        client = %settings.client.command,
        "botpanel HTTP listening"
    );
    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("bind {}", settings.bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}
