use std::sync::Arc;

use drover::config::Config;
use drover::dispatch::ResultDispatcher;
use drover::memory::{ConversationMemory, InMemoryKv};
use drover::orchestrator::ExecutionOrchestrator;
use drover::reviewer::Reviewer;
use drover::runner::CommandRunner;
use drover::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("drover starting");

    let config = Arc::new(Config::from_env());
    let runner = Arc::new(CommandRunner::new(
        config.max_concurrent,
        config.max_output_bytes,
        config.worker_home.clone(),
        config.worker_debug,
    ));
    let store = Arc::new(InMemoryKv::new());
    let memory = Arc::new(ConversationMemory::new(store, config.memory_ttl));
    let reviewer = Reviewer::new(runner.clone(), config.worker_cli_path.clone());
    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        runner,
        memory.clone(),
        reviewer,
        config.clone(),
    ));
    let dispatcher = Arc::new(ResultDispatcher::new(config.webhook_secret.clone()));

    let state = Arc::new(AppState {
        orchestrator,
        dispatcher,
        memory,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", config.bind_addr);
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    tracing::info!("drover shutting down");
    Ok(())
}
