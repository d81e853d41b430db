use anyhow::Context;
use clap::Parser;
use keyserve_server::{
    CliArgs, IssuerGenerator, KeyService, ServerHandle, Settings,
    server::telemetry::init_telemetry,
};
use std::{sync::Arc, thread::JoinHandle};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let settings = Settings::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&settings);

    let generator = IssuerGenerator::from_config(&settings.issuer)?;
    let service = KeyService::bind(&settings.server, Arc::new(generator))
        .with_context(|| format!("failed to bind {}", settings.server.server_addr))?;
    let handle = service.handle();
    let reactor = service
        .spawn()
        .context("failed to spawn reactor thread")?;

    // The reactor owns its thread; this runtime only waits for signals and
    // drives the asynchronous pool shutdown.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    let result = runtime.block_on(serve(reactor, handle));

    providers.shutdown();
    result
}

async fn serve(
    reactor: JoinHandle<keyserve_core::Result<()>>,
    handle: ServerHandle,
) -> anyhow::Result<()> {
    let mut reactor = tokio::task::spawn_blocking(move || reactor.join());

    let finished = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut reactor => {
            tracing::error!("Reactor exited before a shutdown signal");
            Some(joined)
        }
    };

    if let Err(e) = handle.shutdown().await {
        tracing::error!("Error during service shutdown: {e:?}");
    }

    let joined = match finished {
        Some(joined) => joined,
        None => reactor.await,
    };
    joined
        .context("failed to join reactor thread")?
        .map_err(|_| anyhow::anyhow!("reactor thread panicked"))??;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(settings: &Settings) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting issuance service on {} with full config: {:#?}",
            settings.server.server_addr,
            settings
        );
    } else {
        tracing::info!(
            "Starting issuance service on {} with {} workers",
            settings.server.server_addr,
            settings.server.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
