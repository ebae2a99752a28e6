#![doc = include_str!("../README.md")]

mod config;
mod echo;
mod telemetry;

use clap::Parser;
use config::{CliArgs, EchoConfig};
use echo::EchoProcessor;
use ferroid_pubsub::{Broker, InMemoryBroker, RpcClient, RpcServer};
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = EchoConfig::try_from(args)?;

    telemetry::init_tracing();
    log_startup_info(&config);

    let broker = Arc::new(InMemoryBroker::with_delivery_order(config.reorder));

    let server = RpcServer::new(
        Arc::clone(&broker),
        &config.project_id,
        &config.topics.server_subscription,
        &config.topics.request,
        &config.topics.response,
        config.rpc.clone(),
    )?;
    server.initialize(None).await?;
    server.startup(EchoProcessor {
        stream_chunks: config.stream_chunks,
    })?;

    let client = RpcClient::new(
        broker,
        &config.project_id,
        &config.topics.response,
        &config.topics.request,
        config.rpc.clone(),
    )?;
    client.initialize(None).await?;
    client.startup()?;

    let outcome = tokio::select! {
        result = run_demo(&client, &config) => result,
        () = shutdown_signal() => Ok(()),
    };

    // Client first: it stops consuming responses before the server stops
    // producing them.
    client.shutdown().await;
    server.shutdown().await;
    client.cleanup().await?;
    server.cleanup().await?;

    tracing::info!("Echo demo shut down successfully");
    outcome
}

async fn run_demo<B: Broker>(client: &RpcClient<B>, config: &EchoConfig) -> anyhow::Result<()> {
    let timeout = config.rpc.default_timeout;

    let calls = (0..config.requests).map(|_| client.submit(config.payload.clone(), None, timeout));
    let mut failures = 0;
    for (i, reply) in join_all(calls).await.into_iter().enumerate() {
        match reply {
            Ok(reply) => tracing::info!(request = i, "Reply: {}", String::from_utf8_lossy(&reply)),
            Err(e) => {
                failures += 1;
                tracing::error!(request = i, "Request failed: {e}");
            }
        }
    }

    let mut stream = client
        .submit_stream(config.payload.clone(), None, timeout)
        .await?;
    let mut chunks = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        tracing::info!(chunk = chunks, "Stream chunk: {}", String::from_utf8_lossy(&chunk));
        chunks += 1;
    }
    tracing::info!(chunks, "Stream complete");

    if failures > 0 {
        anyhow::bail!("{failures} of {} requests failed", config.requests);
    }
    Ok(())
}

fn log_startup_info(config: &EchoConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting echo demo with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting echo demo: {} requests, {:?} delivery",
            config.requests,
            config.reorder
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
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
