#![allow(clippy::cognitive_complexity)]

use anyhow::{Context, Result, anyhow};

mod config;

use crate::config::{
    cli::{self, Command, Parser},
    trace,
};
use ::config::RegistryConfig;
use registry::{RegistryClient, SessionState};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.registry_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match flatten(tokio::spawn(async move { start(config).await })).await {
            Err(err) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing registry config");
    let registry_cfg = RegistryConfig::parse(&config.config_path)?;
    info!(
        servers = ?registry_cfg.servers,
        root = %registry_cfg.root,
        "connecting to coordination service"
    );
    let client = RegistryClient::connect_nats(registry_cfg)
        .await
        .context("failed to connect registry client")?;

    let token = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(token.clone()));

    let result = match config.command {
        Command::Register {
            service,
            host,
            port,
        } => run_register(&client, &service, &host, port, token.clone()).await,
        Command::Resolve { service, follow } => {
            run_resolve(&client, &service, follow, token.clone()).await
        }
    };

    client.close().await;
    signal_task.abort();
    result
}

/// Advertise until ctrl-c or until the session is lost.
async fn run_register(
    client: &RegistryClient,
    service: &str,
    host: &str,
    port: u16,
    token: CancellationToken,
) -> Result<()> {
    let registration = client
        .register(service, host, port)
        .await
        .with_context(|| format!("failed to register {service} at {host}:{port}"))?;
    info!(node = %registration.node, "registered, waiting for shutdown signal");

    let mut session = client.subscribe_session();
    tokio::select! {
        _ = token.cancelled() => {
            debug!("shutdown requested");
        }
        res = session.wait_for(|s| s.is_terminal()) => {
            let state = res.map(|s| *s).unwrap_or(SessionState::Closed);
            return Err(anyhow!("coordination session {state}, registration lost"));
        }
    }

    let removed = client.unregister().await?;
    info!(node = %removed.node, "unregistered");
    Ok(())
}

/// Print the membership of `service`, and every change while following.
async fn run_resolve(
    client: &RegistryClient,
    service: &str,
    follow: bool,
    token: CancellationToken,
) -> Result<()> {
    if !follow {
        let addresses = client.resolve(service).await?;
        for address in &addresses {
            println!("{address}");
        }
        return Ok(());
    }

    let mut rx = client.watch(service).await?;
    loop {
        {
            let snapshot = rx.borrow_and_update();
            let addresses: Vec<String> =
                snapshot.addresses.iter().map(ToString::to_string).collect();
            println!("v{} [{}]", snapshot.version, addresses.join(", "));
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(anyhow!("membership watch for {service} ended"));
                }
            }
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
