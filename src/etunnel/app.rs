use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::etunnel::{
    acceptor::Acceptor,
    config::Config,
    logging,
    registry::Registry,
    relay::Multiplexer,
};

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let logrt = logging::init(&cfg.logging, cfg.debug)?;
    let _logrt_guard = logrt; // keep alive

    let registry = Arc::new(Registry::new());

    let acceptor = Acceptor::bind(cfg.acceptor_options(), registry.clone())
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    let multiplexer = Multiplexer::new(registry.clone(), cfg.relay_options());

    tracing::info!(
        listen_addr = %cfg.listen_addr,
        upstream = %cfg.upstream_addr,
        bind_addr = ?cfg.bind_addr,
        poll_interval = ?cfg.poll_interval,
        debug = cfg.debug,
        "etunnel: starting"
    );

    serve(acceptor, multiplexer, registry, shutdown_signal()).await
}

/// How long core tasks get to finish after shutdown before they are aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the acceptor and multiplexer until `signal` resolves or either task
/// exits, then drains them.
async fn serve(
    acceptor: Acceptor,
    multiplexer: Multiplexer,
    registry: Arc<Registry>,
    signal: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = JoinSet::new();
    tasks.spawn(multiplexer.run(shutdown_rx.clone()));
    tasks.spawn(acceptor.run(shutdown_rx.clone()));

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut result = Ok(());
    tokio::select! {
        _ = signal => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => tracing::warn!("shutdown: core task exited"),
                    Ok(Err(err)) => result = Err(err),
                    Err(join_err) => result = Err(join_err.into()),
                }
            }
        }
    }
    // The multiplexer may be parked on a stalled write while holding the
    // registry lock; nothing here may wait on that lock before the abort.
    let _ = shutdown_tx.send(true);

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        let closed = registry.clear().await;
        tracing::info!(closed, "shutdown: aborted");
    }

    result
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
