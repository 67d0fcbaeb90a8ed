use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::nautica::{
    accounts, api,
    bridge::{
        session::SessionOptions,
        transport::{self, DialOptions},
    },
    config, logging, proxylist, router, server, telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.apply_env_overrides(std::env::var("PORT").ok(), std::env::var("DOMAIN").ok());

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        domain = %cfg.domain,
        dial = %cfg.bridge.dial,
        "nautica: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    // Collaborator state, owned here and handed to the API only.
    let accounts = Arc::new(accounts::AccountStore::load(&cfg.accounts.path)?);
    let proxies = Arc::new(proxylist::ProxyListStore::new());
    let source = proxylist::ProxyListSource::new(
        cfg.proxy_list.sources.clone(),
        cfg.proxy_list.fetch_timeout,
    )?;
    {
        let proxies = proxies.clone();
        // Not part of the task set: finishing must not look like a listener exiting.
        tokio::spawn(async move { source.refresh(&proxies).await });
    }

    let dialer = transport::dialer_by_name(
        &cfg.bridge.dial,
        DialOptions {
            buffer_size: cfg.bridge.buffer_size,
        },
    )?;
    let upgrades = router::UpgradeRouter::new(
        dialer,
        SessionOptions {
            dial_timeout: cfg.bridge.dial_timeout,
            close_timeout: cfg.bridge.close_timeout,
        },
    )?;

    let api = api::router(
        api::ApiState {
            domain: cfg.domain.clone(),
            port: cfg.listen_port().unwrap_or(0),
            accounts,
            proxies,
            prom,
        },
        cfg.public_dir.clone(),
    );

    let frontend = server::Frontend::new(
        upgrades,
        api,
        server::FrontendOptions {
            max_header_bytes: cfg.bridge.max_header_bytes,
            handshake_timeout: cfg.bridge.handshake_timeout,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();
    {
        let listen_addr = cfg.listen_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server::serve_with_shutdown(&listen_addr, frontend, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Sessions already relaying are detached and end with the process.
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
