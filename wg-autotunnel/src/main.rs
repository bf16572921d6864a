// WireGuard Auto-Tunnel Daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use wg_autotunnel::{
    backend::{create_backend, BackendAdapter},
    config::load_config,
    network_monitor::ConnectivityMonitor,
    ping::IcmpProbe,
    process_host::StateFileHost,
    service::{ServiceDeps, TunnelService},
    store::{SettingsStore, Store},
    tunnel::Timing,
    types::BackendMode,
};

#[derive(Parser)]
#[command(name = "wg-autotunnel")]
#[command(about = "Automatic WireGuard tunnel daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-autotunnel/config.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    // 2 threads is sufficient: the event loop, D-Bus and process spawns are all I/O bound
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-autotunnel")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    log::info!("Starting wg-autotunnel daemon");
    log::info!("Store: {:?}", config.general.store_path);
    log::info!("Run directory: {:?}", config.general.run_dir);

    let store = Arc::new(
        Store::open(&config.general.store_path).context("Failed to open settings store")?,
    );

    // Connectivity
    let monitor = ConnectivityMonitor::new()
        .await
        .context("Failed to create connectivity monitor")?;
    let initial = monitor.snapshot().await.unwrap_or_else(|e| {
        log::warn!("Failed to read initial connectivity: {}", e);
        Default::default()
    });
    let (network_tx, network_rx) = watch::channel(initial);

    let run_dir = config.general.run_dir.clone();
    let service = TunnelService::new(ServiceDeps {
        settings: store.clone(),
        tunnels: store.clone(),
        network: network_rx,
        host: Arc::new(StateFileHost::new(&run_dir)),
        probe: Arc::new(IcmpProbe),
        backends: Box::new(move |mode: BackendMode| -> Arc<dyn BackendAdapter> {
            create_backend(mode, &run_dir)
        }),
        timing: Timing {
            probe_timeout: config.ping.probe_timeout(),
            ..Timing::default()
        },
    });

    // Spawn connectivity monitor task
    // Store the handle so we can monitor it for failures
    let mut monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor.monitor(network_tx).await {
            log::error!("Connectivity monitor error: {}", e);
            // Return error to signal failure
            Err::<(), anyhow::Error>(e)
        } else {
            Ok(())
        }
    });

    service.restore_previous_state().await;
    service.start_orchestrator();

    let mut settings_rx = SettingsStore::subscribe(store.as_ref());
    let mut active_rx = service.registry().active_tunnels();
    let mut errors_rx = service.registry().errors();

    log::info!("Daemon started successfully");

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to set up SIGHUP handler")?;

    // Main event loop
    let result = loop {
        tokio::select! {
            // Shutdown signals
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break Ok(());
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break Ok(());
            }

            // Re-read the store after external edits
            _ = sighup.recv() => {
                log::info!("Received SIGHUP, reloading store");
                if let Err(e) = store.reload() {
                    log::error!("Failed to reload store: {:#}", e);
                }
            }

            // Monitor connectivity task for failures (fail-fast approach)
            monitor_result = &mut monitor_handle => {
                match monitor_result {
                    Ok(Ok(())) => {
                        log::error!("Connectivity monitor task exited unexpectedly");
                    }
                    Ok(Err(e)) => {
                        log::error!("Connectivity monitor task failed: {}", e);
                    }
                    Err(e) => {
                        log::error!("Connectivity monitor task panicked: {}", e);
                    }
                }
                break Err(anyhow::anyhow!(
                    "Connectivity monitor terminated, aborting daemon for systemd restart"
                ));
            }

            // Settings changes may select another backend or flip the kill switch
            res = settings_rx.changed() => {
                if res.is_err() {
                    break Err(anyhow::anyhow!("Settings store closed"));
                }
                service.follow_backend_setting().await;
                service.follow_kill_switch_setting().await;
            }

            // A deferred backend switch can happen once the last tunnel stops
            res = active_rx.changed() => {
                if res.is_err() {
                    break Err(anyhow::anyhow!("Tunnel state channel closed"));
                }
                let idle = active_rx.borrow_and_update().is_empty();
                if idle {
                    service.follow_backend_setting().await;
                }
            }

            // Surface backend failures
            failure = errors_rx.recv() => {
                match failure {
                    Ok(failure) => {
                        log::error!("Tunnel '{}' failed: {}", failure.tunnel.name, failure.error);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Missed {} tunnel error(s)", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break Err(anyhow::anyhow!("Tunnel error channel closed"));
                    }
                }
            }
        }
    };

    // Perform graceful shutdown
    log::info!("Shutting down gracefully...");
    monitor_handle.abort();
    service.shutdown().await;
    log::info!("Shutdown complete");

    result
}
