use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use eyre::{Context as _, eyre};
use helmsman_config::Config;
use helmsman_daemon::{ApiState, Daemon, Notifier, metrics, serve_api};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Run the upgrade orchestrator daemon", long_about = None)]
pub struct RunArgs {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "HELMSMAN_CONFIG")]
    config: PathBuf,
}

impl RunArgs {
    pub async fn run(self) -> eyre::Result<()> {
        let mut config = Config::load(&self.config)
            .wrap_err_with(|| format!("failed to load config {}", self.config.display()))?;
        config.validate().wrap_err("invalid configuration")?;

        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(config.tracing_directive())),
            )
            .init();

        let metrics_handle = PrometheusBuilder::new()
            .add_global_label("chain_id", config.chain_id.clone())
            .install_recorder()
            .context("failed to install metrics recorder")?;
        metrics::describe();

        let notifier = Arc::new(Notifier::from_config(&config));

        let addr = format!("{}:{}", config.host, config.http_port);
        let proposals_interval = config.watchers.upgrade_proposals_interval;
        let clients = config.clients.clone();
        let network = config.upgrade_registry.network.clone();

        let mut daemon = Daemon::new(config, notifier)?;
        daemon.init().await.wrap_err("daemon initialization failed")?;

        let client = helmsman_chain_client::ChainClient::new(
            &clients.host,
            clients.grpc_port,
            clients.cometbft_port,
            clients.timeout,
        )
        .map_err(|err| eyre!("failed to create chain client: {err}"))?;

        let api_state = Arc::new(ApiState {
            registry: daemon.registry(),
            client,
            network,
            status: daemon.status_handle(),
            metrics_handle,
            proposals_interval,
        });

        let cancel = CancellationToken::new();

        let mut api_handle = tokio::spawn(serve_api(api_state, addr, cancel.clone()));
        let daemon_cancel = cancel.clone();
        let mut daemon_handle = tokio::spawn(async move { daemon.run(daemon_cancel).await });

        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        // wait for either a signal or a task failure
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("received SIGINT, shutting down gracefully"),
            result = &mut daemon_handle => {
                match result {
                    Ok(Ok(())) => error!("daemon loop exited unexpectedly"),
                    Ok(Err(err)) => error!(error = %format!("{err:#}"), "daemon loop failed"),
                    Err(err) => error!(error = %err, "daemon task panicked"),
                }
            }
            result = &mut api_handle => {
                match result {
                    Ok(Ok(())) => error!("api server exited unexpectedly"),
                    Ok(Err(err)) => error!(error = %format!("{err:#}"), "api server failed"),
                    Err(err) => error!(error = %err, "api task panicked"),
                }
            }
        }

        cancel.cancel();
        // give both tasks a moment to drain before tearing them down
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !daemon_handle.is_finished() || !api_handle.is_finished() {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await;
        daemon_handle.abort();
        api_handle.abort();

        info!("shutdown complete");
        Ok(())
    }
}
