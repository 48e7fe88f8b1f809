use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use bundle_broker::broker::Broker;
use bundle_broker::bundle::secrets::SecretPolicy;
use bundle_broker::cluster::{KubeClient, OrchestratorClient};
use bundle_broker::config::Config;
use bundle_broker::dao::{InMemoryDao, SubscriberDAO};
use bundle_broker::runtime::network::{IsolateNetworks, JoinNetworks};
use bundle_broker::runtime::SandboxManager;

#[derive(Parser)]
#[command(name = "bundle-broker")]
#[command(about = "Open Service Broker engine running bundle images as sandboxed pods")]
struct Args {
    /// Broker configuration file
    #[arg(long, default_value = "/etc/bundle-broker/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for the rolling log file
    #[arg(long, default_value = "/var/log/bundle-broker")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    std::fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("unable to create log dir {}", args.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "broker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    info!("Starting bundle broker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", args.config.display());

    let config = Config::load(&args.config)
        .with_context(|| format!("unable to load config {}", args.config.display()))?;

    let auth = config.cluster_auth().context("cluster auth")?;
    let client: Arc<dyn OrchestratorClient> =
        Arc::new(KubeClient::new(auth).context("cluster client")?);

    let mut sandbox = SandboxManager::new(Arc::clone(&client), config.broker.namespace.clone());
    if config.broker.join_networks {
        sandbox = sandbox
            .with_post_create_hook(Arc::new(JoinNetworks))
            .with_pre_destroy_hook(Arc::new(IsolateNetworks));
    }

    let secrets = Arc::new(SecretPolicy::new(
        config.broker.namespace.clone(),
        config.secrets.clone(),
    ));
    let dao: Arc<dyn SubscriberDAO> = Arc::new(InMemoryDao::new());

    let broker = Broker::new(
        client,
        Arc::new(sandbox),
        secrets,
        config.executor_config(),
        dao,
    )
    .await;
    let _broker = Arc::new(broker);

    info!(
        namespace = %config.broker.namespace,
        "broker ready; waiting for shutdown signal"
    );
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down");
    Ok(())
}
