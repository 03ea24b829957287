//! `spark-worker` -- fleet node agent.
//!
//! Registers this machine with the dispatcher ("lighthouse"), advertises
//! its job capacity, runs assigned jobs through the configured runner and
//! reports their outcomes. Stops gracefully on SIGTERM/SIGINT or when the
//! dispatcher sends `Shutdown`.
//!
//! # Environment variables
//!
//! | Variable       | Required | Default                     | Description                  |
//! |----------------|----------|-----------------------------|------------------------------|
//! | `SPARK_CONFIG` | no       | `/etc/laniakea/spark.json`  | Path to the JSON config file |
//! | `RUST_LOG`     | no       | `spark_worker=info,...`     | Tracing filter               |

use std::path::PathBuf;
use std::sync::Arc;

use spark_core::config::{Config, DEFAULT_CONFIG_PATH};
use spark_core::identity::{Identity, IdentitySource};
use spark_link::{Endpoint, Link, LinkConfig, WsConnector};
use spark_worker::engine::{Engine, EngineConfig};
use spark_worker::executor::RunnerExecutor;
use spark_worker::pool::Pool;
use spark_worker::shutdown::install_shutdown_handler;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spark_worker=info,spark_link=info,spark_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("SPARK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = Config::load(&config_path).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let identity = Identity::resolve(&IdentitySource::default(), config.machine_name.as_deref())
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Unable to determine machine identity");
            std::process::exit(1);
        });

    let endpoint = Endpoint::parse(&config.lighthouse_server).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid LighthouseServer");
        std::process::exit(1);
    });

    let Some(executor) = RunnerExecutor::new(&config.runner) else {
        tracing::error!("Runner command is empty");
        std::process::exit(1);
    };

    tracing::info!(
        config = %config_path.display(),
        endpoint = %endpoint,
        "Running on {} ({}), job capacity: {}",
        identity.machine_name,
        identity.machine_id,
        config.capacity.max_jobs(),
    );

    let cancel = install_shutdown_handler().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to install signal handlers");
        std::process::exit(1);
    });

    let link = Link::start(Arc::new(WsConnector), endpoint, LinkConfig::default());
    let pool = Pool::new(config.capacity.max_jobs() as usize, Arc::new(executor));
    let engine = Engine::new(
        EngineConfig::from_config(&config, identity),
        link,
        pool,
        cancel,
    );

    let report = engine.run().await;
    if !report.undelivered.is_empty() {
        tracing::warn!(
            count = report.undelivered.len(),
            "Exited with undelivered job results",
        );
    }
}
