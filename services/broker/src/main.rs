//! AWS Service Broker
//!
//! Serves the OSB v2 API. Runs on the in-process backends; the catalog is
//! seeded from `--catalog-file`.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use aws_service_broker::api;
use aws_service_broker::broker::CloudClients;
use aws_service_broker::config::{load_catalog, overrides_from_env};
use aws_service_broker::memory::{InMemoryDataStore, LocalCloud};
use aws_service_broker::{AwsBroker, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let cli = Cli::parse();
    let options = cli.broker_options();
    options.validate().context("Invalid broker options")?;

    let overrides = overrides_from_env(&options.broker_id, std::env::vars());

    info!(
        broker_id = %options.broker_id,
        region = %options.region,
        table = %options.table_name,
        template_bucket = %options.s3_bucket,
        overrides = overrides.len(),
        prescribe_overrides = options.prescribe_overrides,
        "Starting AWS Service Broker"
    );

    let cloud = Arc::new(LocalCloud::new());
    let broker = AwsBroker::new(
        options,
        overrides,
        Arc::new(InMemoryDataStore::new()),
        CloudClients::new(cloud.clone(), cloud.clone(), cloud),
    );

    if let Some(path) = &cli.catalog_file {
        for service in load_catalog(path)? {
            broker.publish_service(service);
        }
    }

    let app = api::router(Arc::new(broker));

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    info!("Broker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
