//! Broker Configuration
//!
//! Command-line/environment options, global parameter overrides and the
//! catalog seed file.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::broker::{Overrides, ServiceDefinition};

/// Environment prefix of broker-wide parameter overrides
pub const OVERRIDE_ENV_PREFIX: &str = "PARAM_OVERRIDE_";

/// Scope segment for overrides that apply to every service, plan and action
const OVERRIDE_ALL_SCOPE: &str = "_all_all_all_";

/// AWS Service Broker - Open Service Broker for CloudFormation-backed services
#[derive(Parser, Debug, Clone)]
#[command(name = "aws-service-broker", version, about)]
pub struct Cli {
    /// Data store table name
    #[arg(long, default_value = "awssb", env = "TABLE_NAME")]
    pub table_name: String,

    /// Bucket holding the service templates
    #[arg(long, default_value = "awsservicebroker", env = "S3_BUCKET")]
    pub s3_bucket: String,

    /// Region of the template bucket
    #[arg(long, default_value = "us-east-1", env = "S3_REGION")]
    pub s3_region: String,

    /// Key prefix of the templates inside the bucket
    #[arg(long, default_value = "templates/latest", env = "S3_KEY")]
    pub s3_key: String,

    /// Default region for provisioned stacks
    #[arg(long, default_value = "us-east-1", env = "AWS_REGION")]
    pub region: String,

    /// Broker ID, used for stack tags and override lookup
    #[arg(long, default_value = "awsservicebroker", env = "BROKER_ID")]
    pub broker_id: String,

    /// Let broker overrides replace caller-supplied parameters
    #[arg(long, default_value = "false", env = "PRESCRIBE_OVERRIDES")]
    pub prescribe_overrides: bool,

    /// HTTP listen port
    #[arg(long, default_value = "3199", env = "PORT")]
    pub port: u16,

    /// JSON catalog (`{"services": [...]}`) published at startup
    #[arg(long, env = "CATALOG_FILE")]
    pub catalog_file: Option<PathBuf>,
}

impl Cli {
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            table_name: self.table_name.clone(),
            s3_bucket: self.s3_bucket.clone(),
            s3_region: self.s3_region.clone(),
            s3_key: self.s3_key.clone(),
            region: self.region.clone(),
            broker_id: self.broker_id.clone(),
            prescribe_overrides: self.prescribe_overrides,
        }
    }
}

/// Broker settings, immutable once the broker is built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerOptions {
    pub table_name: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_key: String,
    /// Default stack region
    pub region: String,
    pub broker_id: String,
    /// Whether overrides win over caller parameters
    pub prescribe_overrides: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    MissingOption(&'static str),
}

impl BrokerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("broker-id", &self.broker_id),
            ("region", &self.region),
            ("s3-bucket", &self.s3_bucket),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingOption(name));
            }
        }
        Ok(())
    }
}

/// Collect `PARAM_OVERRIDE_<broker-id>_all_all_all_<param>` variables.
///
/// Dashes in the broker ID may appear as underscores, since most shells
/// cannot export names containing `-`.
pub fn overrides_from_env<I>(broker_id: &str, vars: I) -> Overrides
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefixes = [
        format!("{}{}{}", OVERRIDE_ENV_PREFIX, broker_id, OVERRIDE_ALL_SCOPE),
        format!(
            "{}{}{}",
            OVERRIDE_ENV_PREFIX,
            broker_id.replace('-', "_"),
            OVERRIDE_ALL_SCOPE
        ),
    ];

    vars.into_iter()
        .filter_map(|(key, value)| {
            let param = prefixes
                .iter()
                .find_map(|prefix| key.strip_prefix(prefix.as_str()))?;
            if param.is_empty() {
                return None;
            }
            Some((param.to_string(), value))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    services: Vec<ServiceDefinition>,
}

/// Read the service definitions from a catalog JSON file
pub fn load_catalog(path: &Path) -> Result<Vec<ServiceDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
    let catalog: CatalogFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse catalog file {}", path.display()))?;

    info!(path = %path.display(), services = catalog.services.len(), "Loaded catalog file");
    Ok(catalog.services)
}
