//! Service Broker Core
//!
//! Provisioning and binding orchestration for CloudFormation-backed
//! services: catalog caches, parameter validation, credential resolution,
//! scope policy attachment and the OSB operation state machine.

pub mod cache;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod params;
pub mod policy;
pub mod ports;
pub mod status;
pub mod types;

pub use cache::{CatalogCache, ListingCache, ServiceNeedsUpdate, LISTINGS_KEY};
pub use error::BrokerError;
pub use orchestrator::AwsBroker;
pub use params::Overrides;
pub use ports::{CloudClients, DataStore, IdentityClient, SecretStore, StackClient};
pub use types::*;
