//! AWS Service Broker Library
//!
//! Open Service Broker v2 orchestration over CloudFormation stacks, SSM
//! parameters and IAM role policies.

pub mod api;
pub mod broker;
pub mod config;
pub mod memory;

pub use broker::{AwsBroker, BrokerError};
pub use config::{BrokerOptions, Cli};
