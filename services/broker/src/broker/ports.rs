//! Collaborator Ports
//!
//! Narrow trait-based abstractions over the data store and the cloud
//! services the broker drives: stack lifecycle (CloudFormation), secret
//! lookup (SSM Parameter Store) and identity/policy (IAM). Each one is
//! substitutable independently, so the orchestrator never reaches for
//! ambient global clients.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::types::{ServiceBinding, ServiceDefinition, ServiceInstance};

/// Persistent storage for catalog entries, instances and bindings.
///
/// Implementations must make `create_service_instance` and
/// `create_service_binding` atomic per key: of two concurrent creates for
/// the same ID exactly one stores its record, the other gets that record back.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_service_definition(&self, service_id: &str) -> Result<Option<ServiceDefinition>>;

    async fn put_service_definition(&self, service: &ServiceDefinition) -> Result<()>;

    async fn get_service_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>>;

    /// Store `instance` unless the ID is taken; returns the existing record if it is
    async fn create_service_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Option<ServiceInstance>>;

    /// Insert or replace
    async fn put_service_instance(&self, instance: &ServiceInstance) -> Result<()>;

    async fn delete_service_instance(&self, instance_id: &str) -> Result<()>;

    async fn get_service_binding(&self, binding_id: &str) -> Result<Option<ServiceBinding>>;

    /// Store `binding` unless the ID is taken; returns the existing record if it is
    async fn create_service_binding(
        &self,
        binding: &ServiceBinding,
    ) -> Result<Option<ServiceBinding>>;

    async fn delete_service_binding(&self, binding_id: &str) -> Result<()>;
}

/// Stack creation request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateStackInput {
    pub region: String,
    pub stack_name: String,
    pub template_url: String,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

/// Snapshot of a stack as reported by DescribeStacks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDescription {
    pub stack_id: String,
    /// Raw CloudFormation status, e.g. `CREATE_IN_PROGRESS`
    pub status: String,
    pub status_reason: Option<String>,
    /// Output key -> output value
    pub outputs: BTreeMap<String, String>,
}

/// Stack lifecycle operations (CloudFormation)
#[async_trait]
pub trait StackClient: Send + Sync {
    /// Request stack creation; returns the stack ID once accepted
    async fn create_stack(&self, input: &CreateStackInput) -> Result<String>;

    /// Request stack deletion; returns once accepted
    async fn delete_stack(&self, region: &str, stack_id: &str) -> Result<()>;

    async fn describe_stack(&self, region: &str, stack_id: &str) -> Result<StackDescription>;
}

/// Result of a batched parameter lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterLookup {
    /// Path -> decrypted value
    pub values: BTreeMap<String, String>,
    /// Paths the store could not resolve
    pub invalid: Vec<String>,
}

/// Secret lookup (SSM Parameter Store GetParameters semantics)
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_parameters(&self, region: &str, names: &[String]) -> Result<ParameterLookup>;
}

/// IAM role policy management
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;
}

/// The set of cloud clients a broker is constructed with
#[derive(Clone)]
pub struct CloudClients {
    pub stacks: Arc<dyn StackClient>,
    pub secrets: Arc<dyn SecretStore>,
    pub identity: Arc<dyn IdentityClient>,
}

impl CloudClients {
    pub fn new(
        stacks: Arc<dyn StackClient>,
        secrets: Arc<dyn SecretStore>,
        identity: Arc<dyn IdentityClient>,
    ) -> Self {
        Self {
            stacks,
            secrets,
            identity,
        }
    }
}
