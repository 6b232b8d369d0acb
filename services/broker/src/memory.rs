//! Local Backends
//!
//! In-process implementations of the data store and cloud ports. The binary
//! runs on these when no cloud account is wired in, and the end-to-end
//! tests drive the broker through them.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::broker::ports::{
    CreateStackInput, DataStore, IdentityClient, ParameterLookup, SecretStore, StackClient,
    StackDescription,
};
use crate::broker::{ServiceBinding, ServiceDefinition, ServiceInstance};

/// Data store keeping every record in memory
#[derive(Default)]
pub struct InMemoryDataStore {
    services: RwLock<HashMap<String, ServiceDefinition>>,
    instances: RwLock<HashMap<String, ServiceInstance>>,
    bindings: RwLock<HashMap<String, ServiceBinding>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_service_definition(&self, service_id: &str) -> Result<Option<ServiceDefinition>> {
        Ok(self.services.read().await.get(service_id).cloned())
    }

    async fn put_service_definition(&self, service: &ServiceDefinition) -> Result<()> {
        self.services
            .write()
            .await
            .insert(service.id.clone(), service.clone());
        Ok(())
    }

    async fn get_service_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>> {
        Ok(self.instances.read().await.get(instance_id).cloned())
    }

    async fn create_service_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Option<ServiceInstance>> {
        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(&instance.id) {
            return Ok(Some(existing.clone()));
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(None)
    }

    async fn put_service_instance(&self, instance: &ServiceInstance) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn delete_service_instance(&self, instance_id: &str) -> Result<()> {
        self.instances.write().await.remove(instance_id);
        Ok(())
    }

    async fn get_service_binding(&self, binding_id: &str) -> Result<Option<ServiceBinding>> {
        Ok(self.bindings.read().await.get(binding_id).cloned())
    }

    async fn create_service_binding(
        &self,
        binding: &ServiceBinding,
    ) -> Result<Option<ServiceBinding>> {
        let mut bindings = self.bindings.write().await;
        if let Some(existing) = bindings.get(&binding.id) {
            return Ok(Some(existing.clone()));
        }
        bindings.insert(binding.id.clone(), binding.clone());
        Ok(None)
    }

    async fn delete_service_binding(&self, binding_id: &str) -> Result<()> {
        self.bindings.write().await.remove(binding_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LocalStack {
    region: String,
    status: String,
    outputs: BTreeMap<String, String>,
}

/// In-process cloud: stacks, a parameter store and role policies.
///
/// A stack reports its pending operation as in progress on the first
/// describe and as complete on the next one.
#[derive(Default)]
pub struct LocalCloud {
    account_id: String,
    stack_outputs: BTreeMap<String, String>,
    stacks: RwLock<HashMap<String, LocalStack>>,
    parameters: RwLock<HashMap<String, String>>,
    role_policies: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl LocalCloud {
    pub fn new() -> Self {
        Self {
            account_id: "000000000000".to_string(),
            ..Default::default()
        }
    }

    /// Outputs every stack reports once created
    pub fn with_stack_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.stack_outputs = outputs;
        self
    }

    pub async fn put_parameter(&self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.write().await.insert(name.into(), value.into());
    }

    pub async fn stack_count(&self) -> usize {
        self.stacks.read().await.len()
    }

    pub async fn role_policies(&self, role_name: &str) -> BTreeSet<String> {
        self.role_policies
            .read()
            .await
            .get(role_name)
            .cloned()
            .unwrap_or_default()
    }
}

/// Status a pending operation settles into on the next describe
fn settled_status(status: &str) -> Option<String> {
    status
        .strip_suffix("_IN_PROGRESS")
        .map(|action| format!("{}_COMPLETE", action))
}

#[async_trait]
impl StackClient for LocalCloud {
    async fn create_stack(&self, input: &CreateStackInput) -> Result<String> {
        let stack_id = format!(
            "arn:aws:cloudformation:{}:{}:stack/{}/{}",
            input.region,
            self.account_id,
            input.stack_name,
            Uuid::new_v4()
        );

        self.stacks.write().await.insert(
            stack_id.clone(),
            LocalStack {
                region: input.region.clone(),
                status: "CREATE_IN_PROGRESS".to_string(),
                outputs: self.stack_outputs.clone(),
            },
        );

        debug!(stack_id = %stack_id, "Local stack created");
        Ok(stack_id)
    }

    async fn delete_stack(&self, region: &str, stack_id: &str) -> Result<()> {
        let mut stacks = self.stacks.write().await;
        match stacks.get_mut(stack_id) {
            Some(stack) if stack.region == region => {
                stack.status = "DELETE_IN_PROGRESS".to_string();
                Ok(())
            }
            _ => bail!("Stack with id {} does not exist", stack_id),
        }
    }

    async fn describe_stack(&self, region: &str, stack_id: &str) -> Result<StackDescription> {
        let mut stacks = self.stacks.write().await;
        let stack = match stacks.get_mut(stack_id) {
            Some(stack) if stack.region == region => stack,
            _ => bail!("Stack with id {} does not exist", stack_id),
        };

        let description = StackDescription {
            stack_id: stack_id.to_string(),
            status: stack.status.clone(),
            status_reason: None,
            outputs: stack.outputs.clone(),
        };

        if let Some(next) = settled_status(&stack.status) {
            stack.status = next;
        }

        Ok(description)
    }
}

#[async_trait]
impl SecretStore for LocalCloud {
    async fn get_parameters(&self, _region: &str, names: &[String]) -> Result<ParameterLookup> {
        let parameters = self.parameters.read().await;
        let mut lookup = ParameterLookup::default();
        for name in names {
            match parameters.get(name) {
                Some(value) => {
                    lookup.values.insert(name.clone(), value.clone());
                }
                None => lookup.invalid.push(name.clone()),
            }
        }
        Ok(lookup)
    }
}

#[async_trait]
impl IdentityClient for LocalCloud {
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        self.role_policies
            .write()
            .await
            .entry(role_name.to_string())
            .or_default()
            .insert(policy_arn.to_string());
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        let mut roles = self.role_policies.write().await;
        let removed = roles
            .get_mut(role_name)
            .is_some_and(|policies| policies.remove(policy_arn));
        if !removed {
            bail!("Policy {} is not attached to role {}", policy_arn, role_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ports::CloudClients;
    use crate::broker::{
        AwsBroker, BindRequest, DeprovisionRequest, OperationState, Overrides, Parameters, Plan,
        ProvisionRequest,
    };
    use crate::config::BrokerOptions;
    use serde_json::json;
    use std::sync::Arc;

    fn options() -> BrokerOptions {
        BrokerOptions {
            table_name: "awssb".to_string(),
            s3_bucket: "awsservicebroker".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_key: "templates/latest".to_string(),
            region: "us-east-1".to_string(),
            broker_id: "awsservicebroker".to_string(),
            prescribe_overrides: false,
        }
    }

    fn s3_service() -> ServiceDefinition {
        ServiceDefinition {
            id: "svc-s3".to_string(),
            name: "s3".to_string(),
            description: "Amazon S3".to_string(),
            bindable: true,
            tags: vec!["storage".to_string()],
            metadata: None,
            plans: vec![Plan {
                id: "plan-production".to_string(),
                name: "production".to_string(),
                description: String::new(),
                free: Some(false),
                schemas: None,
            }],
        }
    }

    fn local_broker() -> (AwsBroker, Arc<LocalCloud>, Arc<InMemoryDataStore>) {
        let outputs: BTreeMap<String, String> = [
            ("BucketName", "local-bucket"),
            ("BucketAccessKeyId", "ssm:/local/BucketAccessKeyId"),
            ("PolicyArnReadOnly", "arn:aws:iam::000000000000:policy/ro"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let cloud = Arc::new(LocalCloud::new().with_stack_outputs(outputs));
        let store = Arc::new(InMemoryDataStore::new());
        let broker = AwsBroker::new(
            options(),
            Overrides::new(),
            store.clone(),
            CloudClients::new(cloud.clone(), cloud.clone(), cloud.clone()),
        );
        (broker, cloud, store)
    }

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            instance_id: "inst-1".to_string(),
            service_id: "svc-s3".to_string(),
            plan_id: "plan-production".to_string(),
            parameters: Parameters::new(),
            accepts_incomplete: true,
        }
    }

    #[tokio::test]
    async fn test_create_is_atomic() {
        let store = InMemoryDataStore::new();
        let first = ServiceInstance::new("i", "s", "p", Parameters::new(), "us-east-1");
        let second = ServiceInstance::new("i", "s", "other", Parameters::new(), "us-east-1");

        assert!(store.create_service_instance(&first).await.unwrap().is_none());
        let existing = store.create_service_instance(&second).await.unwrap().unwrap();
        assert_eq!(existing.plan_id, "p");
    }

    #[tokio::test]
    async fn test_local_stack_lifecycle() {
        let cloud = LocalCloud::new();
        let stack_id = cloud
            .create_stack(&CreateStackInput {
                region: "us-east-1".to_string(),
                stack_name: "aws-service-broker-s3-inst".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = cloud.describe_stack("us-east-1", &stack_id).await.unwrap();
        assert_eq!(first.status, "CREATE_IN_PROGRESS");
        let second = cloud.describe_stack("us-east-1", &stack_id).await.unwrap();
        assert_eq!(second.status, "CREATE_COMPLETE");

        cloud.delete_stack("us-east-1", &stack_id).await.unwrap();
        cloud.describe_stack("us-east-1", &stack_id).await.unwrap();
        let deleted = cloud.describe_stack("us-east-1", &stack_id).await.unwrap();
        assert_eq!(deleted.status, "DELETE_COMPLETE");

        assert!(cloud.describe_stack("eu-west-1", &stack_id).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_provisions_create_one_stack() {
        let (broker, cloud, _store) = local_broker();
        broker.publish_service(s3_service());
        broker.get_catalog().await.unwrap();

        let req = provision_request();
        let (a, b) = tokio::join!(broker.provision(&req), broker.provision(&req));

        // The loser either replays the recorded stack or sees the reservation
        let results = [a, b];
        assert!(results.iter().any(|r| r.as_ref().is_ok_and(|resp| resp.asynchronous)));
        for result in &results {
            if let Err(err) = result {
                assert_eq!(err.error_code(), Some("ConcurrencyError"));
            }
        }
        assert_eq!(cloud.stack_count().await, 1);

        let replay = broker.provision(&req).await.unwrap();
        assert!(replay.asynchronous);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (broker, cloud, store) = local_broker();
        cloud.put_parameter("/local/BucketAccessKeyId", "AKIA-LOCAL").await;

        broker.publish_service(s3_service());
        let catalog = broker.get_catalog().await.unwrap();
        assert_eq!(catalog.services.len(), 1);

        broker.provision(&provision_request()).await.unwrap();

        let poll = broker.last_operation("inst-1").await.unwrap();
        assert_eq!(poll.state, OperationState::InProgress);
        let poll = broker.last_operation("inst-1").await.unwrap();
        assert_eq!(poll.state, OperationState::Succeeded);

        let bind = BindRequest {
            binding_id: "bind-1".to_string(),
            instance_id: "inst-1".to_string(),
            service_id: "svc-s3".to_string(),
            parameters: serde_json::from_value(json!({"RoleName": "app", "Scope": "ReadOnly"}))
                .unwrap(),
        };
        let resp = broker.bind(&bind).await.unwrap();
        assert!(!resp.exists);
        assert_eq!(resp.credentials.get("BUCKET_NAME").unwrap(), "local-bucket");
        assert_eq!(resp.credentials.get("BUCKET_ACCESS_KEY_ID").unwrap(), "AKIA-LOCAL");
        assert!(cloud
            .role_policies("app")
            .await
            .contains("arn:aws:iam::000000000000:policy/ro"));

        let replay = broker.bind(&bind).await.unwrap();
        assert!(replay.exists);
        assert_eq!(replay.credentials, resp.credentials);

        broker.unbind("bind-1").await.unwrap();
        assert!(cloud.role_policies("app").await.is_empty());
        assert!(store.get_service_binding("bind-1").await.unwrap().is_none());

        let resp = broker
            .deprovision(&DeprovisionRequest {
                instance_id: "inst-1".to_string(),
                accepts_incomplete: true,
            })
            .await
            .unwrap();
        assert!(resp.asynchronous);

        assert_eq!(
            broker.last_operation("inst-1").await.unwrap().state,
            OperationState::InProgress
        );
        assert_eq!(
            broker.last_operation("inst-1").await.unwrap().state,
            OperationState::Succeeded
        );
        assert!(store.get_service_instance("inst-1").await.unwrap().is_none());
    }
}
