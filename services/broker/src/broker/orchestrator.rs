//! Service Broker Orchestrator
//!
//! The operation state machine behind the OSB endpoints. Each operation
//! validates its input, consults the data store for idempotency and
//! conflicts, drives the cloud side, persists the outcome and returns a
//! protocol response or a mapped [`BrokerError`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::{CatalogCache, ListingCache};
use super::credentials::CredentialResolver;
use super::error::BrokerError;
use super::params::{
    binding_schema, parameter_value_string, validate_bind_params, Overrides, ParameterValidator,
};
use super::policy::{AttachedPolicy, PolicyAttacher};
use super::ports::{CloudClients, CreateStackInput, DataStore};
use super::status::{StackPhase, DELETE_COMPLETE};
use super::types::{
    BindRequest, BindResponse, CatalogResponse, DeprovisionRequest, DeprovisionResponse,
    LastOperationResponse, OperationState, Parameters, ProvisionRequest, ProvisionResponse,
    ServiceBinding, ServiceBindingSchema, ServiceDefinition, ServiceInstance,
};
use crate::config::BrokerOptions;

/// Prefix of every stack the broker creates
pub const STACK_NAME_PREFIX: &str = "aws-service-broker";

/// CloudFormation's stack name length limit
pub const MAX_STACK_NAME_LEN: usize = 128;

/// Instance parameter selecting the stack region
pub const REGION_PARAMETER: &str = "region";

/// Reported when an instance has no stack to poll
pub const STACK_ID_MISSING_DESCRIPTION: &str =
    "CloudFormation stackid missing, chances are stack creation failed in an unexpected way";

/// Tag keys attached to every stack
pub const TAG_BROKER_ID: &str = "aws-service-broker:broker-id";
pub const TAG_INSTANCE_ID: &str = "aws-service-broker:instance-id";
pub const TAG_SERVICE_ID: &str = "aws-service-broker:service-id";
pub const TAG_PLAN_ID: &str = "aws-service-broker:plan-id";

/// CloudFormation-backed service broker
pub struct AwsBroker {
    options: BrokerOptions,
    /// Broker-wide parameter overrides
    global_overrides: Overrides,
    catalog: Arc<CatalogCache>,
    listings: Arc<ListingCache>,
    store: Arc<dyn DataStore>,
    clients: CloudClients,
}

impl AwsBroker {
    pub fn new(
        options: BrokerOptions,
        global_overrides: Overrides,
        store: Arc<dyn DataStore>,
        clients: CloudClients,
    ) -> Self {
        Self {
            options,
            global_overrides,
            catalog: Arc::new(CatalogCache::new()),
            listings: Arc::new(ListingCache::new()),
            store,
            clients,
        }
    }

    pub fn catalog_cache(&self) -> &Arc<CatalogCache> {
        &self.catalog
    }

    pub fn listing_cache(&self) -> &Arc<ListingCache> {
        &self.listings
    }

    /// Publish a service into the caches and flag it for persistence.
    ///
    /// Plans without a binding schema get the standard `RoleName`/`Scope` one.
    pub fn publish_service(&self, mut service: ServiceDefinition) {
        for plan in &mut service.plans {
            let schemas = plan.schemas.get_or_insert_with(Default::default);
            let binding = schemas
                .service_binding
                .get_or_insert_with(ServiceBindingSchema::default);
            if binding.create.is_none() {
                binding.create = Some(binding_schema());
            }
        }

        let name = service.name.clone();
        info!(service = %name, service_id = %service.id, "Publishing service");
        self.catalog.set(name.clone(), service);
        self.listings.upsert(&name);
    }

    /// Serve the catalog from the caches, persisting newly published entries.
    ///
    /// Flags are cleared per entry before the write and restored if it
    /// fails, so a publish racing with the write is persisted next time.
    pub async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError> {
        let listings = self.listings.listings();
        let mut services = Vec::with_capacity(listings.len());

        for entry in listings {
            let Some(service) = self.catalog.get(&entry.name) else {
                debug!(service = %entry.name, "Listed service missing from catalog cache");
                continue;
            };

            if self.listings.take_update(&entry.name) {
                if let Err(cause) = self.store.put_service_definition(&service).await {
                    self.listings.upsert(&entry.name);
                    return Err(BrokerError::ServicePersist {
                        service_id: service.id.clone(),
                        cause,
                    });
                }
                info!(service = %service.name, "Stored service definition");
            }

            services.push(service);
        }

        Ok(CatalogResponse { services })
    }

    pub async fn provision(&self, req: &ProvisionRequest) -> Result<ProvisionResponse, BrokerError> {
        if !req.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }

        let service = self.lookup_service(&req.service_id).await?;
        let plan = service
            .plan(&req.plan_id)
            .ok_or_else(|| BrokerError::PlanNotFound {
                plan_id: req.plan_id.clone(),
            })?;

        let params = ParameterValidator::new(&self.global_overrides, self.options.prescribe_overrides)
            .validate(plan.create_schema(), &req.parameters)?;

        let existing = self
            .store
            .get_service_instance(&req.instance_id)
            .await
            .map_err(|cause| BrokerError::InstanceLookup {
                instance_id: req.instance_id.clone(),
                cause,
            })?;
        if let Some(existing) = existing {
            return self.replay_provision(&existing, req, &params);
        }

        let region = params
            .get(REGION_PARAMETER)
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.options.region)
            .to_string();

        let instance = ServiceInstance::new(
            &req.instance_id,
            &req.service_id,
            &req.plan_id,
            params.clone(),
            region.clone(),
        );

        // Reserve the ID before touching the cloud so concurrent requests
        // cannot both create a stack.
        let reserved = self
            .store
            .create_service_instance(&instance)
            .await
            .map_err(|cause| BrokerError::InstancePersist {
                instance_id: req.instance_id.clone(),
                cause,
            })?;
        if let Some(existing) = reserved {
            return self.replay_provision(&existing, req, &params);
        }

        let input = CreateStackInput {
            region,
            stack_name: self.stack_name(&service.name, &req.instance_id),
            template_url: self.template_url(&service.name),
            parameters: stack_parameters(&params),
            tags: self.stack_tags(req),
        };

        let stack_id = match self.clients.stacks.create_stack(&input).await {
            Ok(stack_id) => stack_id,
            Err(cause) => {
                if let Err(e) = self.store.delete_service_instance(&req.instance_id).await {
                    warn!(instance_id = %req.instance_id, error = %e, "Failed to release instance reservation");
                }
                return Err(BrokerError::CreateStack {
                    stack_name: input.stack_name,
                    cause,
                });
            }
        };

        info!(
            instance_id = %req.instance_id,
            stack_id = %stack_id,
            region = %input.region,
            "Stack creation accepted"
        );

        let instance = instance.with_stack_id(stack_id.clone());
        if let Err(cause) = self.store.put_service_instance(&instance).await {
            // Without the stack ID on record nothing could ever delete it.
            if let Err(e) = self.clients.stacks.delete_stack(&input.region, &stack_id).await {
                warn!(stack_id = %stack_id, error = %e, "Failed to delete unrecorded stack");
            }
            if let Err(e) = self.store.delete_service_instance(&req.instance_id).await {
                warn!(instance_id = %req.instance_id, error = %e, "Failed to release instance reservation");
            }
            return Err(BrokerError::InstancePersist {
                instance_id: req.instance_id.clone(),
                cause,
            });
        }

        Ok(ProvisionResponse { asynchronous: true })
    }

    fn replay_provision(
        &self,
        existing: &ServiceInstance,
        req: &ProvisionRequest,
        params: &Parameters,
    ) -> Result<ProvisionResponse, BrokerError> {
        if existing.matches(&req.service_id, &req.plan_id, params) {
            if existing.stack_id.is_none() {
                // Reserved by a request that has not recorded its stack yet
                return Err(BrokerError::OperationInProgress {
                    instance_id: req.instance_id.clone(),
                });
            }
            info!(instance_id = %req.instance_id, "Replaying identical provision request");
            Ok(ProvisionResponse { asynchronous: true })
        } else {
            warn!(instance_id = %req.instance_id, "Provision conflicts with existing instance");
            Err(BrokerError::InstanceConflict {
                instance_id: req.instance_id.clone(),
            })
        }
    }

    pub async fn deprovision(
        &self,
        req: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        let instance = self
            .store
            .get_service_instance(&req.instance_id)
            .await
            .map_err(|cause| BrokerError::InstanceLookup {
                instance_id: req.instance_id.clone(),
                cause,
            })?;

        let Some(instance) = instance else {
            debug!(instance_id = %req.instance_id, "Deprovision of unknown instance");
            return Ok(DeprovisionResponse { asynchronous: false });
        };

        let Some(stack_id) = instance.stack_id.as_deref() else {
            self.store
                .delete_service_instance(&instance.id)
                .await
                .map_err(|cause| BrokerError::InstancePersist {
                    instance_id: instance.id.clone(),
                    cause,
                })?;
            info!(instance_id = %instance.id, "Removed instance without a stack");
            return Ok(DeprovisionResponse { asynchronous: false });
        };

        self.clients
            .stacks
            .delete_stack(&instance.region, stack_id)
            .await
            .map_err(|cause| BrokerError::DeleteStack {
                stack_id: stack_id.to_string(),
                cause,
            })?;

        info!(instance_id = %instance.id, stack_id = %stack_id, "Stack deletion accepted");
        Ok(DeprovisionResponse { asynchronous: true })
    }

    pub async fn last_operation(&self, instance_id: &str) -> Result<LastOperationResponse, BrokerError> {
        let instance = self
            .store
            .get_service_instance(instance_id)
            .await
            .map_err(|cause| BrokerError::InstanceLookup {
                instance_id: instance_id.to_string(),
                cause,
            })?;

        let Some((instance, stack_id)) =
            instance.and_then(|i| i.stack_id.clone().map(|stack_id| (i, stack_id)))
        else {
            return Ok(LastOperationResponse {
                state: OperationState::Failed,
                description: Some(STACK_ID_MISSING_DESCRIPTION.to_string()),
            });
        };

        let stack = self
            .clients
            .stacks
            .describe_stack(&instance.region, &stack_id)
            .await
            .map_err(|cause| BrokerError::DescribeStack {
                stack_id: stack_id.clone(),
                cause,
            })?;

        if stack.status == DELETE_COMPLETE {
            self.store
                .delete_service_instance(instance_id)
                .await
                .map_err(|cause| BrokerError::InstancePersist {
                    instance_id: instance_id.to_string(),
                    cause,
                })?;
            info!(instance_id = %instance_id, stack_id = %stack_id, "Instance removed after stack deletion");
        }

        let state = StackPhase::parse(&stack.status).operation_state();
        debug!(instance_id = %instance_id, status = %stack.status, state = %state, "Polled stack");

        Ok(LastOperationResponse {
            state,
            description: stack.status_reason,
        })
    }

    pub async fn bind(&self, req: &BindRequest) -> Result<BindResponse, BrokerError> {
        validate_bind_params(&req.parameters)?;

        let existing = self
            .store
            .get_service_binding(&req.binding_id)
            .await
            .map_err(|cause| BrokerError::BindingLookup {
                binding_id: req.binding_id.clone(),
                cause,
            })?;
        if let Some(existing) = existing {
            return self.replay_bind(existing, req);
        }

        let service = self.lookup_service(&req.service_id).await?;

        let instance = self
            .store
            .get_service_instance(&req.instance_id)
            .await
            .map_err(|cause| BrokerError::InstanceLookup {
                instance_id: req.instance_id.clone(),
                cause,
            })?
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: req.instance_id.clone(),
            })?;

        let stack_id = instance
            .stack_id
            .clone()
            .ok_or_else(|| BrokerError::StackMissing {
                instance_id: instance.id.clone(),
            })?;

        let stack = self
            .clients
            .stacks
            .describe_stack(&instance.region, &stack_id)
            .await
            .map_err(|cause| BrokerError::DescribeStack {
                stack_id: stack_id.clone(),
                cause,
            })?;

        let credentials = CredentialResolver::new(self.clients.secrets.as_ref())
            .resolve(&instance.region, &service.name, &stack.outputs)
            .await
            .map_err(|e| BrokerError::Credentials {
                stack_id: stack_id.clone(),
                cause: e.into(),
            })?;

        let attacher = PolicyAttacher::new(self.clients.identity.as_ref());
        let attached = attacher
            .attach(&stack_id, &stack.outputs, &req.parameters)
            .await?;

        let mut binding = ServiceBinding::new(&req.binding_id, &req.instance_id, req.parameters.clone());
        binding.credentials = credentials;
        if let Some(policy) = &attached {
            binding.role_name = Some(policy.role_name.clone());
            binding.policy_arn = Some(policy.policy_arn.clone());
        }

        let raced = match self.store.create_service_binding(&binding).await {
            Ok(raced) => raced,
            Err(cause) => {
                self.release_policy(&attacher, attached.as_ref(), None).await;
                return Err(BrokerError::BindingPersist {
                    binding_id: req.binding_id.clone(),
                    cause,
                });
            }
        };
        if let Some(existing) = raced {
            let replay = self.replay_bind(existing.clone(), req);
            if replay.is_err() {
                self.release_policy(&attacher, attached.as_ref(), Some(&existing))
                    .await;
            }
            return replay;
        }

        info!(
            binding_id = %req.binding_id,
            instance_id = %req.instance_id,
            credentials = binding.credentials.len(),
            "Binding created"
        );

        Ok(BindResponse {
            exists: false,
            credentials: binding.credentials,
        })
    }

    fn replay_bind(&self, existing: ServiceBinding, req: &BindRequest) -> Result<BindResponse, BrokerError> {
        if existing.matches(&req.instance_id, &req.parameters) {
            info!(binding_id = %req.binding_id, "Replaying identical bind request");
            Ok(BindResponse {
                exists: true,
                credentials: existing.credentials,
            })
        } else {
            warn!(binding_id = %req.binding_id, "Bind conflicts with existing binding");
            Err(BrokerError::BindingConflict {
                binding_id: req.binding_id.clone(),
            })
        }
    }

    /// Undo an attachment whose binding was never stored. A grant the
    /// stored `winner` also holds is left in place.
    async fn release_policy(
        &self,
        attacher: &PolicyAttacher<'_>,
        attached: Option<&AttachedPolicy>,
        winner: Option<&ServiceBinding>,
    ) {
        let Some(policy) = attached else {
            return;
        };
        let shared = winner.is_some_and(|w| {
            w.role_name.as_deref() == Some(policy.role_name.as_str())
                && w.policy_arn.as_deref() == Some(policy.policy_arn.as_str())
        });
        if shared {
            return;
        }

        if let Err(e) = attacher.detach(&policy.role_name, &policy.policy_arn).await {
            warn!(
                role_name = %policy.role_name,
                policy_arn = %policy.policy_arn,
                error = %e,
                "Failed to detach policy of unstored binding"
            );
        }
    }

    pub async fn unbind(&self, binding_id: &str) -> Result<(), BrokerError> {
        let binding = self
            .store
            .get_service_binding(binding_id)
            .await
            .map_err(|cause| BrokerError::BindingLookup {
                binding_id: binding_id.to_string(),
                cause,
            })?;

        let Some(binding) = binding else {
            debug!(binding_id = %binding_id, "Unbind of unknown binding");
            return Ok(());
        };

        if let (Some(role_name), Some(policy_arn)) = (&binding.role_name, &binding.policy_arn) {
            PolicyAttacher::new(self.clients.identity.as_ref())
                .detach(role_name, policy_arn)
                .await?;
        }

        self.store
            .delete_service_binding(binding_id)
            .await
            .map_err(|cause| BrokerError::BindingPersist {
                binding_id: binding_id.to_string(),
                cause,
            })?;

        info!(binding_id = %binding_id, "Binding removed");
        Ok(())
    }

    async fn lookup_service(&self, service_id: &str) -> Result<ServiceDefinition, BrokerError> {
        self.store
            .get_service_definition(service_id)
            .await
            .map_err(|cause| BrokerError::ServiceLookup {
                service_id: service_id.to_string(),
                cause,
            })?
            .ok_or_else(|| BrokerError::ServiceNotFound {
                service_id: service_id.to_string(),
            })
    }

    /// `aws-service-broker-<service>-<instance>`, limited to `[A-Za-z0-9-]`
    pub fn stack_name(&self, service_name: &str, instance_id: &str) -> String {
        format!("{}-{}-{}", STACK_NAME_PREFIX, service_name, instance_id)
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(MAX_STACK_NAME_LEN)
            .collect()
    }

    /// Location of the service's main template in the template bucket
    pub fn template_url(&self, service_name: &str) -> String {
        let key = self.options.s3_key.trim_matches('/');
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };
        format!(
            "https://s3.{}.amazonaws.com/{}/{}{}-main.yaml",
            self.options.s3_region, self.options.s3_bucket, prefix, service_name
        )
    }

    fn stack_tags(&self, req: &ProvisionRequest) -> BTreeMap<String, String> {
        [
            (TAG_BROKER_ID, self.options.broker_id.as_str()),
            (TAG_INSTANCE_ID, req.instance_id.as_str()),
            (TAG_SERVICE_ID, req.service_id.as_str()),
            (TAG_PLAN_ID, req.plan_id.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

/// Every validated parameter except `region`, rendered as strings
fn stack_parameters(params: &Parameters) -> BTreeMap<String, String> {
    params
        .iter()
        .filter(|(name, _)| name.as_str() != REGION_PARAMETER)
        .map(|(name, value)| (name.clone(), parameter_value_string(value)))
        .collect()
}
