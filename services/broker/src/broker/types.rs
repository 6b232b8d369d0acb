//! Service Broker Types
//!
//! Catalog entries, stored instance/binding records, and the request and
//! response shapes of the broker operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Request parameters as supplied by the platform (JSON object).
pub type Parameters = BTreeMap<String, Value>;

/// Issued binding credentials, keyed by SCREAMING_SNAKE names.
pub type Credentials = BTreeMap<String, String>;

/// A service offering published in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl ServiceDefinition {
    /// Find a plan of this service by ID
    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }
}

/// A provisioning variant of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Schemas>,
}

impl Plan {
    /// Input schema for instance creation, if the plan declares one
    pub fn create_schema(&self) -> Option<&InputParametersSchema> {
        self.schemas
            .as_ref()?
            .service_instance
            .as_ref()?
            .create
            .as_ref()
    }

    /// Input schema for binding creation, if the plan declares one
    pub fn binding_schema(&self) -> Option<&InputParametersSchema> {
        self.schemas
            .as_ref()?
            .service_binding
            .as_ref()?
            .create
            .as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<ServiceInstanceSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<ServiceBindingSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBindingSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
}

/// JSON-schema document describing a plan's accepted parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputParametersSchema {
    #[serde(default)]
    pub parameters: Value,
}

impl InputParametersSchema {
    pub fn new(parameters: Value) -> Self {
        Self { parameters }
    }

    /// Whether `name` is a declared property
    pub fn declares(&self, name: &str) -> bool {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|props| props.contains_key(name))
    }

    /// Required names, from both the top-level `required` array and
    /// per-property `"required": true` markers. Deduplicated, in order.
    pub fn required_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|req| req.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if let Some(props) = self.parameters.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                let marked = prop.get("required").and_then(Value::as_bool).unwrap_or(false);
                if marked && !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }

        names
    }
}

/// A provisioned (or provisioning) service instance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub params: Parameters,
    /// Region the backing stack lives in
    pub region: String,
    /// CloudFormation stack ID, set once creation is accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
        params: Parameters,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            params,
            region: region.into(),
            stack_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_stack_id(mut self, stack_id: impl Into<String>) -> Self {
        self.stack_id = Some(stack_id.into());
        self
    }

    /// Whether a repeated provision request describes this same instance
    pub fn matches(&self, service_id: &str, plan_id: &str, params: &Parameters) -> bool {
        self.service_id == service_id && self.plan_id == plan_id && &self.params == params
    }
}

/// An issued binding record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub id: String,
    pub instance_id: String,
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub credentials: Credentials,
    /// Role the scope policy was attached to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_arn: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ServiceBinding {
    pub fn new(id: impl Into<String>, instance_id: impl Into<String>, params: Parameters) -> Self {
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            params,
            credentials: Credentials::new(),
            role_name: None,
            policy_arn: None,
            created_at: Utc::now(),
        }
    }

    pub fn matches(&self, instance_id: &str, params: &Parameters) -> bool {
        self.instance_id == instance_id && &self.params == params
    }
}

/// Protocol state reported by LastOperation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::InProgress => write!(f, "in progress"),
            OperationState::Succeeded => write!(f, "succeeded"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogResponse {
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: Parameters,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionResponse {
    pub asynchronous: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprovisionResponse {
    pub asynchronous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastOperationResponse {
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindResponse {
    /// True when the binding already existed and was replayed
    pub exists: bool,
    pub credentials: Credentials,
}
