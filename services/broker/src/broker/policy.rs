//! Scope Policy Attachment
//!
//! A binding may name an IAM role (`RoleName`) and an access scope
//! (`Scope`). The stack publishes one managed policy per scope as a
//! `PolicyArn<Scope>` output (plain `PolicyArn` for the default scope);
//! the selected policy is attached to the role on bind and detached on unbind.

use std::collections::BTreeMap;
use tracing::info;

use super::credentials::POLICY_ARN_OUTPUT_PREFIX;
use super::error::BrokerError;
use super::params::{string_parameter, ROLE_NAME_PARAMETER, SCOPE_PARAMETER};
use super::ports::IdentityClient;
use super::types::Parameters;

/// A policy attached to a role on behalf of a binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPolicy {
    pub role_name: String,
    pub policy_arn: String,
}

/// Name of the stack output holding the policy for `scope`
pub fn policy_output_name(scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{}{}", POLICY_ARN_OUTPUT_PREFIX, scope),
        None => POLICY_ARN_OUTPUT_PREFIX.to_string(),
    }
}

/// Pick the policy ARN for `scope` out of the stack outputs
pub fn select_policy_arn(
    stack_id: &str,
    outputs: &BTreeMap<String, String>,
    scope: Option<&str>,
) -> Result<String, BrokerError> {
    let output = policy_output_name(scope);
    outputs
        .get(&output)
        .cloned()
        .ok_or_else(|| BrokerError::UnsupportedScope {
            stack_id: stack_id.to_string(),
            scope: scope.unwrap_or_default().to_string(),
            output,
        })
}

/// Attaches and detaches scope policies through an identity client
pub struct PolicyAttacher<'a> {
    identity: &'a dyn IdentityClient,
}

impl<'a> PolicyAttacher<'a> {
    pub fn new(identity: &'a dyn IdentityClient) -> Self {
        Self { identity }
    }

    /// Attach the scope policy named by the bind parameters, if a role was given.
    ///
    /// Returns `None` when the parameters carry no role.
    pub async fn attach(
        &self,
        stack_id: &str,
        outputs: &BTreeMap<String, String>,
        params: &Parameters,
    ) -> Result<Option<AttachedPolicy>, BrokerError> {
        let role_name = match string_parameter(params, ROLE_NAME_PARAMETER)? {
            Some(role) if !role.is_empty() => role,
            _ => return Ok(None),
        };
        let scope = string_parameter(params, SCOPE_PARAMETER)?.filter(|s| !s.is_empty());

        let policy_arn = select_policy_arn(stack_id, outputs, scope)?;

        self.identity
            .attach_role_policy(role_name, &policy_arn)
            .await
            .map_err(|cause| BrokerError::AttachPolicy {
                policy_arn: policy_arn.clone(),
                role_name: role_name.to_string(),
                cause,
            })?;

        info!(role = %role_name, policy_arn = %policy_arn, "Attached scope policy");

        Ok(Some(AttachedPolicy {
            role_name: role_name.to_string(),
            policy_arn,
        }))
    }

    pub async fn detach(&self, role_name: &str, policy_arn: &str) -> Result<(), BrokerError> {
        self.identity
            .detach_role_policy(role_name, policy_arn)
            .await
            .map_err(|cause| BrokerError::DetachPolicy {
                policy_arn: policy_arn.to_string(),
                role_name: role_name.to_string(),
                cause,
            })?;

        info!(role = %role_name, policy_arn = %policy_arn, "Detached scope policy");
        Ok(())
    }
}
