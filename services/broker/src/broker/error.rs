//! Broker Error Taxonomy
//!
//! Every failure an operation can produce, each carrying the identifier it
//! concerns and (for collaborator failures) the underlying cause. Variants
//! map onto four protocol statuses: 400, 409, 422 and 500.

use thiserror::Error;

/// Fixed description for the 422 `AsyncRequired` response
pub const ASYNC_REQUIRED_DESCRIPTION: &str =
    "This service plan requires client support for asynchronous service operations.";

/// Errors returned by broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    // ---- 400 Bad Request ----
    #[error("The parameter {name} is not available.")]
    ParameterNotAvailable { name: String },

    #[error("The parameter {name} is required.")]
    ParameterRequired { name: String },

    #[error("The parameter {name} is not supported.")]
    ParameterNotSupported { name: String },

    #[error("The parameter {name} must be a string.")]
    ParameterNotString { name: String },

    #[error("The service {service_id} was not found.")]
    ServiceNotFound { service_id: String },

    #[error("The service plan {plan_id} was not found.")]
    PlanNotFound { plan_id: String },

    #[error("The service instance {instance_id} was not found.")]
    InstanceNotFound { instance_id: String },

    #[error(
        "The CloudFormation stack {stack_id} does not support binding with scope '{scope}': output not found: {output}"
    )]
    UnsupportedScope {
        stack_id: String,
        scope: String,
        output: String,
    },

    // ---- 409 Conflict ----
    #[error("Service instance {instance_id} already exists but with different attributes.")]
    InstanceConflict { instance_id: String },

    #[error("Service binding {binding_id} already exists but with different attributes.")]
    BindingConflict { binding_id: String },

    // ---- 422 Unprocessable Entity ----
    #[error("{}", ASYNC_REQUIRED_DESCRIPTION)]
    AsyncRequired,

    #[error("Another operation for service instance {instance_id} is in progress.")]
    OperationInProgress { instance_id: String },

    // ---- 500 Internal Server Error ----
    #[error("Failed to get the service {service_id}: {cause}")]
    ServiceLookup {
        service_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to store the service {service_id}: {cause}")]
    ServicePersist {
        service_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to get the service instance {instance_id}: {cause}")]
    InstanceLookup {
        instance_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to store the service instance {instance_id}: {cause}")]
    InstancePersist {
        instance_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to get the service binding {binding_id}: {cause}")]
    BindingLookup {
        binding_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to store the service binding {binding_id}: {cause}")]
    BindingPersist {
        binding_id: String,
        cause: anyhow::Error,
    },

    #[error("The service instance {instance_id} has no CloudFormation stack.")]
    StackMissing { instance_id: String },

    #[error("Failed to create the CloudFormation stack {stack_name}: {cause}")]
    CreateStack {
        stack_name: String,
        cause: anyhow::Error,
    },

    #[error("Failed to delete the CloudFormation stack {stack_id}: {cause}")]
    DeleteStack {
        stack_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to describe the CloudFormation stack {stack_id}: {cause}")]
    DescribeStack {
        stack_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to get the credentials from CloudFormation stack {stack_id}: {cause}")]
    Credentials {
        stack_id: String,
        cause: anyhow::Error,
    },

    #[error("Failed to attach the policy {policy_arn} to role {role_name}: {cause}")]
    AttachPolicy {
        policy_arn: String,
        role_name: String,
        cause: anyhow::Error,
    },

    #[error("Failed to detach the policy {policy_arn} from role {role_name}: {cause}")]
    DetachPolicy {
        policy_arn: String,
        role_name: String,
        cause: anyhow::Error,
    },
}

impl BrokerError {
    /// HTTP status code for the protocol response
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::ParameterNotAvailable { .. }
            | BrokerError::ParameterRequired { .. }
            | BrokerError::ParameterNotSupported { .. }
            | BrokerError::ParameterNotString { .. }
            | BrokerError::ServiceNotFound { .. }
            | BrokerError::PlanNotFound { .. }
            | BrokerError::InstanceNotFound { .. }
            | BrokerError::UnsupportedScope { .. } => 400,
            BrokerError::InstanceConflict { .. } | BrokerError::BindingConflict { .. } => 409,
            BrokerError::AsyncRequired | BrokerError::OperationInProgress { .. } => 422,
            _ => 500,
        }
    }

    /// Machine-readable OSB error code, when the protocol defines one
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            BrokerError::AsyncRequired => Some("AsyncRequired"),
            BrokerError::OperationInProgress { .. } => Some("ConcurrencyError"),
            _ => None,
        }
    }

    /// Human-readable description sent to the platform
    pub fn description(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let bad = BrokerError::ParameterRequired {
            name: "req_param".to_string(),
        };
        assert_eq!(bad.status_code(), 400);

        let conflict = BrokerError::InstanceConflict {
            instance_id: "exists".to_string(),
        };
        assert_eq!(conflict.status_code(), 409);

        assert_eq!(BrokerError::AsyncRequired.status_code(), 422);

        let internal = BrokerError::ServiceLookup {
            service_id: "err".to_string(),
            cause: anyhow::anyhow!("test failure"),
        };
        assert_eq!(internal.status_code(), 500);
    }

    #[test]
    fn test_messages_interpolate_identifier_and_cause() {
        let err = BrokerError::InstanceLookup {
            instance_id: "err".to_string(),
            cause: anyhow::anyhow!("test failure"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to get the service instance err: test failure"
        );

        let err = BrokerError::UnsupportedScope {
            stack_id: "an-id".to_string(),
            scope: "ReadOnly".to_string(),
            output: "PolicyArnReadOnly".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "The CloudFormation stack an-id does not support binding with scope 'ReadOnly': output not found: PolicyArnReadOnly"
        );
    }

    #[test]
    fn test_async_required_code() {
        let err = BrokerError::AsyncRequired;
        assert_eq!(err.error_code(), Some("AsyncRequired"));
        assert_eq!(err.description(), ASYNC_REQUIRED_DESCRIPTION);
    }

    #[test]
    fn test_concurrency_error_code() {
        let err = BrokerError::OperationInProgress {
            instance_id: "reserved".to_string(),
        };
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.error_code(), Some("ConcurrencyError"));
    }
}
