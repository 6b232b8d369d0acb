//! Parameter Validation
//!
//! Checks request parameters against a plan's input schema and merges the
//! broker-wide parameter overrides.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::error::BrokerError;
use super::types::{InputParametersSchema, Parameters};

/// Binding parameter naming the IAM role to attach the scope policy to
pub const ROLE_NAME_PARAMETER: &str = "RoleName";

/// Binding parameter selecting the access scope
pub const SCOPE_PARAMETER: &str = "Scope";

/// Parameters accepted on bind (matched case-insensitively)
pub const BINDING_PARAMETERS: [&str; 2] = [ROLE_NAME_PARAMETER, SCOPE_PARAMETER];

/// Broker-wide parameter overrides, parameter name -> value
pub type Overrides = BTreeMap<String, String>;

/// Validates instance-creation parameters against a plan schema
#[derive(Debug, Clone, Copy)]
pub struct ParameterValidator<'a> {
    overrides: &'a Overrides,
    prescribe_overrides: bool,
}

impl<'a> ParameterValidator<'a> {
    pub fn new(overrides: &'a Overrides, prescribe_overrides: bool) -> Self {
        Self {
            overrides,
            prescribe_overrides,
        }
    }

    /// Validate `params` against `schema` and return the merged mapping.
    ///
    /// Unknown caller keys are rejected first, then the merged mapping is
    /// checked for required names. Overrides only apply when prescribed and
    /// only for names the schema declares; they win over caller values.
    pub fn validate(
        &self,
        schema: Option<&InputParametersSchema>,
        params: &Parameters,
    ) -> Result<Parameters, BrokerError> {
        for name in params.keys() {
            if !schema.is_some_and(|s| s.declares(name)) {
                return Err(BrokerError::ParameterNotAvailable { name: name.clone() });
            }
        }

        let mut merged = params.clone();
        if self.prescribe_overrides {
            if let Some(schema) = schema {
                for (name, value) in self.overrides {
                    if schema.declares(name) {
                        debug!(parameter = %name, "Applying broker parameter override");
                        merged.insert(name.clone(), Value::String(value.clone()));
                    }
                }
            }
        }

        if let Some(schema) = schema {
            for name in schema.required_names() {
                if !merged.contains_key(name) {
                    return Err(BrokerError::ParameterRequired {
                        name: name.to_string(),
                    });
                }
            }
        }

        Ok(merged)
    }
}

/// Reject any bind parameter other than `RoleName` and `Scope`, and any
/// value of theirs that is not a string
pub fn validate_bind_params(params: &Parameters) -> Result<(), BrokerError> {
    for name in params.keys() {
        let supported = BINDING_PARAMETERS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(name));
        if !supported {
            return Err(BrokerError::ParameterNotSupported { name: name.clone() });
        }
    }
    for name in BINDING_PARAMETERS {
        string_parameter(params, name)?;
    }
    Ok(())
}

/// Schema published for binding creation on every plan
pub fn binding_schema() -> InputParametersSchema {
    InputParametersSchema::new(json!({
        "$schema": "http://json-schema.org/draft-06/schema#",
        "type": "object",
        "properties": {
            "RoleName": {
                "type": "string",
                "description": "IAM role to attach the access policy to"
            },
            "Scope": {
                "type": "string",
                "description": "Access scope, selects the PolicyArn<Scope> stack output"
            }
        }
    }))
}

/// Look up a string parameter ignoring the case of its name.
///
/// `null` counts as absent; any other non-string value is an error.
pub fn string_parameter<'p>(
    params: &'p Parameters,
    name: &str,
) -> Result<Option<&'p str>, BrokerError> {
    let Some((key, value)) = params.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)) else {
        return Ok(None);
    };
    match value {
        Value::String(s) => Ok(Some(s.as_str())),
        Value::Null => Ok(None),
        _ => Err(BrokerError::ParameterNotString { name: key.clone() }),
    }
}

/// Render a parameter value the way CloudFormation expects it
pub fn parameter_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
