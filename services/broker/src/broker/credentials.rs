//! Credential Resolution
//!
//! Turns a stack's outputs into the credential mapping returned on bind.
//!
//! Newer templates emit self-describing `ssm:<path>` references for secret
//! outputs; older templates emit raw parameter paths under the
//! `UserKeyId`/`UserSecretKey` outputs. Both are looked up in the secret
//! store in one pass, and a bind fails if any reference stays unresolved.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::ports::SecretStore;
use super::types::Credentials;

/// Marks an output value as a Parameter Store reference
pub const SSM_VALUE_PREFIX: &str = "ssm:";

/// Outputs with this prefix select IAM policies and are never credentials
pub const POLICY_ARN_OUTPUT_PREFIX: &str = "PolicyArn";

/// Legacy outputs holding raw parameter paths, with their credential suffix
pub const LEGACY_CREDENTIAL_OUTPUTS: [(&str, &str); 2] = [
    ("UserKeyId", "USER_KEY_ID"),
    ("UserSecretKey", "USER_SECRET_KEY"),
];

/// GetParameters accepts at most this many names per call
pub const MAX_PARAMETERS_PER_REQUEST: usize = 10;

/// A stack output value, classified once when the outputs are parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputValue {
    /// Returned to the caller as-is
    Literal(String),
    /// Parameter Store path whose value is returned instead
    SecretRef(String),
}

/// One credential entry derived from a stack output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSource {
    pub credential_key: String,
    pub value: OutputValue,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid parameters: [{}]", .0.join(" "))]
    InvalidParameters(Vec<String>),

    #[error("{0}")]
    Lookup(anyhow::Error),
}

/// Classify every credential-bearing output of a stack
pub fn parse_outputs(service_name: &str, outputs: &BTreeMap<String, String>) -> Vec<CredentialSource> {
    outputs
        .iter()
        .filter(|(key, _)| !key.starts_with(POLICY_ARN_OUTPUT_PREFIX))
        .map(|(key, value)| {
            if let Some(path) = value.strip_prefix(SSM_VALUE_PREFIX) {
                return CredentialSource {
                    credential_key: to_screaming_snake_case(key),
                    value: OutputValue::SecretRef(path.to_string()),
                };
            }

            let legacy = LEGACY_CREDENTIAL_OUTPUTS
                .iter()
                .find(|(output, _)| output == key);

            match legacy {
                Some((_, suffix)) => CredentialSource {
                    credential_key: format!("{}_{}", service_name.to_uppercase(), suffix),
                    value: OutputValue::SecretRef(value.clone()),
                },
                None => CredentialSource {
                    credential_key: to_screaming_snake_case(key),
                    value: OutputValue::Literal(value.clone()),
                },
            }
        })
        .collect()
}

/// `BucketAccessKeyId` -> `BUCKET_ACCESS_KEY_ID`, `SSLCertArn` -> `SSL_CERT_ARN`
pub fn to_screaming_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            out.push('_');
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower)
            {
                out.push('_');
            }
        }
        out.extend(c.to_uppercase());
    }

    out
}

/// Resolves stack outputs into credentials through a secret store
pub struct CredentialResolver<'a> {
    secrets: &'a dyn SecretStore,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(secrets: &'a dyn SecretStore) -> Self {
        Self { secrets }
    }

    pub async fn resolve(
        &self,
        region: &str,
        service_name: &str,
        outputs: &BTreeMap<String, String>,
    ) -> Result<Credentials, ResolveError> {
        let sources = parse_outputs(service_name, outputs);

        let mut paths: Vec<String> = Vec::new();
        for source in &sources {
            if let OutputValue::SecretRef(path) = &source.value {
                if !paths.contains(path) {
                    paths.push(path.clone());
                }
            }
        }

        let mut values = BTreeMap::new();
        let mut invalid = Vec::new();
        for batch in paths.chunks(MAX_PARAMETERS_PER_REQUEST) {
            debug!(count = batch.len(), "Fetching credential parameters");
            let lookup = self
                .secrets
                .get_parameters(region, batch)
                .await
                .map_err(ResolveError::Lookup)?;

            for path in batch {
                let reported_invalid = lookup.invalid.contains(path);
                match lookup.values.get(path) {
                    Some(value) if !reported_invalid => {
                        values.insert(path.clone(), value.clone());
                    }
                    _ => invalid.push(path.clone()),
                }
            }
        }

        if !invalid.is_empty() {
            warn!(unresolved = ?invalid, "Credential parameters could not be resolved");
            return Err(ResolveError::InvalidParameters(invalid));
        }

        let mut credentials = Credentials::new();
        for source in sources {
            let value = match source.value {
                OutputValue::Literal(value) => value,
                OutputValue::SecretRef(path) => values.get(&path).cloned().unwrap_or_default(),
            };
            credentials.insert(source.credential_key, value);
        }

        Ok(credentials)
    }
}
