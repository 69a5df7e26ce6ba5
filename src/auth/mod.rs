use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::types::{AuthConfig, AuthMode};
use crate::error::{Result, RunletError};

/// What a verified caller is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// May submit commands for execution.
    Execute,
    /// May query and cancel executions owned by other requesters.
    Admin,
}

/// Verified caller identity as reported by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub requester_id: String,
    pub permissions: HashSet<Permission>,
}

impl Identity {
    pub fn new(requester_id: impl Into<String>, permissions: &[Permission]) -> Self {
        Self {
            requester_id: requester_id.into(),
            permissions: permissions.iter().copied().collect(),
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_admin(&self) -> bool {
        self.can(Permission::Admin)
    }
}

/// Outcome of token verification. Anything other than `Valid` is treated as
/// unauthenticated by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid(Identity),
    Invalid,
}

/// Trait for the external authentication collaborator.
///
/// The engine never issues or inspects tokens itself; it hands the opaque
/// token to a verifier and consumes the verdict.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Returns the verifier name (e.g., "static", "remote")
    fn name(&self) -> &str;

    /// Verify an opaque bearer token.
    async fn verify(&self, token: &str) -> Result<Verdict>;
}

/// Token verifier backed by an immutable in-config token table.
///
/// Used by the CLI and in tests; a production deployment points `remote`
/// mode at its auth service instead.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    /// Verifier recognizing exactly one token.
    pub fn single(token: impl Into<String>, identity: Identity) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.into(), identity);
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    fn name(&self) -> &str {
        "static"
    }

    async fn verify(&self, token: &str) -> Result<Verdict> {
        match self.tokens.get(token) {
            Some(identity) => Ok(Verdict::Valid(identity.clone())),
            None => Ok(Verdict::Invalid),
        }
    }
}

/// Token verifier that defers to an external auth service over HTTP.
pub struct RemoteTokenVerifier {
    client: Client,
    verify_url: String,
}

impl RemoteTokenVerifier {
    pub fn new(verify_url: String) -> Self {
        Self {
            client: Client::new(),
            verify_url,
        }
    }
}

#[async_trait]
impl TokenVerifier for RemoteTokenVerifier {
    fn name(&self) -> &str {
        "remote"
    }

    async fn verify(&self, token: &str) -> Result<Verdict> {
        let request = VerifyRequest { token };

        let response = self
            .client
            .post(&self.verify_url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // A misbehaving auth service is an engine fault, not proof the
            // caller is unauthenticated.
            return Err(RunletError::Config(format!(
                "auth service returned HTTP {} from {}",
                status, self.verify_url
            )));
        }

        let api_response: VerifyResponse = response.json().await?;
        Ok(api_response.into())
    }
}

// Auth service wire types

#[derive(Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    requester_id: Option<String>,
    #[serde(default)]
    permissions: Vec<Permission>,
}

impl From<VerifyResponse> for Verdict {
    fn from(resp: VerifyResponse) -> Self {
        if !resp.valid {
            return Verdict::Invalid;
        }
        match resp.requester_id {
            Some(requester_id) => Verdict::Valid(Identity {
                requester_id,
                permissions: resp.permissions.into_iter().collect(),
            }),
            // valid=true without an identity is malformed; fail closed.
            None => Verdict::Invalid,
        }
    }
}

/// Build a verifier from configuration.
pub fn create_verifier(config: &AuthConfig) -> Result<Arc<dyn TokenVerifier>> {
    match config.mode {
        AuthMode::Static => {
            let tokens = config
                .tokens
                .iter()
                .map(|entry| {
                    (
                        entry.token.clone(),
                        Identity {
                            requester_id: entry.requester_id.clone(),
                            permissions: entry.permissions.iter().copied().collect(),
                        },
                    )
                })
                .collect();
            Ok(Arc::new(StaticTokenVerifier::new(tokens)))
        }
        AuthMode::Remote => {
            let verify_url = config.verify_url.clone().ok_or_else(|| {
                RunletError::Config("auth.verify_url is required for remote mode".to_string())
            })?;
            Ok(Arc::new(RemoteTokenVerifier::new(verify_url)))
        }
    }
}
