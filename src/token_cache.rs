//! Caching of registry bearer tokens.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::reference::Reference;

/// A token granted during the OAuth2-like workflow for OCI registries.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RegistryToken {
    Token { token: String },
    AccessToken { access_token: String },
}

impl RegistryToken {
    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token())
    }

    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token } => token,
            RegistryToken::AccessToken { access_token } => access_token,
        }
    }
}

#[derive(Clone)]
pub(crate) enum RegistryTokenType {
    Bearer(RegistryToken),
    Basic(String, String),
}

/// Desired operation for registry authentication
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistryOperation {
    /// Authenticate for push operations
    Push,
    /// Authenticate for pull operations
    Pull,
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

/// Tokens cached per (registry, repository, operation). Expired entries
/// are evicted lazily on lookup; concurrent readers share the lock,
/// updates are rare and last-writer-wins.
#[derive(Default, Clone)]
pub(crate) struct TokenCache {
    tokens: Arc<RwLock<BTreeMap<(String, String, RegistryOperation), (RegistryTokenType, u64)>>>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(
        &self,
        reference: &Reference,
        op: RegistryOperation,
        token: RegistryTokenType,
        expiration: u64,
    ) {
        let registry = reference.registry().to_string();
        let repository = reference.repository().to_string();
        debug!(%registry, %repository, ?op, %expiration, "Inserting token");
        self.tokens
            .write()
            .await
            .insert((registry, repository, op), (token, expiration));
    }

    pub(crate) async fn get(
        &self,
        reference: &Reference,
        op: RegistryOperation,
    ) -> Option<RegistryTokenType> {
        let registry = reference.registry().to_string();
        let repository = reference.repository().to_string();
        match self
            .tokens
            .read()
            .await
            .get(&(registry.clone(), repository.clone(), op))
        {
            Some((token, expiration)) => {
                if epoch_secs() > *expiration {
                    debug!(%registry, %repository, ?op, %expiration, miss=false, expired=true, "Fetching token");
                    None
                } else {
                    debug!(%registry, %repository, ?op, %expiration, miss=false, expired=false, "Fetching token");
                    Some(token.clone())
                }
            }
            None => {
                debug!(%registry, %repository, ?op, miss=true, "Fetching token");
                None
            }
        }
    }

    pub(crate) async fn contains_key(&self, reference: &Reference, op: RegistryOperation) -> bool {
        self.get(reference, op).await.is_some()
    }
}
