//! # Long-Poll Authentication
//!
//! HTTP Basic credential parsing and verification against an identity collaborator.
//! A successful check yields an [`Authentication`] carrying the user's group and tenant
//! memberships, which scope the lease attempts made on the user's behalf.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::error::FetchAndLockError;
use crate::config::{AuthConfig, StaticUserConfig};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format: {0}")]
    MalformedHeader(String),

    #[error("Invalid credentials for user '{0}'")]
    InvalidCredentials(String),
}

/// User and password decoded from a `Basic` authorization header
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"***REDACTED***")
            .finish()
    }
}

impl Credentials {
    pub fn from_authorization_header(
        header: Option<&str>,
    ) -> std::result::Result<Self, AuthenticationError> {
        let header = header.ok_or(AuthenticationError::MissingHeader)?.trim();
        let (scheme, encoded) = header
            .split_once(' ')
            .ok_or_else(|| AuthenticationError::MalformedHeader("expected '<scheme> <value>'".into()))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthenticationError::MalformedHeader(format!(
                "unsupported scheme '{scheme}'"
            )));
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthenticationError::MalformedHeader(e.to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| AuthenticationError::MalformedHeader(e.to_string()))?;
        let (user_id, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthenticationError::MalformedHeader("missing ':' separator".into()))?;
        if user_id.is_empty() {
            return Err(AuthenticationError::MalformedHeader("empty user id".into()));
        }

        Ok(Self {
            user_id: user_id.to_string(),
            password: password.to_string(),
        })
    }

    /// Encode as a `Basic` header value
    pub fn to_authorization_header(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.user_id, self.password))
        )
    }
}

/// The identity collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync + Debug {
    async fn check_password(&self, user_id: &str, password: &str) -> Result<bool>;

    async fn group_ids(&self, user_id: &str) -> Result<Vec<String>>;

    /// Tenants of the user, directly or through one of `group_ids`
    async fn tenant_ids(&self, user_id: &str, group_ids: &[String]) -> Result<Vec<String>>;
}

/// Identity provider backed by the users listed in configuration
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentityProvider {
    users: HashMap<String, StaticUserConfig>,
}

impl InMemoryIdentityProvider {
    pub fn new(users: impl IntoIterator<Item = StaticUserConfig>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.id.clone(), user))
                .collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.users.iter().cloned())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn check_password(&self, user_id: &str, password: &str) -> Result<bool> {
        Ok(self
            .users
            .get(user_id)
            .is_some_and(|user| user.password == password))
    }

    async fn group_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .users
            .get(user_id)
            .map(|user| user.groups.clone())
            .unwrap_or_default())
    }

    async fn tenant_ids(&self, user_id: &str, _group_ids: &[String]) -> Result<Vec<String>> {
        Ok(self
            .users
            .get(user_id)
            .map(|user| user.tenants.clone())
            .unwrap_or_default())
    }
}

/// Identity bound to one lease attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub user_id: String,
    pub group_ids: Vec<String>,
    pub tenant_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    enabled: bool,
    realm: String,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: &AuthConfig) -> Self {
        Self {
            provider,
            enabled: config.enabled,
            realm: config.realm.clone(),
        }
    }

    /// Authenticator that accepts every request anonymously
    pub fn disabled() -> Self {
        Self {
            provider: Arc::new(InMemoryIdentityProvider::default()),
            enabled: false,
            realm: AuthConfig::default().realm,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Authenticate a request; `Ok(None)` when authentication is disabled
    pub async fn authenticate(
        &self,
        authorization_header: Option<&str>,
    ) -> std::result::Result<Option<Authentication>, FetchAndLockError> {
        if !self.enabled {
            return Ok(None);
        }

        let credentials = Credentials::from_authorization_header(authorization_header)
            .map_err(|e| {
                debug!(error = %e, "Rejecting request with unusable credentials");
                self.unauthorized()
            })?;

        let valid = self
            .provider
            .check_password(&credentials.user_id, &credentials.password)
            .await?;
        if !valid {
            warn!(
                user_id = %credentials.user_id,
                "{}",
                AuthenticationError::InvalidCredentials(credentials.user_id.clone())
            );
            return Err(self.unauthorized());
        }

        let group_ids = self.provider.group_ids(&credentials.user_id).await?;
        let tenant_ids = self
            .provider
            .tenant_ids(&credentials.user_id, &group_ids)
            .await?;

        Ok(Some(Authentication {
            user_id: credentials.user_id,
            group_ids,
            tenant_ids,
        }))
    }

    fn unauthorized(&self) -> FetchAndLockError {
        FetchAndLockError::Unauthorized {
            realm: self.realm.clone(),
        }
    }
}
