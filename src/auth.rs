//! HTTP Basic authentication against configured and dynamic users.

use axum::RequestPartsExt;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{ConfigStore, Credential};
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::metrics::Metrics;

pub const AUTH_REALM: &str = r#"Basic realm="reefshare""#;

/// A syntactically valid bcrypt digest burned for unknown users so the
/// timing of "unknown user" matches "wrong password".
const DUMMY_BCRYPT_HASH: &str = "$2b$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy";

/// Users registered at runtime through the admin API. They overlay the
/// config snapshot and survive reloads until removed.
#[derive(Debug, Default)]
pub struct DynamicUsers {
    entries: Mutex<HashMap<String, String>>,
}

impl DynamicUsers {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a user with a bcrypt digest. Fails when the name is taken.
    pub async fn insert(&self, name: &str, digest: String) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(name) {
            return false;
        }
        entries.insert(name.to_string(), digest);
        true
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.entries.lock().await.remove(name).is_some()
    }

    pub async fn digest(&self, name: &str) -> Option<String> {
        self.entries.lock().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Verifies a password against one credential. Bcrypt work runs off the
/// async executor.
pub async fn verify_password(credential: &Credential, password: &str) -> bool {
    match credential {
        Credential::Plain(secret) => {
            bool::from(secret.as_bytes().ct_eq(password.as_bytes()))
        }
        Credential::Bcrypt(digest) => bcrypt_verify(password.to_string(), digest.clone()).await,
    }
}

async fn bcrypt_verify(password: String, digest: String) -> bool {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &digest).unwrap_or(false))
        .await
        .unwrap_or(false)
}

/// Resolves credentials to a user name, or None. Unknown users still pay
/// for one bcrypt verification.
pub async fn authenticate(
    store: &ConfigStore,
    dynamic: &DynamicUsers,
    username: &str,
    password: &str,
) -> Option<String> {
    let config = store.snapshot();
    if let Some(user) = config.user(username) {
        if verify_password(&user.credential, password).await {
            return Some(user.name.clone());
        }
        return None;
    }
    if let Some(digest) = dynamic.digest(username).await {
        if bcrypt_verify(password.to_string(), digest).await {
            return Some(username.to_string());
        }
        return None;
    }

    let _ = bcrypt_verify(password.to_string(), DUMMY_BCRYPT_HASH.to_string()).await;
    None
}

/// Extractor for an authenticated request. Rejections never reveal whether
/// the user exists or the password was wrong.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub name: String,
}

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let store = parts
            .extensions
            .get::<Arc<ConfigStore>>()
            .cloned()
            .ok_or_else(|| ApiError::Internal("config store missing".into()))?;
        let dynamic = parts
            .extensions
            .get::<Arc<DynamicUsers>>()
            .cloned()
            .ok_or_else(|| ApiError::Internal("user registry missing".into()))?;
        let metrics = parts.extensions.get::<Arc<Metrics>>().cloned();

        let TypedHeader(credentials) = parts
            .extract::<TypedHeader<Authorization<Basic>>>()
            .await
            .map_err(|_| ApiError::Unauthorized)?;

        match authenticate(&store, &dynamic, credentials.username(), credentials.password()).await
        {
            Some(name) => Ok(AuthedUser { name }),
            None => {
                if let Some(metrics) = metrics {
                    metrics.incr_auth_failure();
                }
                warn!(user = credentials.username(), "authentication failed");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

/// Extractor for administrative endpoints: an authenticated user connecting
/// from the server host itself.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthedUser);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthedUser::from_request_parts(parts, state).await?;
        let loopback = resolve_client_ip(&parts.headers, &parts.extensions)
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
        if !loopback {
            return Err(ApiError::Forbidden(
                "administrative APIs are only accessible from the server host".into(),
            ));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, User};

    fn store_with_users(users: Vec<User>) -> ConfigStore {
        let mut config = Config::default();
        config.users = users;
        ConfigStore::for_tests(config)
    }

    fn plain_user(name: &str, secret: &str) -> User {
        User {
            name: name.into(),
            credential: Credential::Plain(secret.into()),
        }
    }

    #[tokio::test]
    async fn plaintext_credentials_verify() {
        let store = store_with_users(vec![plain_user("alice", "secret")]);
        let dynamic = DynamicUsers::new();

        assert_eq!(
            authenticate(&store, &dynamic, "alice", "secret").await,
            Some("alice".to_string())
        );
        assert_eq!(authenticate(&store, &dynamic, "alice", "wrong").await, None);
        assert_eq!(authenticate(&store, &dynamic, "nobody", "secret").await, None);
    }

    #[tokio::test]
    async fn bcrypt_credentials_verify() {
        let digest = bcrypt::hash("hunter2", 4).expect("hash");
        let store = store_with_users(vec![User {
            name: "bob".into(),
            credential: Credential::Bcrypt(digest),
        }]);
        let dynamic = DynamicUsers::new();

        assert_eq!(
            authenticate(&store, &dynamic, "bob", "hunter2").await,
            Some("bob".to_string())
        );
        assert_eq!(authenticate(&store, &dynamic, "bob", "hunter3").await, None);
    }

    #[tokio::test]
    async fn dynamic_users_overlay_the_snapshot() {
        let store = store_with_users(Vec::new());
        let dynamic = DynamicUsers::new();
        let digest = bcrypt::hash("pw123456", 4).expect("hash");

        assert!(dynamic.insert("carol", digest.clone()).await);
        assert!(!dynamic.insert("carol", digest).await, "duplicate rejected");
        assert_eq!(
            authenticate(&store, &dynamic, "carol", "pw123456").await,
            Some("carol".to_string())
        );

        assert!(dynamic.remove("carol").await);
        assert!(!dynamic.remove("carol").await);
        assert_eq!(
            authenticate(&store, &dynamic, "carol", "pw123456").await,
            None
        );
    }

    #[tokio::test]
    async fn config_users_shadow_dynamic_users() {
        let store = store_with_users(vec![plain_user("dave", "static")]);
        let dynamic = DynamicUsers::new();
        dynamic
            .insert("dave", bcrypt::hash("other", 4).expect("hash"))
            .await;

        // The configured credential wins for a shared name.
        assert_eq!(
            authenticate(&store, &dynamic, "dave", "static").await,
            Some("dave".to_string())
        );
        assert_eq!(authenticate(&store, &dynamic, "dave", "other").await, None);
    }
}
