//! Administrative endpoints, reachable only from the server host.

use axum::extract::{Extension, Json, Path as UrlPath};
use axum::response::Json as JsonResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::auth::{AdminUser, DynamicUsers};
use crate::config::ConfigStore;
use crate::error::{ApiError, Envelope};
use crate::metrics::Metrics;
use crate::quota::{QuotaTracker, format_size, parse_size};

#[derive(Deserialize)]
pub(crate) struct QuotaUpdateBody {
    #[serde(default)]
    quota: Option<String>,
    #[serde(default, rename = "quotaBytes")]
    quota_bytes: Option<u64>,
}

#[derive(Deserialize)]
pub(crate) struct CreateUserBody {
    username: String,
    password: String,
}

/// Consolidated server state for the external control panel.
pub async fn status(
    admin: AdminUser,
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(quota): Extension<Arc<QuotaTracker>>,
    Extension(dynamic): Extension<Arc<DynamicUsers>>,
    Extension(metrics): Extension<Arc<Metrics>>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();

    let mut shares = Vec::with_capacity(config.shares.len());
    for share in &config.shares {
        let usage = quota
            .usage(share)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let quota_info = share.quota_bytes.map(|limit| {
            json!({
                "limit": limit,
                "limit_display": format_size(limit),
                "used": usage,
                "used_display": format_size(usage),
                "remaining": limit.saturating_sub(usage),
                "over": usage > limit,
            })
        });
        shares.push(json!({
            "name": share.name,
            "root": share.root.display().to_string(),
            "usage": usage,
            "usage_display": format_size(usage),
            "quota": quota_info,
        }));
    }

    let dynamic_names = dynamic.names().await;
    let mut users: Vec<serde_json::Value> = config
        .users
        .iter()
        .map(|user| json!({"name": user.name, "dynamic": false}))
        .chain(
            dynamic_names
                .iter()
                .map(|name| json!({"name": name, "dynamic": true})),
        )
        .collect();
    users.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Ok(Envelope::ok(json!({
        "admin": admin.0.name,
        "uptime_seconds": metrics.uptime_secs(),
        "shares": shares,
        "users": users,
        "rate_limit": {
            "rps": config.rate_limit.rps,
            "burst": config.rate_limit.burst,
            "max_concurrent": config.rate_limit.max_concurrent,
        },
        "dav": {
            "enabled": config.dav.enabled,
            "mount_path": config.dav.mount_path,
        },
    })))
}

/// Updates or clears a share quota in the live snapshot.
pub async fn update_share_quota(
    UrlPath(share_name): UrlPath<String>,
    _admin: AdminUser,
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(quota): Extension<Arc<QuotaTracker>>,
    Json(body): Json<QuotaUpdateBody>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let quota_bytes = match (body.quota_bytes, body.quota.as_deref()) {
        (Some(bytes), _) => (bytes > 0).then_some(bytes),
        (None, Some(text)) => {
            let bytes = parse_size(text).map_err(ApiError::BadRequest)?;
            (bytes > 0).then_some(bytes)
        }
        (None, None) => None,
    };

    let share = store
        .set_share_quota(&share_name, quota_bytes)
        .ok_or(ApiError::UnknownShare)?;
    quota.invalidate(&share_name).await;

    let quota_display = share
        .quota_bytes
        .map(format_size)
        .unwrap_or_else(|| "Unlimited".to_string());
    info!(share = share_name, quota = quota_display, "share quota updated");
    Ok(Envelope::ok_msg(
        "share quota updated",
        json!({
            "share": {
                "name": share.name,
                "quotaBytes": share.quota_bytes,
                "quotaDisplay": quota_display,
            }
        }),
    ))
}

/// Lists configured and dynamically registered users.
pub async fn list_users(
    _admin: AdminUser,
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(dynamic): Extension<Arc<DynamicUsers>>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    let dynamic_names = dynamic.names().await;
    let mut users: Vec<serde_json::Value> = config
        .users
        .iter()
        .map(|user| json!({"name": user.name, "dynamic": false}))
        .chain(
            dynamic_names
                .iter()
                .map(|name| json!({"name": name, "dynamic": true})),
        )
        .collect();
    users.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Ok(Envelope::ok(json!({"users": users})))
}

/// Registers a dynamic user with a bcrypt-hashed secret.
pub async fn create_user(
    _admin: AdminUser,
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(dynamic): Extension<Arc<DynamicUsers>>,
    Json(body): Json<CreateUserBody>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let username = body.username.trim().to_string();
    if username.len() < 3 {
        return Err(ApiError::BadRequest(
            "username must be at least 3 characters".into(),
        ));
    }
    if body.password.len() < 6 {
        return Err(ApiError::BadRequest(
            "password must be at least 6 characters".into(),
        ));
    }
    if store.snapshot().user(&username).is_some() {
        return Err(ApiError::AlreadyExists("username already exists".into()));
    }

    let password = body.password.clone();
    let digest = tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if !dynamic.insert(&username, digest).await {
        return Err(ApiError::AlreadyExists("username already exists".into()));
    }

    info!(user = username, "dynamic user registered");
    Ok(Envelope::ok_msg(
        "user created",
        json!({"user": {"name": username, "dynamic": true}}),
    ))
}

/// Removes a dynamically registered user. Configured users are immutable.
pub async fn remove_user(
    UrlPath(username): UrlPath<String>,
    admin: AdminUser,
    Extension(dynamic): Extension<Arc<DynamicUsers>>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let target = username.trim();
    if target.is_empty() {
        return Err(ApiError::BadRequest("username is required".into()));
    }
    if target.eq_ignore_ascii_case(&admin.0.name) {
        return Err(ApiError::BadRequest(
            "cannot remove the currently authenticated account".into(),
        ));
    }
    if !dynamic.remove(target).await {
        return Err(ApiError::NotFound(
            "user not found or not dynamically registered".into(),
        ));
    }

    info!(user = target, "dynamic user removed");
    Ok(Envelope::ok_msg(
        "user removed",
        json!({"username": target}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthedUser;
    use crate::config::{Config, ConfigStore, FileConfig};
    use tempfile::tempdir;

    fn admin() -> AdminUser {
        AdminUser(AuthedUser {
            name: "alice".into(),
        })
    }

    fn store_with_share(dir: &std::path::Path) -> Arc<ConfigStore> {
        let raw = format!(
            "[[shares]]\nname = \"public\"\npath = \"{}\"\n",
            dir.display()
        );
        let file: FileConfig = toml::from_str(&raw).expect("parse");
        Arc::new(ConfigStore::for_tests(
            Config::validate(file).expect("validate"),
        ))
    }

    #[tokio::test]
    async fn quota_update_round_trips_human_units() {
        let temp = tempdir().expect("tempdir");
        let store = store_with_share(&temp.path().join("public"));
        let quota = Arc::new(QuotaTracker::new());

        let JsonResponse(envelope) = update_share_quota(
            UrlPath("public".into()),
            admin(),
            Extension(store.clone()),
            Extension(quota.clone()),
            Json(QuotaUpdateBody {
                quota: Some("1MB".into()),
                quota_bytes: None,
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("update failed"));

        let data = envelope.data.expect("data");
        assert_eq!(data["share"]["quotaBytes"], 1024 * 1024);
        assert_eq!(store.snapshot().shares[0].quota_bytes, Some(1024 * 1024));

        let missing = update_share_quota(
            UrlPath("ghost".into()),
            admin(),
            Extension(store),
            Extension(quota),
            Json(QuotaUpdateBody {
                quota: None,
                quota_bytes: Some(1),
            }),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::UnknownShare)));
    }

    #[tokio::test]
    async fn dynamic_user_lifecycle() {
        let store = Arc::new(ConfigStore::for_tests(Config::default()));
        let dynamic = Arc::new(DynamicUsers::new());

        create_user(
            admin(),
            Extension(store.clone()),
            Extension(dynamic.clone()),
            Json(CreateUserBody {
                username: "carol".into(),
                password: "pw123456".into(),
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("create failed"));

        let duplicate = create_user(
            admin(),
            Extension(store.clone()),
            Extension(dynamic.clone()),
            Json(CreateUserBody {
                username: "carol".into(),
                password: "pw123456".into(),
            }),
        )
        .await;
        assert!(matches!(duplicate, Err(ApiError::AlreadyExists(_))));

        let JsonResponse(listing) =
            list_users(admin(), Extension(store.clone()), Extension(dynamic.clone()))
                .await
                .unwrap_or_else(|_| panic!("list failed"));
        let users = listing.data.expect("data")["users"].clone();
        assert_eq!(users[0]["name"], "carol");
        assert_eq!(users[0]["dynamic"], true);

        remove_user(UrlPath("carol".into()), admin(), Extension(dynamic.clone()))
            .await
            .unwrap_or_else(|_| panic!("remove failed"));
        let gone = remove_user(UrlPath("carol".into()), admin(), Extension(dynamic)).await;
        assert!(matches!(gone, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn cannot_remove_self_or_short_credentials() {
        let store = Arc::new(ConfigStore::for_tests(Config::default()));
        let dynamic = Arc::new(DynamicUsers::new());

        let result = remove_user(UrlPath("alice".into()), admin(), Extension(dynamic.clone())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = create_user(
            admin(),
            Extension(store),
            Extension(dynamic),
            Json(CreateUserBody {
                username: "xy".into(),
                password: "short".into(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
