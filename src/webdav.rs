//! WebDAV 适配层：按共享挂载 dav-server 处理器，复用同一套访问规则。
//!
//! Every DAV verb is mapped to an operation class and authorized through
//! the rule engine before the request reaches the filesystem handler, so
//! nothing is reachable over WebDAV that the REST API would deny.

use arc_swap::ArcSwap;
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Uri};
use axum::response::Response;
use dav_server::{DavHandler, fakels::FakeLs, localfs::LocalFs, memls::MemLs};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::AuthedUser;
use crate::config::{Config, ConfigStore};
use crate::error::ApiError;
use crate::http::ClientIp;
use crate::metrics::Metrics;
use crate::rules::{self, Permission};

/// Per-share DAV handlers, rebuilt whenever the config snapshot changes.
pub struct DavGateway {
    handlers: ArcSwap<HashMap<String, DavHandler>>,
}

impl DavGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            handlers: ArcSwap::from_pointee(build_handlers(config)),
        }
    }

    /// Reload hook: replaces the handler table wholesale.
    pub fn rebuild(&self, config: &Config) {
        self.handlers.store(Arc::new(build_handlers(config)));
    }
}

fn build_handlers(config: &Config) -> HashMap<String, DavHandler> {
    let mut handlers = HashMap::new();
    if !config.dav.enabled {
        return handlers;
    }
    for share in &config.shares {
        let builder = DavHandler::builder()
            .strip_prefix(format!("{}/{}", config.dav.mount_path, share.name))
            .filesystem(LocalFs::new(&share.root, false, false, false));
        let builder = if config.dav.lock_manager {
            builder.locksystem(MemLs::new())
        } else {
            builder.locksystem(FakeLs::new())
        };
        handlers.insert(share.name.clone(), builder.build_handler());
    }
    handlers
}

/// Operation classes a verb needs on the request path, plus the class
/// required on the Destination target for MOVE/COPY.
fn required_operations(method: &Method) -> Option<(&'static [Permission], Option<Permission>)> {
    match method.as_str() {
        "OPTIONS" | "GET" | "HEAD" | "PROPFIND" => Some((&[Permission::Read], None)),
        "PUT" | "MKCOL" | "PROPPATCH" | "LOCK" | "UNLOCK" => Some((&[Permission::Write], None)),
        "DELETE" => Some((&[Permission::Delete], None)),
        "MOVE" => Some((&[Permission::Write], Some(Permission::Write))),
        "COPY" => Some((&[Permission::Read], Some(Permission::Write))),
        _ => None,
    }
}

/// Splits `/<mount>/<share>/<rest>` into decoded (share, rest).
fn split_share_path(uri_path: &str, mount_path: &str) -> Option<(String, String)> {
    let rest = uri_path.strip_prefix(mount_path)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    let (share, rel) = match rest.split_once('/') {
        Some((share, rel)) => (share, rel),
        None => (rest, ""),
    };
    let share = percent_decode_str(share).decode_utf8().ok()?.to_string();
    let rel = percent_decode_str(rel).decode_utf8().ok()?.to_string();
    if share.is_empty() {
        return None;
    }
    Some((share, rel))
}

/// RFC 4918 treats a missing Depth as infinity; both are clamped to depth 1
/// to bound PROPFIND responses on deep trees.
fn clamp_propfind_depth(headers: &mut HeaderMap) {
    let depth = headers
        .get("depth")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("infinity");
    if depth.eq_ignore_ascii_case("infinity") {
        headers.insert("depth", HeaderValue::from_static("1"));
    }
}

fn destination_path(value: &str) -> Result<String, ApiError> {
    let uri: Uri = value
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid destination header".into()))?;
    Ok(uri.path().to_string())
}

/// 校验权限后将请求委托给对应共享的 dav-server 处理器。
pub async fn webdav_handler(
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(gateway): Extension<Arc<DavGateway>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
    mut req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let config = store.snapshot();
    if !config.dav.enabled {
        return Err(ApiError::NotFound("not found".into()));
    }
    metrics.incr_webdav();

    let (share_name, rel_path) = split_share_path(req.uri().path(), &config.dav.mount_path)
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;
    let (path_ops, dest_op) =
        required_operations(req.method()).ok_or(ApiError::MethodNotAllowed)?;

    for op in path_ops {
        rules::authorize(&config, &user.name, *op, &share_name, &rel_path, client_ip)?;
    }
    if let Some(op) = dest_op {
        let destination = req
            .headers()
            .get("destination")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest("destination header required".into()))?;
        let dest = destination_path(destination)?;
        let (dest_share, dest_rel) = split_share_path(&dest, &config.dav.mount_path)
            .ok_or_else(|| ApiError::BadRequest("invalid destination header".into()))?;
        if dest_share != share_name {
            return Err(ApiError::BadRequest(
                "cross-share destination not supported".into(),
            ));
        }
        rules::authorize(&config, &user.name, op, &dest_share, &dest_rel, client_ip)?;
    }

    if req.method().as_str() == "PROPFIND" {
        clamp_propfind_depth(req.headers_mut());
    }

    config.share(&share_name).ok_or(ApiError::UnknownShare)?;
    let handlers = gateway.handlers.load();
    let handler = handlers.get(&share_name).ok_or(ApiError::UnknownShare)?;
    let response = handler.handle(req).await;
    Ok(response.map(AxumBody::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use tempfile::tempdir;

    #[test]
    fn verb_mapping_matches_operation_classes() {
        let read_only = ["OPTIONS", "GET", "HEAD", "PROPFIND"];
        for verb in read_only {
            let method = Method::from_bytes(verb.as_bytes()).expect("method");
            let (ops, dest) = required_operations(&method).expect("mapped");
            assert_eq!(ops, &[Permission::Read]);
            assert!(dest.is_none());
        }

        let write_only = ["PUT", "MKCOL", "PROPPATCH", "LOCK", "UNLOCK"];
        for verb in write_only {
            let method = Method::from_bytes(verb.as_bytes()).expect("method");
            let (ops, dest) = required_operations(&method).expect("mapped");
            assert_eq!(ops, &[Permission::Write]);
            assert!(dest.is_none());
        }

        let (ops, dest) = required_operations(&Method::DELETE).expect("mapped");
        assert_eq!(ops, &[Permission::Delete]);
        assert!(dest.is_none());

        let method = Method::from_bytes(b"MOVE").expect("method");
        let (ops, dest) = required_operations(&method).expect("mapped");
        assert_eq!(ops, &[Permission::Write]);
        assert_eq!(dest, Some(Permission::Write));

        let method = Method::from_bytes(b"COPY").expect("method");
        let (ops, dest) = required_operations(&method).expect("mapped");
        assert_eq!(ops, &[Permission::Read]);
        assert_eq!(dest, Some(Permission::Write));

        let method = Method::from_bytes(b"TRACE").expect("method");
        assert!(required_operations(&method).is_none());
    }

    #[test]
    fn share_and_path_splitting() {
        assert_eq!(
            split_share_path("/webdav/public/a/b.txt", "/webdav"),
            Some(("public".into(), "a/b.txt".into()))
        );
        assert_eq!(
            split_share_path("/webdav/public", "/webdav"),
            Some(("public".into(), String::new()))
        );
        assert_eq!(
            split_share_path("/webdav/pub%20lic/a%20b.txt", "/webdav"),
            Some(("pub lic".into(), "a b.txt".into()))
        );
        assert_eq!(split_share_path("/webdav", "/webdav"), None);
        assert_eq!(split_share_path("/other/public", "/webdav"), None);
    }

    #[test]
    fn propfind_depth_is_clamped() {
        let mut headers = HeaderMap::new();
        clamp_propfind_depth(&mut headers);
        assert_eq!(headers.get("depth").unwrap(), "1");

        let mut headers = HeaderMap::new();
        headers.insert("depth", HeaderValue::from_static("Infinity"));
        clamp_propfind_depth(&mut headers);
        assert_eq!(headers.get("depth").unwrap(), "1");

        let mut headers = HeaderMap::new();
        headers.insert("depth", HeaderValue::from_static("0"));
        clamp_propfind_depth(&mut headers);
        assert_eq!(headers.get("depth").unwrap(), "0");
    }

    #[test]
    fn destination_header_accepts_absolute_urls_and_paths() {
        assert_eq!(
            destination_path("http://example.com/webdav/public/new.txt").unwrap(),
            "/webdav/public/new.txt"
        );
        assert_eq!(
            destination_path("/webdav/public/new.txt").unwrap(),
            "/webdav/public/new.txt"
        );
    }

    #[test]
    fn gateway_builds_one_handler_per_share() {
        let temp = tempdir().expect("tempdir");
        let raw = format!(
            "[[shares]]\nname = \"public\"\npath = \"{0}/public\"\n\n[[shares]]\nname = \"home\"\npath = \"{0}/home\"\n",
            temp.path().display()
        );
        let file: FileConfig = toml::from_str(&raw).expect("parse");
        let config = Config::validate(file).expect("validate");

        let gateway = DavGateway::new(&config);
        let handlers = gateway.handlers.load();
        assert_eq!(handlers.len(), 2);
        assert!(handlers.contains_key("public"));
        assert!(handlers.contains_key("home"));

        let mut disabled = config.clone();
        disabled.dav.enabled = false;
        gateway.rebuild(&disabled);
        assert!(gateway.handlers.load().is_empty());
    }
}
