//! CIDR-based client IP filtering, applied before authentication.

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::middleware::Next;
use cidr::{Cidr, IpCidr};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use crate::config::ConfigStore;
use crate::error::ApiError;
use crate::http::{is_public_path, resolve_client_ip};
use crate::metrics::Metrics;

/// Parses one filter entry into concrete networks.
///
/// `*` expands to both address families, a bare IP becomes a host network,
/// anything else must be valid CIDR notation.
pub fn parse_entry(entry: &str) -> Result<Vec<IpCidr>, String> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err("empty ip filter entry".to_string());
    }
    if trimmed == "*" {
        let v4 = "0.0.0.0/0".parse::<IpCidr>().map_err(|err| err.to_string())?;
        let v6 = "::/0".parse::<IpCidr>().map_err(|err| err.to_string())?;
        return Ok(vec![v4, v6]);
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(vec![IpCidr::new_host(ip)]);
    }
    trimmed
        .parse::<IpCidr>()
        .map(|net| vec![net])
        .map_err(|err| format!("invalid CIDR '{trimmed}': {err}"))
}

/// Parses a whole allow/deny list, rejecting the list on any invalid entry.
pub fn parse_list(entries: &[String]) -> Result<Vec<IpCidr>, String> {
    let mut networks = Vec::new();
    for entry in entries {
        networks.extend(parse_entry(entry)?);
    }
    Ok(networks)
}

fn matches_any(ip: IpAddr, networks: &[IpCidr]) -> bool {
    networks.iter().any(|net| match (net, ip) {
        (IpCidr::V4(net), IpAddr::V4(addr)) => net.contains(&addr),
        (IpCidr::V6(net), IpAddr::V6(addr)) => net.contains(&addr),
        _ => false,
    })
}

/// The filter decision: allowed iff the allow list is empty or contains the
/// IP, and the deny list does not contain it.
pub fn ip_allowed(ip: IpAddr, allow: &[IpCidr], deny: &[IpCidr]) -> bool {
    (allow.is_empty() || matches_any(ip, allow)) && !matches_any(ip, deny)
}

/// Middleware enforcing the configured global filter. Health, metrics, the
/// landing page, and text-share reads bypass it.
pub async fn ip_filter_middleware(
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    request: Request<AxumBody>,
    next: Next,
) -> Response {
    if is_public_path(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let config = store.snapshot();
    let filter = &config.ip_filter;
    if filter.allow.is_empty() && filter.deny.is_empty() {
        return next.run(request).await;
    }

    let client_ip = resolve_client_ip(request.headers(), request.extensions());
    let allowed = match client_ip {
        Some(ip) => ip_allowed(ip, &filter.allow, &filter.deny),
        None => false,
    };
    if !allowed {
        metrics.incr_ip_denied();
        warn!(client_ip = ?client_ip, path = request.uri().path(), "ip blocked");
        return ApiError::IpDenied.into_response();
    }

    next.run(request).await
}
