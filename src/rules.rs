use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;

use crate::config::{Config, Rule};
use crate::error::ApiError;
use crate::ipfilter::ip_allowed;

/// Operation classes used for every authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Permission {
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
    #[serde(rename = "D")]
    Delete,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Evaluates the ordered rule set for one request.
///
/// The first rule whose subject, share, path prefix, and client IP all match
/// decides the outcome: Allow when its operation set contains `operation`,
/// Deny otherwise. No matching rule means Deny. Callers hold one config
/// snapshot for the whole request, so the rule set cannot change mid-scan.
pub fn authorize(
    config: &Config,
    user: &str,
    operation: Permission,
    root: &str,
    rel_path: &str,
    client_ip: IpAddr,
) -> Result<(), ApiError> {
    for rule in &config.rules {
        if !rule_matches(rule, user, root, rel_path, client_ip) {
            continue;
        }
        if rule.allow.contains(&operation) {
            tracing::debug!(user, %operation, root, rel_path, "access granted");
            return Ok(());
        }
        tracing::warn!(user, %operation, root, rel_path, "access denied");
        return Err(ApiError::Forbidden(format!(
            "{operation} operation not permitted"
        )));
    }

    tracing::warn!(user, %operation, root, rel_path, "no matching access rule");
    Err(ApiError::Forbidden("access denied".into()))
}

fn rule_matches(rule: &Rule, user: &str, root: &str, rel_path: &str, client_ip: IpAddr) -> bool {
    if rule.who != "*" && rule.who != user {
        return false;
    }
    if !rule.roots.iter().any(|r| r == "*" || r == root) {
        return false;
    }
    if !path_matches(rel_path, &rule.paths) {
        return false;
    }
    ip_allowed(client_ip, &rule.ip_allow, &rule.ip_deny)
}

fn path_matches(rel_path: &str, rule_paths: &[String]) -> bool {
    let candidate = to_slash_form(rel_path);
    rule_paths.iter().any(|entry| {
        if entry == "*" || entry == "/*" {
            return true;
        }
        let prefix = to_slash_form(entry);
        if prefix == "/" || candidate == prefix {
            return true;
        }
        if let Some(stripped) = prefix.strip_suffix('/') {
            return candidate == stripped || candidate.starts_with(&prefix);
        }
        candidate
            .strip_prefix(&prefix)
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

fn to_slash_form(path: &str) -> String {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        unified
    } else {
        format!("/{unified}")
    }
}

/// Share names the user can reach with at least one operation, intersected
/// with the configured shares. Drives the session payload and admin status.
pub fn accessible_roots(config: &Config, user: &str, client_ip: IpAddr) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    for rule in &config.rules {
        if rule.who != "*" && rule.who != user {
            continue;
        }
        if rule.allow.is_empty() || !ip_allowed(client_ip, &rule.ip_allow, &rule.ip_deny) {
            continue;
        }
        if rule.roots.iter().any(|r| r == "*") {
            return config.shares.iter().map(|s| s.name.clone()).collect();
        }
        for root in &rule.roots {
            if config.share(root).is_some() && !roots.contains(root) {
                roots.push(root.clone());
            }
        }
    }
    roots.sort();
    roots
}
