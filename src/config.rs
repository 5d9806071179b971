//! CLI arguments, configuration schema, whole-document validation, and the
//! hot-swappable snapshot store.
//!
//! The TOML file is deserialized into the `*Section` structs, then validated
//! wholesale into an immutable [`Config`]. A structural or semantic error
//! anywhere rejects the entire document; nothing is partially applied.
//! Readers take one `Arc<Config>` per request from the [`ConfigStore`].

use arc_swap::ArcSwap;
use cidr::IpCidr;
use clap::Parser;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::ipfilter;
use crate::quota::parse_size;
use crate::rules::Permission;

pub const DEFAULT_CONFIG_PATH: &str = "reefshare.toml";
pub const LOCK_WAIT_TIMEOUT_SECS: u64 = 10;
pub const CONFIG_POLL_INTERVAL_SECS: u64 = 1;
pub const QUOTA_REFRESH_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "reefshare", version, about = "reefshare file server")]
pub struct Args {
    #[arg(
        short = 'c',
        long,
        env = "REEF_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Configuration file path"
    )]
    pub config: String,
    #[arg(long, env = "REEF_BIND", help = "Override the configured bind address")]
    pub host: Option<String>,
    #[arg(
        short = 'p',
        long,
        env = "REEF_PORT",
        help = "Override the configured listen port"
    )]
    pub port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// File schema

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub shares: Vec<ShareSection>,
    #[serde(default)]
    pub users: Vec<UserSection>,
    #[serde(default)]
    pub rules: Vec<RuleSection>,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub ip_filter: IpFilterSection,
    #[serde(default)]
    pub ui: UiSection,
    #[serde(default)]
    pub dav: DavSection,
    #[serde(default)]
    pub hot_reload: HotReloadSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Option<String>,
    #[serde(default)]
    pub tls: TlsSection,
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            cors_origins: None,
            tls: TlsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub certfile: String,
    #[serde(default)]
    pub keyfile: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareSection {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub quota: Option<String>,
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSection {
    pub name: String,
    pub pass: String,
    #[serde(default)]
    pub pass_bcrypt: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    pub who: String,
    #[serde(default)]
    pub allow: Vec<Permission>,
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default = "default_rule_paths")]
    pub paths: Vec<String>,
    #[serde(default = "default_rule_ip_allow")]
    pub ip_allow: Vec<String>,
    #[serde(default)]
    pub ip_deny: Vec<String>,
}

fn default_rule_paths() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_rule_ip_allow() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_rps")]
    pub rps: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_rps() -> u32 {
    50
}

fn default_burst() -> u32 {
    100
}

fn default_max_concurrent() -> u32 {
    32
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            burst: default_burst(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IpFilterSection {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiSection {
    #[serde(default = "default_brand")]
    pub brand: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub text_share_dir: String,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_brand() -> String {
    "reefshare".to_string()
}

fn default_title() -> String {
    "reefshare File Server".to_string()
}

fn default_max_upload_size() -> u64 {
    100 * 1024 * 1024
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for UiSection {
    fn default() -> Self {
        Self {
            brand: default_brand(),
            title: default_title(),
            text_share_dir: String::new(),
            max_upload_size: default_max_upload_size(),
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DavSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default = "default_true")]
    pub lock_manager: bool,
}

fn default_true() -> bool {
    true
}

fn default_mount_path() -> String {
    "/webdav".to_string()
}

impl Default for DavSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mount_path: default_mount_path(),
            lock_manager: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HotReloadSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub watch_config: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for HotReloadSection {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_config: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated snapshot

#[derive(Debug, Clone)]
pub struct Share {
    pub name: String,
    /// Canonicalized at validation time; every resolved path must stay under it.
    pub root: PathBuf,
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum Credential {
    Plain(String),
    Bcrypt(String),
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub credential: Credential,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub who: String,
    pub allow: Vec<Permission>,
    pub roots: Vec<String>,
    pub paths: Vec<String>,
    pub ip_allow: Vec<IpCidr>,
    pub ip_deny: Vec<IpCidr>,
}

#[derive(Debug, Clone, Default)]
pub struct IpFilterRules {
    pub allow: Vec<IpCidr>,
    pub deny: Vec<IpCidr>,
}

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub brand: String,
    pub title: String,
    pub text_share_dir: Option<PathBuf>,
    pub max_upload_size: Option<u64>,
    pub language: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            brand: default_brand(),
            title: default_title(),
            text_share_dir: None,
            max_upload_size: Some(default_max_upload_size()),
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerSection,
    pub shares: Vec<Share>,
    pub users: Vec<User>,
    pub rules: Vec<Rule>,
    pub logging: LoggingSection,
    pub rate_limit: RateLimitSection,
    pub ip_filter: IpFilterRules,
    pub ui: UiConfig,
    pub dav: DavSection,
    pub hot_reload: HotReloadSection,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&raw)?;
        Config::validate(file)
    }

    /// Validates the whole document; any error rejects it entirely.
    pub fn validate(file: FileConfig) -> Result<Config, ConfigError> {
        let mut shares = Vec::with_capacity(file.shares.len());
        for section in &file.shares {
            if section.name.is_empty() || section.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid share name '{}'",
                    section.name
                )));
            }
            if shares.iter().any(|s: &Share| s.name == section.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate share '{}'",
                    section.name
                )));
            }
            if section.path.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "share '{}' has no path",
                    section.name
                )));
            }
            std::fs::create_dir_all(&section.path).map_err(|err| {
                ConfigError::Invalid(format!(
                    "share '{}' path '{}': {err}",
                    section.name, section.path
                ))
            })?;
            let root = std::fs::canonicalize(&section.path).map_err(|err| {
                ConfigError::Invalid(format!(
                    "share '{}' path '{}': {err}",
                    section.name, section.path
                ))
            })?;
            if !root.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "share '{}' path is not a directory",
                    section.name
                )));
            }
            let quota_bytes = match (&section.quota_bytes, &section.quota) {
                (Some(bytes), _) => normalize_quota(*bytes),
                (None, Some(text)) => {
                    let bytes = parse_size(text).map_err(|err| {
                        ConfigError::Invalid(format!("share '{}' quota: {err}", section.name))
                    })?;
                    normalize_quota(bytes)
                }
                (None, None) => None,
            };
            shares.push(Share {
                name: section.name.clone(),
                root,
                quota_bytes,
            });
        }

        let mut users = Vec::with_capacity(file.users.len());
        for section in &file.users {
            if section.name.is_empty() {
                return Err(ConfigError::Invalid("user with empty name".into()));
            }
            if users.iter().any(|u: &User| u.name == section.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate user '{}'",
                    section.name
                )));
            }
            if section.pass.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "user '{}' has an empty secret",
                    section.name
                )));
            }
            let credential = if section.pass_bcrypt {
                Credential::Bcrypt(section.pass.clone())
            } else {
                Credential::Plain(section.pass.clone())
            };
            users.push(User {
                name: section.name.clone(),
                credential,
            });
        }

        let mut rules = Vec::with_capacity(file.rules.len());
        for (index, section) in file.rules.iter().enumerate() {
            if section.who.is_empty() {
                return Err(ConfigError::Invalid(format!("rule #{index} has no subject")));
            }
            let ip_allow = ipfilter::parse_list(&section.ip_allow)
                .map_err(|err| ConfigError::Invalid(format!("rule #{index}: {err}")))?;
            let ip_deny = ipfilter::parse_list(&section.ip_deny)
                .map_err(|err| ConfigError::Invalid(format!("rule #{index}: {err}")))?;
            rules.push(Rule {
                who: section.who.clone(),
                allow: section.allow.clone(),
                roots: section.roots.clone(),
                paths: section.paths.clone(),
                ip_allow,
                ip_deny,
            });
        }

        if file.rate_limit.rps == 0 || file.rate_limit.burst == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.rps and rate_limit.burst must be at least 1".into(),
            ));
        }
        if file.rate_limit.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_concurrent must be at least 1".into(),
            ));
        }

        let ip_filter = IpFilterRules {
            allow: ipfilter::parse_list(&file.ip_filter.allow)
                .map_err(|err| ConfigError::Invalid(format!("ip_filter.allow: {err}")))?,
            deny: ipfilter::parse_list(&file.ip_filter.deny)
                .map_err(|err| ConfigError::Invalid(format!("ip_filter.deny: {err}")))?,
        };

        let text_share_dir = if file.ui.text_share_dir.is_empty() {
            None
        } else {
            std::fs::create_dir_all(&file.ui.text_share_dir)
                .map_err(|err| ConfigError::Invalid(format!("ui.text_share_dir: {err}")))?;
            let dir = std::fs::canonicalize(&file.ui.text_share_dir)
                .map_err(|err| ConfigError::Invalid(format!("ui.text_share_dir: {err}")))?;
            Some(dir)
        };
        let ui = UiConfig {
            brand: file.ui.brand.clone(),
            title: file.ui.title.clone(),
            text_share_dir,
            max_upload_size: normalize_quota(file.ui.max_upload_size),
            language: file.ui.language.clone(),
        };

        let mut dav = file.dav.clone();
        if !dav.mount_path.starts_with('/') || dav.mount_path.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "dav.mount_path '{}' must be an absolute path",
                dav.mount_path
            )));
        }
        while dav.mount_path.ends_with('/') {
            dav.mount_path.pop();
        }

        Ok(Config {
            server: file.server,
            shares,
            users,
            rules,
            logging: file.logging,
            rate_limit: file.rate_limit,
            ip_filter,
            ui,
            dav,
            hot_reload: file.hot_reload,
        })
    }

    pub fn share(&self, name: &str) -> Option<&Share> {
        self.shares.iter().find(|share| share.name == name)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|user| user.name == name)
    }
}

fn normalize_quota(bytes: u64) -> Option<u64> {
    if bytes == 0 { None } else { Some(bytes) }
}

// ---------------------------------------------------------------------------
// Live store

/// Holds the active snapshot. Writers publish a whole new `Arc<Config>`;
/// readers load it once per request and never observe a half-applied update.
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<Config>,
}

impl ConfigStore {
    /// Loads the initial snapshot; errors here are fatal to startup.
    pub fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let config = Config::from_file(&path)?;
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Re-reads the config file. On success the snapshot is swapped and
    /// returned; on failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let config = Arc::new(Config::from_file(&self.path)?);
        self.current.store(config.clone());
        Ok(config)
    }

    /// Updates one share's quota in a fresh snapshot. Returns the updated
    /// share, or None when the share does not exist.
    pub fn set_share_quota(&self, name: &str, quota_bytes: Option<u64>) -> Option<Share> {
        if self.current.load().share(name).is_none() {
            return None;
        }
        self.current.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(share) = next.shares.iter_mut().find(|s| s.name == name) {
                share.quota_bytes = quota_bytes;
            }
            next
        });
        self.current.load().share(name).cloned()
    }

    #[cfg(test)]
    pub fn for_tests(config: Config) -> Self {
        Self {
            path: PathBuf::from("unused.toml"),
            current: ArcSwap::from_pointee(config),
        }
    }
}
