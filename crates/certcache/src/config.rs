//! File-based configuration
//!
//! ```toml
//! [store]
//! kind = "dir"                      # or "secret-manager"
//! dir = "/var/lib/certcache/certs"
//!
//! [acme]                            # optional: put a CachingStore in front
//! cache_dir = "/var/lib/certcache/acme"
//! readonly = false
//!
//! [serving]
//! ttl_secs = 21600
//! fetch_timeout_secs = 5
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::caching::{CachingStore, CachingStoreConfig};
use crate::serving::{ServingCacheConfig, DEFAULT_TTL};
use crate::store::{
    BackingStore, DirStore, RoutingStore, SecretManagerStore, StaticToken, StoreError,
    DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT,
};

/// Environment variable holding the Secret Manager bearer token by default
pub const DEFAULT_TOKEN_ENV: &str = "CERTCACHE_TOKEN";

/// Errors that can occur when loading or applying a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field is missing or has an unusable value
    #[error("{path}: {message}")]
    InvalidField { path: String, message: String },

    /// Multiple errors collected during validation
    #[error("{}", display_multiple(.0))]
    Multiple(Vec<ConfigError>),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn display_multiple(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn invalid(path: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        path: path.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    Dir,
    SecretManager,
}

/// Where certificates live
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Root directory (`dir` only)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Project owning the secrets (`secret-manager` only)
    #[serde(default)]
    pub project: Option<String>,
    /// Prefix prepended to every secret id
    #[serde(default)]
    pub prefix: String,
    /// Environment variable carrying the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Keep local-only keys in this directory instead of the secret store
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

/// ACME caching store in front of the main store
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeConfig {
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub account_key_name: Option<String>,
}

/// In-memory serving cache
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServingConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// PEM bundle replacing the built-in web PKI roots
    #[serde(default)]
    pub roots_file: Option<PathBuf>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            roots_file: None,
            fetch_timeout_secs: None,
        }
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub acme: Option<AcmeConfig>,
    #[serde(default)]
    pub serving: ServingConfig,
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        match self.store.kind {
            StoreKind::Dir => {
                if self.store.dir.is_none() {
                    errors.push(invalid("store.dir", "required when kind = \"dir\""));
                }
                if self.store.project.is_some() || self.store.local_dir.is_some() {
                    errors.push(invalid(
                        "store",
                        "project and local_dir only apply to kind = \"secret-manager\"",
                    ));
                }
            }
            StoreKind::SecretManager => {
                match &self.store.project {
                    Some(project) if !project.is_empty() => {}
                    _ => errors.push(invalid(
                        "store.project",
                        "required when kind = \"secret-manager\"",
                    )),
                }
                if self.store.request_timeout_secs == 0 {
                    errors.push(invalid("store.request_timeout_secs", "must be at least 1"));
                }
            }
        }

        if let Some(acme) = &self.acme {
            if acme.cache_dir.as_os_str().is_empty() {
                errors.push(invalid("acme.cache_dir", "must not be empty"));
            }
            if matches!(&acme.account_key_name, Some(name) if name.is_empty()) {
                errors.push(invalid("acme.account_key_name", "must not be empty"));
            }
        }

        if self.serving.ttl_secs == 0 {
            errors.push(invalid("serving.ttl_secs", "must be at least 1"));
        }
        if self.serving.fetch_timeout_secs == Some(0) {
            errors.push(invalid("serving.fetch_timeout_secs", "must be at least 1"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }

    /// Build the store stack described by `[store]` and `[acme]`
    pub fn open_store(&self) -> Result<Arc<dyn BackingStore>, ConfigError> {
        let base: Arc<dyn BackingStore> = match self.store.kind {
            StoreKind::Dir => {
                let dir = self
                    .store
                    .dir
                    .as_ref()
                    .ok_or_else(|| invalid("store.dir", "required when kind = \"dir\""))?;
                Arc::new(DirStore::new(dir)?)
            }
            StoreKind::SecretManager => {
                let shared: Arc<dyn BackingStore> = Arc::new(self.secret_manager_store()?);
                match &self.store.local_dir {
                    Some(local_dir) => {
                        let local: Arc<dyn BackingStore> = Arc::new(DirStore::new(local_dir)?);
                        Arc::new(RoutingStore::new(local, shared)) as Arc<dyn BackingStore>
                    }
                    None => shared,
                }
            }
        };

        match &self.acme {
            Some(acme) => {
                let mut caching = CachingStoreConfig::new(&acme.cache_dir).readonly(acme.readonly);
                caching.account_key_name = acme.account_key_name.clone();
                Ok(Arc::new(CachingStore::new(base, caching)?))
            }
            None => Ok(base),
        }
    }

    fn secret_manager_store(&self) -> Result<SecretManagerStore, ConfigError> {
        let project = self.store.project.clone().unwrap_or_default();
        let token = std::env::var(&self.store.token_env)
            .map_err(|_| ConfigError::MissingEnv(self.store.token_env.clone()))?;
        let endpoint = self
            .store
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(SecretManagerStore::with_options(
            project,
            self.store.prefix.clone(),
            Arc::new(StaticToken::new(token)),
            endpoint,
            Duration::from_secs(self.store.request_timeout_secs),
        )?)
    }

    /// Serving cache options described by `[serving]`
    pub fn serving_cache_config(&self) -> Result<ServingCacheConfig, ConfigError> {
        let mut config =
            ServingCacheConfig::default().with_ttl(Duration::from_secs(self.serving.ttl_secs));
        if let Some(path) = &self.serving.roots_file {
            config = config.with_roots(Arc::new(load_roots(path)?));
        }
        if let Some(secs) = self.serving.fetch_timeout_secs {
            config = config.with_fetch_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

/// Read every CERTIFICATE block in a PEM bundle into a root store
pub fn load_roots(path: &Path) -> Result<RootCertStore, ConfigError> {
    let data = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let blocks = pem::parse_many(&data)
        .map_err(|e| invalid("serving.roots_file", format!("{}: {}", path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(
        blocks
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| CertificateDer::from(block.into_contents())),
    );
    if added == 0 {
        return Err(invalid(
            "serving.roots_file",
            format!("no usable certificates in {}", path.display()),
        ));
    }

    info!(path = %path.display(), added, ignored, "Loaded root certificates");
    Ok(roots)
}
