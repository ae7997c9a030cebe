//! Typed configuration.
//!
//! `Config` enumerates every recognized option under its cross-language JSON
//! name. Unknown keys are rejected at parse time. A few legacy names are
//! accepted as aliases:
//!
//! | Alias | Option |
//! |---|---|
//! | `ExpireAfter` | `ExpireKeyAfter` |
//! | `CheckInterval` | `RevokeCheckInterval` |
//! | `SessionCacheDuration` | `SessionCacheTTL` |
//!
//! All durations are whole seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KeystrataError;
use crate::kms::MasterKey;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetastoreKind {
    #[default]
    #[serde(rename = "memory", alias = "test-debug-memory")]
    Memory,
    #[serde(rename = "rdbms", alias = "sqlite", alias = "test-debug-sqlite")]
    Rdbms,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KmsKind {
    #[default]
    #[serde(rename = "static", alias = "test-debug-static")]
    Static,
    /// A cloud KMS. No backend ships with this crate; inject one through
    /// `SessionFactoryBuilder::kms`.
    #[serde(rename = "aws", alias = "cloud")]
    Aws,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "ProductID")]
    pub product_id: String,
    #[serde(rename = "Metastore", default)]
    pub metastore: MetastoreKind,
    #[serde(
        rename = "ConnectionString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_string: Option<String>,
    #[serde(rename = "KMS", default)]
    pub kms: KmsKind,
    #[serde(
        rename = "StaticMasterKeyHex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub static_master_key_hex: Option<String>,
    #[serde(
        rename = "RegionSuffix",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub region_suffix: Option<String>,
    #[serde(rename = "EnableSessionCaching", default)]
    pub enable_session_caching: bool,
    #[serde(rename = "SessionCacheMaxSize", default = "default_cache_size")]
    pub session_cache_max_size: usize,
    #[serde(
        rename = "SessionCacheTTL",
        alias = "SessionCacheDuration",
        default = "default_session_cache_ttl"
    )]
    pub session_cache_ttl_secs: u64,
    #[serde(
        rename = "ExpireKeyAfter",
        alias = "ExpireAfter",
        default = "default_expire_key_after"
    )]
    pub expire_key_after_secs: u64,
    #[serde(
        rename = "RevokeCheckInterval",
        alias = "CheckInterval",
        default = "default_revoke_check_interval"
    )]
    pub revoke_check_interval_secs: u64,
    #[serde(rename = "CreateDatePrecision", default = "default_create_date_precision")]
    pub create_date_precision_secs: u64,
    #[serde(rename = "CacheSystemKeys", default = "default_true")]
    pub cache_system_keys: bool,
    #[serde(rename = "CacheIntermediateKeys", default = "default_true")]
    pub cache_intermediate_keys: bool,
    #[serde(rename = "KeyCacheMaxSize", default = "default_cache_size")]
    pub key_cache_max_size: usize,
    #[serde(rename = "DependencyTimeout", default = "default_dependency_timeout")]
    pub dependency_timeout_secs: u64,
    #[serde(rename = "MaxRetries", default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "Verbose", default)]
    pub verbose: bool,
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    1000
}

fn default_session_cache_ttl() -> u64 {
    2 * 60 * 60
}

fn default_expire_key_after() -> u64 {
    90 * 24 * 60 * 60
}

fn default_revoke_check_interval() -> u64 {
    60 * 60
}

fn default_create_date_precision() -> u64 {
    60
}

fn default_dependency_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Defaults for everything but the service and product names.
    pub fn new(service_name: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            product_id: product_id.into(),
            metastore: MetastoreKind::default(),
            connection_string: None,
            kms: KmsKind::default(),
            static_master_key_hex: None,
            region_suffix: None,
            enable_session_caching: false,
            session_cache_max_size: default_cache_size(),
            session_cache_ttl_secs: default_session_cache_ttl(),
            expire_key_after_secs: default_expire_key_after(),
            revoke_check_interval_secs: default_revoke_check_interval(),
            create_date_precision_secs: default_create_date_precision(),
            cache_system_keys: true,
            cache_intermediate_keys: true,
            key_cache_max_size: default_cache_size(),
            dependency_timeout_secs: default_dependency_timeout(),
            max_retries: default_max_retries(),
            verbose: false,
        }
    }

    pub fn with_static_master_key(mut self, hex: impl Into<String>) -> Self {
        self.kms = KmsKind::Static;
        self.static_master_key_hex = Some(hex.into());
        self
    }

    pub fn from_json(json: &str) -> Result<Self, KeystrataError> {
        serde_json::from_str(json).map_err(|e| KeystrataError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), KeystrataError> {
        self.validate_with(false)
    }

    /// Validate, skipping the KMS checks when the caller supplies its own KMS.
    pub(crate) fn validate_with(&self, kms_supplied: bool) -> Result<(), KeystrataError> {
        if self.service_name.is_empty() {
            return Err(invalid("ServiceName must not be empty"));
        }
        if self.product_id.is_empty() {
            return Err(invalid("ProductID must not be empty"));
        }
        if self.metastore == MetastoreKind::Rdbms
            && self.connection_string.as_deref().map_or(true, str::is_empty)
        {
            return Err(invalid("ConnectionString is required when Metastore is rdbms"));
        }
        if self.kms == KmsKind::Static && !kms_supplied {
            let hex = self
                .static_master_key_hex
                .as_deref()
                .ok_or_else(|| invalid("StaticMasterKeyHex is required when KMS is static"))?;
            MasterKey::from_hex(hex)?;
        }
        if self.create_date_precision_secs == 0 {
            return Err(invalid("CreateDatePrecision must be at least 1"));
        }
        if self.key_cache_max_size == 0 {
            return Err(invalid("KeyCacheMaxSize must be at least 1"));
        }
        if self.enable_session_caching && self.session_cache_max_size == 0 {
            return Err(invalid("SessionCacheMaxSize must be at least 1"));
        }
        Ok(())
    }

    pub fn crypto_policy(&self) -> CryptoPolicy {
        CryptoPolicy {
            expire_key_after: Duration::from_secs(self.expire_key_after_secs),
            revoke_check_interval: Duration::from_secs(self.revoke_check_interval_secs),
            create_date_precision: Duration::from_secs(self.create_date_precision_secs),
            cache_system_keys: self.cache_system_keys,
            cache_intermediate_keys: self.cache_intermediate_keys,
            key_cache_max_size: self.key_cache_max_size,
            cache_sessions: self.enable_session_caching,
            session_cache_max_size: self.session_cache_max_size,
            session_cache_ttl: Duration::from_secs(self.session_cache_ttl_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.dependency_timeout_secs),
            ..RetryPolicy::default()
        }
    }
}

fn invalid(reason: &str) -> KeystrataError {
    KeystrataError::Config(reason.to_owned())
}

/// Key lifetime and caching rules for one factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoPolicy {
    pub expire_key_after: Duration,
    pub revoke_check_interval: Duration,
    pub create_date_precision: Duration,
    pub cache_system_keys: bool,
    pub cache_intermediate_keys: bool,
    pub key_cache_max_size: usize,
    pub cache_sessions: bool,
    pub session_cache_max_size: usize,
    pub session_cache_ttl: Duration,
}

impl Default for CryptoPolicy {
    fn default() -> Self {
        Config::new("", "").crypto_policy()
    }
}

impl CryptoPolicy {
    pub(crate) fn expire_after_secs(&self) -> i64 {
        whole_secs(self.expire_key_after)
    }

    pub(crate) fn precision_secs(&self) -> i64 {
        whole_secs(self.create_date_precision).max(1)
    }
}

fn whole_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
