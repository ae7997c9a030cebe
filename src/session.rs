//! Sessions and the factory that hands them out.
//!
//! A `Session` binds one partition to the factory's shared key hierarchy.
//! It holds no key material of its own: every encrypt resolves the current
//! IK through the shared caches, draws a fresh DRK, and scrubs the DRK before
//! returning.
//!
//! Lifecycle: `Open -> Closed`. A handle closes on `close()` or drop. With
//! session caching enabled, handles for one partition share a reference-
//! counted `SessionCore`; the core is torn down only once no handle refers to
//! it and the cache decides to drop it, or when the factory closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::audit::{AuditSink, AuditTrail};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, KmsKind, MetastoreKind};
use crate::crypto;
use crate::envelope::{self, DataRowRecord, EnvelopeKeyRecord};
use crate::error::KeystrataError;
use crate::hierarchy::KeyManager;
use crate::kms::{KeyManagementService, MasterKey, StaticKms};
use crate::metastore::{InMemoryMetastore, Metastore};
use crate::metrics::{Metrics, MetricsSink, Timed};
use crate::partition::Partition;
use crate::rdbms::SqliteMetastore;
use crate::session_cache::SessionCache;

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

/// Per-partition state shared by every handle for that partition.
pub(crate) struct SessionCore {
    partition: Partition,
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    verbose: bool,
    factory_closed: Arc<AtomicBool>,
    retired: AtomicBool,
}

impl SessionCore {
    pub(crate) fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Mark torn down. Handles still pointing here fail with `SessionClosed`.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        !self.retired.load(Ordering::Acquire) && !self.factory_closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A handle for encrypting and decrypting one partition's data.
pub struct Session {
    core: Arc<SessionCore>,
    cache: Option<Arc<SessionCache>>,
    closed: AtomicBool,
}

impl Session {
    pub fn partition(&self) -> &Partition {
        &self.core.partition
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || !self.core.is_live()
    }

    fn ensure_open(&self) -> Result<(), KeystrataError> {
        if self.is_closed() {
            return Err(KeystrataError::SessionClosed);
        }
        Ok(())
    }

    /// Encrypt `plaintext` under a fresh DRK wrapped by the partition's
    /// current IK.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<DataRowRecord, KeystrataError> {
        self.ensure_open()?;
        self.core
            .keys
            .metrics()
            .time(Timed::Encrypt, || self.encrypt_inner(plaintext))
    }

    fn encrypt_inner(&self, plaintext: &[u8]) -> Result<DataRowRecord, KeystrataError> {
        let core = &self.core;
        let ik = core.keys.resolve_encryption_ik(&core.partition)?;

        let drk = crypto::generate_random_key()?;
        let data = crypto::encrypt(&drk, plaintext, &[])?;
        let encrypted_key = crypto::wrap_key(ik.as_bytes(), drk.as_slice())?;
        drop(drk);

        if core.verbose {
            debug!(partition = %core.partition.id(), ik = %ik.meta(), len = plaintext.len(), "encrypt");
        }
        Ok(DataRowRecord {
            key: EnvelopeKeyRecord {
                revoked: false,
                created: core.clock.unix_seconds(),
                encrypted_key,
                parent_key_meta: Some(ik.meta().clone()),
            },
            data,
        })
    }

    /// Decrypt a record produced for this partition.
    ///
    /// A record whose IK belongs to another partition fails with
    /// `KeyNotFound`; a tampered record fails with `IntegrityCheckFailed`.
    pub fn decrypt(&self, record: &DataRowRecord) -> Result<Vec<u8>, KeystrataError> {
        self.ensure_open()?;
        self.core
            .keys
            .metrics()
            .time(Timed::Decrypt, || self.decrypt_inner(record))
    }

    fn decrypt_inner(&self, record: &DataRowRecord) -> Result<Vec<u8>, KeystrataError> {
        let core = &self.core;
        let ik_meta = record.parent_key_meta()?;
        let ik = core.keys.resolve_decryption_ik(&core.partition, ik_meta)?;

        let drk = crypto::unwrap_key(ik.as_bytes(), &record.key.encrypted_key)?;
        let plaintext = crypto::decrypt(crypto::key_array(&drk)?, &record.data, &[])?;

        if core.verbose {
            debug!(partition = %core.partition.id(), ik = %ik_meta, len = plaintext.len(), "decrypt");
        }
        Ok(plaintext)
    }

    /// Encrypt and return the canonical envelope string.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, KeystrataError> {
        envelope::encode_to_string(&self.encrypt(plaintext)?)
    }

    /// Decode a canonical envelope and decrypt it.
    pub fn open(&self, envelope: impl AsRef<[u8]>) -> Result<Vec<u8>, KeystrataError> {
        self.decrypt(&envelope::decode(envelope.as_ref())?)
    }

    /// Close this handle. Later calls are no-ops. Shared state is released
    /// back to the session cache, which decides when to tear it down.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.cache {
            Some(cache) => cache.release(&self.core),
            None => self.core.retire(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("partition", &self.core.partition)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Hands out sessions for one service/product pair. All sessions share the
/// factory's key caches.
pub struct SessionFactory {
    service: String,
    product: String,
    region_suffix: Option<String>,
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    sessions: Option<Arc<SessionCache>>,
    verbose: bool,
    closed: Arc<AtomicBool>,
}

impl SessionFactory {
    /// Build a factory whose metastore and KMS come from `config` alone.
    pub fn from_config(config: Config) -> Result<Self, KeystrataError> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(config)
    }

    pub fn partition(&self, partition_id: &str) -> Partition {
        match &self.region_suffix {
            Some(suffix) => Partition::with_region_suffix(
                partition_id,
                &self.service,
                &self.product,
                suffix.as_str(),
            ),
            None => Partition::new(partition_id, &self.service, &self.product),
        }
    }

    /// A session for `partition_id`. Fails with `SessionClosed` once the
    /// factory has been closed.
    pub fn get_session(&self, partition_id: &str) -> Result<Session, KeystrataError> {
        if self.is_closed() {
            return Err(KeystrataError::SessionClosed);
        }
        let create = || SessionCore {
            partition: self.partition(partition_id),
            keys: Arc::clone(&self.keys),
            clock: Arc::clone(&self.clock),
            verbose: self.verbose,
            factory_closed: Arc::clone(&self.closed),
            retired: AtomicBool::new(false),
        };
        let core = match &self.sessions {
            Some(cache) => cache.acquire(partition_id, create),
            None => Arc::new(create()),
        };
        Ok(Session {
            core,
            cache: self.sessions.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Close every session and drop all cached keys. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cache) = &self.sessions {
            cache.close();
        }
        self.keys.clear_caches();
        info!(service = %self.service, product = %self.product, "session factory closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    /// Number of partitions with live shared session state. Always zero
    /// when session caching is off.
    pub fn cached_sessions(&self) -> usize {
        self.sessions.as_ref().map_or(0, |cache| cache.len())
    }

    /// Outstanding session references for `partition_id` in the cache.
    pub fn session_refs(&self, partition_id: &str) -> Option<usize> {
        self.sessions.as_ref().and_then(|cache| cache.refs(partition_id))
    }
}

impl Drop for SessionFactory {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("service", &self.service)
            .field("product", &self.product)
            .field("region_suffix", &self.region_suffix)
            .field("sessions", &self.sessions)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a `SessionFactory`, letting callers supply the metastore, KMS,
/// clock, audit sinks and metrics sinks that `Config` alone cannot describe.
pub struct SessionFactoryBuilder {
    config: Config,
    metastore: Option<Arc<dyn Metastore>>,
    kms: Option<Arc<dyn KeyManagementService>>,
    clock: Option<Arc<dyn Clock>>,
    sinks: Vec<Arc<dyn AuditSink>>,
    metrics: Vec<Arc<dyn MetricsSink>>,
}

impl SessionFactoryBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            metastore: None,
            kms: None,
            clock: None,
            sinks: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// Use this metastore instead of the one named by `Metastore`.
    pub fn metastore(mut self, metastore: Arc<dyn Metastore>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    /// Use this KMS instead of the one named by `KMS`.
    pub fn kms(mut self, kms: Arc<dyn KeyManagementService>) -> Self {
        self.kms = Some(kms);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics.push(sink);
        self
    }

    pub fn build(self) -> Result<SessionFactory, KeystrataError> {
        let config = self.config;
        config.validate_with(self.kms.is_some())?;

        let metastore = match self.metastore {
            Some(metastore) => metastore,
            None => open_metastore(&config)?,
        };
        let kms = match self.kms {
            Some(kms) => kms,
            None => open_kms(&config)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let policy = config.crypto_policy();

        let sessions = policy.cache_sessions.then(|| {
            Arc::new(SessionCache::new(
                policy.session_cache_max_size,
                policy.session_cache_ttl,
                Arc::clone(&clock),
            ))
        });
        let keys = Arc::new(KeyManager::new(
            metastore,
            kms,
            Arc::clone(&clock),
            policy,
            config.retry_policy(),
            AuditTrail::new(self.sinks),
            Metrics::new(self.metrics),
        ));

        info!(
            service = %config.service_name,
            product = %config.product_id,
            metastore = ?config.metastore,
            session_caching = config.enable_session_caching,
            "session factory ready"
        );
        Ok(SessionFactory {
            service: config.service_name,
            product: config.product_id,
            region_suffix: config.region_suffix.filter(|s| !s.is_empty()),
            keys,
            clock,
            sessions,
            verbose: config.verbose,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn open_metastore(config: &Config) -> Result<Arc<dyn Metastore>, KeystrataError> {
    match config.metastore {
        MetastoreKind::Memory => Ok(Arc::new(InMemoryMetastore::new())),
        MetastoreKind::Rdbms => {
            let connection = config.connection_string.as_deref().unwrap_or_default();
            let timeout = Duration::from_secs(config.dependency_timeout_secs);
            Ok(Arc::new(SqliteMetastore::open(connection, timeout)?))
        }
    }
}

fn open_kms(config: &Config) -> Result<Arc<dyn KeyManagementService>, KeystrataError> {
    match config.kms {
        KmsKind::Static => {
            let hex = config.static_master_key_hex.as_deref().ok_or_else(|| {
                KeystrataError::Config("StaticMasterKeyHex is required when KMS is static".into())
            })?;
            Ok(Arc::new(StaticKms::new(MasterKey::from_hex(hex)?)))
        }
        KmsKind::Aws => Err(KeystrataError::Config(
            "KMS aws has no built-in backend; supply one with SessionFactoryBuilder::kms".into(),
        )),
    }
}
