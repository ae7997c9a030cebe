//! Key hierarchy management: SK -> IK -> DRK.
//!
//! `KeyManager` resolves the intermediate key a session encrypts or
//! decrypts with, creating and persisting system and intermediate keys on
//! demand.
//!
//! ```text
//! resolve_encryption_ik(partition)
//!   IK cache (latest, usable)  ── hit ──> IK
//!     miss: metastore.load_latest(IK id)
//!       valid record   -> unwrap under its parent SK
//!       missing/invalid -> new IK wrapped under the latest usable SK,
//!                          conditional store; on conflict adopt the winner
//!
//! resolve_decryption_ik(partition, meta)
//!   IK id must belong to partition, else KeyNotFound
//!   IK cache (exact)  ── hit ──> IK
//!     miss: metastore.load(meta) -> unwrap under SK named by ParentKeyMeta
//! ```
//!
//! System keys follow the same path one level up, with the KMS in place of a
//! parent key. Every metastore and KMS call runs under the retry policy.

use std::sync::Arc;

use tracing::{debug, info};

use crate::audit::{AuditTrail, KeyEvent, KeyEventKind, KeyTier};
use crate::cache::KeyCache;
use crate::clock::Clock;
use crate::config::CryptoPolicy;
use crate::crypto;
use crate::envelope::EnvelopeKeyRecord;
use crate::error::KeystrataError;
use crate::keys::{is_key_expired, CryptoKey, KeyMeta};
use crate::kms::KeyManagementService;
use crate::metastore::Metastore;
use crate::metrics::{Metrics, Timed};
use crate::partition::Partition;
use crate::retry::RetryPolicy;

pub struct KeyManager {
    metastore: Arc<dyn Metastore>,
    kms: Arc<dyn KeyManagementService>,
    clock: Arc<dyn Clock>,
    policy: CryptoPolicy,
    retry: RetryPolicy,
    system_keys: KeyCache,
    intermediate_keys: KeyCache,
    audit: AuditTrail,
    metrics: Metrics,
}

impl KeyManager {
    pub(crate) fn new(
        metastore: Arc<dyn Metastore>,
        kms: Arc<dyn KeyManagementService>,
        clock: Arc<dyn Clock>,
        policy: CryptoPolicy,
        retry: RetryPolicy,
        audit: AuditTrail,
        metrics: Metrics,
    ) -> Self {
        let system_keys = KeyCache::new(
            "system",
            policy.cache_system_keys,
            policy.key_cache_max_size,
            policy.revoke_check_interval,
            Arc::clone(&clock),
            metrics.clone(),
        );
        let intermediate_keys = KeyCache::new(
            "intermediate",
            policy.cache_intermediate_keys,
            policy.key_cache_max_size,
            policy.revoke_check_interval,
            Arc::clone(&clock),
            metrics.clone(),
        );
        Self {
            metastore,
            kms,
            clock,
            policy,
            retry,
            system_keys,
            intermediate_keys,
            audit,
            metrics,
        }
    }

    pub fn policy(&self) -> &CryptoPolicy {
        &self.policy
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // -----------------------------------------------------------------------
    // Intermediate keys
    // -----------------------------------------------------------------------

    /// The IK new data for `partition` is encrypted under: the latest
    /// intermediate key that is neither expired nor revoked, created if
    /// necessary.
    pub fn resolve_encryption_ik(
        &self,
        partition: &Partition,
    ) -> Result<Arc<CryptoKey>, KeystrataError> {
        let now = self.clock.unix_seconds();
        self.intermediate_keys.get_or_load_latest(
            &partition.intermediate_key_id(),
            |key| self.is_usable(key, now),
            || self.load_latest_or_create_ik(partition),
        )
    }

    /// The IK named by `meta`, which must belong to `partition`. Revoked
    /// keys are returned: existing data stays decryptable.
    pub fn resolve_decryption_ik(
        &self,
        partition: &Partition,
        meta: &KeyMeta,
    ) -> Result<Arc<CryptoKey>, KeystrataError> {
        if !partition.is_valid_intermediate_key_id(&meta.id) {
            return Err(KeystrataError::KeyNotFound(meta.to_string()));
        }
        self.intermediate_keys.get_or_load(meta, || {
            let record = self
                .load_record(meta)?
                .ok_or_else(|| KeystrataError::KeyNotFound(meta.to_string()))?;
            let key = self.unwrap_intermediate(meta, &record)?;
            self.emit(KeyTier::Intermediate, KeyEventKind::Loaded, meta);
            Ok(key)
        })
    }

    fn load_latest_or_create_ik(&self, partition: &Partition) -> Result<CryptoKey, KeystrataError> {
        let id = partition.intermediate_key_id();
        let latest = self.load_latest_record(&id)?;
        if let Some(record) = &latest {
            if self.is_record_usable(record) {
                let meta = KeyMeta::new(id, record.created);
                let key = self.unwrap_intermediate(&meta, record)?;
                self.emit(KeyTier::Intermediate, KeyEventKind::Loaded, &meta);
                return Ok(key);
            }
            debug!(key_id = %id, created = record.created, revoked = record.revoked, "latest intermediate key unusable");
        }
        self.create_ik(partition, latest.map(|r| r.created))
    }

    fn create_ik(
        &self,
        partition: &Partition,
        previous: Option<i64>,
    ) -> Result<CryptoKey, KeystrataError> {
        let sk = self.resolve_latest_sk(partition)?;
        let meta = KeyMeta::new(
            partition.intermediate_key_id(),
            self.new_key_timestamp(previous),
        );
        let ik = CryptoKey::generate(meta.clone())?;
        let record = EnvelopeKeyRecord {
            revoked: false,
            created: meta.created,
            encrypted_key: crypto::wrap_key(sk.as_bytes(), ik.as_bytes())?,
            parent_key_meta: Some(sk.meta().clone()),
        };

        if self.store_record(&meta, &record)? {
            info!(key = %meta, parent = %sk.meta(), "intermediate key created");
            self.emit(KeyTier::Intermediate, KeyEventKind::Created, &meta);
            return Ok(ik);
        }

        // Another writer stored this (id, created) first. Use theirs.
        drop(ik);
        let winner = self
            .load_record(&meta)?
            .ok_or_else(|| KeystrataError::KeyNotFound(meta.to_string()))?;
        let adopted = self.unwrap_intermediate(&meta, &winner)?;
        info!(key = %meta, "intermediate key adopted from concurrent writer");
        self.emit(KeyTier::Intermediate, KeyEventKind::Adopted, &meta);
        if adopted.is_revoked() {
            return Err(KeystrataError::KeyRevoked(meta.to_string()));
        }
        Ok(adopted)
    }

    fn unwrap_intermediate(
        &self,
        meta: &KeyMeta,
        record: &EnvelopeKeyRecord,
    ) -> Result<CryptoKey, KeystrataError> {
        let parent = record.parent_key_meta.as_ref().ok_or_else(|| {
            KeystrataError::Metastore(format!("intermediate key {meta} has no parent key"))
        })?;
        let sk = self.resolve_sk(parent)?;
        let bytes = crypto::unwrap_key(sk.as_bytes(), &record.encrypted_key)?;
        CryptoKey::from_slice(meta.clone(), record.revoked, &bytes)
    }

    // -----------------------------------------------------------------------
    // System keys
    // -----------------------------------------------------------------------

    fn resolve_sk(&self, meta: &KeyMeta) -> Result<Arc<CryptoKey>, KeystrataError> {
        self.system_keys.get_or_load(meta, || {
            let record = self
                .load_record(meta)?
                .ok_or_else(|| KeystrataError::KeyNotFound(meta.to_string()))?;
            let key = self.unwrap_system(meta, &record)?;
            self.emit(KeyTier::System, KeyEventKind::Loaded, meta);
            Ok(key)
        })
    }

    fn resolve_latest_sk(&self, partition: &Partition) -> Result<Arc<CryptoKey>, KeystrataError> {
        let now = self.clock.unix_seconds();
        self.system_keys.get_or_load_latest(
            &partition.system_key_id(),
            |key| self.is_usable(key, now),
            || self.load_latest_or_create_sk(partition),
        )
    }

    fn load_latest_or_create_sk(&self, partition: &Partition) -> Result<CryptoKey, KeystrataError> {
        let id = partition.system_key_id();
        let latest = self.load_latest_record(&id)?;
        if let Some(record) = &latest {
            if self.is_record_usable(record) {
                let meta = KeyMeta::new(id, record.created);
                let key = self.unwrap_system(&meta, record)?;
                self.emit(KeyTier::System, KeyEventKind::Loaded, &meta);
                return Ok(key);
            }
            debug!(key_id = %id, created = record.created, revoked = record.revoked, "latest system key unusable");
        }

        let meta = KeyMeta::new(id, self.new_key_timestamp(latest.map(|r| r.created)));
        let sk = CryptoKey::generate(meta.clone())?;
        let wrapped = self
            .retry
            .run("kms.encrypt_key", || self.kms.encrypt_key(sk.as_bytes()))?;
        let record = EnvelopeKeyRecord {
            revoked: false,
            created: meta.created,
            encrypted_key: wrapped,
            parent_key_meta: None,
        };

        if self.store_record(&meta, &record)? {
            info!(key = %meta, "system key created");
            self.emit(KeyTier::System, KeyEventKind::Created, &meta);
            return Ok(sk);
        }

        drop(sk);
        let winner = self
            .load_record(&meta)?
            .ok_or_else(|| KeystrataError::KeyNotFound(meta.to_string()))?;
        let adopted = self.unwrap_system(&meta, &winner)?;
        info!(key = %meta, "system key adopted from concurrent writer");
        self.emit(KeyTier::System, KeyEventKind::Adopted, &meta);
        if adopted.is_revoked() {
            return Err(KeystrataError::KeyRevoked(meta.to_string()));
        }
        Ok(adopted)
    }

    fn unwrap_system(
        &self,
        meta: &KeyMeta,
        record: &EnvelopeKeyRecord,
    ) -> Result<CryptoKey, KeystrataError> {
        let bytes = self
            .retry
            .run("kms.decrypt_key", || self.kms.decrypt_key(&record.encrypted_key))?;
        CryptoKey::from_slice(meta.clone(), record.revoked, &bytes)
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn load_record(&self, meta: &KeyMeta) -> Result<Option<EnvelopeKeyRecord>, KeystrataError> {
        debug!(key = %meta, "metastore load");
        self.metrics.time(Timed::MetastoreLoad, || {
            self.retry.run("metastore.load", || self.metastore.load(meta))
        })
    }

    fn load_latest_record(&self, key_id: &str) -> Result<Option<EnvelopeKeyRecord>, KeystrataError> {
        debug!(key_id, "metastore load_latest");
        self.metrics.time(Timed::MetastoreLoad, || {
            self.retry
                .run("metastore.load_latest", || self.metastore.load_latest(key_id))
        })
    }

    /// Conditional create. A retried store whose first attempt landed reports
    /// `false`; the caller then adopts the record, which is its own.
    fn store_record(&self, meta: &KeyMeta, record: &EnvelopeKeyRecord) -> Result<bool, KeystrataError> {
        self.metrics.time(Timed::MetastoreStore, || {
            self.retry
                .run("metastore.store", || self.metastore.store(meta, record))
        })
    }

    fn is_usable(&self, key: &CryptoKey, now: i64) -> bool {
        !key.is_revoked() && !key.is_expired(now, self.policy.expire_after_secs())
    }

    fn is_record_usable(&self, record: &EnvelopeKeyRecord) -> bool {
        !record.revoked
            && !is_key_expired(
                record.created,
                self.clock.unix_seconds(),
                self.policy.expire_after_secs(),
            )
    }

    /// `created` for a new SK or IK: now truncated to the configured
    /// precision, or one past the key being replaced if that is not later.
    fn new_key_timestamp(&self, previous: Option<i64>) -> i64 {
        let now = self.clock.unix_seconds();
        let truncated = now - now.rem_euclid(self.policy.precision_secs());
        match previous {
            Some(previous) if previous >= truncated => previous + 1,
            _ => truncated,
        }
    }

    fn emit(&self, tier: KeyTier, kind: KeyEventKind, meta: &KeyMeta) {
        if !self.audit.is_empty() {
            self.audit.emit(KeyEvent::new(tier, kind, meta, self.clock.now()));
        }
    }

    /// Number of unwrapped system and intermediate keys currently cached.
    pub fn cached_keys(&self) -> usize {
        self.system_keys.len() + self.intermediate_keys.len()
    }

    /// Drop every cached SK and IK.
    pub(crate) fn clear_caches(&self) {
        self.system_keys.clear();
        self.intermediate_keys.clear();
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("policy", &self.policy)
            .field("system_keys", &self.system_keys)
            .field("intermediate_keys", &self.intermediate_keys)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::{AuditLog, AuditSink};
    use crate::clock::ManualClock;
    use crate::kms::{MasterKey, StaticKms};
    use crate::metastore::InMemoryMetastore;

    const T0: i64 = 1_700_000_030;

    struct Fixture {
        store: Arc<InMemoryMetastore>,
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        manager: KeyManager,
    }

    fn fixture(policy: CryptoPolicy) -> Fixture {
        let store = Arc::new(InMemoryMetastore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let audit = Arc::new(AuditLog::new());
        let manager = KeyManager::new(
            store.clone(),
            Arc::new(StaticKms::new(MasterKey::from_bytes([1u8; 32]))),
            clock.clone(),
            policy,
            RetryPolicy::none(),
            AuditTrail::new(vec![audit.clone() as Arc<dyn AuditSink>]),
            Metrics::default(),
        );
        Fixture {
            store,
            clock,
            audit,
            manager,
        }
    }

    fn partition() -> Partition {
        Partition::new("alice", "svc", "prod")
    }

    #[test]
    fn first_encryption_creates_sk_and_ik_at_truncated_time() {
        let f = fixture(CryptoPolicy::default());
        let ik = f.manager.resolve_encryption_ik(&partition()).unwrap();
        assert_eq!(ik.meta(), &KeyMeta::new("_IK_alice_svc_prod", T0 - T0 % 60));
        assert_eq!(f.store.versions("_SK_svc_prod").len(), 1);
        assert_eq!(f.store.versions("_IK_alice_svc_prod").len(), 1);
        assert_eq!(f.audit.count(KeyTier::System, KeyEventKind::Created), 1);
        assert_eq!(f.audit.count(KeyTier::Intermediate, KeyEventKind::Created), 1);

        let again = f.manager.resolve_encryption_ik(&partition()).unwrap();
        assert!(Arc::ptr_eq(&ik, &again));
    }

    #[test]
    fn foreign_ik_id_is_key_not_found() {
        let f = fixture(CryptoPolicy::default());
        let ik = f.manager.resolve_encryption_ik(&partition()).unwrap();
        let other = Partition::new("bob", "svc", "prod");
        assert!(matches!(
            f.manager.resolve_decryption_ik(&other, ik.meta()),
            Err(KeystrataError::KeyNotFound(_))
        ));
    }

    #[test]
    fn missing_ik_version_is_key_not_found() {
        let f = fixture(CryptoPolicy::default());
        let meta = KeyMeta::new("_IK_alice_svc_prod", 42);
        assert!(matches!(
            f.manager.resolve_decryption_ik(&partition(), &meta),
            Err(KeystrataError::KeyNotFound(_))
        ));
    }

    #[test]
    fn expired_ik_rotates_with_monotonic_created() {
        let policy = CryptoPolicy {
            expire_key_after: Duration::from_secs(60),
            revoke_check_interval: Duration::from_secs(1),
            ..CryptoPolicy::default()
        };
        let f = fixture(policy);
        let first = f.manager.resolve_encryption_ik(&partition()).unwrap();
        f.clock.advance(Duration::from_secs(120));
        let second = f.manager.resolve_encryption_ik(&partition()).unwrap();
        assert!(second.created() > first.created());
        assert_ne!(second.as_bytes(), first.as_bytes());

        // The rotated-out key still decrypts.
        let old = f
            .manager
            .resolve_decryption_ik(&partition(), first.meta())
            .unwrap();
        assert_eq!(old.as_bytes(), first.as_bytes());
    }

    #[test]
    fn revoked_ik_in_same_second_uses_previous_plus_one() {
        let policy = CryptoPolicy {
            revoke_check_interval: Duration::from_secs(1),
            ..CryptoPolicy::default()
        };
        let f = fixture(policy);
        let first = f.manager.resolve_encryption_ik(&partition()).unwrap();
        assert!(f.store.mark_revoked(first.meta()));
        f.clock.advance(Duration::from_secs(1));

        let second = f.manager.resolve_encryption_ik(&partition()).unwrap();
        assert_eq!(second.created(), first.created() + 1);
        assert!(!second.is_revoked());
    }

    #[test]
    fn conflicting_store_adopts_existing_record() {
        let f = fixture(CryptoPolicy::default());
        let p = partition();
        // A peer process sharing the metastore writes the IK first.
        let peer_manager = KeyManager::new(
            f.store.clone(),
            Arc::new(StaticKms::new(MasterKey::from_bytes([1u8; 32]))),
            f.clock.clone(),
            CryptoPolicy::default(),
            RetryPolicy::none(),
            AuditTrail::default(),
            Metrics::default(),
        );
        let winner = peer_manager.resolve_encryption_ik(&p).unwrap();

        // Same second, same truncated timestamp: the conditional store loses.
        let adopted = f.manager.create_ik(&p, None).unwrap();
        assert_eq!(adopted.meta(), winner.meta());
        assert_eq!(adopted.as_bytes(), winner.as_bytes());
        assert_eq!(f.audit.count(KeyTier::Intermediate, KeyEventKind::Adopted), 1);
        assert_eq!(f.store.versions("_IK_alice_svc_prod").len(), 1);
    }
}
