//! Persistence of wrapped SK and IK records.
//!
//! A metastore maps `(key id, created)` to an `EnvelopeKeyRecord`. `store` is
//! a conditional create: it returns `false` and leaves the existing record
//! untouched when that exact pair is already present. The key hierarchy
//! relies on this to linearize IK creation across processes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::envelope::EnvelopeKeyRecord;
use crate::error::KeystrataError;
use crate::keys::KeyMeta;

/// Storage backend for wrapped key records.
///
/// Implementations report transient failures as `DependencyTimeout` or
/// `Unavailable` so the hierarchy can retry them.
pub trait Metastore: Send + Sync {
    /// The record stored under exactly `meta`, if any.
    fn load(&self, meta: &KeyMeta) -> Result<Option<EnvelopeKeyRecord>, KeystrataError>;

    /// The record with the greatest `created` for `key_id`, if any.
    fn load_latest(&self, key_id: &str) -> Result<Option<EnvelopeKeyRecord>, KeystrataError>;

    /// Create the record for `meta`. Returns `false` if one already exists.
    fn store(&self, meta: &KeyMeta, record: &EnvelopeKeyRecord) -> Result<bool, KeystrataError>;
}

/// Process-local metastore. Records live as long as the instance.
///
/// Shared between factories with an `Arc`, it behaves like a single database
/// seen by several processes.
#[derive(Debug, Default)]
pub struct InMemoryMetastore {
    records: RwLock<HashMap<String, BTreeMap<i64, EnvelopeKeyRecord>>>,
}

impl InMemoryMetastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a stored key as revoked. Returns `false` if no such record exists.
    pub fn mark_revoked(&self, meta: &KeyMeta) -> bool {
        let mut records = self.records.write();
        match records
            .get_mut(&meta.id)
            .and_then(|versions| versions.get_mut(&meta.created))
        {
            Some(record) => {
                record.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Every stored version of `key_id`, oldest first.
    pub fn versions(&self, key_id: &str) -> Vec<KeyMeta> {
        self.records
            .read()
            .get(key_id)
            .map(|versions| {
                versions
                    .keys()
                    .map(|created| KeyMeta::new(key_id, *created))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of stored records across all key ids.
    pub fn len(&self) -> usize {
        self.records.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Metastore for InMemoryMetastore {
    fn load(&self, meta: &KeyMeta) -> Result<Option<EnvelopeKeyRecord>, KeystrataError> {
        Ok(self
            .records
            .read()
            .get(&meta.id)
            .and_then(|versions| versions.get(&meta.created))
            .cloned())
    }

    fn load_latest(&self, key_id: &str) -> Result<Option<EnvelopeKeyRecord>, KeystrataError> {
        Ok(self
            .records
            .read()
            .get(key_id)
            .and_then(|versions| versions.values().next_back())
            .cloned())
    }

    fn store(&self, meta: &KeyMeta, record: &EnvelopeKeyRecord) -> Result<bool, KeystrataError> {
        let mut records = self.records.write();
        let versions = records.entry(meta.id.clone()).or_default();
        if versions.contains_key(&meta.created) {
            return Ok(false);
        }
        versions.insert(meta.created, record.clone());
        Ok(true)
    }
}
