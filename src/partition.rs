//! Partition identity and key-id derivation.
//!
//! A partition is the tenant scope of an intermediate key. Its id strings are
//! part of the wire envelope and are shared with every other implementation,
//! so their format is fixed:
//!
//! ```text
//! _SK_{service}_{product}[_{suffix}]
//! _IK_{partition}_{service}_{product}[_{suffix}]
//! ```

use std::fmt;

/// Logical tenant identity: (partition id, service, product), with an
/// optional region suffix for multi-region metastores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    id: String,
    service: String,
    product: String,
    suffix: Option<String>,
}

impl Partition {
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            product: product.into(),
            suffix: None,
        }
    }

    /// A partition whose key ids carry a region suffix. An empty suffix is
    /// treated as no suffix.
    pub fn with_region_suffix(
        id: impl Into<String>,
        service: impl Into<String>,
        product: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        let suffix = suffix.into();
        Self {
            suffix: (!suffix.is_empty()).then_some(suffix),
            ..Self::new(id, service, product)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn region_suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    pub fn system_key_id(&self) -> String {
        let base = format!("_SK_{}_{}", self.service, self.product);
        self.with_suffix(base)
    }

    pub fn intermediate_key_id(&self) -> String {
        self.with_suffix(self.intermediate_key_prefix())
    }

    /// Whether `key_id` names an intermediate key of this partition.
    ///
    /// An unsuffixed partition accepts only its exact id. A suffixed
    /// partition also accepts the unsuffixed id and ids written under another
    /// region's suffix, since regional metastores replicate each other's
    /// records.
    pub fn is_valid_intermediate_key_id(&self, key_id: &str) -> bool {
        if key_id == self.intermediate_key_id() {
            return true;
        }
        if self.suffix.is_none() {
            return false;
        }
        let prefix = self.intermediate_key_prefix();
        key_id
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || (rest.len() > 1 && rest.starts_with('_')))
    }

    fn intermediate_key_prefix(&self) -> String {
        format!("_IK_{}_{}_{}", self.id, self.service, self.product)
    }

    fn with_suffix(&self, base: String) -> String {
        match &self.suffix {
            Some(suffix) => format!("{base}_{suffix}"),
            None => base,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.intermediate_key_id())
    }
}
