//! # keystrata
//!
//! Application-layer envelope encryption with a rotating key hierarchy.
//!
//! Each payload is encrypted under a fresh Data Row Key (DRK). The DRK is
//! wrapped by the partition's Intermediate Key (IK), the IK by the System Key
//! (SK), and the SK by an external KMS. Only wrapped keys are ever persisted.
//!
//! ```text
//! KMS ──wraps──> SK ──wraps──> IK (per partition) ──wraps──> DRK (per call) ──> payload
//! ```
//!
//! The encrypted artifact, `DataRowRecord`, has one canonical JSON form shared
//! with every other implementation of the scheme; see [`envelope`].
//!
//! ## Public API
//!
//! - [`SessionFactory`] / [`Session`]: encrypt and decrypt per partition.
//! - [`Runtime`]: process-wide `setup` / `shutdown` with string and byte
//!   convenience calls.
//! - [`Metastore`] and [`KeyManagementService`]: the two external seams.
//! - [`AuditSink`]: key lifecycle events.
//! - [`MetricsSink`]: operation timings and key cache hit/miss counts.

pub mod audit;
pub(crate) mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod hierarchy;
pub mod keys;
pub mod kms;
pub mod metastore;
pub mod metrics;
pub mod partition;
pub mod rdbms;
pub mod retry;
pub mod runtime;
pub mod session;
pub(crate) mod session_cache;

pub use audit::{AuditLog, AuditSink, FileAuditSink, KeyEvent, KeyEventKind, KeyTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, CryptoPolicy, KmsKind, MetastoreKind};
pub use envelope::{DataRowRecord, EnvelopeKeyRecord};
pub use error::KeystrataError;
pub use hierarchy::KeyManager;
pub use keys::{CryptoKey, KeyMeta};
pub use kms::{generate_master_key, KeyManagementService, MasterKey, StaticKms};
pub use metastore::{InMemoryMetastore, Metastore};
pub use metrics::{MetricsRecorder, MetricsSink, MetricsSnapshot, TimerSnapshot};
pub use partition::Partition;
pub use rdbms::SqliteMetastore;
pub use retry::RetryPolicy;
pub use runtime::Runtime;
pub use session::{Session, SessionFactory, SessionFactoryBuilder};
