//! Key lifecycle audit trail.
//!
//! Records every system and intermediate key the hierarchy creates, adopts
//! from a concurrent writer, or loads from the metastore. Records are
//! append-only and carry key identities only, never key material.
//! Sinks are pluggable: keep records in memory, write them to a file, or
//! forward them to any other store.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::keys::KeyMeta;

/// A sink that receives key events. Called synchronously on the thread that
/// produced the event, so implementations should not block for long.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &KeyEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyTier {
    System,
    Intermediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEventKind {
    /// This process generated the key and won the conditional store.
    Created,
    /// This process lost the conditional store and took the winner's key.
    Adopted,
    /// The key was read from the metastore and unwrapped.
    Loaded,
}

/// A permanent record of one key lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub tier: KeyTier,
    pub kind: KeyEventKind,
    pub key_id: String,
    /// `created` of the key the event concerns.
    pub created: i64,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl KeyEvent {
    pub fn new(tier: KeyTier, kind: KeyEventKind, meta: &KeyMeta, timestamp: DateTime<Utc>) -> Self {
        Self {
            tier,
            kind,
            key_id: meta.id.clone(),
            created: meta.created,
            timestamp,
        }
    }

    pub fn meta(&self) -> KeyMeta {
        KeyMeta::new(self.key_id.clone(), self.created)
    }
}

/// An append-only in-memory log of key events.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: Mutex<Vec<KeyEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event so far, oldest first.
    pub fn events(&self) -> Vec<KeyEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of events matching `tier` and `kind`.
    pub fn count(&self, tier: KeyTier, kind: KeyEventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.tier == tier && e.kind == kind)
            .count()
    }
}

impl AuditSink for AuditLog {
    fn append(&self, event: &KeyEvent) {
        self.events.lock().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes key events as JSON lines (one per event) to a file.
/// Creates the file if it doesn't exist; appends if it does.
#[derive(Debug)]
pub struct FileAuditSink {
    file: Mutex<File>,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, event: &KeyEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, key_id = %event.key_id, "audit event serialization failed");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{line}").and_then(|()| file.flush()) {
            tracing::warn!(error = %err, "audit sink write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// The set of sinks attached to one factory.
#[derive(Clone, Default)]
pub(crate) struct AuditTrail {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditTrail {
    pub(crate) fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub(crate) fn emit(&self, event: KeyEvent) {
        for sink in &self.sinks {
            sink.append(&event);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
