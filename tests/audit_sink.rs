//! Tests for pluggable key lifecycle sinks.

use std::sync::{Arc, Mutex};

use keystrata::{
    AuditLog, AuditSink, Config, FileAuditSink, KeyEvent, KeyEventKind, KeyMeta, KeyTier,
    ManualClock, SessionFactory,
};

const T0: i64 = 1_700_000_040;

/// A test sink that collects events into a shared Vec.
struct SharedVecSink {
    events: Arc<Mutex<Vec<KeyEvent>>>,
}

impl SharedVecSink {
    fn new(events: Arc<Mutex<Vec<KeyEvent>>>) -> Self {
        Self { events }
    }
}

impl AuditSink for SharedVecSink {
    fn append(&self, event: &KeyEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn config() -> Config {
    Config::new("svc", "prod").with_static_master_key("3c".repeat(32))
}

#[test]
fn test_forward_sink_receives_creation_events() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(AuditLog::new());
    let factory = SessionFactory::builder(config())
        .clock(Arc::new(ManualClock::at_unix(T0)))
        .audit_sink(log.clone())
        .audit_sink(Arc::new(SharedVecSink::new(Arc::clone(&events))))
        .build()
        .unwrap();

    let session = factory.get_session("alice").unwrap();
    session.encrypt(b"first").unwrap();
    session.encrypt(b"second").unwrap();

    // Primary log has the records
    assert_eq!(log.len(), 2);

    // Forward sink also received them, system key first.
    let collected = events.lock().unwrap();
    assert_eq!(collected.len(), 2);
    assert_eq!(collected[0].tier, KeyTier::System);
    assert_eq!(collected[0].kind, KeyEventKind::Created);
    assert_eq!(collected[0].meta(), KeyMeta::new("_SK_svc_prod", T0));
    assert_eq!(collected[1].tier, KeyTier::Intermediate);
    assert_eq!(collected[1].key_id, "_IK_alice_svc_prod");
    assert_eq!(collected[1].timestamp.timestamp(), T0);
    assert_eq!(*collected, log.events());
}

#[test]
fn test_cache_hits_are_not_audited() {
    let log = Arc::new(AuditLog::new());
    let factory = SessionFactory::builder(config())
        .audit_sink(log.clone())
        .build()
        .unwrap();
    let session = factory.get_session("alice").unwrap();

    let record = session.encrypt(b"row").unwrap();
    let after_first = log.len();
    for _ in 0..10 {
        session.encrypt(b"row").unwrap();
        session.decrypt(&record).unwrap();
    }
    assert_eq!(log.len(), after_first);
}

#[test]
fn test_uncached_hierarchy_audits_every_load() {
    let mut config = config();
    config.cache_intermediate_keys = false;
    config.cache_system_keys = false;
    let log = Arc::new(AuditLog::new());
    let factory = SessionFactory::builder(config)
        .audit_sink(log.clone())
        .build()
        .unwrap();
    let session = factory.get_session("alice").unwrap();

    let record = session.encrypt(b"row").unwrap();
    session.decrypt(&record).unwrap();

    assert_eq!(log.count(KeyTier::Intermediate, KeyEventKind::Created), 1);
    assert_eq!(log.count(KeyTier::Intermediate, KeyEventKind::Loaded), 1);
    // The decrypt reloads the SK to unwrap the IK.
    assert_eq!(log.count(KeyTier::System, KeyEventKind::Loaded), 1);
}

#[test]
fn test_file_sink_writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.audit.jsonl");

    {
        let sink = Arc::new(FileAuditSink::new(&path).unwrap());
        let factory = SessionFactory::builder(config())
            .clock(Arc::new(ManualClock::at_unix(T0)))
            .audit_sink(sink)
            .build()
            .unwrap();
        factory.get_session("alice").unwrap().encrypt(b"a").unwrap();
        factory.get_session("bob").unwrap().encrypt(b"b").unwrap();
    }

    let text = std::fs::read_to_string(&path).unwrap();
    let events: Vec<KeyEvent> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].key_id, "_SK_svc_prod");
    assert_eq!(events[1].key_id, "_IK_alice_svc_prod");
    assert_eq!(events[2].key_id, "_IK_bob_svc_prod");
    assert!(events.iter().all(|e| e.kind == KeyEventKind::Created));
    // Identities only, never key bytes.
    assert!(!text.contains("\"Key\""));
}

#[test]
fn test_file_sink_appends_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("append.jsonl");
    let event = KeyEvent::new(
        KeyTier::System,
        KeyEventKind::Loaded,
        &KeyMeta::new("_SK_svc_prod", T0),
        chrono::DateTime::from_timestamp(T0, 0).unwrap(),
    );

    FileAuditSink::new(&path).unwrap().append(&event);
    FileAuditSink::new(&path).unwrap().append(&event);

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 2);
}
