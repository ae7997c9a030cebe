use keystrata::{Config, KeystrataError, Runtime, SessionFactory};

const MASTER_HEX: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

fn config() -> Config {
    Config::new("svc", "prod").with_static_master_key(MASTER_HEX)
}

#[test]
fn test_setup_encrypt_shutdown_cycle() {
    let runtime = Runtime::new();
    assert!(!runtime.get_setup_status());

    runtime.setup(config()).unwrap();
    assert!(runtime.get_setup_status());

    let sealed = runtime.encrypt_string("pytest", "hello").unwrap();
    assert_eq!(runtime.decrypt_string("pytest", &sealed).unwrap(), "hello");

    let bytes = runtime.encrypt_bytes("pytest", &[0xff, 0x00, 0x7f]).unwrap();
    assert_eq!(runtime.decrypt_bytes("pytest", bytes).unwrap(), vec![0xffu8, 0x00, 0x7f]);

    runtime.shutdown().unwrap();
    assert!(!runtime.get_setup_status());
}

#[test]
fn test_double_setup_is_rejected() {
    let runtime = Runtime::new();
    runtime.setup(config()).unwrap();

    assert!(matches!(
        runtime.setup(config()),
        Err(KeystrataError::AlreadyInitialized)
    ));
    let factory = SessionFactory::from_config(config()).unwrap();
    assert!(matches!(
        runtime.setup_with(factory),
        Err(KeystrataError::AlreadyInitialized)
    ));
    // The first setup is still in effect.
    assert!(runtime.get_setup_status());
}

#[test]
fn test_calls_before_setup_fail() {
    let runtime = Runtime::new();
    assert!(matches!(
        runtime.encrypt_string("p", "x"),
        Err(KeystrataError::NotInitialized)
    ));
    assert!(matches!(
        runtime.decrypt_bytes("p", b"{}"),
        Err(KeystrataError::NotInitialized)
    ));
    assert!(matches!(runtime.factory(), Err(KeystrataError::NotInitialized)));
    // Shutdown without setup is a no-op.
    runtime.shutdown().unwrap();
    runtime.shutdown().unwrap();
}

#[test]
fn test_setup_after_shutdown_starts_clean() {
    let runtime = Runtime::new();
    runtime.setup(config()).unwrap();
    let sealed = runtime.encrypt_string("p", "first run").unwrap();
    let held = runtime.factory().unwrap();
    let session = held.get_session("p").unwrap();
    runtime.shutdown().unwrap();

    // Handles taken before shutdown are closed.
    assert!(held.is_closed());
    assert!(session.is_closed());

    // The default metastore is in memory, so a new setup has no keys from
    // the first run.
    runtime.setup(config()).unwrap();
    assert!(matches!(
        runtime.decrypt_string("p", &sealed),
        Err(KeystrataError::KeyNotFound(_))
    ));
    let again = runtime.encrypt_string("p", "second run").unwrap();
    assert_eq!(runtime.decrypt_string("p", &again).unwrap(), "second run");
}

#[test]
fn test_setup_from_json_with_legacy_names() {
    let runtime = Runtime::new();
    runtime
        .setup_json(&format!(
            r#"{{
                "ServiceName": "svc",
                "ProductID": "prod",
                "Metastore": "test-debug-memory",
                "KMS": "test-debug-static",
                "StaticMasterKeyHex": "{MASTER_HEX}",
                "EnableSessionCaching": true,
                "Verbose": true
            }}"#
        ))
        .unwrap();
    let sealed = runtime.encrypt_string("json", "configured").unwrap();
    assert_eq!(runtime.decrypt_string("json", &sealed).unwrap(), "configured");
    assert_eq!(runtime.factory().unwrap().cached_sessions(), 1);
}

#[test]
fn test_invalid_setup_leaves_runtime_uninitialized() {
    let runtime = Runtime::new();

    assert!(matches!(
        runtime.setup(Config::new("svc", "prod")),
        Err(KeystrataError::Config(_))
    ));
    assert!(matches!(
        runtime.setup_json(r#"{"ServiceName":"svc","ProductID":"prod","Colour":"blue"}"#),
        Err(KeystrataError::Config(_))
    ));
    assert!(!runtime.get_setup_status());
}

#[test]
fn test_decrypt_string_rejects_non_utf8_plaintext() {
    let runtime = Runtime::new();
    runtime.setup(config()).unwrap();
    let sealed = runtime.encrypt_bytes("p", &[0xc3, 0x28]).unwrap();
    assert!(matches!(
        runtime.decrypt_string("p", &sealed),
        Err(KeystrataError::InvalidUtf8)
    ));
}

#[test]
fn test_runtime_works_as_a_static() {
    static RUNTIME: Runtime = Runtime::new();
    RUNTIME.setup(config()).unwrap();
    let sealed = RUNTIME.encrypt_string("global", "static").unwrap();
    assert_eq!(RUNTIME.decrypt_string("global", sealed).unwrap(), "static");
    RUNTIME.shutdown().unwrap();
}
