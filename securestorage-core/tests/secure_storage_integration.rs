//! Integration tests for secure storage.

mod common;

use std::sync::Arc;
use std::thread;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{Device, FlakyStore, RecordingListener};
use securestorage_core::crypto::CipherTextIvMac;
use securestorage_core::platform::{
    HardwareKeystore, KeyValueStore, MemoryCapabilities, StoreChangeListener,
};
use securestorage_core::{BackendKind, SecureStorageError, LEGACY_CAPABILITY_FLAG};
use test_case::test_case;

const LEGACY: MemoryCapabilities = MemoryCapabilities::legacy_device();
const MODERN: MemoryCapabilities = MemoryCapabilities::modern_device();

#[test]
fn test_legacy_device_round_trip() {
    let device = Device::new();
    let storage = device.open(LEGACY);
    assert_eq!(storage.backend().expect("backend"), BackendKind::Legacy);

    storage.put_string("K", "V").expect("put");
    assert!(storage.contains("K").expect("contains"));
    assert_eq!(storage.get_string("K", "X".to_string()).expect("get"), "V");

    storage.remove("K").expect("remove");
    assert!(!storage.contains("K").expect("contains"));
    assert!(device.raw("confidentiality-key-K").is_none());
    assert!(device.raw("integrity-key-K").is_none());
    assert_eq!(storage.get_string("K", "X".to_string()).expect("get"), "X");
}

#[test]
fn test_modern_device_round_trip() {
    let device = Device::new();
    let storage = device.open(MODERN);
    assert_eq!(storage.backend().expect("backend"), BackendKind::Modern);
    assert!(device.raw(LEGACY_CAPABILITY_FLAG).is_none());

    storage.put_string("K", "V").expect("put");
    assert!(device.raw("KeyCipherIVK").is_some());
    assert_eq!(storage.get_string("K", "X".to_string()).expect("get"), "V");

    storage.remove("K").expect("remove");
    assert!(device.raw("KeyCipherIVK").is_none());
}

#[test]
fn test_hardware_only_without_secure_hardware_is_inert() {
    let device = Device::without_secure_hardware();
    let mut config = device.config();
    config.require_hardware_only = true;
    let storage = device.open_with(config, MemoryCapabilities::new(28, false));
    assert!(!storage.is_usable());

    match storage.put_string("K", "V") {
        Err(SecureStorageError::HardwareUnsupported) => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(()) => panic!("expected error"),
    }
    match storage.get_string("K", "X".to_string()) {
        Err(SecureStorageError::HardwareUnsupported) => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("expected error"),
    }
    assert!(matches!(
        storage.contains("K"),
        Err(SecureStorageError::HardwareUnsupported)
    ));
    assert!(matches!(
        storage.clear_all_values(),
        Err(SecureStorageError::HardwareUnsupported)
    ));
    assert!(matches!(
        storage.device_has_secure_hardware_support(),
        Err(SecureStorageError::HardwareUnsupported)
    ));
    assert!(device.keystore.aliases().is_empty());
    assert!(device.store.is_empty());
}

#[test]
fn test_hardware_only_with_secure_hardware() {
    let device = Device::new();
    let mut config = device.config();
    config.require_hardware_only = true;
    let storage = device.open_with(config, MODERN);

    assert!(storage.device_has_secure_hardware_support().expect("probe"));
    assert!(storage.is_key_inside_secure_hardware().expect("query"));
    storage.put_string("K", "V").expect("put");
    assert_eq!(storage.get_string("K", String::new()).expect("get"), "V");
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_typed_round_trips(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let storage = device.open(capabilities);

    let long = "x".repeat(1000);
    for value in ["", "plain", "ünïcödé ✓", "a:b:c", long.as_str()] {
        storage.put_string("string", value).expect("put");
        assert_eq!(storage.get_string("string", "default".to_string()).expect("get"), value);
    }
    for value in [true, false] {
        storage.put_bool("bool", value).expect("put");
        assert_eq!(storage.get_bool("bool", !value).expect("get"), value);
    }
    for value in [0, -1, i32::MIN, i32::MAX] {
        storage.put_int("int", value).expect("put");
        assert_eq!(storage.get_int("int", 42).expect("get"), value);
    }
    for value in [0, i64::MIN, i64::MAX, 1_700_000_000_000] {
        storage.put_long("long", value).expect("put");
        assert_eq!(storage.get_long("long", 42).expect("get"), value);
    }
    for value in [0.1_f32, -0.0, f32::MIN_POSITIVE, f32::MAX, f32::INFINITY, 1.0e-40] {
        storage.put_float("float", value).expect("put");
        assert_eq!(
            storage.get_float("float", 42.0).expect("get").to_bits(),
            value.to_bits()
        );
    }
    for value in [0.1_f64, -0.0, f64::MIN_POSITIVE, f64::MAX, f64::NEG_INFINITY, 5e-324] {
        storage.put_double("double", value).expect("put");
        assert_eq!(
            storage.get_double("double", 42.0).expect("get").to_bits(),
            value.to_bits()
        );
    }
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_entries_are_isolated(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let storage = device.open(capabilities);

    storage.put_string("k1", "v1").expect("put");
    storage.put_string("k2", "v2").expect("put");
    assert_eq!(storage.get_string("k1", String::new()).expect("get"), "v1");
    assert_eq!(storage.get_string("k2", String::new()).expect("get"), "v2");

    if capabilities == MODERN {
        assert_ne!(device.raw("KeyCipherIVk1"), device.raw("KeyCipherIVk2"));
    }
}

#[test]
fn test_missing_value_yields_default() {
    let device = Device::new();
    let storage = device.open(MODERN);
    assert_eq!(storage.get_string("absent", "d".to_string()).expect("get"), "d");
    assert_eq!(storage.get_int("absent", -5).expect("get"), -5);
    assert!(!storage.get_bool("absent", false).expect("get"));
}

#[test]
fn test_tampered_legacy_ciphertext_yields_default() {
    let device = Device::new();
    let storage = device.open(LEGACY);
    storage.put_string("K", "secret value").expect("put");

    let stored = device.raw("K").expect("stored");
    let token: CipherTextIvMac = stored.parse().expect("token");
    let mut ciphertext = token.ciphertext().to_vec();
    for byte in 0..ciphertext.len() {
        for bit in 0..8 {
            ciphertext[byte] ^= 1 << bit;
            let tampered = format!(
                "{}:{}:{}",
                STANDARD.encode(token.iv()),
                STANDARD.encode(token.mac()),
                STANDARD.encode(&ciphertext)
            );
            device.set_raw("K", &tampered);
            assert_eq!(
                storage.get_string("K", "default".to_string()).expect("get"),
                "default"
            );
            ciphertext[byte] ^= 1 << bit;
        }
    }

    device.set_raw("K", &stored);
    assert_eq!(
        storage.get_string("K", "default".to_string()).expect("get"),
        "secret value"
    );
    device.set_raw("K", "not a token");
    assert_eq!(
        storage.get_string("K", "default".to_string()).expect("get"),
        "default"
    );
}

#[test]
fn test_lost_iv_yields_default() {
    let device = Device::new();
    let storage = device.open(MODERN);
    storage.put_string("K", "V").expect("put");
    device.store.remove("KeyCipherIVK".to_string()).expect("remove");
    assert_eq!(storage.get_string("K", "X".to_string()).expect("get"), "X");
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_clear_all_values_keeps_keys(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let storage = device.open(capabilities);
    let names = ["a", "b", "c"];
    for name in names {
        storage.put_string(name, name).expect("put");
    }

    let aliases = device.keystore.aliases();

    storage.clear_all_values().expect("clear");
    for name in names {
        assert!(!storage.contains(name).expect("contains"));
    }
    assert!(storage.key_material_exists().expect("exists"));
    assert_eq!(device.keystore.aliases(), aliases);
    assert_eq!(
        device.raw(LEGACY_CAPABILITY_FLAG).is_some(),
        capabilities == LEGACY
    );
    let expected = if capabilities == LEGACY {
        BackendKind::Legacy
    } else {
        BackendKind::Modern
    };
    assert_eq!(storage.backend().expect("backend"), expected);

    storage.put_string("a", "again").expect("put");
    assert_eq!(storage.get_string("a", String::new()).expect("get"), "again");
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_full_wipe_regenerates_keys(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let storage = device.open(capabilities);
    storage.put_string("K", "V").expect("put");
    assert!(storage.key_material_exists().expect("exists"));

    storage.clear_all_values_and_delete_keys().expect("wipe");
    assert!(!storage.key_material_exists().expect("exists"));
    assert!(!storage.contains("K").expect("contains"));
    assert!(device.keystore.aliases().is_empty());

    storage.put_string("K", "fresh").expect("put");
    assert!(storage.key_material_exists().expect("exists"));
    assert_eq!(storage.get_string("K", String::new()).expect("get"), "fresh");
}

#[test]
fn test_full_wipe_tolerates_missing_keys() {
    let device = Device::new();
    let storage = device.open(MODERN);
    for alias in device.keystore.aliases() {
        device.keystore.delete_entry(alias).expect("delete");
    }
    storage.clear_all_values_and_delete_keys().expect("wipe");
    assert!(device.store.is_empty());
}

#[test]
fn test_full_wipe_keeps_legacy_pinning_on_old_os() {
    let device = Device::new();
    let storage = device.open(LEGACY);
    storage.clear_all_values_and_delete_keys().expect("wipe");
    assert_eq!(device.raw(LEGACY_CAPABILITY_FLAG).as_deref(), Some("true"));
    assert_eq!(storage.backend().expect("backend"), BackendKind::Legacy);
}

#[test]
fn test_backend_is_pinned_across_os_upgrade() {
    let device = Device::new();
    let before = device.open(LEGACY);
    before.put_string("K", "from lollipop").expect("put");
    before.put_int("n", 7).expect("put");
    drop(before);

    let after = device.open(MODERN);
    assert_eq!(after.backend().expect("backend"), BackendKind::Legacy);
    assert_eq!(
        after.get_string("K", String::new()).expect("get"),
        "from lollipop"
    );
    assert_eq!(after.get_int("n", 0).expect("get"), 7);
    assert!(!after.is_key_inside_secure_hardware().expect("query"));
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_values_survive_restart(capabilities: MemoryCapabilities) {
    let device = Device::new();
    device
        .open(capabilities)
        .put_long("counter", 99)
        .expect("put");
    let aliases = device.keystore.aliases();

    let reopened = device.open(capabilities);
    assert_eq!(reopened.get_long("counter", 0).expect("get"), 99);
    assert_eq!(device.keystore.aliases(), aliases);
}

#[test]
fn test_keystore_failure_on_write_and_read() {
    let device = Device::new();
    let storage = device.open(MODERN);
    storage.put_string("K", "V").expect("put");

    device.keystore.set_available(false);
    match storage.put_string("K", "W") {
        Err(err) if err.is_keystore_failure() => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(()) => panic!("expected error"),
    }
    assert_eq!(storage.get_string("K", "X".to_string()).expect("get"), "X");

    device.keystore.set_available(true);
    assert_eq!(storage.get_string("K", "X".to_string()).expect("get"), "V");
}

#[test]
fn test_change_listener_pass_through() {
    let device = Device::new();
    let storage = device.open(MODERN);
    let listener = Arc::new(RecordingListener::default());
    let handle: Arc<dyn StoreChangeListener> = listener.clone();

    storage.register_change_listener(Arc::clone(&handle));
    storage.put_string("K", "V").expect("put");
    storage.clear_all_values().expect("clear");
    storage.unregister_change_listener(handle);
    storage.put_string("L", "W").expect("put");

    let events = listener.events();
    let key_events = events
        .iter()
        .filter(|event| event.as_deref() == Some("K"))
        .count();
    assert_eq!(key_events, 2);
    assert!(events.contains(&Some("KeyCipherIVK".to_string())));
    assert!(!events.contains(&Some("L".to_string())));
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_concurrent_writers(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let storage = Arc::new(device.open(capabilities));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                for round in 0..10 {
                    let own = format!("worker-{worker}");
                    storage.put_int(&own, round).expect("put own");
                    assert_eq!(storage.get_int(&own, -1).expect("get own"), round);
                    storage.put_int("shared", worker).expect("put shared");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    for worker in 0..4 {
        assert_eq!(
            storage
                .get_int(&format!("worker-{worker}"), -1)
                .expect("get"),
            9
        );
    }
    let shared = storage.get_int("shared", -1).expect("get");
    assert!((0..4).contains(&shared));
    assert_eq!(device.keystore.aliases().len(), 1);
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_deferred_persistence(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let mut config = device.config();
    config.async_persistence = true;
    let storage = device.open_with(config, capabilities);

    for i in 0..20 {
        storage.put_int("n", i).expect("put");
        assert_eq!(storage.get_int("n", -1).expect("get"), i);
    }
    storage.remove("gone").expect("remove");
    storage.flush().expect("flush");

    assert!(device.raw("n").is_some());
    let reopened = device.open(capabilities);
    assert_eq!(reopened.get_int("n", -1).expect("get"), 19);
}

fn assert_reserved<T>(result: Result<T, SecureStorageError>) {
    match result {
        Err(SecureStorageError::ReservedName(_)) => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("expected error"),
    }
}

#[test_case(LEGACY_CAPABILITY_FLAG ; "capability flag")]
#[test_case("AesConfidentialityKey" ; "installation confidentiality key")]
#[test_case("AesIntegrityKey" ; "installation integrity key")]
#[test_case("confidentiality-key-K" ; "entry confidentiality key")]
#[test_case("integrity-key-K" ; "entry integrity key")]
#[test_case("KeyCipherIVK" ; "iv record")]
fn test_internal_record_names_are_rejected(name: &str) {
    for (capabilities, backend) in [(LEGACY, BackendKind::Legacy), (MODERN, BackendKind::Modern)] {
        let device = Device::new();
        let storage = device.open(capabilities);
        storage.put_string("K", "V").expect("put");
        let records = device.store.keys().expect("keys");

        assert_reserved(storage.put_string(name, "x"));
        assert_reserved(storage.put_bool(name, true));
        assert_reserved(storage.remove(name));
        assert_reserved(storage.contains(name));
        assert_reserved(storage.get_string(name, String::new()));
        assert_reserved(storage.get_int(name, 0));

        assert_eq!(device.store.keys().expect("keys"), records);
        assert_eq!(storage.backend().expect("backend"), backend);
        assert_eq!(storage.get_string("K", String::new()).expect("get"), "V");
    }
}

#[test]
fn test_capability_flag_cannot_be_removed_after_os_upgrade() {
    let device = Device::new();
    device.open(LEGACY).put_string("K", "V").expect("put");

    let upgraded = device.open(MODERN);
    assert_reserved(upgraded.remove(LEGACY_CAPABILITY_FLAG));
    assert_eq!(upgraded.backend().expect("backend"), BackendKind::Legacy);
    assert_eq!(upgraded.get_string("K", String::new()).expect("get"), "V");
}

#[test_case(LEGACY ; "legacy")]
#[test_case(MODERN ; "modern")]
fn test_failed_put_keeps_previous_value(capabilities: MemoryCapabilities) {
    let device = Device::new();
    let store = Arc::new(FlakyStore::new("K"));
    let storage = device.open_on(store.clone(), capabilities);
    storage.put_string("K", "original").expect("put");
    let records = store.keys().expect("keys");
    let iv = store.get("KeyCipherIVK".to_string()).expect("get");

    store.set_failing(true);
    match storage.put_string("K", "replacement") {
        Err(SecureStorageError::Store(_)) => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(()) => panic!("expected error"),
    }
    assert_eq!(store.keys().expect("keys"), records);
    assert_eq!(store.get("KeyCipherIVK".to_string()).expect("get"), iv);
    assert_eq!(
        storage.get_string("K", "default".to_string()).expect("get"),
        "original"
    );

    store.set_failing(false);
    storage.put_string("K", "replacement").expect("put");
    assert_eq!(
        storage.get_string("K", "default".to_string()).expect("get"),
        "replacement"
    );
}

#[test]
fn test_failed_first_put_leaves_no_entry_keys() {
    let device = Device::new();
    let store = Arc::new(FlakyStore::new("K"));
    let storage = device.open_on(store.clone(), LEGACY);
    let records = store.keys().expect("keys");

    store.set_failing(true);
    assert!(storage.put_string("K", "V").is_err());
    assert_eq!(store.keys().expect("keys"), records);
    assert!(!storage.contains("K").expect("contains"));
}
