//! Registry + snapshot store integration: a full save/load cycle across
//! simulated process restarts, including legacy-format upgrade.

use linkdrop::registry::{MediaKind, Registry, RegistryConfig};
use linkdrop::snapshot::SnapshotStore;
use std::time::Duration;
use uuid::Uuid;

fn temp_store() -> SnapshotStore {
    let path = std::env::temp_dir().join(format!(
        "linkdrop-integration-{}.json",
        Uuid::new_v4().simple()
    ));
    SnapshotStore::new(path)
}

fn test_registry() -> Registry {
    Registry::new(RegistryConfig {
        ttl: Duration::from_secs(48 * 3600),
        rate_limit: 10,
        prune_every: 50,
    })
}

#[tokio::test]
async fn state_survives_a_restart() {
    let store = temp_store();

    // First process lifetime: publish two files, fetch one of them.
    let registry = test_registry();
    let key_a = registry
        .insert("ref-A".to_string(), MediaKind::Video)
        .expect("insert A");
    let key_b = registry
        .insert("ref-B".to_string(), MediaKind::Document)
        .expect("insert B");
    let fetched = registry.fetch(&key_a).expect("fetch A");
    assert_eq!(fetched.access_count, 1);

    store.save(&registry.export()).await.expect("save");

    // Second process lifetime: restore and verify state carried over.
    let restarted = test_registry();
    restarted.restore(store.load().await.expect("load"));

    let stats = restarted.stats();
    assert_eq!(stats.record_count, 2);
    assert_eq!(stats.total_accesses, 1);
    // Rate windows are not persisted; a fresh process starts clean.
    assert_eq!(stats.active_user_count, 0);

    let record_a = restarted.fetch(&key_a).expect("fetch A after restart");
    assert_eq!(record_a.file_id, "ref-A");
    assert_eq!(record_a.kind, MediaKind::Video);
    assert_eq!(record_a.access_count, 2);

    let record_b = restarted.fetch(&key_b).expect("fetch B after restart");
    assert_eq!(record_b.access_count, 1);

    tokio::fs::remove_file(store.path()).await.expect("cleanup");
}

#[tokio::test]
async fn legacy_snapshot_upgrades_and_round_trips() {
    let store = temp_store();

    // A snapshot written by the old bot: records carry only id and type.
    let legacy = r#"{
        "11aa22bb": { "id": "legacy-doc", "type": "document" },
        "33cc44dd": { "id": "native-photo", "type": "photo",
                      "created_at": 1700000000, "access_count": 4 }
    }"#;
    tokio::fs::write(store.path(), legacy).await.expect("write");

    let registry = test_registry();
    registry.restore(store.load().await.expect("load"));

    // Upgraded record behaves like a native one: fetchable, counted.
    let upgraded = registry.fetch("11aa22bb").expect("upgraded record");
    assert_eq!(upgraded.file_id, "legacy-doc");
    assert_eq!(upgraded.access_count, 1);

    // Save and reload: the once-upgraded record is now indistinguishable
    // from a native-format record.
    store.save(&registry.export()).await.expect("save");
    let reloaded = store.load().await.expect("reload");
    assert_eq!(
        reloaded.get("11aa22bb"),
        registry.export().get("11aa22bb")
    );
    assert_eq!(
        reloaded
            .get("33cc44dd")
            .map(|r| (r.created_at, r.access_count)),
        Some((1_700_000_000, 4))
    );

    tokio::fs::remove_file(store.path()).await.expect("cleanup");
}

#[tokio::test]
async fn rate_limit_applies_after_restore() {
    let store = temp_store();
    let registry = Registry::new(RegistryConfig {
        ttl: Duration::from_secs(3600),
        rate_limit: 2,
        prune_every: 0,
    });
    let key = registry
        .insert("ref".to_string(), MediaKind::Audio)
        .expect("insert");
    store.save(&registry.export()).await.expect("save");

    let restarted = Registry::new(RegistryConfig {
        ttl: Duration::from_secs(3600),
        rate_limit: 2,
        prune_every: 0,
    });
    restarted.restore(store.load().await.expect("load"));

    // The quota starts fresh and is enforced by the restored registry.
    assert!(restarted.check_and_record_request(7));
    assert!(restarted.check_and_record_request(7));
    assert!(!restarted.check_and_record_request(7));
    assert!(restarted.fetch(&key).is_some());

    tokio::fs::remove_file(store.path()).await.expect("cleanup");
}
