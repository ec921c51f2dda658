//! Integration tests for hosting transactions, vault info and manifests.

mod common;

use common::{TestEngine, manifest_file, sample_files, vault_key};
use pinfold_archive::MemoryFile;
use pinfold_core::FlockIntent;
use pinfold_server::engine::EngineError;
use serde_json::json;

#[tokio::test]
async fn hosting_loads_and_flocks_the_vault() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let key = vault_key(1);
    t.opener.publish(&key, sample_files(1, 2));

    let record = t.host("alice", &key).await;
    assert_eq!(record.owner_name.as_deref(), Some("alice-name"));
    assert_eq!(record.name.as_deref(), Some("test vault"));

    let handle = t.engine.get_vault(&key).unwrap();
    assert_eq!(handle.flock_intent(), Some(FlockIntent::FULL));
    assert!(t.swarm.is_listening(handle.discovery_key()));

    let listed = t.metadata().list_user_vaults("alice").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key().unwrap(), key);
}

#[tokio::test]
async fn unknown_user_cannot_host() {
    let t = TestEngine::new().await;
    let err = t
        .engine
        .add_hosted_vault("ghost", &vault_key(2), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UserNotFound(_)));
    assert_eq!(t.opener.open_count(), 0);
}

#[tokio::test]
async fn user_at_quota_is_out_of_space() {
    let t = TestEngine::new().await;
    t.create_user("alice", Some(100)).await;
    t.metadata()
        .update_user_disk_usage("alice", 100)
        .await
        .unwrap();

    let err = t
        .engine
        .add_hosted_vault("alice", &vault_key(3), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfSpace { .. }));
    assert!(t.metadata().get_vault(&vault_key(3)).await.unwrap().is_none());
}

#[tokio::test]
async fn second_owner_is_rejected() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    t.create_user("bob", None).await;
    let key = vault_key(4);
    t.host("alice", &key).await;

    let err = t
        .engine
        .add_hosted_vault("bob", &key, None)
        .await
        .unwrap_err();
    assert!(err.is_already_hosted());
    assert!(t.metadata().list_user_vaults("bob").await.unwrap().is_empty());

    // The current owner may host again.
    let record = t.host("alice", &key).await;
    assert_eq!(record.hosting_users, vec!["alice"]);
}

#[tokio::test]
async fn removing_an_unhosted_vault_changes_nothing() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let removed = t
        .engine
        .remove_hosted_vault("alice", &vault_key(5))
        .await
        .unwrap();
    assert!(!removed);
    t.settle().await;
}

#[tokio::test]
async fn admin_removal_drops_every_host() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let key = vault_key(6);
    t.host("alice", &key).await;

    let users = t.engine.admin_remove_vault(&key).await.unwrap();
    t.settle().await;

    assert_eq!(users, vec!["alice"]);
    assert!(t.engine.get_vault(&key).is_none());
    assert!(t.metadata().list_user_vaults("alice").await.unwrap().is_empty());
    assert_eq!(t.metadata().list_dead_vault_keys().await.unwrap(), vec![key]);

    let err = t.engine.admin_remove_vault(&vault_key(7)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn vault_info_describes_a_loaded_vault() {
    let t = TestEngine::new().await;
    t.create_user("alice", None).await;
    let key = vault_key(8);
    t.opener.publish(&key, sample_files(8, 2));
    t.host("alice", &key).await;
    t.archive(&key).set_remote_peers(2);

    let info = t.engine.vault_info(&key).await.unwrap();
    assert_eq!(info.key, key);
    assert_eq!(info.num_peers, 3);
    assert_eq!(info.flock_intent, Some(FlockIntent::FULL));
    assert!(!info.is_loading);
    assert_eq!(info.stats.num_files, 3);
    // Blocks are not local yet.
    assert!(info.manifest.is_none());

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["numPeers"], 3);
    assert_eq!(json["flockIntent"], json!({ "upload": true, "download": true }));

    let status = t.engine.vault_status(&key).await.unwrap();
    assert_eq!(status.progress, 0.0);
    assert!(t.engine.get_vault_mtime(&key).await > 0);
    assert_eq!(t.engine.get_vault_mtime(&vault_key(9)).await, 0);
    t.settle().await;
}

#[tokio::test]
async fn manifest_is_cached_by_offset() {
    let t = TestEngine::new().await;
    let key = vault_key(10);
    t.opener.publish(&key, vec![manifest_file("first")]);
    t.engine.load_vault(&key).await.unwrap();
    assert!(t.engine.get_manifest(&key).await.is_none());

    t.archive(&key).download_all().await.unwrap();
    let manifest = t.engine.get_manifest(&key).await.unwrap();
    assert_eq!(manifest["title"], "first");

    // A new version whose manifest is not downloaded yet keeps the cached copy.
    t.opener.publish(&key, vec![manifest_file("second")]);
    assert_eq!(t.engine.get_manifest(&key).await.unwrap()["title"], "first");

    t.archive(&key).download_all().await.unwrap();
    assert_eq!(t.engine.get_manifest(&key).await.unwrap()["title"], "second");
    t.settle().await;
}

#[tokio::test]
async fn invalid_manifests_are_ignored() {
    let t = TestEngine::new().await;
    let key = vault_key(11);
    t.opener
        .publish(&key, vec![MemoryFile::new("/dpack.json", "[1, 2, 3]")]);
    t.engine.load_vault(&key).await.unwrap();
    t.archive(&key).download_all().await.unwrap();

    assert!(t.engine.get_manifest(&key).await.is_none());
    assert!(t.engine.get_manifest(&vault_key(12)).await.is_none());
    t.settle().await;
}
