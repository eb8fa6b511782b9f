//! Node state survives a restart
//!
//! Each test opens an engine on a temporary directory, mutates it, drops it
//! and opens the same directory again.

use meshsync_core::document::{Audience, Listing};
use meshsync_core::{EngineConfig, MeshEngine, Profile, VersionVector};
use tempfile::TempDir;

fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.node.data_dir = dir.path().join("node");
    config.node.display_name = Some("river-camp".into());
    config
}

fn listing(title: &str) -> Listing {
    Listing {
        title: title.into(),
        category: "tools".into(),
        available: true,
        ..Default::default()
    }
}

#[test]
fn test_identity_and_document_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let (peer_id, id, version) = {
        let engine = MeshEngine::open_dir(config(&dir)).unwrap();
        let id = engine
            .documents()
            .insert(&Listing {
                notes: Some("spare blade in drawer".into()),
                ..listing("Hand saw")
            })
            .unwrap();
        engine
            .set_profile(&Profile {
                display_name: "River".into(),
                home_area: Some("east bank".into()),
                ..Default::default()
            })
            .unwrap();
        (
            engine.peer_id().clone(),
            id,
            engine.documents().version(),
        )
    };

    let engine = MeshEngine::open_dir(config(&dir)).unwrap();
    assert_eq!(engine.peer_id(), &peer_id);
    assert_eq!(engine.documents().version(), version);
    assert_eq!(engine.documents().clock(), 2);

    // Private fields stay on this device, including across restarts
    let saw: Listing = engine.documents().get(&id).unwrap();
    assert_eq!(saw.notes.as_deref(), Some("spare blade in drawer"));
    let (_, profile) = engine.own_profile().unwrap();
    assert_eq!(profile.home_area.as_deref(), Some("east bank"));

    // New writes continue the sequence instead of reusing it
    let change = engine
        .documents()
        .apply_local_change(|tx| tx.set("listings", &id, "available", false))
        .unwrap();
    assert_eq!(change.seq, 3);
    assert_eq!(change.counter, 3);
}

#[test]
fn test_compacted_log_reopens_from_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.document.max_log_changes = 2;

    {
        let engine = MeshEngine::open_dir(config.clone()).unwrap();
        for title in ["Axe", "Saw", "Rope", "Tarp", "Kettle"] {
            engine.documents().insert(&listing(title)).unwrap();
        }
        assert_eq!(engine.documents().checkpoint().unwrap(), 3);
    }

    let engine = MeshEngine::open_dir(config).unwrap();
    assert_eq!(engine.documents().list::<Listing>().len(), 5);
    assert_eq!(engine.documents().log_len(), 2);
    assert_eq!(engine.documents().clock(), 5);

    // A newcomer can no longer be served incrementally
    assert!(engine
        .documents()
        .changes_since(&VersionVector::new(), Audience::Community)
        .is_none());
}

#[test]
fn test_bundles_and_community_key_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let created = {
        let engine = MeshEngine::open_dir(config(&dir)).unwrap();
        engine.documents().insert(&listing("Ladder")).unwrap();
        let changes = engine
            .documents()
            .changes_since(&VersionVector::new(), Audience::TrustedPeer)
            .unwrap();
        let created = engine.relay_change(&changes[0]).unwrap();
        assert_eq!(created.len(), 1);
        created
    };

    let engine = MeshEngine::open_dir(config(&dir)).unwrap();
    assert!(engine.router().contains(&created[0]));
    assert_eq!(engine.node_info().unwrap().stored_bundles, 1);
    assert!(engine.storage().load_community_key().unwrap().is_some());

    // Sequence numbers are never reused after a restart
    engine.documents().insert(&listing("Rake")).unwrap();
    let changes = engine
        .documents()
        .changes_since(&VersionVector::new(), Audience::TrustedPeer)
        .unwrap();
    let again = engine.relay_change(changes.last().unwrap()).unwrap();
    assert!(again[0].seq > created[0].seq);
}
