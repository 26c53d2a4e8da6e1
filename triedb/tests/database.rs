//! Integration tests for the trie database facade.
//!
//! Every test opens its own sled instance, either temporary or inside a
//! `tempfile` directory when the test needs to reopen it. Both schemes are
//! driven through the same public API; the interesting parts are which
//! scheme gets picked, which operations each scheme refuses, and what is
//! durable after commit and close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use triedb::hashdb::{self, ChildResolver};
use triedb::pathdb;
use triedb::{
    Config, Database, DiskDb, ErrorKind, Hash, MergedNodeSet, Node, NodeSet, Scheme, StateSet,
    StorageSize, EMPTY_ROOT_HASH, ZERO_HASH,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Test node encoding: one salt byte followed by the 32-byte hashes of the
/// node's children.
struct ConcatResolver;

impl ChildResolver for ConcatResolver {
    fn for_each_child(&self, blob: &[u8], on_child: &mut dyn FnMut(Hash)) {
        for chunk in blob.get(1..).unwrap_or_default().chunks_exact(32) {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(chunk);
            on_child(hash);
        }
    }
}

fn hash_config() -> Config {
    Config {
        hash_db: Some(hashdb::Config::defaults().with_resolver(ConcatResolver)),
        ..Default::default()
    }
}

fn path_config() -> Config {
    Config::path_defaults()
}

/// A root with two leaves, valid under both schemes. Returns the root hash,
/// the `(path, hash)` of every node, and the node set.
fn trie(salt: u8) -> (Hash, Vec<(Vec<u8>, Hash)>, MergedNodeSet) {
    let left = Node::new(vec![salt]);
    let right = Node::new(vec![salt.wrapping_add(128)]);
    let mut blob = vec![salt];
    blob.extend_from_slice(&left.hash);
    blob.extend_from_slice(&right.hash);
    let root = Node::new(blob);

    let nodes = vec![
        (Vec::new(), root.hash),
        (vec![0x01], left.hash),
        (vec![0x02], right.hash),
    ];
    let root_hash = root.hash;

    let mut set = NodeSet::new(ZERO_HASH);
    set.add_node(Vec::new(), root);
    set.add_node(vec![0x01], left);
    set.add_node(vec![0x02], right);
    (root_hash, nodes, MergedNodeSet::with_set(set))
}

fn states(salt: u8) -> StateSet {
    let mut states = StateSet::new();
    states.set_account([salt; 32], vec![salt; 8]);
    states
}

fn assert_readable(db: &Database, root: Hash, nodes: &[(Vec<u8>, Hash)]) {
    let reader = db.reader(root).expect("reader");
    assert_eq!(reader.root(), root);
    for (path, hash) in nodes {
        let blob = reader.node(&ZERO_HASH, path, hash).expect("node");
        assert_eq!(triedb::hash_node(&blob), *hash);
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[test]
fn fresh_disk_without_config_uses_hash_scheme() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, None).expect("open");

    assert_eq!(db.scheme(), Scheme::Hash);
    assert!(db.config().hash_db.is_some());
    assert!(db.config().path_db.is_none());
    assert_eq!(db.resolution(), (Scheme::Hash, None));

    let (root, _, _) = trie(1);
    assert!(!db.initialized(root));
}

#[test]
fn recorded_scheme_is_used_on_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let db = Database::new(DiskDb::open(dir.path()).expect("open"), Some(path_config())).expect("db");
        db.commit(EMPTY_ROOT_HASH, false).expect("commit");
        db.close().expect("close");
    }

    let db = Database::new(DiskDb::open(dir.path()).expect("reopen"), None).expect("db");
    assert_eq!(db.scheme(), Scheme::Path);
    assert_eq!(db.config().path_db, Some(pathdb::Config::defaults()));
}

#[test]
fn explicit_hash_overrides_recorded_path_with_warning() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let db = Database::new(DiskDb::open(dir.path()).expect("open"), Some(path_config())).expect("db");
        db.commit(EMPTY_ROOT_HASH, false).expect("commit");
    }

    let db = Database::new(DiskDb::open(dir.path()).expect("reopen"), Some(hash_config())).expect("db");
    let (scheme, mismatch) = db.resolution();
    assert_eq!(scheme, Scheme::Hash);
    let mismatch = mismatch.expect("mismatch reported");
    assert_eq!(mismatch.recorded, Scheme::Path);
    assert_eq!(mismatch.requested, Scheme::Hash);
    // the marker belongs to whoever wrote first
    assert_eq!(db.disk().read_state_scheme().expect("scheme"), Some(Scheme::Path));
}

#[test]
fn both_sub_configs_are_rejected() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let config = Config {
        hash_db: Some(hashdb::Config::defaults()),
        path_db: Some(pathdb::Config::defaults()),
        ..Default::default()
    };
    let err = Database::new(disk, Some(config)).err().expect("rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

// ---------------------------------------------------------------------------
// Capability gating
// ---------------------------------------------------------------------------

#[test]
fn path_operations_fail_on_hash_scheme() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, Some(hash_config())).expect("db");
    let root = [1u8; 32];

    let failures = [
        db.recover(root).err(),
        db.recoverable(root).err(),
        db.reset(root).err(),
        db.journal(root).err(),
        db.set_buffer_size(1024).err(),
    ];
    for err in failures {
        assert_eq!(err.expect("must fail").kind(), ErrorKind::UnsupportedOperation);
    }
}

#[test]
fn hash_operations_fail_on_path_scheme() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, Some(path_config())).expect("db");
    let root = [1u8; 32];

    let failures = [
        db.cap(StorageSize::ZERO).err(),
        db.reference(root, ZERO_HASH).err(),
        db.dereference(root).err(),
        db.node(&root).err(),
    ];
    for err in failures {
        assert_eq!(err.expect("must fail").kind(), ErrorKind::UnsupportedOperation);
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn update_commit_read(config: Config) {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, Some(config)).expect("db");
    let (root, nodes, set) = trie(1);

    db.update(root, EMPTY_ROOT_HASH, 1, set, states(1)).expect("update");
    db.commit(root, false).expect("commit");

    assert!(db.initialized(root));
    assert_readable(&db, root, &nodes);
    assert_eq!(db.metrics().commits_total.get(), 1);

    let err = db.reader([0xEE; 32]).err().expect("unknown root");
    assert_eq!(err.kind(), ErrorKind::StateUnavailable);
}

#[test]
fn update_commit_read_hash_scheme() {
    update_commit_read(hash_config());
}

#[test]
fn update_commit_read_path_scheme() {
    update_commit_read(path_config());
}

#[test]
fn commit_twice_is_idempotent_hash_scheme() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, Some(hash_config())).expect("db");
    let (root, nodes, set) = trie(2);
    db.update(root, EMPTY_ROOT_HASH, 1, set, states(2)).expect("update");

    db.commit(root, false).expect("first commit");
    let written = db.metrics().hash_commit_nodes_total.get();
    db.commit(root, true).expect("second commit");

    assert_eq!(written, 3);
    assert_eq!(db.metrics().hash_commit_nodes_total.get(), written);
    for (_, hash) in &nodes {
        assert!(db.disk().read_hash_node(hash).expect("read").is_some());
    }
}

#[test]
fn commit_twice_is_idempotent_path_scheme() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk.clone(), Some(path_config())).expect("db");
    let (root, nodes, set) = trie(2);
    db.update(root, EMPTY_ROOT_HASH, 1, set, states(2)).expect("update");

    db.commit(root, false).expect("first commit");
    let snapshot = (disk.path_node_count(), disk.read_persistent_state_id().expect("id"));
    db.commit(root, false).expect("second commit");

    assert_eq!(snapshot, (3, 1));
    assert_eq!((disk.path_node_count(), disk.read_persistent_state_id().expect("id")), snapshot);
    assert_readable(&db, root, &nodes);
}

#[test]
fn commit_hook_sees_every_update() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let config = hash_config().with_on_commit(move |states: &StateSet| {
        counter.fetch_add(states.accounts.len(), Ordering::SeqCst);
    });
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, Some(config)).expect("db");

    let (a, _, set) = trie(3);
    db.update(a, EMPTY_ROOT_HASH, 1, set, states(3)).expect("update");
    let (b, _, set) = trie(4);
    db.update(b, a, 2, set, states(4)).expect("update");

    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn preimages_are_durable_after_update_then_close() {
    for config in [hash_config(), path_config()] {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = [0x42u8; 32];
        {
            let db = Database::new(DiskDb::open(dir.path()).expect("open"), Some(config.with_preimages(true)))
                .expect("db");
            db.insert_preimage(HashMap::from([(key, b"alice".to_vec())]));
            let (root, _, set) = trie(5);
            db.update(root, EMPTY_ROOT_HASH, 1, set, states(5)).expect("update");

            // below the threshold nothing is written yet
            assert!(db.disk().read_preimage(&key).expect("read").is_none());
            assert!(db.size().1 > StorageSize::ZERO);

            db.close().expect("close");
            assert_eq!(db.size().1, StorageSize::ZERO);
        }
        let disk = DiskDb::open(dir.path()).expect("reopen");
        assert_eq!(disk.read_preimage(&key).expect("read"), Some(b"alice".to_vec()));
    }
}

#[test]
fn commit_flushes_preimages_first() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk.clone(), Some(path_config().with_preimages(true))).expect("db");
    db.insert_preimage(HashMap::from([([7u8; 32], b"bob".to_vec())]));

    // the root is unknown, so the backend fails after the preimages landed
    let err = db.commit([9u8; 32], false).err().expect("unknown root");
    assert_eq!(err.kind(), ErrorKind::StateUnavailable);
    assert_eq!(disk.read_preimage(&[7u8; 32]).expect("read"), Some(b"bob".to_vec()));
    assert_eq!(db.preimage(&[7u8; 32]).expect("read"), Some(b"bob".to_vec()));
}

// ---------------------------------------------------------------------------
// Hash scheme
// ---------------------------------------------------------------------------

#[test]
fn referenced_roots_survive_cap_and_unreferenced_are_collected() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk, Some(hash_config())).expect("db");
    let (kept, kept_nodes, set) = trie(6);
    db.update(kept, EMPTY_ROOT_HASH, 1, set, states(6)).expect("update");
    let (dropped, dropped_nodes, set) = trie(7);
    db.update(dropped, kept, 2, set, states(7)).expect("update");

    db.reference(kept, ZERO_HASH).expect("reference");
    db.reference(dropped, ZERO_HASH).expect("reference");
    db.dereference(dropped).expect("dereference");
    for (_, hash) in &dropped_nodes {
        assert_eq!(db.node(hash).expect("node"), None);
    }

    db.cap(StorageSize::ZERO).expect("cap");
    assert_eq!(db.size().0, StorageSize::ZERO);
    for (_, hash) in &kept_nodes {
        assert!(db.node(hash).expect("node").is_some());
    }
    assert_readable(&db, kept, &kept_nodes);
}

// ---------------------------------------------------------------------------
// Path scheme
// ---------------------------------------------------------------------------

#[test]
fn journal_then_reopen_restores_layers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (a, a_nodes, set) = trie(8);
    let (b, b_nodes, b_set) = trie(9);
    {
        let db = Database::new(DiskDb::open(dir.path()).expect("open"), Some(path_config())).expect("db");
        db.update(a, EMPTY_ROOT_HASH, 1, set, states(8)).expect("update");
        db.update(b, a, 2, b_set, states(9)).expect("update");
        db.journal(b).expect("journal");

        let (c, _, set) = trie(10);
        let err = db.update(c, b, 3, set, states(10)).err().expect("read-only");
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        db.close().expect("close");
    }

    let db = Database::new(DiskDb::open(dir.path()).expect("reopen"), None).expect("db");
    assert_eq!(db.scheme(), Scheme::Path);
    assert_readable(&db, a, &a_nodes);
    assert_readable(&db, b, &b_nodes);
}

#[test]
fn journal_with_buffered_layers_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut parent = EMPTY_ROOT_HASH;
    let mut head_nodes = Vec::new();
    {
        let disk = DiskDb::open(dir.path()).expect("open");
        let db = Database::new(disk.clone(), Some(path_config())).expect("db");
        // two layers more than the diff limit end up in the node buffer
        for block in 0..130u64 {
            let (root, nodes, set) = trie(block as u8);
            db.update(root, parent, block + 1, set, states(block as u8)).expect("update");
            parent = root;
            head_nodes = nodes;
        }
        assert_eq!(disk.path_node_count(), 0);
        db.journal(parent).expect("journal");
        db.close().expect("close");
    }

    let disk = DiskDb::open(dir.path()).expect("reopen");
    let db = Database::new(disk.clone(), None).expect("db");
    assert_readable(&db, parent, &head_nodes);
    assert_eq!(disk.state_history_range().expect("range"), Some((1, 2)));

    db.commit(parent, false).expect("commit");
    assert_eq!(disk.read_persistent_state_id().expect("id"), 130);
}

#[test]
fn recover_and_reset_through_facade() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk.clone(), Some(path_config())).expect("db");
    let (a, a_nodes, set) = trie(11);
    db.update(a, EMPTY_ROOT_HASH, 1, set, states(11)).expect("update");
    let (b, _, set) = trie(12);
    db.update(b, a, 2, set, states(12)).expect("update");
    db.commit(b, false).expect("commit");

    assert!(db.recoverable(a).expect("recoverable"));
    assert!(!db.recoverable(b).expect("recoverable"));
    db.recover(a).expect("recover");
    assert_readable(&db, a, &a_nodes);
    assert_eq!(db.reader(b).err().expect("gone").kind(), ErrorKind::StateUnavailable);

    db.reset(EMPTY_ROOT_HASH).expect("reset");
    assert!(!db.initialized(a));
    assert_eq!(disk.path_node_count(), 0);
}

#[test]
fn set_buffer_size_flushes_when_over_budget() {
    let disk = DiskDb::open_temporary().expect("temp db");
    let db = Database::new(disk.clone(), Some(path_config())).expect("db");
    let mut parent = EMPTY_ROOT_HASH;
    // two layers more than the diff limit end up in the node buffer
    for block in 0..130u64 {
        let (root, _, set) = trie(block as u8);
        db.update(root, parent, block + 1, set, StateSet::new()).expect("update");
        parent = root;
    }
    assert_eq!(disk.path_node_count(), 0);

    db.set_buffer_size(0).expect("shrink");
    assert_eq!(disk.path_node_count(), 3);
    assert_eq!(disk.read_persistent_state_id().expect("id"), 2);
}
