//! End-to-end scenarios over a real repository directory: scanning,
//! deletion propagation, peer index absorption, receive-side ignore
//! filtering, and the ignore round-trip.

mod support;

use flotilla_node::ModelCallbacks;
use flotilla_primitives::{BlockInfo, Event, FileInfo, NodeId, RepoId};
use sha2::{Digest, Sha256};

use support::{model_with_repo, utf8};

fn repo() -> RepoId {
    "photos".into()
}

fn remote_file(name: &str, version: u64, content: &[u8]) -> FileInfo {
    FileInfo {
        name: name.to_owned(),
        flags: 0o644,
        modified: 1_400_000_000,
        version,
        local_version: 0,
        blocks: vec![BlockInfo {
            offset: 0,
            size: content.len() as u32,
            hash: Sha256::digest(content).to_vec(),
        }],
    }
}

#[tokio::test]
async fn cold_start_scan_indexes_local_files() {
    support::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let dir = utf8(dir.path());
    std::fs::write(dir.join("a.jpg").as_std_path(), b"0123456789").unwrap();

    let m = model_with_repo("photos", &dir, &[]);
    m.scan_repo(&repo()).await.unwrap();

    assert_eq!(m.local_size(&repo()), (1, 0, 10));
    assert_eq!(m.current_local_version(&repo()), 1);

    let entry = m.current_repo_file(&repo(), "a.jpg").unwrap();
    assert!(entry.version > 0);
    assert!(!entry.is_deleted());
}

#[tokio::test]
async fn deletion_is_tombstoned_on_rescan() {
    support::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let dir = utf8(dir.path());
    let path = dir.join("a.jpg");
    std::fs::write(path.as_std_path(), b"0123456789").unwrap();

    let m = model_with_repo("photos", &dir, &[]);
    m.scan_repo(&repo()).await.unwrap();
    let scanned = m.current_repo_file(&repo(), "a.jpg").unwrap();

    std::fs::remove_file(path.as_std_path()).unwrap();
    m.scan_repo(&repo()).await.unwrap();

    let tombstone = m.current_repo_file(&repo(), "a.jpg").unwrap();
    assert!(tombstone.is_deleted());
    assert!(
        tombstone.version > scanned.version,
        "a re-create must beat the deletion"
    );

    assert_eq!(m.local_size(&repo()), (0, 1, 10));
    assert_eq!(m.current_local_version(&repo()), 2);
}

#[tokio::test]
async fn unchanged_disk_leaves_the_replica_alone() {
    support::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let dir = utf8(dir.path());
    std::fs::write(dir.join("a.jpg").as_std_path(), b"0123456789").unwrap();

    let m = model_with_repo("photos", &dir, &[]);
    m.scan_repo(&repo()).await.unwrap();
    let before = m.current_repo_file(&repo(), "a.jpg").unwrap();
    let watermark = m.current_local_version(&repo());

    m.scan_repo(&repo()).await.unwrap();

    let after = m.current_repo_file(&repo(), "a.jpg").unwrap();
    assert_eq!(before, after, "no-change rescan must not rewrite entries");
    assert_eq!(m.current_local_version(&repo()), watermark);
}

#[tokio::test]
async fn peer_index_is_absorbed_into_global_and_need() {
    support::init_tracing();

    let peer = NodeId::new([1; 32]);
    let dir = tempfile::tempdir().unwrap();
    let dir = utf8(dir.path());
    std::fs::write(dir.join("a.jpg").as_std_path(), b"0123456789").unwrap();

    let m = model_with_repo("photos", &dir, &[peer]);
    m.scan_repo(&repo()).await.unwrap();

    m.index(peer, &repo(), vec![remote_file("b.jpg", 7, b"12345")]);

    assert_eq!(m.global_size(&repo()), (2, 0, 15));

    let needed = m.need_files_limited(&repo(), 0, 0);
    assert_eq!(needed.len(), 1);
    assert_eq!(needed[0].name, "b.jpg");

    assert_eq!(m.availability(&repo(), "b.jpg"), [peer]);
}

#[tokio::test]
async fn ignored_names_are_dropped_at_receive() {
    support::init_tracing();

    let peer = NodeId::new([1; 32]);
    let dir = tempfile::tempdir().unwrap();
    let dir = utf8(dir.path());
    std::fs::write(dir.join(".stignore").as_std_path(), b"*.jpg\n").unwrap();

    let m = model_with_repo("photos", &dir, &[peer]);
    // The scan loads and publishes the ignore patterns.
    m.scan_repo(&repo()).await.unwrap();

    let mut events = m.events().subscribe();
    m.index(peer, &repo(), vec![remote_file("b.jpg", 7, b"12345")]);

    match events.recv().await.unwrap() {
        Event::RemoteIndexUpdated { items, node, .. } => {
            assert_eq!(items, 0, "ignored entries must be dropped before replace");
            assert_eq!(node, peer);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(m.current_global_file(&repo(), "b.jpg").is_none());
    assert!(m.availability(&repo(), "b.jpg").is_empty());
}

#[tokio::test]
async fn set_ignores_round_trips_and_rescans() {
    support::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let dir = utf8(dir.path());

    let m = model_with_repo("photos", &dir, &[]);

    let lines = vec!["*.tmp".to_owned(), "build/**".to_owned()];
    m.set_ignores(&repo(), &lines).await.unwrap();

    assert_eq!(m.get_ignores(&repo()).unwrap(), lines);

    // The rewrite went through a temp file; nothing stray is left behind.
    let mut entries: Vec<String> = std::fs::read_dir(dir.as_std_path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, [".stignore"]);
}

#[tokio::test]
async fn equal_replicas_converge_after_index_exchange() {
    support::init_tracing();

    let a_id = NodeId::new([1; 32]);
    let b_id = NodeId::new([2; 32]);

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = model_with_repo("photos", &utf8(dir_a.path()), &[b_id]);
    let b = model_with_repo("photos", &utf8(dir_b.path()), &[a_id]);

    let files = vec![
        remote_file("x.jpg", 3, b"xxxx"),
        remote_file("y.jpg", 4, b"yyyyy"),
    ];

    a.replace_local(&repo(), files.clone());
    b.replace_local(&repo(), files.clone());

    // Exchange full indexes in both directions.
    a.index(b_id, &repo(), files.clone());
    b.index(a_id, &repo(), files.clone());

    for name in ["x.jpg", "y.jpg"] {
        let ga = a.current_global_file(&repo(), name).unwrap();
        let gb = b.current_global_file(&repo(), name).unwrap();
        assert_eq!(ga.version, gb.version, "{name}: diverged global version");
        assert_eq!(ga.flags, gb.flags);
        assert_eq!(ga.blocks, gb.blocks);
    }

    assert_eq!(a.need_size(&repo()), (0, 0));
    assert_eq!(b.need_size(&repo()), (0, 0));
}
