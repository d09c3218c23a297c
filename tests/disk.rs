//! Directory watching and persistence.

mod common;

use std::time::Duration;

use tokio::sync::mpsc;

use lighthouse::disk::{DiskEvent, DiskManager, CLAIM_STATUS_FILE, PLEDGE_EXT, PROJECT_EXT};
use lighthouse::pledge::Pledge;
use lighthouse::wire::PledgeDetails;

use common::*;

fn sample_pledge() -> Pledge {
    Pledge::from_details(PledgeDetails {
        project_id: vec![7; 32],
        total_input_value: 50_000,
        timestamp: 12,
        transactions: vec![vec![0xaa; 40]],
        pledge_details: None,
        orig_hash: None,
    })
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<DiskEvent>) -> DiskEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watcher produced no event in time")
        .expect("watcher channel closed")
}

#[tokio::test]
async fn watcher_reports_projects_and_pledges() {
    let dir = tempfile::tempdir().unwrap();
    let manager = DiskManager::open(dir.path()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.start_watcher(tx);

    let project_path = dir.path().join(format!("roof.{PROJECT_EXT}"));
    manager.write_atomic(&project_path, b"project-bytes").await.unwrap();
    match next_event(&mut rx).await {
        DiskEvent::ProjectFile { path, bytes } => {
            assert_eq!(path, project_path);
            assert_eq!(bytes, b"project-bytes");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // A pledge file one directory down.
    let project_dir = dir.path().join("aabbcc");
    let pledge_path = project_dir.join(format!("deadbeef.{PLEDGE_EXT}"));
    manager.write_atomic(&pledge_path, b"pledge-bytes").await.unwrap();
    match next_event(&mut rx).await {
        DiskEvent::PledgeFile { path, bytes } => {
            assert_eq!(path, pledge_path);
            assert_eq!(bytes, b"pledge-bytes");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    tokio::fs::remove_file(&project_path).await.unwrap();
    match next_event(&mut rx).await {
        DiskEvent::ProjectFileRemoved { path } => assert_eq!(path, project_path),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn watcher_reports_replaced_contents() {
    let dir = tempfile::tempdir().unwrap();
    let manager = DiskManager::open(dir.path()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.start_watcher(tx);

    let path = dir.path().join(format!("roof.{PROJECT_EXT}"));
    manager.write_atomic(&path, b"one").await.unwrap();
    match next_event(&mut rx).await {
        DiskEvent::ProjectFile { bytes, .. } => assert_eq!(bytes, b"one"),
        other => panic!("unexpected event: {other:?}"),
    }

    // Leave the debounce window before rewriting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.write_atomic(&path, b"two!").await.unwrap();
    match next_event(&mut rx).await {
        DiskEvent::ProjectFile { bytes, .. } => assert_eq!(bytes, b"two!"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn pledges_persist_under_their_hash() {
    let dir = tempfile::tempdir().unwrap();
    let manager = DiskManager::open(dir.path()).await.unwrap();
    let pledge = sample_pledge();
    let project_id = pledge.project_id().unwrap();

    let path = manager.persist_pledge(&project_id, &pledge).await.unwrap();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        format!("{}.{PLEDGE_EXT}", pledge.hash())
    );
    let bytes = tokio::fs::read(&path).await.unwrap();
    let back = Pledge::decode_delimited(&bytes).unwrap();
    assert_eq!(back.identity(), pledge.identity());

    // No temp files left behind.
    let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        assert!(!entry.file_name().to_string_lossy().starts_with(".tmp-"));
    }
}

#[tokio::test]
async fn claim_marker_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let manager = DiskManager::open(dir.path()).await.unwrap();
    let project_id = sample_pledge().project_id().unwrap();
    let txid = random_txid();

    assert!(manager.read_claim_status(&project_id).await.is_none());
    manager.write_claim_status(&project_id, &txid).await.unwrap();
    let marker = manager.read_claim_status(&project_id).await.unwrap();
    assert_eq!(marker.claim_tx_hash, txid.to_string());
    assert!(manager
        .project_dir(&project_id)
        .join(CLAIM_STATUS_FILE)
        .exists());
}
