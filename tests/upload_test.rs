//! Upload pipeline against the in-memory cloud library.

mod common;

use common::FakeLibrary;
use nas_mirror::{StatusBoard, TransferLedger, UploadPipeline};
use std::path::Path;
use std::sync::Arc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

fn seed_mirror(root: &Path) {
    std::fs::create_dir_all(root.join("Trip")).unwrap();
    std::fs::write(root.join("Trip/a.jpg"), b"aaaa").unwrap();
    std::fs::write(root.join("Trip/b.jpg"), b"bbbbbb").unwrap();
    std::fs::write(root.join("c.mp4"), b"cccccccc").unwrap();
    std::fs::write(root.join("Trip/notes.txt"), b"not media").unwrap();
}

fn pipeline(library: &Arc<FakeLibrary>, ledger_path: &Path) -> UploadPipeline {
    let ledger = TransferLedger::open(ledger_path).unwrap();
    UploadPipeline::new(library.clone(), ledger, Arc::new(StatusBoard::new()))
}

#[tokio::test]
async fn crash_between_stage_and_commit_never_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("nas");
    seed_mirror(&mirror);
    let ledger_path = dir.path().join("ledger.json");
    let library = Arc::new(FakeLibrary::default());
    library.crash_before_commit("a.jpg");

    let first = assert_ok!(pipeline(&library, &ledger_path).run(&mirror, &CancellationToken::new()).await);
    assert_eq!(first.pending, 3);
    assert_eq!(first.uploaded, 2);
    assert_eq!(first.failed, 1);
    assert_eq!(library.staged(), 3);

    // The ledger on disk only knows the committed files.
    let ledger = TransferLedger::open(&ledger_path).unwrap();
    assert_eq!(ledger.len(), 2);
    let canonical = std::fs::canonicalize(&mirror).unwrap();
    assert!(!ledger.contains(&canonical.join("Trip/a.jpg")));
    assert!(ledger.contains(&canonical.join("Trip/b.jpg")));

    library.heal();
    let second = assert_ok!(pipeline(&library, &ledger_path).run(&mirror, &CancellationToken::new()).await);
    assert_eq!(second.pending, 1);
    assert_eq!(second.uploaded, 1);
    assert_eq!(second.skipped_in_ledger, 2);

    let third = assert_ok!(pipeline(&library, &ledger_path).run(&mirror, &CancellationToken::new()).await);
    assert_eq!(third.pending, 0);

    let mut committed = library.committed();
    committed.sort();
    assert_eq!(committed, vec!["a.jpg", "b.jpg", "c.mp4"]);
}

#[tokio::test]
async fn failed_stage_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("nas");
    seed_mirror(&mirror);
    let ledger_path = dir.path().join("ledger.json");
    let library = Arc::new(FakeLibrary::default());
    library.fail_stage("c.mp4");

    let mut pipeline = pipeline(&library, &ledger_path);
    let report = assert_ok!(pipeline.run(&mirror, &CancellationToken::new()).await);
    assert_eq!(report.failed, 1);
    assert_eq!(pipeline.ledger().len(), 2);
    assert!(!library.committed().contains(&"c.mp4".to_string()));
}

#[tokio::test]
async fn cancelled_run_stages_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("nas");
    seed_mirror(&mirror);
    let library = Arc::new(FakeLibrary::default());

    let token = CancellationToken::new();
    token.cancel();
    let report = assert_ok!(pipeline(&library, &dir.path().join("ledger.json")).run(&mirror, &token).await);
    assert!(report.cancelled);
    assert_eq!(report.uploaded, 0);
    assert_eq!(library.staged(), 0);
    assert!(!dir.path().join("ledger.json").exists());
}
