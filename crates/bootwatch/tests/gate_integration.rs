use std::time::Duration;

use bootwatch::gate::{GateError, wait_for_path};
use bootwatch_common::Shutdown;

const GATE_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn existing_path_returns_immediately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ssd = dir.path().join("ssd");
    std::fs::write(&ssd, b"").expect("create");

    tokio::time::timeout(GATE_WAIT, wait_for_path(&ssd, &Shutdown::new()))
        .await
        .expect("should not block")
        .expect("path exists");
}

#[tokio::test]
async fn waits_until_symlink_is_created() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ssd = dir.path().join("ssd");
    let target = dir.path().join("nvme0n1");

    let link = ssd.clone();
    let creator = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        // unrelated entries must not release the gate
        std::fs::write(link.with_file_name("other"), b"")
            .expect("create other");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");
    });

    tokio::time::timeout(GATE_WAIT, wait_for_path(&ssd, &Shutdown::new()))
        .await
        .expect("gate never opened")
        .expect("wait_for_path");
    creator.await.expect("creator panicked");
    assert!(std::fs::symlink_metadata(&ssd).is_ok());
}

#[tokio::test]
async fn cancelled_wait_reports_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ssd = dir.path().join("ssd");
    let shutdown = Shutdown::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    });

    let res = tokio::time::timeout(GATE_WAIT, wait_for_path(&ssd, &shutdown))
        .await
        .expect("cancel should end the wait");
    assert!(matches!(res, Err(GateError::Cancelled)), "got {res:?}");
}

#[tokio::test]
async fn missing_parent_directory_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ssd = dir.path().join("no-such-dir").join("ssd");

    let res = wait_for_path(&ssd, &Shutdown::new()).await;
    match res {
        Err(GateError::Watch { source, .. }) => {
            assert!(source.is_kernel_resource());
        }
        other => panic!("expected watch error, got {other:?}"),
    }
}
