use std::fs;

use secscan_rs::store::{FsReportStore, ReportStore, StoreError};
use secscan_rs::types::{Report, RunKind, RunRequest, ScanKind, StepResult, StepStatus};

fn report(id: &str, timestamp: &str, statuses: &[(ScanKind, StepStatus)]) -> Report {
    Report {
        id: id.into(),
        request: RunRequest::new(RunKind::All).with_run_id(id),
        timestamp: timestamp.into(),
        results: statuses
            .iter()
            .map(|(kind, status)| StepResult {
                kind: *kind,
                status: *status,
                exit_code: if *status == StepStatus::Completed { 0 } else { 1 },
                output: format!("{kind} output\nwith é and \u{fffd}\n"),
                started_at: timestamp.into(),
                finished_at: timestamp.into(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn written_report_reads_back_identically() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path().join("reports"));
    let original = report(
        "run-1",
        "2026-10-01T10:00:00Z",
        &[
            (ScanKind::TrivySbom, StepStatus::Completed),
            (ScanKind::Kyverno, StepStatus::Failed),
        ],
    );

    let location = store.write(&original).await.unwrap();
    assert!(location.ends_with("run-1.json"));

    let back = store.read("run-1").await.unwrap().expect("stored");
    assert_eq!(back, original);
    assert_eq!(back.status(), StepStatus::Failed);
    assert!(store.exists("run-1").await.unwrap());
}

#[tokio::test]
async fn second_write_for_same_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    let r = report("dup", "2026-10-01T10:00:00Z", &[]);
    store.write(&r).await.unwrap();
    let err = store.write(&r).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(id) if id == "dup"));
}

#[tokio::test]
async fn missing_report_is_none_and_bad_ids_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    assert!(store.read("nope").await.unwrap().is_none());
    assert!(!store.exists("nope").await.unwrap());
    assert!(matches!(
        store.read("../secret").await,
        Err(StoreError::InvalidId(_))
    ));
}

#[tokio::test]
async fn list_is_newest_first_and_skips_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    assert!(store.list().await.unwrap().is_empty());

    store
        .write(&report(
            "older",
            "2026-10-01T10:00:00Z",
            &[(ScanKind::Nmap, StepStatus::Completed)],
        ))
        .await
        .unwrap();
    store
        .write(&report(
            "newer",
            "2026-10-02T10:00:00Z",
            &[(ScanKind::Nmap, StepStatus::Failed)],
        ))
        .await
        .unwrap();
    fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let list = store.list().await.unwrap();
    let ids: Vec<_> = list.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);
    assert_eq!(list[0].status, StepStatus::Failed);
    assert_eq!(list[1].status, StepStatus::Completed);
    assert_eq!(list[0].scan_type, RunKind::All);
}

#[tokio::test]
async fn list_reads_legacy_request_field() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("legacy.json"),
        r#"{"id":"legacy","timestamp":"2026-01-01T00:00:00","request":{"scan_type":"kyverno"},
            "results":[{"scan_type":"kyverno","status":"completed","output":"..."}]}"#,
    )
    .unwrap();
    let store = FsReportStore::new(dir.path());
    let list = store.list().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].scan_type, RunKind::Single(ScanKind::Kyverno));
}

fn dir_entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn writes_leave_no_temporary_files_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    let first = report("kept", "2026-10-01T10:00:00Z", &[(ScanKind::Nmap, StepStatus::Completed)]);
    store.write(&first).await.unwrap();

    let second = report("kept", "2026-10-02T10:00:00Z", &[(ScanKind::Nmap, StepStatus::Failed)]);
    assert!(matches!(
        store.write(&second).await,
        Err(StoreError::AlreadyExists(_))
    ));

    assert_eq!(dir_entries(dir.path()), vec!["kept.json".to_string()]);
    assert_eq!(store.read("kept").await.unwrap(), Some(first));
}

#[tokio::test]
async fn concurrent_writes_for_one_id_publish_exactly_one_complete_report() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    let writers: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let r = report(
                "contended",
                &format!("2026-10-01T10:00:0{i}Z"),
                &[(ScanKind::Kyverno, StepStatus::Completed)],
            );
            tokio::spawn(async move { store.write(&r).await })
        })
        .collect();

    let mut published = 0;
    for w in writers {
        match w.await.unwrap() {
            Ok(_) => published += 1,
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }
    assert_eq!(published, 1);
    assert!(store.read("contended").await.unwrap().is_some());
    assert_eq!(dir_entries(dir.path()), vec!["contended.json".to_string()]);
}

#[tokio::test]
async fn leftover_temporary_file_does_not_count_as_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    fs::write(dir.path().join(".r1.0000.tmp"), "{\"id\":\"r1\",\"times").unwrap();

    assert!(!store.exists("r1").await.unwrap());
    assert_eq!(store.read("r1").await.unwrap(), None);
    assert!(store.list().await.unwrap().is_empty());

    store.write(&report("r1", "2026-10-01T10:00:00Z", &[])).await.unwrap();
    assert!(store.exists("r1").await.unwrap());
}

#[tokio::test]
async fn list_orders_by_instant_not_by_text() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsReportStore::new(dir.path());
    // without a fraction the text sorts after the later, fractional timestamp
    store.write(&report("whole", "2026-10-01T10:00:00Z", &[])).await.unwrap();
    store.write(&report("half", "2026-10-01T10:00:00.5Z", &[])).await.unwrap();
    store.write(&report("offset", "2026-10-01T11:30:00+02:00", &[])).await.unwrap();
    store.write(&report("legacy", "2026-10-03 08:00", &[])).await.unwrap();

    let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["half", "whole", "offset", "legacy"]);
}
