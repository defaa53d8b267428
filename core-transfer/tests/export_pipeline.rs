//! Export pipeline against an in-memory DICOM store.

mod common;

use common::{client, store, wait_until, FakeDicomStore, FakeTokenProvider};
use core_runtime::events::{CoreEvent, EventBus, TransferEvent};
use core_transfer::multipart::{boundary_from_content_type, read_message};
use core_transfer::{
    Direction, ExportService, ExportSettings, OutcomeStatus, TransferError, TransferStatusSink,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn settings(max_workers: usize) -> ExportSettings {
    ExportSettings {
        max_workers,
        include_content_disposition: false,
        ensure_store: false,
    }
}

fn service(
    fake: &Arc<FakeDicomStore>,
    tokens: &Arc<FakeTokenProvider>,
    sink: &Arc<TransferStatusSink>,
    settings: ExportSettings,
) -> ExportService {
    ExportService::new(
        Arc::clone(tokens) as Arc<dyn core_auth::AccessTokenProvider>,
        client(fake),
        store(),
        Arc::clone(sink),
        settings,
    )
}

fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn subject(path: &Path) -> String {
    path.display().to_string()
}

#[tokio::test]
async fn test_zero_length_file_fails_without_network_call() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(2));

    let empty = write_file(&dir, "empty.dcm", b"");
    export.start().await.unwrap();
    export.submit(&empty).unwrap();

    assert!(wait_until(WAIT, || sink.len() == 1).await);

    let outcome = sink.get(Direction::Upload, &subject(&empty)).unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Fail);
    assert!(outcome.detail.unwrap().contains("empty"));
    assert!(empty.exists());
    assert_eq!(fake.requests.load(Ordering::SeqCst), 0);
    assert_eq!(tokens.calls.load(Ordering::SeqCst), 0);

    export.shutdown().await;
}

#[tokio::test]
async fn test_success_deletes_file_and_failure_keeps_it() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    fake.queue_upload_statuses(&[200, 500]);
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(1));

    let accepted = write_file(&dir, "accepted.dcm", b"DICM accepted");
    let rejected = write_file(&dir, "rejected.dcm", b"DICM rejected");
    export.submit(&accepted).unwrap();
    export.submit(&rejected).unwrap();
    export.start().await.unwrap();

    assert!(wait_until(WAIT, || sink.len() == 2).await);

    let uploaded = sink.get(Direction::Upload, &subject(&accepted)).unwrap();
    assert_eq!(uploaded.status, OutcomeStatus::Ok);
    assert_eq!(uploaded.detail.as_deref(), Some("13 bytes"));
    assert!(!accepted.exists());

    let failed = sink.get(Direction::Upload, &subject(&rejected)).unwrap();
    assert_eq!(failed.status, OutcomeStatus::Fail);
    assert!(failed.detail.unwrap().contains("500"));
    assert!(rejected.exists());

    let counts = sink.counts(Direction::Upload);
    assert_eq!((counts.success, counts.fail, counts.total), (1, 1, 2));

    export.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_never_exceeds_max_workers() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::with_upload_delay(Duration::from_millis(40)));
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(3));

    export.start().await.unwrap();
    for i in 0..12 {
        let path = write_file(&dir, &format!("{}.dcm", i), b"DICM");
        export.submit(path).unwrap();
    }

    assert!(wait_until(WAIT, || sink.len() == 12).await);

    let max = fake.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "saw {} concurrent uploads", max);
    assert!(max >= 1);
    assert_eq!(sink.counts(Direction::Upload).success, 12);

    export.shutdown().await;
}

#[tokio::test]
async fn test_tasks_start_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(
        &fake,
        &tokens,
        &sink,
        ExportSettings {
            include_content_disposition: true,
            ..settings(1)
        },
    );

    for i in 0..5 {
        let path = write_file(&dir, &format!("f{}.dcm", i), format!("payload-{}", i).as_bytes());
        export.submit(path).unwrap();
    }
    export.start().await.unwrap();

    assert!(wait_until(WAIT, || sink.len() == 5).await);

    let uploads = fake.uploads.lock().clone();
    for (i, upload) in uploads.iter().enumerate() {
        let boundary = boundary_from_content_type(&upload.content_type);
        let message = read_message(&upload.body[..], boundary).await.unwrap();
        assert_eq!(message.parts.len(), 1);
        assert_eq!(message.parts[0].headers.filename().unwrap(), format!("f{}.dcm", i));
        assert_eq!(&message.parts[0].body[..], format!("payload-{}", i).as_bytes());
    }

    export.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_survives_encode_and_decode() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(1));

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let path = write_file(&dir, "large.dcm", &payload);

    export.start().await.unwrap();
    export.submit(&path).unwrap();
    assert!(wait_until(WAIT, || sink.len() == 1).await);

    let upload = fake.uploads.lock()[0].clone();
    assert!(upload
        .content_type
        .starts_with("multipart/related; type=\"application/dicom\""));
    assert_eq!(upload.authorization.as_deref(), Some("Bearer test-token"));

    let boundary = boundary_from_content_type(&upload.content_type);
    let message = read_message(&upload.body[..], boundary).await.unwrap();
    assert_eq!(message.parts[0].headers.content_type(), Some("application/dicom"));
    assert!(message.parts[0].headers.filename().is_none());
    assert_eq!(message.parts[0].body.len(), payload.len());
    assert!(message.parts[0].body[..] == payload[..]);

    export.shutdown().await;
}

#[tokio::test]
async fn test_repeated_denials_warn_once_per_transition() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    fake.set_default_upload_status(401);
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let bus = EventBus::new(100);
    let mut events = bus.subscribe();
    let export = service(&fake, &tokens, &sink, settings(1)).with_event_bus(bus);

    export.start().await.unwrap();
    for i in 0..4 {
        export.submit(write_file(&dir, &format!("d{}.dcm", i), b"DICM")).unwrap();
    }
    assert!(wait_until(WAIT, || sink.len() == 4).await);

    fake.queue_upload_statuses(&[200, 403]);
    export.submit(write_file(&dir, "ok.dcm", b"DICM")).unwrap();
    assert!(wait_until(WAIT, || sink.len() == 5).await);
    export.submit(write_file(&dir, "denied-again.dcm", b"DICM")).unwrap();
    assert!(wait_until(WAIT, || sink.len() == 6).await);

    let mut denials = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Transfer(TransferEvent::AuthorizationDenied { status }) = event {
            denials.push(status);
        }
    }
    assert_eq!(denials, vec![401, 403]);

    let counts = sink.counts(Direction::Upload);
    assert_eq!((counts.success, counts.fail), (1, 5));

    export.shutdown().await;
}

#[tokio::test]
async fn test_any_other_status_rearms_denial_warning() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    fake.queue_upload_statuses(&[401, 500, 401]);
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let bus = EventBus::new(100);
    let mut events = bus.subscribe();
    let export = service(&fake, &tokens, &sink, settings(1)).with_event_bus(bus);

    export.start().await.unwrap();
    for i in 0..3 {
        export.submit(write_file(&dir, &format!("r{}.dcm", i), b"DICM")).unwrap();
        assert!(wait_until(WAIT, || sink.len() == i + 1).await);
    }

    let mut denials = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Transfer(TransferEvent::AuthorizationDenied { status }) = event {
            denials.push(status);
        }
    }
    assert_eq!(denials, vec![401, 401]);
    assert_eq!(sink.counts(Direction::Upload).fail, 3);

    export.shutdown().await;
}

#[tokio::test]
async fn test_sign_in_failure_fails_task_without_upload() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::failing());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(1));

    let path = write_file(&dir, "a.dcm", b"DICM");
    export.start().await.unwrap();
    export.submit(&path).unwrap();
    assert!(wait_until(WAIT, || sink.len() == 1).await);

    assert_eq!(
        sink.get(Direction::Upload, &subject(&path)).unwrap().status,
        OutcomeStatus::Fail
    );
    assert!(path.exists());
    assert_eq!(fake.requests.load(Ordering::SeqCst), 0);

    export.shutdown().await;
}

#[tokio::test]
async fn test_start_checks_store_and_rejects_second_start() {
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(
        &fake,
        &tokens,
        &sink,
        ExportSettings {
            ensure_store: true,
            ..settings(1)
        },
    );

    export.start().await.unwrap();
    assert_eq!(fake.requests.load(Ordering::SeqCst), 1);
    assert!(export.is_running());

    assert!(matches!(
        export.start().await,
        Err(TransferError::AlreadyStarted)
    ));

    export.shutdown().await;
}

#[tokio::test]
async fn test_start_fails_when_sign_in_fails() {
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::failing());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(
        &fake,
        &tokens,
        &sink,
        ExportSettings {
            ensure_store: true,
            ..settings(1)
        },
    );

    assert!(matches!(export.start().await, Err(TransferError::Auth(_))));
    assert!(!export.is_running());
}

#[tokio::test]
async fn test_queue_size_counts_undispatched_tasks() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(2));

    for i in 0..3 {
        export.submit(write_file(&dir, &format!("{}.dcm", i), b"DICM")).unwrap();
    }
    assert_eq!(export.queue_size(), 3);

    export.start().await.unwrap();
    assert!(wait_until(WAIT, || sink.len() == 3).await);
    assert_eq!(export.queue_size(), 0);

    export.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_while_idle_returns_promptly() {
    let fake = Arc::new(FakeDicomStore::new());
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(2));

    export.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), export.shutdown())
        .await
        .expect("shutdown should not hang on an empty queue");

    assert!(!export.is_running());
    assert!(matches!(
        export.submit("/outbox/late.dcm"),
        Err(TransferError::ShutDown)
    ));
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_upload() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(FakeDicomStore::with_upload_delay(Duration::from_secs(30)));
    let tokens = Arc::new(FakeTokenProvider::default());
    let sink = Arc::new(TransferStatusSink::new());
    let export = service(&fake, &tokens, &sink, settings(1));

    let path = write_file(&dir, "slow.dcm", b"DICM");
    export.start().await.unwrap();
    export.submit(&path).unwrap();
    assert!(wait_until(WAIT, || fake.upload_count() == 1).await);

    tokio::time::timeout(Duration::from_secs(2), export.shutdown())
        .await
        .expect("shutdown should abort the slow upload");

    assert!(path.exists());
    assert!(sink.is_empty());
}
