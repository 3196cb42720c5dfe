use objvault::checksum::md5_hex;
use objvault::transfer::download::temp_path_for;
use objvault::transport::{Fault, Operation};
use objvault::{
    ByteRange, ChannelReporter, ClientConfig, Conditions, DownloadRequest, MemoryTransport,
    ProgressEvent, TransferClient,
};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn client(store: &Arc<MemoryTransport>) -> TransferClient {
    let config = ClientConfig {
        max_retries: 1,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..ClientConfig::default()
    };
    TransferClient::builder(store.clone()).config(config).build().unwrap()
}

fn seed_object(store: &MemoryTransport, size: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..size).map(|i| (i * 13 % 256) as u8).collect();
    store.put_raw("bucket", "object", data.clone(), BTreeMap::new());
    data
}

#[test]
fn test_interrupted_download_resumes_into_temp_file() {
    let store = Arc::new(MemoryTransport::new());
    let data = seed_object(&store, 850_000);
    let work = TempDir::new().unwrap();
    let checkpoints = TempDir::new().unwrap();
    let target = work.path().join("object.bin");
    let request = DownloadRequest::new("bucket", "object", &target)
        .with_part_size(102_400)
        .with_thread_num(3)
        .with_checkpoint_dir(checkpoints.path());
    let client = client(&store);

    store.inject(Fault::network(Operation::GetObject).on_range_start(3 * 102_400));
    let err = client.resumable_download(&request).unwrap_err();
    assert_eq!(err.code(), "NetworkError");
    assert!(!target.exists(), "the target only appears once complete");
    assert_eq!(
        fs::metadata(temp_path_for(&target)).unwrap().len(),
        850_000,
        "the temp file is preallocated"
    );

    store.clear_faults();
    let outcome = client.resumable_download(&request).unwrap();
    assert!(outcome.resumed);
    assert!(outcome.transferred_bytes < 850_000);
    assert_eq!(md5_hex(&fs::read(&target).unwrap()), md5_hex(&data));
    assert!(!temp_path_for(&target).exists());
    assert_eq!(fs::read_dir(checkpoints.path()).unwrap().count(), 0);
}

#[test]
fn test_removed_temp_file_forces_fresh_start() {
    let store = Arc::new(MemoryTransport::new());
    let data = seed_object(&store, 300_000);
    let work = TempDir::new().unwrap();
    let checkpoints = TempDir::new().unwrap();
    let target = work.path().join("object.bin");
    let request = DownloadRequest::new("bucket", "object", &target)
        .with_part_size(100_000)
        .with_checkpoint_dir(checkpoints.path());
    let client = client(&store);

    store.inject(Fault::network(Operation::GetObject).on_range_start(200_000));
    client.resumable_download(&request).unwrap_err();
    fs::remove_file(temp_path_for(&target)).unwrap();

    store.clear_faults();
    let outcome = client.resumable_download(&request).unwrap();
    assert!(!outcome.resumed);
    assert_eq!(outcome.transferred_bytes, 300_000);
    assert_eq!(fs::read(&target).unwrap(), data);
}

#[test]
fn test_deleted_source_fails_the_retry() {
    let store = Arc::new(MemoryTransport::new());
    seed_object(&store, 300_000);
    let work = TempDir::new().unwrap();
    let checkpoints = TempDir::new().unwrap();
    let target = work.path().join("object.bin");
    let request = DownloadRequest::new("bucket", "object", &target)
        .with_part_size(100_000)
        .with_checkpoint_dir(checkpoints.path());
    let client = client(&store);

    store.inject(Fault::network(Operation::GetObject).on_range_start(100_000));
    client.resumable_download(&request).unwrap_err();
    store.clear_faults();
    assert!(store.remove_object("bucket", "object"));

    let err = client.resumable_download(&request).unwrap_err();
    assert_eq!(err.code(), "NoSuchKey");
    assert!(!target.exists());
    assert!(temp_path_for(&target).exists(), "the stale temp file is left for the caller");
}

#[test]
fn test_ranged_download_with_conditions() {
    let store = Arc::new(MemoryTransport::new());
    let data = seed_object(&store, 10_000);
    let etag = client(&store)
        .head_object("bucket", "object", None)
        .unwrap()
        .etag;
    assert!(etag.is_some());
    let work = TempDir::new().unwrap();
    let target = work.path().join("range.bin");

    client(&store)
        .resumable_download(
            &DownloadRequest::new("bucket", "object", &target)
                .with_range(ByteRange::new(1_000, 8_999))
                .with_conditions(Conditions {
                    if_match: etag.clone(),
                    ..Conditions::default()
                })
                .with_part_size(1_500)
                .with_thread_num(4),
        )
        .unwrap();
    assert_eq!(fs::read(&target).unwrap(), &data[1_000..9_000]);

    let err = client(&store)
        .resumable_download(
            &DownloadRequest::new("bucket", "object", &target).with_conditions(Conditions {
                if_none_match: etag,
                ..Conditions::default()
            }),
        )
        .unwrap_err();
    assert_eq!(err.code(), "NotModified");
}

#[test]
fn test_progress_is_monotonic_and_complete() {
    let store = Arc::new(MemoryTransport::new());
    seed_object(&store, 50_000);
    let work = TempDir::new().unwrap();
    let (reporter, events) = ChannelReporter::unbounded();

    client(&store)
        .resumable_download(
            &DownloadRequest::new("bucket", "object", work.path().join("out"))
                .with_part_size(4_096)
                .with_thread_num(5)
                .with_progress(Arc::new(reporter)),
        )
        .unwrap();

    let events: Vec<ProgressEvent> = events.try_iter().collect();
    assert!(matches!(
        events.first(),
        Some(ProgressEvent::TransferStarted {
            total_bytes: 50_000,
            resumed_bytes: 0,
            ..
        })
    ));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::TransferCompleted {
            total_bytes: 50_000,
            ..
        })
    ));

    let mut last = 0;
    for event in &events {
        if let ProgressEvent::BytesTransferred {
            transferred_bytes, ..
        } = event
        {
            assert!(*transferred_bytes > last);
            last = *transferred_bytes;
        }
    }
    assert_eq!(last, 50_000);
}
