use objvault::crypto::{envelope, CEK_ALGORITHM};
use objvault::partition::MIN_PART_SIZE;
use objvault::{
    ByteRange, ClientConfig, DownloadRequest, EncryptionMaterials, GetObjectOptions,
    MemoryTransport, ObjectMetadata, SymmetricKeyProvider, TransferClient, UploadRequest,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const PART: u64 = MIN_PART_SIZE;

fn encryption_client(store: &Arc<MemoryTransport>, provider: SymmetricKeyProvider) -> TransferClient {
    TransferClient::builder(store.clone())
        .config(ClientConfig {
            max_retries: 0,
            ..ClientConfig::default()
        })
        .encryption(EncryptionMaterials::new(Arc::new(provider)))
        .build()
        .unwrap()
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 17 % 251) as u8).collect()
}

#[test]
fn test_round_trip_at_part_boundaries() {
    let store = Arc::new(MemoryTransport::new());
    let client = encryption_client(&store, SymmetricKeyProvider::generate("a"));
    let work = TempDir::new().unwrap();
    let ps = PART as usize;

    for size in [0, 1, ps - 1, ps, ps + 1, ps * 3 + 12_345] {
        let data = payload(size);
        let source = work.path().join(format!("src-{}", size));
        fs::write(&source, &data).unwrap();
        let key = format!("obj-{}", size);

        client
            .resumable_upload(
                &UploadRequest::new("bucket", &key, &source)
                    .with_part_size(PART)
                    .with_thread_num(3),
            )
            .unwrap();

        let stored = store.object_data("bucket", &key).unwrap();
        assert_eq!(stored.len(), size, "CTR mode keeps the length");
        if size > 16 {
            assert_ne!(stored, data, "size {} stored in the clear", size);
        }

        let whole = client
            .get_object("bucket", &key, &GetObjectOptions::new())
            .unwrap();
        assert_eq!(whole.data, data, "single GET of size {}", size);

        let target = work.path().join(format!("dst-{}", size));
        client
            .resumable_download(
                &DownloadRequest::new("bucket", &key, &target)
                    .with_part_size(PART / 3)
                    .with_thread_num(2),
            )
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), data, "download of size {}", size);

        for (start, end) in [(0u64, 0u64), (5, 40), (PART - 3, PART + 20), (size as u64 / 2, size as u64 + 10)] {
            if start >= size as u64 {
                continue;
            }
            let got = client
                .get_object(
                    "bucket",
                    &key,
                    &GetObjectOptions::new().with_range(ByteRange::new(start, end)),
                )
                .unwrap();
            let stop = (end as usize + 1).min(size);
            assert_eq!(
                got.data,
                &data[start as usize..stop],
                "range {}-{} of size {}",
                start,
                end,
                size
            );
        }
    }
}

#[test]
fn test_envelope_metadata_is_stored() {
    let store = Arc::new(MemoryTransport::new());
    let client = encryption_client(&store, SymmetricKeyProvider::generate("desc-a"));
    client
        .put_object("bucket", "obj", payload(64), &ObjectMetadata::new())
        .unwrap();

    let headers = store.object_metadata("bucket", "obj").unwrap();
    assert_eq!(headers.get(envelope::META_CEK_ALG).map(String::as_str), Some(CEK_ALGORITHM));
    assert_eq!(headers.get(envelope::META_MATDESC).map(String::as_str), Some("desc-a"));
    assert_eq!(envelope::unencrypted_length(&headers), Some(64));
    assert!(headers.contains_key(envelope::META_KEY));
    assert!(headers.contains_key(envelope::META_START));

    // The envelope does not leak into the caller's view
    let info = client.head_object("bucket", "obj", None).unwrap();
    assert!(info.user_metadata.keys().all(|k| !k.starts_with("client-side-encryption")));
}

#[test]
fn test_cross_material_isolation() {
    let store = Arc::new(MemoryTransport::new());
    let provider_a = SymmetricKeyProvider::generate("A");
    let master_a = provider_a.master_key_base64();
    let writer = encryption_client(&store, provider_a);
    let data = payload(PART as usize * 2 + 1);
    writer
        .put_object("bucket", "secret", data.clone(), &ObjectMetadata::new())
        .unwrap();

    // Different description: no provider matches
    let other = encryption_client(&store, SymmetricKeyProvider::generate("B"));
    let err = other
        .get_object("bucket", "secret", &GetObjectOptions::new())
        .unwrap_err();
    assert_eq!(err.code(), "EncryptionClientError");

    // Same description, wrong key: unwrap fails
    let impostor = encryption_client(&store, SymmetricKeyProvider::generate("A"));
    let err = impostor
        .get_object("bucket", "secret", &GetObjectOptions::new())
        .unwrap_err();
    assert_eq!(err.code(), "EncryptionClientError");

    // A separate instance holding the same key reads it
    let twin = encryption_client(&store, SymmetricKeyProvider::from_base64(&master_a, "A").unwrap());
    let got = twin
        .get_object("bucket", "secret", &GetObjectOptions::new())
        .unwrap();
    assert_eq!(got.data, data);

    // A reader with several providers picks the matching one
    let materials = EncryptionMaterials::new(Arc::new(SymmetricKeyProvider::generate("B")))
        .with_provider(Arc::new(SymmetricKeyProvider::from_base64(&master_a, "A").unwrap()));
    let multi = TransferClient::builder(store.clone())
        .encryption(materials)
        .build()
        .unwrap();
    assert_eq!(
        multi
            .get_object("bucket", "secret", &GetObjectOptions::new())
            .unwrap()
            .data,
        data
    );
}

#[test]
fn test_plain_objects_pass_through_an_encryption_client() {
    let store = Arc::new(MemoryTransport::new());
    let plain = TransferClient::new(store.clone()).unwrap();
    plain
        .put_object("bucket", "plain", b"clear text".to_vec(), &ObjectMetadata::new())
        .unwrap();

    let client = encryption_client(&store, SymmetricKeyProvider::generate("a"));
    let got = client
        .get_object("bucket", "plain", &GetObjectOptions::new())
        .unwrap();
    assert!(!got.decrypted);
    assert_eq!(got.data, b"clear text");
}

#[test]
fn test_unsupported_cek_algorithm_is_named() {
    let store = Arc::new(MemoryTransport::new());
    let client = encryption_client(&store, SymmetricKeyProvider::generate("a"));
    client
        .put_object("bucket", "obj", payload(32), &ObjectMetadata::new())
        .unwrap();

    let mut headers = store.object_metadata("bucket", "obj").unwrap();
    headers.insert(envelope::META_CEK_ALG.to_string(), "AES/GCM/NoPadding".to_string());
    let stored = store.object_data("bucket", "obj").unwrap();
    store.put_raw("bucket", "obj", stored, headers);

    let err = client
        .get_object("bucket", "obj", &GetObjectOptions::new())
        .unwrap_err();
    assert_eq!(err.code(), "EncryptionClientError");
    let message = err.to_string();
    assert!(message.contains("AES/GCM/NoPadding"), "{}", message);
    assert!(message.contains(CEK_ALGORITHM), "{}", message);
}

#[test]
fn test_invalid_master_key_fails_every_encrypted_operation() {
    let store = Arc::new(MemoryTransport::new());
    let client = encryption_client(&store, SymmetricKeyProvider::new(&[1, 2, 3], "short"));
    let work = TempDir::new().unwrap();
    let source = work.path().join("src");
    fs::write(&source, payload(10)).unwrap();

    let errors = vec![
        client
            .put_object("bucket", "k", payload(10), &ObjectMetadata::new())
            .unwrap_err(),
        client
            .get_object("bucket", "k", &GetObjectOptions::new())
            .unwrap_err(),
        client
            .resumable_upload(&UploadRequest::new("bucket", "k", &source))
            .unwrap_err(),
        client
            .resumable_download(&DownloadRequest::new("bucket", "k", work.path().join("out")))
            .unwrap_err(),
        client
            .copy_object("bucket", "a", "bucket", "b", None)
            .unwrap_err(),
    ];
    for err in errors {
        assert_eq!(err.code(), "EncryptionClientError", "{}", err);
    }
    assert_eq!(store.total_requests(), 0);
}
