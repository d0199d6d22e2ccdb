// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content synchronization between the build executor's namespace and the
//! servable namespace, including blobs that land after their image.

use kiln_core::application::sync::{ContentSyncEngine, SyncSettings};
use kiln_core::domain::content::{
    ContentNamespace, ContentStore, Descriptor, ImageRecord, ImageStore, IngestRequest,
    MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use kiln_core::domain::events::EventPublisher;
use kiln_core::domain::content::sha256_digest;
use kiln_core::infrastructure::content::{
    open_namespace, ContentBackend, MemoryContentStore, MemoryImageStore,
};
use kiln_core::infrastructure::event_bus::EventBus;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Namespaces {
    bus: EventBus,
    source_blobs: Arc<MemoryContentStore>,
    dest_blobs: Arc<MemoryContentStore>,
    source: ContentNamespace,
    destination: ContentNamespace,
}

fn namespaces() -> Namespaces {
    let bus = EventBus::with_default_capacity();
    let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
    let source_blobs = Arc::new(MemoryContentStore::new());
    let dest_blobs = Arc::new(MemoryContentStore::new());
    Namespaces {
        source: ContentNamespace::new(
            "buildkit",
            source_blobs.clone(),
            Arc::new(MemoryImageStore::new("buildkit", Some(publisher.clone()))),
        ),
        destination: ContentNamespace::new(
            "k8s.io",
            dest_blobs.clone(),
            Arc::new(MemoryImageStore::new("k8s.io", Some(publisher))),
        ),
        bus,
        source_blobs,
        dest_blobs,
    }
}

async fn ingest(store: &dyn ContentStore, desc: &Descriptor, data: &[u8], labels: BTreeMap<String, String>) {
    store
        .ingest(
            IngestRequest::new(desc.ref_key(), desc.digest.clone())
                .with_descriptor(desc.clone())
                .with_labels(labels),
            Box::pin(Cursor::new(data.to_vec())),
        )
        .await
        .unwrap();
}

fn manifest(config: &Descriptor, layers: &[&Descriptor]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_MANIFEST,
        "config": config,
        "layers": layers,
    }))
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_sync_waits_for_late_blob_then_is_idempotent() {
    let ns = namespaces();
    let config_bytes = br#"{"os":"linux","architecture":"amd64"}"#;
    let late_bytes = b"late-layer-contents";
    let config = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, config_bytes);
    let late = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, late_bytes);
    let manifest_bytes = manifest(&config, &[&late]);
    let top = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes);

    let mut labels = BTreeMap::new();
    labels.insert("containerd.io/gc.ref.content.l.0".to_string(), late.digest.clone());
    ingest(ns.source_blobs.as_ref(), &config, config_bytes, BTreeMap::new()).await;
    ingest(ns.source_blobs.as_ref(), &top, &manifest_bytes, labels.clone()).await;
    ns.source
        .images
        .create(ImageRecord::new("docker.io/library/app:v1", top.clone()))
        .await
        .unwrap();

    // The layer finishes unpacking 20 s after the image is announced.
    let writer = ns.source_blobs.clone();
    let late_desc = late.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        ingest(writer.as_ref(), &late_desc, late_bytes, BTreeMap::new()).await;
    });

    let engine = ContentSyncEngine::new(ns.source.clone(), ns.destination.clone(), SyncSettings::default());
    let started = tokio::time::Instant::now();
    let report = engine.sync_image("docker.io/library/app:v1").await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(report.copied, 3);

    assert!(ns.dest_blobs.contains(&late.digest));
    let info = ns.destination.content.info(&top.digest).await.unwrap();
    assert_eq!(info.labels, labels);
    let mirrored = ns.destination.images.get("docker.io/library/app:v1").await.unwrap();
    assert_eq!(mirrored.target, top);

    let writes = ns.dest_blobs.write_count();
    let again = engine.sync_image("docker.io/library/app:v1").await.unwrap();
    assert_eq!(again.copied, 0);
    assert_eq!(ns.dest_blobs.write_count(), writes);
}

#[tokio::test]
async fn test_sync_walks_index_children() {
    let ns = namespaces();
    let config_bytes = b"{}";
    let layer_bytes = b"shared-layer";
    let config = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, config_bytes);
    let layer = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, layer_bytes);
    let manifest_bytes = manifest(&config, &[&layer]);
    let platform_manifest = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes);
    let index_bytes = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_INDEX,
        "manifests": [platform_manifest],
    }))
    .unwrap();
    let index = Descriptor::for_bytes(MEDIA_TYPE_OCI_INDEX, &index_bytes);

    for (desc, data) in [
        (&config, &config_bytes[..]),
        (&layer, &layer_bytes[..]),
        (&platform_manifest, &manifest_bytes[..]),
        (&index, &index_bytes[..]),
    ] {
        ingest(ns.source_blobs.as_ref(), desc, data, BTreeMap::new()).await;
    }
    ns.source
        .images
        .create(ImageRecord::new("docker.io/library/multi:v1", index.clone()))
        .await
        .unwrap();

    let engine = ContentSyncEngine::new(ns.source.clone(), ns.destination.clone(), SyncSettings::default());
    let report = engine.sync_image("docker.io/library/multi:v1").await.unwrap();
    assert_eq!(report.copied, 4);
    for desc in [&config, &layer, &platform_manifest, &index] {
        assert!(ns.dest_blobs.contains(&desc.digest));
    }
}

#[tokio::test]
async fn test_engine_mirrors_over_existing_record() {
    let ns = namespaces();
    let bytes = b"single-blob-image";
    let blob = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, bytes);
    ingest(ns.source_blobs.as_ref(), &blob, bytes, BTreeMap::new()).await;

    let engine = Arc::new(ContentSyncEngine::new(
        ns.source.clone(),
        ns.destination.clone(),
        SyncSettings::default(),
    ));
    let cancel = CancellationToken::new();
    let handle = engine.spawn(&ns.bus, cancel.clone());

    // Pre-existing record in the destination is overwritten, not an error.
    let stale = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, b"stale");
    ns.destination
        .images
        .create(ImageRecord::new("app:latest", stale))
        .await
        .unwrap();
    ns.source
        .images
        .create(ImageRecord::new("app:latest", blob.clone()))
        .await
        .unwrap();

    let mirrored = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let image = ns.destination.images.get("app:latest").await.unwrap();
            if image.target == blob {
                return image;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(mirrored.name, "app:latest");
    assert_eq!(ns.dest_blobs.write_count(), 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_syncs_sharing_a_layer_commit_intact_blobs() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = ContentBackend::Local {
        root: temp_dir.path().to_path_buf(),
    };
    let source = open_namespace(&backend, "buildkit", None).unwrap();
    let destination = open_namespace(&backend, "k8s.io", None).unwrap();

    let base_bytes: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let base = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, &base_bytes);
    ingest(source.content.as_ref(), &base, &base_bytes, BTreeMap::new()).await;

    let mut expected = vec![base.clone()];
    for tag in ["v1", "v2"] {
        let config_bytes = format!(r#"{{"os":"linux","architecture":"amd64","tag":"{}"}}"#, tag);
        let config = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, config_bytes.as_bytes());
        let own_bytes = format!("{}-layer-contents", tag).repeat(4096);
        let own = Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, own_bytes.as_bytes());
        let manifest_bytes = manifest(&config, &[&base, &own]);
        let top = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes);

        ingest(source.content.as_ref(), &config, config_bytes.as_bytes(), BTreeMap::new()).await;
        ingest(source.content.as_ref(), &own, own_bytes.as_bytes(), BTreeMap::new()).await;
        ingest(source.content.as_ref(), &top, &manifest_bytes, BTreeMap::new()).await;
        source
            .images
            .create(ImageRecord::new(format!("registry.example/app:{}", tag), top.clone()))
            .await
            .unwrap();
        expected.extend([config, own, top]);
    }

    let engine = Arc::new(ContentSyncEngine::new(source, destination.clone(), SyncSettings::default()));
    let mut tasks = Vec::new();
    // Create and update events for both images arrive together.
    for name in ["registry.example/app:v1", "registry.example/app:v2"].repeat(2) {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.sync_image(name).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for desc in &expected {
        let data = destination.content.read_all(&desc.digest).await.unwrap();
        assert_eq!(sha256_digest(&data), desc.digest);
        assert_eq!(data.len() as i64, desc.size);
    }
    for tag in ["v1", "v2"] {
        let name = format!("registry.example/app:{}", tag);
        assert!(destination.images.get(&name).await.is_ok());
    }
    let leftovers = std::fs::read_dir(temp_dir.path().join("k8s.io/ingest")).unwrap().count();
    assert_eq!(leftovers, 0);
}
