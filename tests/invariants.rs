//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees through the public API.

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use forgeedit_core::{
    directory::{DirectoryError, NewImage},
    store::{AccessCounts, StoreError},
    Accounts, ArtifactKind, ArtifactStore, CookieIdentity, EditPipeline, EditRequest,
    EngineConfig, FsStore, ImageRef, InMemoryDirectory, MemoryStore, Operation,
    OwnedImageRecord, OwnershipPolicy, PipelineError, RequestContext, SnapshotLock, User,
    UserDirectory, UserId,
};

/// Low round count keeps credential sealing cheap in tests.
const TEST_ROUNDS: u32 = 64;

fn accounts(directory: Arc<dyn UserDirectory>) -> Accounts {
    Accounts::new(directory).with_iterations(TEST_ROUNDS)
}
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

struct Harness {
    store: Arc<MemoryStore>,
    directory: Arc<InMemoryDirectory>,
    pipeline: EditPipeline,
}

fn harness(policy: OwnershipPolicy) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let accounts = accounts(directory.clone());
    accounts.register("alice", "pw").unwrap();
    accounts.register("bob", "pw").unwrap();

    let identity = Arc::new(CookieIdentity::new(directory.clone()));
    let config = EngineConfig {
        ownership_policy: policy,
        ..EngineConfig::default()
    };
    let pipeline = EditPipeline::new(store.clone(), directory.clone(), identity, &config);
    Harness { store, directory, pipeline }
}

fn alice() -> RequestContext {
    RequestContext::for_user("alice")
}

fn bob() -> RequestContext {
    RequestContext::for_user("bob")
}

fn encode(img: RgbaImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img).write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

fn gradient_png(w: u32, h: u32) -> Vec<u8> {
    encode(
        RgbaImage::from_fn(w, h, |x, y| {
            let (r, g) = ((x * 255 / w.max(1)) as u8, (y * 255 / h.max(1)) as u8);
            Rgba([r, g, ((x ^ y) & 0xff) as u8, 255])
        }),
        ImageFormat::Png,
    )
}

fn dimensions(bytes: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory(bytes).unwrap();
    (img.width(), img.height())
}

fn upload(h: &Harness, w: u32, height: u32) -> ImageRef {
    h.pipeline
        .upload(&alice(), "photo.png", &gradient_png(w, height))
        .unwrap()
        .image_url
}

#[test]
fn invariant_crop_output_matches_requested_size() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 40, 30);

    let regions = [(0, 0, 40, 30), (0, 0, 1, 1), (10, 5, 30, 25), (39, 29, 1, 1), (7, 0, 13, 30)];
    for (x, y, w, ht) in regions {
        let out = h
            .pipeline
            .crop(&alice(), source.as_str(), x, y, w, ht)
            .unwrap();
        let bytes = h.pipeline.fetch(out.image_url.as_str()).unwrap();
        assert_eq!(dimensions(&bytes), (w as u32, ht as u32));
    }
}

#[test]
fn invariant_rotate_zero_preserves_dimensions() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 33, 17);
    let out = h.pipeline.rotate(&alice(), source.as_str(), 0).unwrap();
    assert_eq!((out.width, out.height), (33, 17));
    let bytes = h.pipeline.fetch(out.image_url.as_str()).unwrap();
    assert_eq!(dimensions(&bytes), (33, 17));

    let quarter = h.pipeline.rotate(&alice(), source.as_str(), -90).unwrap();
    assert_eq!((quarter.width, quarter.height), (17, 33));
}

#[test]
fn invariant_compress_quality_sanity_bound() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 128, 96);

    let high = h.pipeline.compress(&alice(), source.as_str(), 100).unwrap();
    let mid = h.pipeline.compress(&alice(), source.as_str(), 50).unwrap();
    let high_size = high.stats.unwrap().after_size_bytes as f64;
    let mid_size = mid.stats.unwrap().after_size_bytes as f64;
    assert!(high_size / mid_size >= 1.0);
}

#[test]
fn invariant_compress_stats_reproducible() {
    let h = harness(OwnershipPolicy::Strict);
    let solid = RgbaImage::from_pixel(1000, 1000, Rgba([30, 120, 200, 255]));
    let png = encode(solid, ImageFormat::Png);
    let source = h.pipeline.upload(&alice(), "solid.png", &png).unwrap().image_url;

    let first = h.pipeline.compress(&alice(), source.as_str(), 80).unwrap();
    let second = h.pipeline.compress(&alice(), source.as_str(), 80).unwrap();
    let stats = first.stats.unwrap();

    assert_eq!(stats.before_size_bytes, png.len() as u64);
    assert!(stats.after_size_bytes > 0);
    let ratio = stats.before_size_bytes as f64 / stats.after_size_bytes as f64;
    let expected = (ratio * 100.0).round() / 100.0;
    assert_eq!(stats.ratio, expected);
    assert_eq!(second.stats.unwrap(), stats);

    let jpeg = h.pipeline.fetch(first.image_url.as_str()).unwrap();
    assert_eq!(jpeg.len() as u64, stats.after_size_bytes);
    assert_eq!(first.image_url.extension(), Some("jpg"));
}

#[test]
fn invariant_identical_uploads_get_distinct_references() {
    let h = harness(OwnershipPolicy::Strict);
    let bytes = gradient_png(8, 8);

    let (a, b) = thread::scope(|s| {
        let t1 = s.spawn(|| h.pipeline.upload(&alice(), "same.png", &bytes).unwrap());
        let t2 = s.spawn(|| h.pipeline.upload(&alice(), "same.png", &bytes).unwrap());
        (t1.join().unwrap(), t2.join().unwrap())
    });

    assert_ne!(a.image_url, b.image_url);
    assert_eq!(a.record.content_hash, b.record.content_hash);
    assert_eq!(h.store.len(), 2);
    assert_eq!(h.directory.list_images(a.record.owner).len(), 2);
}

#[test]
fn invariant_unauthenticated_never_touches_store() {
    let h = harness(OwnershipPolicy::Permissive);
    let source = upload(&h, 10, 10);
    let before = h.store.access_counts();
    assert_eq!(before, AccessCounts { reads: 0, writes: 1 });

    let anon = RequestContext::anonymous();
    let stranger = RequestContext::for_user("nobody-registered");
    let url = source.as_str();
    for ctx in [&anon, &stranger] {
        let results = vec![
            h.pipeline.upload(ctx, "x.png", &gradient_png(2, 2)),
            h.pipeline.rotate(ctx, url, 90),
            h.pipeline.crop(ctx, url, 0, 0, 5, 5),
            h.pipeline.compress(ctx, url, 0),
            h.pipeline.brightness(ctx, url, 1.5),
            h.pipeline.contrast(ctx, url, -1.0),
            h.pipeline.sharpen(ctx, url),
            h.pipeline.smooth(ctx, url),
            h.pipeline.histogram(ctx, url),
        ];
        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err, PipelineError::Unauthorized(_)), "{err}");
            assert_eq!(err.status_code(), 401);
        }
        assert!(matches!(h.pipeline.gallery(ctx), Err(PipelineError::Unauthorized(_))));
    }

    assert_eq!(h.store.access_counts(), before);
}

#[test]
fn invariant_crop_out_of_bounds_writes_nothing() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 20, 10);
    let writes = h.store.access_counts().writes;

    let err = h
        .pipeline
        .crop(&alice(), source.as_str(), 15, 0, 6, 5)
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRegion(_)), "{err}");
    assert!(err.is_client_error());
    assert_eq!(h.store.access_counts().writes, writes);
    assert_eq!(h.pipeline.gallery(&alice()).unwrap().len(), 1);
}

#[test]
fn invariant_bad_quality_rejected_before_read() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 4, 4);
    let before = h.store.access_counts();

    for quality in [0, 101, -5] {
        let err = h.pipeline.compress(&alice(), source.as_str(), quality).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter(_)), "{err}");
    }
    let err = h.pipeline.brightness(&alice(), source.as_str(), 0.0).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidParameter(_)));

    assert_eq!(h.store.access_counts(), before);
}

#[test]
fn invariant_copy_on_edit() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 16, 16);
    let original = h.pipeline.fetch(source.as_str()).unwrap();

    let ops = [
        Operation::Rotate { angle: 30 },
        Operation::Brightness { factor: 1.8 },
        Operation::Contrast { factor: 0.4 },
        Operation::Sharpen,
        Operation::Smooth,
        Operation::Compress { quality: 10 },
    ];
    for op in ops {
        let out = h
            .pipeline
            .apply(&alice(), &EditRequest::new(source.as_str(), op))
            .unwrap();
        assert_ne!(out.image_url, source);
    }
    assert_eq!(h.pipeline.fetch(source.as_str()).unwrap(), original);
}

#[test]
fn invariant_gallery_records_full_edit_history() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 12, 12);
    let rotated = h.pipeline.rotate(&alice(), source.as_str(), 90).unwrap();
    let smoothed = h.pipeline.smooth(&alice(), rotated.image_url.as_str()).unwrap();
    let chart = h.pipeline.histogram(&alice(), smoothed.image_url.as_str()).unwrap();

    let gallery = h.pipeline.gallery(&alice()).unwrap();
    let refs: Vec<_> = gallery.iter().map(|r| r.reference.clone()).collect();
    assert_eq!(
        refs,
        vec![
            source.clone(),
            rotated.image_url.clone(),
            smoothed.image_url.clone(),
            chart.image_url.clone(),
        ]
    );

    let kinds: Vec<_> = gallery.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ArtifactKind::Upload,
            ArtifactKind::Edit,
            ArtifactKind::Edit,
            ArtifactKind::Diagnostic,
        ]
    );
    assert_eq!(gallery[1].parent.as_ref(), Some(&source));
    assert_eq!(gallery[2].operation.as_deref(), Some("smooth"));
    assert!(gallery[1..].iter().all(|r| r.original_filename == "photo.png"));
    assert!(gallery[1].job_hash.is_some());

    assert!(h.pipeline.gallery(&bob()).unwrap().is_empty());
}

#[test]
fn invariant_histogram_output_not_editable() {
    let h = harness(OwnershipPolicy::Permissive);
    let source = upload(&h, 8, 8);
    let chart = h.pipeline.histogram(&alice(), source.as_str()).unwrap();
    assert_eq!(chart.kind, ArtifactKind::Diagnostic);

    let reads = h.store.access_counts().reads;
    let err = h.pipeline.sharpen(&alice(), chart.image_url.as_str()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidParameter(_)));
    assert_eq!(h.store.access_counts().reads, reads);

    // still servable
    assert!(!h.pipeline.fetch(chart.image_url.as_str()).unwrap().is_empty());
}

#[test]
fn invariant_strict_policy_forbids_foreign_input() {
    let h = harness(OwnershipPolicy::Strict);
    let source = upload(&h, 8, 8);
    let before = h.store.access_counts();

    let err = h.pipeline.rotate(&bob(), source.as_str(), 90).unwrap_err();
    assert!(matches!(err, PipelineError::Forbidden(_)));
    assert_eq!(err.status_code(), 403);
    assert_eq!(h.store.access_counts(), before);
}

#[test]
fn invariant_permissive_policy_allows_any_caller() {
    let h = harness(OwnershipPolicy::Permissive);
    let source = upload(&h, 8, 8);

    let out = h.pipeline.rotate(&bob(), source.as_str(), 90).unwrap();
    let bob_gallery = h.pipeline.gallery(&bob()).unwrap();
    assert_eq!(bob_gallery.len(), 1);
    assert_eq!(bob_gallery[0].reference, out.image_url);

    let missing = h.pipeline.smooth(&bob(), "/uploads/not-there.png").unwrap_err();
    assert!(matches!(missing, PipelineError::NotFound(_)));
}

#[test]
fn invariant_references_cannot_escape_root() {
    let h = harness(OwnershipPolicy::Permissive);
    for bad in ["/uploads/../Cargo.toml", "/uploads/a/../../b.png", "../secret", "/etc/passwd"] {
        let err = h.pipeline.sharpen(&alice(), bad).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter(_)), "{bad}: {err}");
        assert!(h.pipeline.fetch(bad).is_err());
    }
    assert_eq!(h.store.access_counts().reads, 0);
}

#[test]
fn invariant_non_image_upload_rejected() {
    let h = harness(OwnershipPolicy::Strict);
    let err = h
        .pipeline
        .upload(&alice(), "notes.txt", b"just some text")
        .unwrap_err();
    assert!(matches!(err, PipelineError::DecodeError(_)));
    assert!(!err.is_client_error());
    assert_eq!(h.store.access_counts().writes, 0);
}

#[test]
fn invariant_upload_extension_from_content() {
    let h = harness(OwnershipPolicy::Strict);
    let jpeg = {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(6, 6, image::Rgb([1, 2, 3])))
            .write_to(&mut buf, ImageFormat::Jpeg)
            .unwrap();
        buf.into_inner()
    };
    let out = h.pipeline.upload(&alice(), "../../misnamed.png", &jpeg).unwrap();
    assert_eq!(out.image_url.extension(), Some("jpg"));
    assert_eq!(out.record.original_filename, "misnamed.png");
}

/// Directory that refuses to record images.
struct RefusingDirectory(InMemoryDirectory);

impl UserDirectory for RefusingDirectory {
    fn find_by_name(&self, name: &str) -> Option<User> {
        self.0.find_by_name(name)
    }

    fn create(&self, name: &str, credential_hash: &str) -> Result<User, DirectoryError> {
        self.0.create(name, credential_hash)
    }

    fn record_image(
        &self,
        owner: UserId,
        _image: NewImage,
    ) -> Result<OwnedImageRecord, DirectoryError> {
        Err(DirectoryError::UnknownUser(owner))
    }

    fn list_images(&self, owner: UserId) -> Vec<OwnedImageRecord> {
        self.0.list_images(owner)
    }

    fn find_image(&self, reference: &ImageRef) -> Option<OwnedImageRecord> {
        self.0.find_image(reference)
    }
}

#[test]
fn invariant_failed_recording_leaves_orphan_out_of_gallery() {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(RefusingDirectory(InMemoryDirectory::new()));
    accounts(directory.clone()).register("alice", "pw").unwrap();
    let identity = Arc::new(CookieIdentity::new(directory.clone()));
    let config = EngineConfig::default();
    let pipeline = EditPipeline::new(store.clone(), directory.clone(), identity, &config);

    let err = pipeline.upload(&alice(), "a.png", &gradient_png(4, 4)).unwrap_err();
    assert!(matches!(err, PipelineError::StorageFailure(_)));
    assert_eq!(store.len(), 1);
    assert!(pipeline.gallery(&alice()).unwrap().is_empty());
}

#[test]
fn invariant_filesystem_store_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(tmp.path().join("uploads")).unwrap());
    let directory = Arc::new(InMemoryDirectory::new());
    accounts(directory.clone()).register("alice", "pw").unwrap();
    let identity = Arc::new(CookieIdentity::new(directory.clone()));
    let config = EngineConfig::default();
    let pipeline = EditPipeline::new(store.clone(), directory.clone(), identity, &config);

    let source = pipeline
        .upload(&alice(), "p.png", &gradient_png(30, 20))
        .unwrap()
        .image_url;
    let cropped = pipeline.crop(&alice(), source.as_str(), 5, 5, 10, 10).unwrap();

    let path = store.resolve(&cropped.image_url);
    assert!(path.starts_with(store.root()));
    assert_eq!(dimensions(&std::fs::read(path).unwrap()), (10, 10));
    assert_eq!(store.get(&source).unwrap(), gradient_png(30, 20));
}

/// Store whose reads wait for a second concurrent reader.
struct RendezvousStore {
    inner: MemoryStore,
    readers: Mutex<usize>,
    arrived: Condvar,
}

impl ArtifactStore for RendezvousStore {
    fn put(&self, bytes: &[u8], extension: &str) -> Result<ImageRef, StoreError> {
        self.inner.put(bytes, extension)
    }

    fn get(&self, reference: &ImageRef) -> Result<Vec<u8>, StoreError> {
        let mut readers = self.readers.lock().unwrap();
        *readers += 1;
        self.arrived.notify_all();
        let (readers, wait) = self
            .arrived
            .wait_timeout_while(readers, Duration::from_secs(5), |n| *n < 2)
            .unwrap();
        drop(readers);
        if wait.timed_out() {
            return Err(StoreError::NotFound("no concurrent reader".to_string()));
        }
        self.inner.get(reference)
    }
}

#[test]
fn invariant_storage_reads_do_not_hold_job_slots() {
    let store = Arc::new(RendezvousStore {
        inner: MemoryStore::new(),
        readers: Mutex::new(0),
        arrived: Condvar::new(),
    });
    let directory = Arc::new(InMemoryDirectory::new());
    accounts(directory.clone()).register("alice", "pw").unwrap();
    let identity = Arc::new(CookieIdentity::new(directory.clone()));
    let config = EngineConfig {
        max_concurrent_jobs: 1,
        ..EngineConfig::default()
    };
    let pipeline = EditPipeline::new(store, directory, identity, &config);
    let source = pipeline
        .upload(&alice(), "a.png", &gradient_png(6, 6))
        .unwrap()
        .image_url;

    // with one job slot, both reads can only overlap if neither holds it
    let (a, b) = thread::scope(|s| {
        let t1 = s.spawn(|| pipeline.rotate(&alice(), source.as_str(), 90));
        let t2 = s.spawn(|| pipeline.smooth(&alice(), source.as_str()));
        (t1.join().unwrap(), t2.join().unwrap())
    });
    assert!(a.is_ok(), "{:?}", a.err());
    assert!(b.is_ok(), "{:?}", b.err());
}

fn locked_upload(state: &Path, storage: &Path, bytes: &[u8]) -> ImageRef {
    let _lock = SnapshotLock::acquire(state).unwrap();
    let directory = Arc::new(InMemoryDirectory::load(state).unwrap());
    let store = Arc::new(FsStore::open(storage).unwrap());
    let identity = Arc::new(CookieIdentity::new(directory.clone()));
    let pipeline = EditPipeline::new(store, directory.clone(), identity, &EngineConfig::default());
    let out = pipeline.upload(&alice(), "a.png", bytes).unwrap();
    directory.save(state).unwrap();
    out.image_url
}

#[test]
fn invariant_overlapping_snapshot_sessions_keep_every_record() {
    let tmp = tempfile::tempdir().unwrap();
    let state = tmp.path().join("state.json");
    let storage = tmp.path().join("uploads");
    {
        let directory = Arc::new(InMemoryDirectory::new());
        accounts(directory.clone()).register("alice", "pw").unwrap();
        directory.save(&state).unwrap();
    }

    let bytes = gradient_png(4, 4);
    let uploaded: Vec<ImageRef> = thread::scope(|s| {
        let handles: Vec<_> = (0..12)
            .map(|_| s.spawn(|| locked_upload(&state, &storage, &bytes)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let directory = InMemoryDirectory::load(&state).unwrap();
    let alice_id = directory.find_by_name("alice").unwrap().id;
    let gallery = directory.list_images(alice_id);
    assert_eq!(gallery.len(), uploaded.len());
    for reference in &uploaded {
        assert!(gallery.iter().any(|r| &r.reference == reference));
    }
    assert_eq!(std::fs::read_dir(&storage).unwrap().count(), uploaded.len());
}
