use crate::config::Config;
use crate::db::{CatalogTable, JobKind, JobStatus};
use crate::error::{AppError, ErrorKind};
use crate::formats::cover;
use crate::ingest::hasher::content_hash;
use crate::ingest::{IngestEvent, Payload, Pipeline, repair};
use crate::library::StorageLayout;
use crate::store::Store;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

const WAIT: Duration = Duration::from_secs(20);

const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// EPUB bytes with the usual layout: stored `mimetype` first, container,
/// package document and one chapter.
fn epub(title: &str, author: Option<&str>, cover_png: Option<&[u8]>) -> Vec<u8> {
    let creator = author
        .map(|a| format!(r#"<dc:creator opf:role="aut">{}</dc:creator>"#, a))
        .unwrap_or_default();
    let (cover_meta, cover_item) = if cover_png.is_some() {
        (
            r#"<meta name="cover" content="cover-img"/>"#,
            r#"<item id="cover-img" href="images/cover.png" media-type="image/png"/>"#,
        )
    } else {
        ("", "")
    };
    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" xmlns:dc="http://purl.org/dc/elements/1.1/"
         xmlns:opf="http://www.idpf.org/2007/opf" version="2.0">
  <metadata><dc:title>{title}</dc:title>{creator}{cover_meta}</metadata>
  <manifest>
    <item id="c1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    {cover_item}
  </manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#
    );
    let chapter = format!("<html><body><h1>{}</h1></body></html>", title);

    let mut entries: Vec<(&str, &[u8])> = vec![
        ("META-INF/container.xml", CONTAINER.as_bytes()),
        ("OEBPS/content.opf", opf.as_bytes()),
        ("OEBPS/text/ch1.xhtml", chapter.as_bytes()),
    ];
    if let Some(png) = cover_png {
        entries.push(("OEBPS/images/cover.png", png));
    }
    zip_with_mimetype(&entries)
}

fn zip_with_mimetype(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    let deflated = SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, deflated).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn png() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 6));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

fn upload(file_name: &str, data: Vec<u8>) -> Payload {
    Payload::Multipart {
        file_name: file_name.to_string(),
        data,
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    store: Store,
    pipeline: Arc<Pipeline>,
    layout: StorageLayout,
    user_id: i64,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = tmp.path().to_path_buf();
        config.workers.upload = 2;
        config.workers.parse = 2;
        config.workers.queue_capacity = 4;
        config.cover.convert = false;
        adjust(&mut config);

        let store = Store::open_memory().unwrap();
        let user_id = store.app.create_user("reader", "hash", "user").unwrap().id;
        let pipeline = Arc::new(Pipeline::start(
            store.clone(),
            &config,
            CancellationToken::new(),
        ));

        Self {
            layout: StorageLayout::new(tmp.path()),
            _tmp: tmp,
            store,
            pipeline,
            user_id,
        }
    }

    fn book_dirs(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.layout.user_books_dir(self.user_id)) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn book_count(&self) -> i64 {
        self.store.catalog.count(CatalogTable::Books).unwrap()
    }
}

async fn next_events(events: &mut broadcast::Receiver<IngestEvent>, count: usize) -> Vec<IngestEvent> {
    let mut seen = Vec::with_capacity(count);
    while seen.len() < count {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for ingest events")
            .expect("event channel closed");
        seen.push(event);
    }
    seen
}

// ========== END-TO-END SCENARIOS ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_upload_returns_catalogued_book() {
    let h = Harness::new();

    let book = h
        .pipeline
        .ingest_single(
            h.user_id,
            upload("novel.epub", epub("Leaves of Grass", Some("Walt Whitman"), None)),
        )
        .await
        .unwrap();

    assert_eq!(book.title, "Leaves of Grass");
    assert_eq!(book.sort_title, "Leaves of Grass");
    assert_eq!(book.author_sort, "Whitman, Walt");
    assert_eq!(book.isbn, None);
    assert!(!book.has_cover);
    assert!(Path::new(&book.path).is_file());

    assert_eq!(h.book_count(), 1);
    assert_eq!(h.store.book(book.id).unwrap(), Some(book.clone()));
    let owned = h.store.user_books(h.user_id).unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, book.id);

    let hash = content_hash(Path::new(&book.path), &CancellationToken::new()).unwrap();
    assert_eq!(h.store.app.find_book_by_hash(&hash).unwrap(), Some(book.id));

    let authors = h.store.catalog.book_authors(book.id).unwrap();
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].name, "Walt Whitman");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_single_upload_is_rejected() {
    let h = Harness::new();
    let bytes = epub("Leaves of Grass", Some("Walt Whitman"), None);

    let first = h
        .pipeline
        .ingest_single(h.user_id, upload("novel.epub", bytes.clone()))
        .await
        .unwrap();

    let second = h
        .pipeline
        .ingest_single(h.user_id, upload("novel.epub", bytes))
        .await;
    match second {
        Err(AppError::DuplicateBook { existing_id }) => assert_eq!(existing_id, first.id),
        other => panic!("expected duplicate, got {:?}", other),
    }

    assert_eq!(h.book_count(), 1);
    assert_eq!(h.store.app.hashed_book_ids().unwrap().len(), 1);
    // The second upload claimed `novel_1` and removed it again.
    assert_eq!(h.book_dirs().len(), 1);

    let jobs = h.store.app.list_jobs(h.user_id, 10).unwrap();
    let failed: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_with_spoofed_text_file() {
    let h = Harness::new();
    let mut events = h.pipeline.subscribe();

    let records = h
        .pipeline
        .ingest_batch(
            h.user_id,
            vec![
                upload("one.epub", epub("One", Some("Ann Author"), None)),
                upload("two.epub", b"plain text wearing an epub extension".to_vec()),
                upload("three.epub", epub("Three", Some("Ann Author"), None)),
            ],
        )
        .unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == JobStatus::Pending));

    let outcomes = next_events(&mut events, 3).await;
    for (index, record) in records.iter().enumerate() {
        let event = outcomes
            .iter()
            .find(|e| e.job_id() == record.id)
            .unwrap();
        if index == 1 {
            assert!(matches!(
                event,
                IngestEvent::Failed {
                    kind: ErrorKind::UnsupportedFormat,
                    ..
                }
            ));
        } else {
            assert!(matches!(event, IngestEvent::Ingested { .. }));
        }
    }

    let spoofed = h.store.job(records[1].id).unwrap().unwrap();
    assert_eq!(spoofed.status, JobStatus::Failed);
    assert!(spoofed.error.is_some());

    assert_eq!(h.book_count(), 2);
    assert_eq!(h.book_dirs().len(), 2);
    // Both books share one author row.
    assert_eq!(h.store.catalog.count(CatalogTable::Authors).unwrap(), 1);
}

// ========== DEDUPLICATION ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_duplicate_is_skipped() {
    let h = Harness::new();
    let mut events = h.pipeline.subscribe();
    let bytes = epub("Repeat", None, None);

    h.pipeline
        .ingest_batch(h.user_id, vec![upload("repeat.epub", bytes.clone())])
        .unwrap();
    let first = next_events(&mut events, 1).await;
    let IngestEvent::Ingested { book_id, .. } = first[0] else {
        panic!("expected ingestion, got {:?}", first[0]);
    };

    let records = h
        .pipeline
        .ingest_batch(h.user_id, vec![upload("repeat.epub", bytes)])
        .unwrap();
    let second = next_events(&mut events, 1).await;
    assert!(matches!(
        second[0],
        IngestEvent::Skipped { existing_id, .. } if existing_id == book_id
    ));

    // Skipping is not a failure: the job keeps the DONE status of its upload.
    let skipped = h.store.app.get_job(records[0].id).unwrap().unwrap();
    assert_eq!(skipped.status, JobStatus::Done);
    assert_eq!(skipped.error, None);

    assert_eq!(h.book_count(), 1);
    assert_eq!(h.store.app.hashed_book_ids().unwrap().len(), 1);
    assert_eq!(h.book_dirs().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repacked_book_is_a_duplicate() {
    let h = Harness::new();
    let a = epub("Same", Some("Ann Author"), None);

    // Same entries in a different physical order.
    let mut source = zip::ZipArchive::new(Cursor::new(a.clone())).unwrap();
    let mut names: Vec<String> = source.file_names().map(str::to_string).collect();
    names.retain(|n| n != "mimetype");
    names.sort();
    names.reverse();
    let mut contents = Vec::new();
    for name in &names {
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut source.by_name(name).unwrap(), &mut data).unwrap();
        contents.push((name.clone(), data));
    }
    let entries: Vec<(&str, &[u8])> = contents
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();
    let b = zip_with_mimetype(&entries);
    assert_ne!(a, b);

    h.pipeline
        .ingest_single(h.user_id, upload("a.epub", a))
        .await
        .unwrap();
    let second = h.pipeline.ingest_single(h.user_id, upload("b.epub", b)).await;
    assert!(matches!(second, Err(AppError::DuplicateBook { .. })));
    assert_eq!(h.book_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_uploads_keep_one_book() {
    let h = Harness::new();
    let bytes = epub("Twice", Some("Ann Author"), None);

    let mut set = JoinSet::new();
    for _ in 0..2 {
        let pipeline = Arc::clone(&h.pipeline);
        let payload = upload("twice.epub", bytes.clone());
        let user_id = h.user_id;
        set.spawn(async move { pipeline.ingest_single(user_id, payload).await });
    }

    let mut ok = 0;
    let mut duplicates = 0;
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(AppError::DuplicateBook { .. }) => duplicates += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!((ok, duplicates), (1, 1));
    assert_eq!(h.book_count(), 1);
    assert_eq!(h.book_dirs().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cover_conversion_only_runs_for_kept_book() {
    let h = Harness::with_config(|config| config.cover.convert = true);
    let bytes = epub("Covered Twice", None, Some(&png()));

    let mut set = JoinSet::new();
    for _ in 0..2 {
        let pipeline = Arc::clone(&h.pipeline);
        let payload = upload("covered.epub", bytes.clone());
        let user_id = h.user_id;
        set.spawn(async move { pipeline.ingest_single(user_id, payload).await });
    }

    let mut kept = Vec::new();
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(book) => kept.push(book),
            Err(AppError::DuplicateBook { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(kept.len(), 1);

    let dir = Path::new(&kept[0].path).parent().unwrap().to_path_buf();
    let webp = dir.join("cover.webp");
    let deadline = tokio::time::Instant::now() + WAIT;
    while !webp.is_file() {
        assert!(tokio::time::Instant::now() < deadline, "cover was never converted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(h.book_dirs(), vec![dir]);
}

// ========== CONCURRENCY ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_file_name_gets_distinct_directories() {
    let h = Harness::new();
    const N: usize = 6;

    let mut set = JoinSet::new();
    for i in 0..N {
        let pipeline = Arc::clone(&h.pipeline);
        let payload = upload("novel.epub", epub(&format!("Volume {}", i), None, None));
        let user_id = h.user_id;
        set.spawn(async move { pipeline.ingest_single(user_id, payload).await });
    }

    let mut dirs = HashSet::new();
    while let Some(result) = set.join_next().await {
        let book = result.unwrap().unwrap();
        let dir = Path::new(&book.path).parent().unwrap().to_path_buf();
        assert!(dirs.insert(dir));
    }

    assert_eq!(dirs.len(), N);
    assert_eq!(h.book_dirs().len(), N);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_single_uploads_receive_their_own_book() {
    let h = Harness::new();

    let mut set = JoinSet::new();
    for i in 0..5 {
        let pipeline = Arc::clone(&h.pipeline);
        let title = format!("Book {}", i);
        let payload = upload(&format!("book{}.epub", i), epub(&title, None, None));
        let user_id = h.user_id;
        set.spawn(async move { (title, pipeline.ingest_single(user_id, payload).await) });
    }

    while let Some(result) = set.join_next().await {
        let (title, book) = result.unwrap();
        assert_eq!(book.unwrap().title, title);
    }
    assert_eq!(h.pipeline.pending(), 0);
}

// ========== FAILURE CLEANUP ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_archive_leaves_no_directory() {
    let h = Harness::new();
    let mut bytes = epub("Broken", None, None);
    // Keeps the leading `mimetype` entry but loses the central directory.
    bytes.truncate(200);

    let result = h
        .pipeline
        .ingest_single(h.user_id, upload("broken.epub", bytes))
        .await;

    assert!(matches!(result, Err(AppError::CorruptArchive(_))));
    assert!(h.book_dirs().is_empty());
    assert_eq!(h.book_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_container_leaves_no_directory() {
    let h = Harness::new();
    let bytes = zip_with_mimetype(&[("OEBPS/content.opf", b"<package/>")]);

    let result = h
        .pipeline
        .ingest_single(h.user_id, upload("nocontainer.epub", bytes))
        .await;

    assert!(matches!(result, Err(AppError::MetadataParse(_))));
    assert!(h.book_dirs().is_empty());
    assert!(h.store.app.hashed_book_ids().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shut_down_pipeline_cancels_new_jobs() {
    let h = Harness::new();
    h.pipeline.shutdown().await;

    let result = h
        .pipeline
        .ingest_single(h.user_id, upload("late.epub", epub("Late", None, None)))
        .await;

    assert!(matches!(result, Err(AppError::Cancelled)));
    assert!(h.book_dirs().is_empty());
    let jobs = h.store.app.list_jobs(h.user_id, 10).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_fails_queued_jobs() {
    let h = Harness::with_config(|config| {
        config.workers.upload = 1;
        config.workers.queue_capacity = 8;
    });

    for i in 0..8 {
        let payload = upload(&format!("queued{}.epub", i), epub(&format!("Queued {}", i), None, None));
        let job = h.pipeline.submit(h.user_id, JobKind::Batch, payload).unwrap();
        h.pipeline.push(job).await.unwrap();
    }
    h.pipeline.shutdown().await;

    let jobs = h.store.app.list_jobs(h.user_id, 20).unwrap();
    assert_eq!(jobs.len(), 8);
    for job in &jobs {
        assert!(
            matches!(job.status, JobStatus::Done | JobStatus::Failed),
            "job {} left {:?}",
            job.id,
            job.status
        );
    }

    // Every job either became a book or was failed and cleaned up.
    let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count() as i64;
    assert_eq!(h.book_count() + failed, 8);
    assert_eq!(h.book_dirs().len() as i64, h.book_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catalog_failure_keeps_stored_file() {
    let h = Harness::new();

    // A catalog row already holding the path the upload will be stored at.
    let clash = h
        .layout
        .user_books_dir(h.user_id)
        .join("clash")
        .join("clash.epub");
    h.store
        .catalog
        .create_book(
            &crate::db::NewBook {
                title: "Squatter".to_string(),
                sort_title: "Squatter".to_string(),
                publish_date: None,
                author_sort: "Unknown".to_string(),
                isbn: None,
                path: clash.to_string_lossy().into_owned(),
                uuid: uuid::Uuid::new_v4().to_string(),
                has_cover: false,
            },
            "Unknown",
            "Unknown",
            None,
            &[],
        )
        .unwrap();

    let result = h
        .pipeline
        .ingest_single(h.user_id, upload("clash.epub", epub("Clash", None, None)))
        .await;

    assert!(matches!(result, Err(AppError::Persistence(_))));
    assert!(clash.is_file());
    assert_eq!(h.book_count(), 1);
    assert!(h.store.app.hashed_book_ids().unwrap().is_empty());

    let jobs = h.store.app.list_jobs(h.user_id, 10).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hash_link_failure_still_returns_book() {
    let h = Harness::new();
    h.store
        .app
        .execute_batch(
            "CREATE TRIGGER reject_hash_link BEFORE INSERT ON book_hash_link
             BEGIN SELECT RAISE(ABORT, 'hash index unavailable'); END;",
        )
        .unwrap();

    let book = h
        .pipeline
        .ingest_single(h.user_id, upload("linked.epub", epub("Linked", None, None)))
        .await
        .unwrap();

    assert_eq!(h.book_count(), 1);
    assert!(h.store.app.user_owns_book(h.user_id, book.id).unwrap());
    assert!(h.store.app.hashed_book_ids().unwrap().is_empty());

    let jobs = h.store.app.list_jobs(h.user_id, 10).unwrap();
    assert_eq!(jobs[0].status, JobStatus::Done);

    // Repair fills in the missing index row once the store accepts writes.
    h.store
        .app
        .execute_batch("DROP TRIGGER reject_hash_link;")
        .unwrap();
    let report = repair::repair(&h.store, &h.layout, false).unwrap();
    assert_eq!(report.hash_links, 1);
    assert_eq!(report.user_links, 0);
}

// ========== COVERS AND IMPORT ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cover_is_stored_beside_book() {
    let h = Harness::new();
    let png = png();

    let book = h
        .pipeline
        .ingest_single(
            h.user_id,
            upload("covered.epub", epub("Covered", None, Some(&png))),
        )
        .await
        .unwrap();

    assert!(book.has_cover);
    let dir = Path::new(&book.path).parent().unwrap();
    let cover_path = cover::find_cover(dir).unwrap();
    assert_eq!(cover_path.file_name().unwrap(), "cover.png");
    assert_eq!(std::fs::read(cover_path).unwrap(), png);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archive_import_maps_directories_to_tags() {
    let h = Harness::new();
    let mut events = h.pipeline.subscribe();

    let book = epub("Dune", Some("Frank Herbert"), None);
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    let mut header = tar::Header::new_gnu();
    header.set_size(book.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "scifi/classics/dune.epub", book.as_slice())
        .unwrap();
    let archive = builder.into_inner().unwrap().finish().unwrap();

    let records = h
        .pipeline
        .import_archive(h.user_id, archive, true)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    let outcome = next_events(&mut events, 1).await;
    let IngestEvent::Ingested { book_id, .. } = outcome[0] else {
        panic!("expected ingestion, got {:?}", outcome[0]);
    };

    let tags: HashSet<String> = h
        .store
        .catalog
        .book_tags(book_id)
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(
        tags,
        HashSet::from(["scifi".to_string(), "classics".to_string()])
    );
}

// ========== SAGA RECOVERY ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repair_restores_dedup_after_lost_links() {
    let h = Harness::new();
    let bytes = epub("Orphan", Some("Ann Author"), None);

    // A catalogued book whose application links were never written.
    let dir = h
        .layout
        .claim_book_dir(h.user_id, "orphan.epub")
        .await
        .unwrap();
    let file = dir.join("orphan.epub");
    std::fs::write(&file, &bytes).unwrap();
    let book = h
        .store
        .catalog
        .create_book(
            &crate::db::NewBook {
                title: "Orphan".to_string(),
                sort_title: "Orphan".to_string(),
                publish_date: None,
                author_sort: "Author, Ann".to_string(),
                isbn: None,
                path: file.to_string_lossy().into_owned(),
                uuid: uuid::Uuid::new_v4().to_string(),
                has_cover: false,
            },
            "Ann Author",
            "Author, Ann",
            None,
            &[],
        )
        .unwrap();
    assert!(!h.store.app.user_owns_book(h.user_id, book.id).unwrap());

    let report = repair::repair(&h.store, &h.layout, false).unwrap();
    assert_eq!(report.hash_links, 1);
    assert_eq!(report.user_links, 1);
    assert!(h.store.app.user_owns_book(h.user_id, book.id).unwrap());

    let again = h
        .pipeline
        .ingest_single(h.user_id, upload("orphan.epub", bytes))
        .await;
    assert!(matches!(
        again,
        Err(AppError::DuplicateBook { existing_id }) if existing_id == book.id
    ));
}
