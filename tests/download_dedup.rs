mod util;

use std::sync::Arc;

use msgstore_correlator::report::attr;
use msgstore_correlator::{CorrelatorConfig, MemoryIndex, ProcessOutcome};
use util::{CountingFetcher, EchoLinks, Row, StoreFixture, TestTracing, fixture_processor};

fn download_config() -> CorrelatorConfig {
    CorrelatorConfig {
        download_enabled: true,
        download_pool_size: 3,
        ..Default::default()
    }
}

#[test]
fn shared_hash_is_downloaded_once_per_run() {
    let tracing = TestTracing::new();
    let _guard = tracing.install();

    let fx = StoreFixture::new();
    let first = fx.store(
        1,
        "msgstore.db",
        &[Row::media("1", 10, "h-shared", "IMG-1.jpg", 100)],
    );
    let second = fx.store(
        2,
        "msgstore-2023-01-01.1.db",
        &[
            Row::media("1", 10, "h-shared", "IMG-1.jpg", 100),
            Row::media("2", 20, "h-only-here", "IMG-2.jpg", 200),
        ],
    );

    let fetcher = Arc::new(CountingFetcher::default());
    let (processor, _, sink) = fixture_processor(download_config());
    let processor = processor
        .with_index(Arc::new(MemoryIndex::new()))
        .with_downloads(Arc::new(EchoLinks), fetcher.clone())
        .unwrap();

    for item in [&first, &second] {
        assert!(matches!(
            processor.process(item).unwrap(),
            ProcessOutcome::Deferred { .. }
        ));
    }

    assert_eq!(fetcher.calls(), 2);
    let downloaded: Vec<_> = sink
        .units()
        .into_iter()
        .filter(|u| u.get(attr::DOWNLOADED_DATA) == Some("true"))
        .collect();
    assert_eq!(downloaded.len(), 2);
    let mut contents: Vec<_> = downloaded
        .iter()
        .map(|u| String::from_utf8_lossy(&u.content).to_string())
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["media-h-only-here", "media-h-shared"]);
    assert!(downloaded.iter().all(|u| u.title == "Downloaded_item_1"));
    tracing.assert_contains("Downloaded 1 files from msgstore.db");
}

#[test]
fn media_present_in_case_is_not_downloaded() {
    let fx = StoreFixture::new();
    let store = fx.store(
        1,
        "msgstore.db",
        &[Row::media("1", 10, "present", "IMG-1.jpg", 100)],
    );
    let index = Arc::new(MemoryIndex::new());
    let mut on_disk = msgstore_correlator::model::Item::new(50, "IMG-1.jpg", "/case/sdcard/IMG-1.jpg");
    on_disk.sha256 = Some("present".into());
    index.add(on_disk);

    let fetcher = Arc::new(CountingFetcher::default());
    let (processor, _, sink) = fixture_processor(download_config());
    let processor = processor
        .with_index(index)
        .with_downloads(Arc::new(EchoLinks), fetcher.clone())
        .unwrap();

    processor.process(&store).unwrap();
    assert_eq!(fetcher.calls(), 0);
    assert!(sink.is_empty());
}

#[test]
fn downloads_stay_off_unless_enabled() {
    let fx = StoreFixture::new();
    let store = fx.store(1, "msgstore.db", &[Row::media("1", 10, "h", "a.jpg", 1)]);
    let fetcher = Arc::new(CountingFetcher::default());
    let (processor, _, _) = fixture_processor(CorrelatorConfig::default());
    let processor = processor
        .with_index(Arc::new(MemoryIndex::new()))
        .with_downloads(Arc::new(EchoLinks), fetcher.clone())
        .unwrap();

    assert!(matches!(
        processor.process(&store).unwrap(),
        ProcessOutcome::Reported { .. }
    ));
    assert_eq!(fetcher.calls(), 0);
}
