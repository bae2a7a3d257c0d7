mod util;

use std::sync::Arc;

use msgstore_correlator::artifact::{ATTACHMENT, CHAT};
use msgstore_correlator::model::Item;
use msgstore_correlator::report::attr;
use msgstore_correlator::{CorrelatorConfig, MemoryIndex};
use util::{Row, StoreFixture, fixture_processor};

fn media_item(id: u64, name: &str, sha: Option<&str>, len: u64) -> Item {
    let mut it = Item::new(id, name, format!("/case/sdcard/WhatsApp/Media/{name}"));
    it.sha256 = sha.map(str::to_string);
    it.length = Some(len);
    it
}

#[test]
fn attachments_are_linked_by_hash_and_by_name_and_size() {
    let index = Arc::new(MemoryIndex::new());
    index.add(media_item(10, "IMG-20230101-WA0001.jpg", Some("aaa"), 500));
    index.add(media_item(11, "PTT-20230101-WA0002.opus", None, 900));

    let fx = StoreFixture::new();
    let mut voice = Row::media("1", 30, "", "PTT-20230101-WA0002.opus", 900);
    voice.media_hash = None;
    let store = fx.store(
        1,
        "msgstore.db",
        &[
            Row::media("1", 10, "aaa", "IMG-20230101-WA0001.jpg", 500),
            Row::media("1", 20, "aaa", "IMG-20230101-WA0001 (1).jpg", 500),
            voice,
            Row::media("1", 40, "never-seen", "VID-1.mp4", 7000),
        ],
    );

    let (processor, _, sink) = fixture_processor(CorrelatorConfig::default());
    let processor = processor.with_index(index.clone());
    processor.process(&store).unwrap();

    let hash_queries: Vec<_> = index
        .queries()
        .into_iter()
        .filter(|q| q.starts_with("sha-256:"))
        .collect();
    assert_eq!(hash_queries, vec!["sha-256:(aaa never-seen)".to_string()]);

    let attachments = sink.units_of_type(ATTACHMENT);
    let linked: Vec<_> = attachments
        .iter()
        .map(|u| u.get(attr::LINKED_ITEMS).unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        linked,
        vec![
            "sha-256:aaa",
            "sha-256:aaa",
            "name:\"PTT\\-20230101\\-WA0002.opus\" AND length:900",
        ]
    );

    let chat = &sink.units_of_type(CHAT)[0];
    assert_eq!(chat.values(attr::LINKED_ITEMS).len(), 3);
    assert!(chat.values(attr::SHARED_HASHES).is_empty());
}

#[test]
fn zero_padded_copy_is_linked_only_with_fallback_enabled() {
    let padded = {
        let mut bytes = vec![0x55u8; 1000];
        bytes.extend_from_slice(&[0u8; 12]);
        bytes
    };
    let build_index = || {
        let index = Arc::new(MemoryIndex::new());
        let mut it = media_item(20, "DOC-1.pdf", Some("other"), padded.len() as u64);
        it.hash = Some("DEADBEEF".into());
        index.add_with_content(it, padded.clone());
        index
    };

    let fx = StoreFixture::new();
    let store = fx.store(1, "msgstore.db", &[Row::media("1", 10, "declared", "DOC-1.pdf", 1000)]);

    let (processor, _, sink) = fixture_processor(CorrelatorConfig::default());
    processor.with_index(build_index()).process(&store).unwrap();
    let att = sink.units_of_type(ATTACHMENT);
    assert_eq!(att.len(), 1);
    assert_eq!(att[0].get(attr::LINKED_ITEMS), Some("hash:DEADBEEF"));

    let config = CorrelatorConfig {
        link_media_by_name_and_approx_size_fallback: false,
        ..Default::default()
    };
    let (processor, _, sink) = fixture_processor(config);
    processor.with_index(build_index()).process(&store).unwrap();
    assert!(sink.units_of_type(ATTACHMENT).is_empty());
}
