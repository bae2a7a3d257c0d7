use msgstore_correlator::artifact::{MSG_STORE, SourceDecoder};
use msgstore_correlator::download::{
    FetchError, LinkError, LinkExtractor, MediaFetcher, MediaKind, MediaLink, encrypt_media,
};
use msgstore_correlator::model::{Account, Chat, Contact, ContactsDirectory, Item, Message};
use msgstore_correlator::{CaseProcessor, CorrelatorConfig, DecodeError, Decoders, MemorySink};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub const MEDIA_KEY: [u8; 32] = [42u8; 32];

/// Decoder over the fixture schema written by [`StoreFixture`].
///
/// Counts `decode_chats` calls so tests can assert decode-once behavior.
#[derive(Default)]
pub struct FixtureDecoder {
    pub chat_decodes: AtomicUsize,
}

#[allow(dead_code)]
impl FixtureDecoder {
    pub fn decodes(&self) -> usize {
        self.chat_decodes.load(Ordering::SeqCst)
    }
}

impl SourceDecoder for FixtureDecoder {
    fn decode_chats(
        &self,
        conn: &Connection,
        _contacts: &ContactsDirectory,
        _account: &Account,
    ) -> Result<Vec<Chat>, DecodeError> {
        self.chat_decodes.fetch_add(1, Ordering::SeqCst);
        let mut stmt = conn.prepare(
            "SELECT rowid, remote, ts, from_me, body, media_hash, media_name, media_size
             FROM messages ORDER BY remote, ts, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            let mut m = Message::new(row.get(0)?, row.get(2)?, row.get::<_, i64>(3)? != 0);
            m.body = row.get(4)?;
            m.media.hash = row.get(5)?;
            m.media.name = row.get(6)?;
            m.media.size = row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u64;
            Ok((row.get::<_, String>(1)?, m))
        })?;

        let mut chats: Vec<Chat> = Vec::new();
        for row in rows {
            let (remote, message) = row?;
            if chats.last().is_none_or(|c| c.remote.id != remote) {
                chats.push(Chat::new(chats.len() as i64 + 1, Contact::new(remote)));
            }
            if let Some(chat) = chats.last_mut() {
                chat.messages.push(message);
            }
        }
        Ok(chats)
    }

    fn decode_contacts(&self, _conn: &Connection) -> Result<ContactsDirectory, DecodeError> {
        Ok(ContactsDirectory::new())
    }

    fn decode_account(&self, bytes: &[u8]) -> Result<Account, DecodeError> {
        let id = String::from_utf8_lossy(bytes).trim().to_string();
        if id.is_empty() {
            return Err(DecodeError::Corrupted("account".into()));
        }
        Ok(Account::new(id))
    }
}

/// One row of the fixture `messages` table.
#[derive(Debug, Clone)]
pub struct Row {
    pub remote: String,
    pub ts: i64,
    pub from_me: bool,
    pub body: Option<String>,
    pub media_hash: Option<String>,
    pub media_name: Option<String>,
    pub media_size: u64,
}

#[allow(dead_code)]
impl Row {
    pub fn text(remote: &str, ts: i64, from_me: bool, body: &str) -> Self {
        Self {
            remote: remote.into(),
            ts,
            from_me,
            body: Some(body.into()),
            media_hash: None,
            media_name: None,
            media_size: 0,
        }
    }

    pub fn media(remote: &str, ts: i64, hash: &str, name: &str, size: u64) -> Self {
        Self {
            remote: remote.into(),
            ts,
            from_me: false,
            body: None,
            media_hash: Some(hash.into()),
            media_name: Some(name.into()),
            media_size: size,
        }
    }
}

/// Writes message-store fixtures into a temp dir and builds matching items.
pub struct StoreFixture {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl StoreFixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// A message store at `/case/data/com.whatsapp/databases/<name>`.
    pub fn store(&self, id: u64, name: &str, rows: &[Row]) -> Item {
        let local = self.dir.path().join(format!("{id}-{name}"));
        let conn = Connection::open(&local).expect("open fixture db");
        conn.execute_batch(
            "CREATE TABLE messages (remote TEXT NOT NULL, ts INTEGER NOT NULL,
                from_me INTEGER NOT NULL, body TEXT, media_hash TEXT, media_name TEXT,
                media_size INTEGER)",
        )
        .expect("create fixture table");
        for r in rows {
            conn.execute(
                "INSERT INTO messages VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    r.remote,
                    r.ts,
                    r.from_me as i64,
                    r.body,
                    r.media_hash,
                    r.media_name,
                    r.media_size as i64
                ],
            )
            .expect("insert fixture row");
        }
        let mut item = Item::new(id, name, format!("/case/data/com.whatsapp/databases/{name}"));
        item.content_type = Some(MSG_STORE.to_string());
        item.local_path = Some(local);
        item
    }
}

#[allow(dead_code)]
pub fn with_content_type(item: &Item, content_type: &str) -> Item {
    let mut it = item.clone();
    it.content_type = Some(content_type.to_string());
    it
}

/// Processor wired to a fresh [`FixtureDecoder`] and [`MemorySink`].
#[allow(dead_code)]
pub fn fixture_processor(
    config: CorrelatorConfig,
) -> (CaseProcessor, Arc<FixtureDecoder>, Arc<MemorySink>) {
    let decoder = Arc::new(FixtureDecoder::default());
    let sink = Arc::new(MemorySink::new());
    let d: Arc<dyn SourceDecoder> = decoder.clone();
    let processor = CaseProcessor::new(config, Decoders::new(d.clone(), d), sink.clone());
    (processor, decoder, sink)
}

/// Serves a link for every requested hash.
#[allow(dead_code)]
pub struct EchoLinks;

impl LinkExtractor for EchoLinks {
    fn extract_links(&self, _db: &Item, hashes: &BTreeSet<String>) -> Result<Vec<MediaLink>, LinkError> {
        if hashes.is_empty() {
            return Err(LinkError::NoLinks);
        }
        Ok(hashes
            .iter()
            .map(|h| MediaLink {
                hash: h.clone(),
                url: format!("https://media.example/{h}"),
                media_key: MEDIA_KEY.to_vec(),
                kind: MediaKind::Image,
            })
            .collect())
    }
}

/// Returns the encrypted form of `media-<hash>` for every URL.
#[derive(Default)]
pub struct CountingFetcher {
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MediaFetcher for CountingFetcher {
    fn fetch(&self, url: &str, out: &mut File) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hash = url.rsplit('/').next().unwrap_or_default();
        let payload = encrypt_media(format!("media-{hash}").as_bytes(), &MEDIA_KEY, MediaKind::Image)
            .map_err(|e| FetchError::Io(std::io::Error::other(e.to_string())))?;
        out.write_all(&payload)?;
        Ok(payload.len() as u64)
    }
}
