//! Retrieval of media that is referenced by a database but missing from the
//! case.
//!
//! Links come from a [`LinkExtractor`], bytes from a [`MediaFetcher`]. Every
//! accepted link runs as an independent unit on a bounded pool owned by the
//! case run; a hash is fetched at most once per run no matter how many
//! databases reference it.

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CorrelatorConfig;
use crate::model::Item;
use crate::report::{ReportSink, ReportUnit};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// Truncated MAC appended to every encrypted media payload.
pub const MEDIA_MAC_LEN: usize = 10;
const EXPANDED_KEY_LEN: usize = 112;
const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no media links found")]
    NoLinks,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The media server no longer has the file. Expected for old media.
    #[error("media not found at {0}")]
    NotFound(String),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
    /// No bytes arrived within the read timeout.
    #[error("no data from {url} for {after:?}")]
    Timeout { url: String, after: Duration },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("encrypted media too short ({0} bytes)")]
    Truncated(usize),
    #[error("media key expansion failed")]
    KeyExpansion,
    #[error("media MAC mismatch")]
    MacMismatch,
    #[error("media padding is invalid")]
    Padding,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to build download pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Media class; selects the key-expansion info string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn info(&self) -> &'static [u8] {
        match self {
            Self::Image => b"WhatsApp Image Keys",
            Self::Video => b"WhatsApp Video Keys",
            Self::Audio => b"WhatsApp Audio Keys",
            Self::Document => b"WhatsApp Document Keys",
        }
    }

    /// Kind from a mime type; anything unrecognized is a document.
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLink {
    pub hash: String,
    pub url: String,
    pub media_key: Vec<u8>,
    pub kind: MediaKind,
}

/// Reads download links for the given hashes out of a message store.
pub trait LinkExtractor: Send + Sync {
    fn extract_links(&self, db: &Item, hashes: &BTreeSet<String>)
    -> Result<Vec<MediaLink>, LinkError>;
}

/// Writes the bytes behind a URL into `out`.
pub trait MediaFetcher: Send + Sync {
    fn fetch(&self, url: &str, out: &mut File) -> Result<u64, FetchError>;
}

/// HTTP fetcher with a connect timeout and a per-read inactivity timeout.
///
/// Requests run on a small tokio runtime owned by the fetcher, so callers on
/// the download pool stay synchronous. The read timeout bounds the wait for
/// response headers and for each body chunk, never the whole transfer.
pub struct HttpFetcher {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, FetchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("media-fetch")
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("msgstore-correlator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| FetchError::Http {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            runtime,
            connect_timeout,
            read_timeout,
        })
    }

    pub fn from_config(config: &CorrelatorConfig) -> Result<Self, FetchError> {
        Self::new(config.connect_timeout(), config.read_timeout())
    }

    async fn fetch_async(&self, url: &str, out: &mut File) -> Result<u64, FetchError> {
        let http = |source: reqwest::Error| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let stalled = || FetchError::Timeout {
            url: url.to_string(),
            after: self.read_timeout,
        };

        // `send` covers connecting plus waiting for the response headers.
        let headers_due = self.connect_timeout + self.read_timeout;
        let mut response = tokio::time::timeout(headers_due, self.client.get(url).send())
            .await
            .map_err(|_| stalled())?
            .map_err(http)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut written = 0u64;
        while let Some(chunk) = tokio::time::timeout(self.read_timeout, response.chunk())
            .await
            .map_err(|_| stalled())?
            .map_err(http)?
        {
            out.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        out.flush()?;
        Ok(written)
    }
}

impl MediaFetcher for HttpFetcher {
    fn fetch(&self, url: &str, out: &mut File) -> Result<u64, FetchError> {
        self.runtime.block_on(self.fetch_async(url, out))
    }
}

fn expand_media_key(media_key: &[u8], kind: MediaKind) -> Result<[u8; EXPANDED_KEY_LEN], DownloadError> {
    let hk = Hkdf::<Sha256>::new(None, media_key);
    let mut okm = [0u8; EXPANDED_KEY_LEN];
    hk.expand(kind.info(), &mut okm)
        .map_err(|_| DownloadError::KeyExpansion)?;
    Ok(okm)
}

/// Decrypt a downloaded media payload.
///
/// The media key expands to IV, cipher key and MAC key; the trailing
/// [`MEDIA_MAC_LEN`] bytes authenticate `iv || ciphertext` and are checked
/// before anything is decrypted.
pub fn decrypt_media(payload: &[u8], media_key: &[u8], kind: MediaKind) -> Result<Vec<u8>, DownloadError> {
    if payload.len() < MEDIA_MAC_LEN + IV_LEN {
        return Err(DownloadError::Truncated(payload.len()));
    }
    let (ciphertext, tag) = payload.split_at(payload.len() - MEDIA_MAC_LEN);
    let keys = expand_media_key(media_key, kind)?;
    let (iv, rest) = keys.split_at(IV_LEN);
    let (cipher_key, rest) = rest.split_at(32);
    let mac_key = &rest[..32];

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| DownloadError::KeyExpansion)?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_truncated_left(tag)
        .map_err(|_| DownloadError::MacMismatch)?;

    Aes256CbcDec::new_from_slices(cipher_key, iv)
        .map_err(|_| DownloadError::KeyExpansion)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DownloadError::Padding)
}

/// Encrypt `plain` the way the media servers store it. Inverse of
/// [`decrypt_media`].
pub fn encrypt_media(plain: &[u8], media_key: &[u8], kind: MediaKind) -> Result<Vec<u8>, DownloadError> {
    let keys = expand_media_key(media_key, kind)?;
    let (iv, rest) = keys.split_at(IV_LEN);
    let (cipher_key, rest) = rest.split_at(32);
    let mac_key = &rest[..32];

    let mut out = Aes256CbcEnc::new_from_slices(cipher_key, iv)
        .map_err(|_| DownloadError::KeyExpansion)?
        .encrypt_padded_vec_mut::<Pkcs7>(plain);
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| DownloadError::KeyExpansion)?;
    mac.update(iv);
    mac.update(&out);
    let tag = mac.finalize().into_bytes();
    out.extend_from_slice(&tag[..MEDIA_MAC_LEN]);
    Ok(out)
}

/// Runs media downloads for a whole case run.
pub struct DownloadCoordinator {
    pool: rayon::ThreadPool,
    fetcher: Arc<dyn MediaFetcher>,
    sink: Arc<dyn ReportSink>,
    /// Hashes already claimed by some unit during this run.
    seen: Mutex<HashSet<String>>,
}

impl DownloadCoordinator {
    pub fn new(
        pool_size: usize,
        fetcher: Arc<dyn MediaFetcher>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self, DownloadError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size.max(1))
            .thread_name(|i| format!("media-download-{i}"))
            .build()?;
        Ok(Self {
            pool,
            fetcher,
            sink,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Claim a hash for download; false if some unit already has it.
    pub fn claim(&self, hash: &str) -> bool {
        self.seen.lock().insert(hash.to_string())
    }

    pub fn claimed(&self) -> usize {
        self.seen.lock().len()
    }

    /// Download the media for `missing` hashes referenced by `db`.
    ///
    /// Blocks until every unit started by this call finishes and returns how
    /// many files were downloaded and reported.
    pub fn download_missing(
        &self,
        db: &Item,
        missing: &BTreeSet<String>,
        extractor: &dyn LinkExtractor,
    ) -> usize {
        if missing.is_empty() {
            return 0;
        }
        let links = match extractor.extract_links(db, missing) {
            Ok(links) => links,
            Err(LinkError::NoLinks) => {
                debug!(db = %db.path, "no media links in database");
                return 0;
            }
            Err(e) => {
                warn!(db = %db.path, "could not extract links from database: {e:#}");
                return 0;
            }
        };

        let (tx, rx) = crossbeam_channel::unbounded::<bool>();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut submitted = 0usize;
        for link in links {
            if link.hash.is_empty() || !self.claim(&link.hash) {
                continue;
            }
            let tx = tx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let sink = Arc::clone(&self.sink);
            let counter = Arc::clone(&counter);
            let db_path = db.path.clone();
            self.pool.spawn(move || {
                let ok = match run_unit(&link, fetcher.as_ref(), sink.as_ref(), &counter) {
                    Ok(()) => true,
                    Err(DownloadError::Fetch(FetchError::NotFound(_))) => false,
                    Err(e) => {
                        warn!(db = %db_path, url = %link.url, "error downloading media: {e}");
                        false
                    }
                };
                let _ = tx.send(ok);
            });
            submitted += 1;
        }
        drop(tx);

        let downloaded = rx.iter().take(submitted).filter(|ok| *ok).count();
        if downloaded > 0 {
            info!("Downloaded {} files from {}", downloaded, db.name);
        }
        downloaded
    }
}

fn run_unit(
    link: &MediaLink,
    fetcher: &dyn MediaFetcher,
    sink: &dyn ReportSink,
    counter: &AtomicUsize,
) -> Result<(), DownloadError> {
    let mut encrypted = tempfile::tempfile()?;
    fetcher.fetch(&link.url, &mut encrypted)?;
    encrypted.seek(SeekFrom::Start(0))?;
    let mut payload = Vec::new();
    encrypted.read_to_end(&mut payload)?;

    let plain = decrypt_media(&payload, &link.media_key, link.kind)?;
    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
    sink.emit(ReportUnit::downloaded(n, plain));
    Ok(())
}
