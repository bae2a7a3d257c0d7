//! Per-artifact processing stage.
//!
//! The surrounding pipeline calls [`CaseProcessor::process`] once per
//! discovered artifact and content-type stage, in any order and possibly from
//! several threads. Message stores go through two stages when merging or
//! downloading is on: the first decodes and registers the database and
//! defers; the terminal stage ([`MSG_STORE_READY`]) merges every registered
//! copy and reports.

use std::sync::Arc;

use crate::artifact::{ArtifactKind, Decoders, MSG_STORE_READY, SourceVariant};
use crate::avatar::resolve_avatar;
use crate::config::CorrelatorConfig;
use crate::contacts::{ContactsCache, lookup_account};
use crate::download::{DownloadCoordinator, DownloadError, LinkExtractor, MediaFetcher};
use crate::error::{DecodeError, ProcessError};
use crate::merge;
use crate::model::{Account, Chat, ContactsDirectory, Item};
use crate::registry::{Classification, DatabaseContext, DatabaseRegistry};
use crate::report::{
    self, ChatRenderer, ChatReport, JsonChatRenderer, ReportSink, ReportStats, ReportUnit,
};
use crate::resolver::{MediaResolver, ResolveMode, ResolveOutcome};
use crate::search::{self, SearchIndex};

/// What processing an artifact produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Account(Account),
    Contacts {
        count: usize,
    },
    Reported {
        chats: usize,
        messages: usize,
        recovered: usize,
    },
    /// Registered; finish when the artifact comes back with this content type.
    Deferred {
        next_content_type: &'static str,
    },
    /// Merged into `main`; only a notice was reported.
    BackupOf {
        main: Item,
    },
    /// Nothing to do for this artifact at this stage.
    Skipped,
}

struct Downloads {
    coordinator: DownloadCoordinator,
    links: Arc<dyn LinkExtractor>,
}

/// State and collaborators for one case run.
pub struct CaseProcessor {
    config: CorrelatorConfig,
    decoders: Decoders,
    index: Option<Arc<dyn SearchIndex>>,
    sink: Arc<dyn ReportSink>,
    renderer: Arc<dyn ChatRenderer>,
    registry: DatabaseRegistry,
    contacts: ContactsCache,
    downloads: Option<Downloads>,
}

impl CaseProcessor {
    pub fn new(config: CorrelatorConfig, decoders: Decoders, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            config,
            decoders,
            index: None,
            sink,
            renderer: Arc::new(JsonChatRenderer::default()),
            registry: DatabaseRegistry::new(),
            contacts: ContactsCache::new(),
            downloads: None,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ChatRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Enable media downloads. Only used when `download_enabled` is set.
    pub fn with_downloads(
        mut self,
        links: Arc<dyn LinkExtractor>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Result<Self, DownloadError> {
        let coordinator = DownloadCoordinator::new(
            self.config.download_pool_size,
            fetcher,
            Arc::clone(&self.sink),
        )?;
        self.downloads = Some(Downloads { coordinator, links });
        Ok(self)
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &DatabaseRegistry {
        &self.registry
    }

    pub fn contacts_cache(&self) -> &ContactsCache {
        &self.contacts
    }

    fn index(&self) -> Option<&dyn SearchIndex> {
        self.index.as_deref()
    }

    fn downloads(&self) -> Option<&Downloads> {
        self.downloads
            .as_ref()
            .filter(|_| self.config.download_enabled)
    }

    /// Process one artifact.
    pub fn process(&self, item: &Item) -> Result<ProcessOutcome, ProcessError> {
        let content_type = item.content_type.as_deref().unwrap_or_default();
        let Some(kind) = ArtifactKind::from_content_type(content_type) else {
            return Err(ProcessError::new(
                item.path.clone(),
                DecodeError::Unsupported(content_type.to_string()),
            ));
        };
        let span = tracing::info_span!("artifact", path = %item.path, kind = ?kind);
        let _guard = span.enter();

        let variant = kind.variant();
        let result = match kind {
            ArtifactKind::AccountXml | ArtifactKind::AccountPlist => {
                self.process_account(item, variant)
            }
            ArtifactKind::ContactsDb | ArtifactKind::ContactsV2 => {
                self.with_table_fallback(item, self.process_contacts(item, variant))
            }
            ArtifactKind::MessageStore if self.config.defers_to_merge_stage() => {
                self.register_and_defer(item)
            }
            ArtifactKind::MessageStore | ArtifactKind::ChatStorage => {
                self.with_table_fallback(item, self.report_directly(item, variant))
            }
            ArtifactKind::MessageStoreReady => self.merge_and_report(item),
        };
        result.map_err(|e| ProcessError::new(item.path.clone(), e))
    }

    /// On failure, report the raw table listing before passing the error on.
    fn with_table_fallback<T>(
        &self,
        item: &Item,
        result: Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        if result.is_err()
            && let Some(path) = item.local_path.as_deref()
        {
            match report::sqlite_table_listing(item, path) {
                Ok(unit) => self.sink.emit(unit),
                Err(e) => tracing::debug!("table listing unavailable: {e}"),
            }
        }
        result
    }

    fn read_item(&self, item: &Item) -> Result<Vec<u8>, DecodeError> {
        if let Some(index) = self.index() {
            return Ok(search::read_all(index, item)?);
        }
        let path = item
            .local_path
            .as_deref()
            .ok_or_else(|| DecodeError::NoLocalCopy(item.path.clone()))?;
        Ok(std::fs::read(path)?)
    }

    fn process_account(
        &self,
        item: &Item,
        variant: SourceVariant,
    ) -> Result<ProcessOutcome, DecodeError> {
        let bytes = self.read_item(item)?;
        let account = variant
            .decoder(&self.decoders)
            .decode_account(&bytes)
            .map_err(|e| {
                tracing::debug!("account decode failed: {e}");
                DecodeError::Corrupted("account file".to_string())
            })?;
        self.sink.emit(report::account_unit(&account));
        Ok(ProcessOutcome::Account(account))
    }

    fn process_contacts(
        &self,
        item: &Item,
        variant: SourceVariant,
    ) -> Result<ProcessOutcome, DecodeError> {
        let decoded = variant.decode_contacts(&self.decoders, item)?;
        let directory = self.contacts.directory_for_folder_of(&item.path);
        let contacts = decoded.contacts();
        directory.put_all(contacts.iter().cloned());

        let account = lookup_account(self.index(), &item.path, variant, &self.decoders);
        for mut contact in contacts.iter().cloned() {
            if let Some(index) = self.index() {
                resolve_avatar(index, &mut contact);
            }
            if let Some(avatar) = &contact.avatar {
                directory.set_avatar(&contact.id, avatar.clone());
            }
            self.sink.emit(report::contact_unit(&contact, &account));
        }
        tracing::info!(count = contacts.len(), "reported contacts");
        Ok(ProcessOutcome::Contacts {
            count: contacts.len(),
        })
    }

    fn directory_and_account(
        &self,
        item: &Item,
        variant: SourceVariant,
    ) -> Result<(Arc<ContactsDirectory>, Account), DecodeError> {
        let directory =
            self.contacts
                .directory_for(&item.path, self.index(), variant, &self.decoders)?;
        let account = lookup_account(self.index(), &item.path, variant, &self.decoders);
        Ok((directory, account))
    }

    fn report_directly(
        &self,
        item: &Item,
        variant: SourceVariant,
    ) -> Result<ProcessOutcome, DecodeError> {
        let (directory, account) = self.directory_and_account(item, variant)?;
        let mut chats = variant.decode_chats(&self.decoders, item, &directory, &account)?;
        let stats = self.report_chats(&mut chats, &directory, &account)?;
        Ok(reported(&chats, stats, 0))
    }

    /// Resolve media and avatars, then emit chat and message units.
    fn report_chats(
        &self,
        chats: &mut [Chat],
        directory: &ContactsDirectory,
        account: &Account,
    ) -> Result<ReportStats, DecodeError> {
        let mut report = ChatReport::new(
            self.sink.as_ref(),
            self.renderer.as_ref(),
            directory,
            account,
            self.config.extract_messages,
        );
        let mut stats = ReportStats::default();
        for chat in chats.iter_mut() {
            if let Some(index) = self.index() {
                resolve_avatar(index, &mut chat.remote);
                MediaResolver::from_config(index, &self.config)
                    .resolve(&mut chat.messages, ResolveMode::Report);
            }
            report.emit_chat(chat, &mut stats)?;
        }
        Ok(stats)
    }

    /// Decode a registered message store unless it already is.
    fn decode_context(&self, ctx: &DatabaseContext) -> Result<bool, DecodeError> {
        ctx.ensure_decoded(|item| {
            let variant = SourceVariant::Android;
            let (directory, account) = self.directory_and_account(item, variant)?;
            variant.decode_chats(&self.decoders, item, &directory, &account)
        })
    }

    fn register_and_defer(&self, item: &Item) -> Result<ProcessOutcome, DecodeError> {
        let (ctx, _) = self.registry.register(item);
        if let Err(e) = self.decode_context(&ctx) {
            self.registry.discard(ctx.id());
            return Err(e);
        }

        if let Some(downloads) = self.downloads()
            && let Some(index) = self.index()
        {
            let resolver = MediaResolver::from_config(index, &self.config);
            let outcome = ctx
                .with_chats_mut(|chats| {
                    let mut outcome = ResolveOutcome::default();
                    for chat in chats.iter_mut() {
                        outcome.absorb(resolver.resolve(&mut chat.messages, ResolveMode::DatabaseScan));
                    }
                    outcome
                })
                .unwrap_or_default();
            downloads.coordinator.download_missing(
                item,
                &outcome.missing_hashes,
                downloads.links.as_ref(),
            );
        }

        Ok(ProcessOutcome::Deferred {
            next_content_type: MSG_STORE_READY,
        })
    }

    fn merge_and_report(&self, item: &Item) -> Result<ProcessOutcome, DecodeError> {
        // Needed when a run is resumed and earlier registrations are gone.
        self.registry.backfill_from_index(self.index());
        let result = self.merge_and_report_registered(item);
        self.registry.release_if_only_backups_left();
        result
    }

    fn merge_and_report_registered(&self, item: &Item) -> Result<ProcessOutcome, DecodeError> {
        let Some(ctx) = self.registry.get(item.id) else {
            tracing::debug!("message store is not registered (already reported)");
            return Ok(ProcessOutcome::Skipped);
        };
        if let Err(e) = self.decode_context(&ctx) {
            self.registry.discard(ctx.id());
            return Err(e);
        }
        for other in self.registry.contexts_newest_first() {
            if other.id() == ctx.id() {
                continue;
            }
            if let Err(e) = self.decode_context(&other) {
                self.registry.discard(other.id());
                tracing::warn!(
                    "Could not parse DB {} ({} bytes): {}",
                    other.item().path,
                    other.item().length.unwrap_or_default(),
                    e
                );
            }
        }

        let (directory, account) = self.directory_and_account(item, SourceVariant::Android)?;

        if !self.config.merge_backups {
            return self.report_context(&ctx, &directory, &account, 0);
        }

        if let Some(main) = ctx.backup_of() {
            self.sink.emit(ReportUnit::backup_notice(item, &main));
            return Ok(ProcessOutcome::BackupOf { main });
        }

        let mut recovered = 0;
        for other in self.registry.contexts_newest_first() {
            if other.id() == ctx.id()
                || other.classification() == Classification::Unknown
                || ctx.classification() == Classification::Unknown
            {
                continue;
            }
            let (main, backup) = match (ctx.is_main(), other.is_main()) {
                (true, false) => (&ctx, &other),
                (false, true) => (&other, &ctx),
                _ => continue,
            };
            let Some(backup_chats) = backup.chats_snapshot() else {
                continue;
            };

            let _gate = main.merge_gate();
            let is_backup = main
                .with_chats(|chats| merge::is_backup(&backup_chats, chats))
                .unwrap_or(false);
            if !is_backup {
                continue;
            }

            if Arc::ptr_eq(main, &ctx) {
                let n = main
                    .with_chats_mut(|chats| merge::merge(chats, &backup_chats))
                    .unwrap_or(0);
                tracing::info!("Recovered {} messages from {}", n, backup.item().path);
                recovered += n;
                if backup.mark_backup_of(main.item()) {
                    self.registry.record_backup_merged();
                }
            } else {
                if ctx.mark_backup_of(main.item()) {
                    self.registry.record_backup_merged();
                }
                self.sink
                    .emit(ReportUnit::backup_notice(item, main.item()));
                return Ok(ProcessOutcome::BackupOf {
                    main: main.item().clone(),
                });
            }
        }

        // A main on another thread may have merged us since the first check.
        if let Some(main) = ctx.backup_of() {
            self.sink.emit(ReportUnit::backup_notice(item, &main));
            return Ok(ProcessOutcome::BackupOf { main });
        }
        if !ctx.is_main() {
            tracing::info!("Creating separate report for {}", item.path);
        }
        self.report_context(&ctx, &directory, &account, recovered)
    }

    /// Report a registered database and drop it from the registry.
    fn report_context(
        &self,
        ctx: &DatabaseContext,
        directory: &ContactsDirectory,
        account: &Account,
        recovered: usize,
    ) -> Result<ProcessOutcome, DecodeError> {
        let mut chats = ctx.chats_snapshot().unwrap_or_default();
        let stats = self.report_chats(&mut chats, directory, account)?;
        self.registry.remove(ctx.id());
        Ok(reported(&chats, stats, recovered))
    }
}

fn reported(chats: &[Chat], stats: ReportStats, recovered: usize) -> ProcessOutcome {
    ProcessOutcome::Reported {
        chats: stats.chats,
        messages: chats.iter().map(|c| c.messages.len()).sum(),
        recovered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ACCOUNT, ACCOUNT_XML, CHAT, MSG_STORE};
    use crate::model::{Contact, Message};
    use crate::report::MemorySink;
    use rusqlite::Connection;

    /// Decoder that ignores the database and returns canned chats per file.
    struct Canned;

    impl crate::artifact::SourceDecoder for Canned {
        fn decode_chats(
            &self,
            conn: &Connection,
            _contacts: &ContactsDirectory,
            _account: &Account,
        ) -> Result<Vec<Chat>, DecodeError> {
            let n: i64 = conn.query_row("SELECT n FROM fixture", [], |r| r.get(0))?;
            let msgs = (0..n)
                .map(|i| Message::text(i, 1_000 * (i + 1), true, format!("m{i}")))
                .collect();
            Ok(vec![Chat::new(1, Contact::new("77")).with_messages(msgs)])
        }

        fn decode_contacts(&self, _conn: &Connection) -> Result<ContactsDirectory, DecodeError> {
            Ok(ContactsDirectory::new())
        }

        fn decode_account(&self, bytes: &[u8]) -> Result<Account, DecodeError> {
            let id = std::str::from_utf8(bytes).map_err(anyhow::Error::from)?;
            if id.is_empty() {
                return Err(DecodeError::Corrupted("empty".into()));
            }
            Ok(Account::new(id.trim()))
        }
    }

    fn fixture(dir: &tempfile::TempDir, id: u64, name: &str, n: i64, ct: &str) -> Item {
        let path = dir.path().join(format!("{id}-{name}"));
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(&format!("CREATE TABLE fixture(n INTEGER); INSERT INTO fixture VALUES ({n});"))
            .unwrap();
        let mut item = Item::new(id, name, format!("/data/com.whatsapp/databases/{name}"));
        item.content_type = Some(ct.to_string());
        item.local_path = Some(path);
        item
    }

    fn processor(config: CorrelatorConfig, sink: Arc<MemorySink>) -> CaseProcessor {
        let d: Arc<dyn crate::artifact::SourceDecoder> = Arc::new(Canned);
        CaseProcessor::new(config, Decoders::new(d.clone(), d), sink)
    }

    #[test]
    fn direct_report_without_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let p = processor(CorrelatorConfig::default(), sink.clone());
        let out = p.process(&fixture(&dir, 1, "msgstore.db", 2, MSG_STORE)).unwrap();
        assert_eq!(
            out,
            ProcessOutcome::Reported {
                chats: 1,
                messages: 2,
                recovered: 0
            }
        );
        assert_eq!(sink.units_of_type(CHAT).len(), 1);
        assert!(p.registry().is_empty());
    }

    #[test]
    fn merge_mode_defers_then_reports() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let config = CorrelatorConfig {
            merge_backups: true,
            ..Default::default()
        };
        let p = processor(config, sink.clone());
        let mut item = fixture(&dir, 1, "msgstore.db", 2, MSG_STORE);
        assert_eq!(
            p.process(&item).unwrap(),
            ProcessOutcome::Deferred {
                next_content_type: MSG_STORE_READY
            }
        );
        assert!(sink.is_empty());
        item.content_type = Some(MSG_STORE_READY.to_string());
        assert!(matches!(
            p.process(&item).unwrap(),
            ProcessOutcome::Reported { messages: 2, .. }
        ));
        assert_eq!(p.process(&item).unwrap(), ProcessOutcome::Skipped);
    }

    #[test]
    fn unsupported_and_corrupt_inputs_are_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let p = processor(CorrelatorConfig::default(), sink.clone());

        let mut img = Item::new(9, "a.jpg", "/a.jpg");
        img.content_type = Some("image/jpeg".into());
        let err = p.process(&img).unwrap_err();
        assert!(matches!(err.source, DecodeError::Unsupported(_)));

        let empty = dir.path().join("prefs.xml");
        std::fs::write(&empty, b"").unwrap();
        let mut acc = Item::new(3, "com.whatsapp_preferences.xml", "/p/com.whatsapp_preferences.xml");
        acc.content_type = Some(ACCOUNT_XML.into());
        acc.local_path = Some(empty);
        let err = p.process(&acc).unwrap_err();
        assert_eq!(err.source.to_string(), "corrupted account file");
        assert!(sink.units_of_type(ACCOUNT).is_empty());
    }
}
