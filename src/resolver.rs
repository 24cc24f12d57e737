//! Ordered fallback over the registered sources.
//!
//! Probes run one at a time in priority order. The first one whose payload
//! normalizes to at least one item wins; nothing is merged across sources
//! except the per-kind override applied on top of the primary catalog.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::media::{MediaId, MediaItem};
use crate::normalize::{CatalogBatch, Normalizer};
use crate::sources::{OverrideStoreProbe, ProbeOutcome, SourceKind, SourceProbe};

/// What happened to one probe during a resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum Attempt {
    Accepted { source: SourceKind, items: usize },
    Empty { source: SourceKind },
    Failed { source: SourceKind, reason: String },
}

/// Terminal result of [`Resolver::resolve`].
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved {
        source: SourceKind,
        items: Vec<MediaItem>,
        attempts: Vec<Attempt>,
    },
    /// Every source failed or was empty.
    NoMedia { attempts: Vec<Attempt> },
}

impl Resolution {
    pub fn items(&self) -> &[MediaItem] {
        match self {
            Self::Resolved { items, .. } => items,
            Self::NoMedia { .. } => &[],
        }
    }

    pub fn source(&self) -> Option<SourceKind> {
        match self {
            Self::Resolved { source, .. } => Some(*source),
            Self::NoMedia { .. } => None,
        }
    }

    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::Resolved { attempts, .. } | Self::NoMedia { attempts } => attempts,
        }
    }

    pub fn into_items(self) -> Vec<MediaItem> {
        match self {
            Self::Resolved { items, .. } => items,
            Self::NoMedia { .. } => Vec::new(),
        }
    }
}

/// Loop decision for one probe outcome, kept apart from the probes' I/O.
#[derive(Debug)]
pub enum Step {
    Accept(Vec<MediaItem>),
    FallThrough(Attempt),
}

/// Decides whether a normalized payload ends the chain.
pub fn decide(source: SourceKind, outcome: Result<Vec<MediaItem>, SourceError>) -> Step {
    match outcome {
        Ok(items) if items.is_empty() => Step::FallThrough(Attempt::Empty { source }),
        Ok(items) => Step::Accept(items),
        Err(err) => Step::FallThrough(Attempt::Failed {
            source,
            reason: err.to_string(),
        }),
    }
}

pub struct Resolver {
    probes: Vec<Box<dyn SourceProbe>>,
    overrides: Option<OverrideStoreProbe>,
    normalizer: Normalizer,
}

impl Resolver {
    pub fn new(normalizer: Normalizer) -> Self {
        Self {
            probes: Vec::new(),
            overrides: None,
            normalizer,
        }
    }

    /// Registers a probe. Probes are kept in fixed priority order regardless
    /// of registration order; registering the same kind twice replaces it.
    pub fn with_probe(mut self, probe: Box<dyn SourceProbe>) -> Self {
        let kind = probe.kind();
        self.probes.retain(|existing| existing.kind() != kind);
        self.probes.push(probe);
        self.probes.sort_by_key(|probe| probe.kind());
        self
    }

    /// Registers the override store both as the second source and as the
    /// replacement step applied to the primary catalog.
    pub fn with_override_store(self, overrides: OverrideStoreProbe) -> Self {
        let mut resolver = self.with_probe(Box::new(overrides.clone()));
        resolver.overrides = Some(overrides);
        resolver
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn source_order(&self) -> Vec<SourceKind> {
        self.probes.iter().map(|probe| probe.kind()).collect()
    }

    pub async fn resolve(&self) -> Resolution {
        let mut attempts = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            let source = probe.kind();
            debug!(%source, "probing source");
            let outcome = match probe.probe().await {
                ProbeOutcome::Items(batch) => Ok(self.finish_batch(source, batch).await),
                ProbeOutcome::Empty => Ok(Vec::new()),
                ProbeOutcome::Failed(err) => Err(err),
            };

            match decide(source, outcome) {
                Step::Accept(items) => {
                    info!(%source, items = items.len(), "resolved media feed");
                    attempts.push(Attempt::Accepted {
                        source,
                        items: items.len(),
                    });
                    return Resolution::Resolved {
                        source,
                        items,
                        attempts,
                    };
                }
                Step::FallThrough(attempt) => {
                    if let Attempt::Failed { reason, .. } = &attempt {
                        warn!(%source, %reason, "source failed, falling through");
                    } else {
                        debug!(%source, "source empty, falling through");
                    }
                    attempts.push(attempt);
                }
            }
        }

        warn!("no source produced media");
        Resolution::NoMedia { attempts }
    }

    async fn finish_batch(&self, source: SourceKind, mut batch: CatalogBatch) -> Vec<MediaItem> {
        if source == SourceKind::PrimaryCatalog
            && let Some(overrides) = &self.overrides
        {
            match overrides.read_overrides().await {
                Ok(found) => {
                    if found.videos.is_some() || found.images.is_some() {
                        debug!(
                            videos = found.videos.is_some(),
                            images = found.images.is_some(),
                            "applying catalog overrides"
                        );
                    }
                    found.apply(&mut batch);
                }
                Err(err) => warn!(%err, "ignoring unreadable overrides"),
            }
        }
        dedupe_ids(self.normalizer.normalize_batch(&batch))
    }
}

/// Keeps ids unique inside one resolution. A repeated id gets the first free
/// `-<n>` suffix (n >= 2); ids present anywhere in the list are never handed out,
/// so explicit ids keep their reaction records.
fn dedupe_ids(mut items: Vec<MediaItem>) -> Vec<MediaItem> {
    let reserved: HashSet<MediaId> = items.iter().map(|item| item.id.clone()).collect();
    let mut assigned: HashSet<MediaId> = HashSet::with_capacity(items.len());
    for item in &mut items {
        if assigned.insert(item.id.clone()) {
            continue;
        }
        let mut n = 2usize;
        let unique = loop {
            let candidate = MediaId::new(format!("{}-{n}", item.id));
            if !reserved.contains(&candidate) && !assigned.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        assigned.insert(unique.clone());
        item.id = unique;
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::normalize::RawRecord;
    use crate::sources::tests::FakeFetcher;
    use crate::sources::{CatalogLocation, LegacyCatalogProbe, PrimaryCatalogProbe};
    use crate::store::{KeyValueStore, MemoryStore, OVERRIDE_IMAGES_KEY, OVERRIDE_VIDEOS_KEY};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    const CATALOG_URL: &str = "https://gallery.test/data/media.json";

    /// Probe with a canned outcome that records when it was consulted.
    struct ScriptedProbe {
        kind: SourceKind,
        outcome: ProbeOutcome,
        calls: Arc<Mutex<Vec<SourceKind>>>,
    }

    #[async_trait]
    impl SourceProbe for ScriptedProbe {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn probe(&self) -> ProbeOutcome {
            self.calls.lock().push(self.kind);
            self.outcome.clone()
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new("media/videos/sd", "media/images/full")
    }

    fn batch(value: serde_json::Value) -> CatalogBatch {
        CatalogBatch::from_document(&value).unwrap()
    }

    fn scripted(
        kind: SourceKind,
        outcome: ProbeOutcome,
        calls: &Arc<Mutex<Vec<SourceKind>>>,
    ) -> Box<dyn SourceProbe> {
        Box::new(ScriptedProbe {
            kind,
            outcome,
            calls: calls.clone(),
        })
    }

    fn failed(kind: SourceKind) -> ProbeOutcome {
        ProbeOutcome::Failed(SourceError::unavailable(kind, "offline"))
    }

    #[test]
    fn decide_policy() {
        assert!(matches!(
            decide(SourceKind::LegacyCatalog, Ok(Vec::new())),
            Step::FallThrough(Attempt::Empty { .. })
        ));
        assert!(matches!(
            decide(
                SourceKind::PrimaryCatalog,
                Err(SourceError::schema(SourceKind::PrimaryCatalog, "bad"))
            ),
            Step::FallThrough(Attempt::Failed { .. })
        ));
        let item = normalizer()
            .normalize(&RawRecord::file("a.mp4"), crate::normalize::Section::Videos)
            .unwrap();
        assert!(matches!(
            decide(SourceKind::DirectoryListing, Ok(vec![item])),
            Step::Accept(_)
        ));
    }

    /// For every position N, failing exactly one earlier source still yields
    /// the same items as normalizing source N directly.
    #[tokio::test]
    async fn single_failure_falls_through_to_next_source() {
        let content = batch(json!({"videos": ["a.mp4", "b.mp4"], "images": ["c.png"]}));
        let expected = normalizer().normalize_batch(&content);

        for (index, winner) in SourceKind::PRIORITY.iter().enumerate().skip(1) {
            for failing in &SourceKind::PRIORITY[..index] {
                let calls = Arc::new(Mutex::new(Vec::new()));
                let mut resolver = Resolver::new(normalizer());
                for kind in &SourceKind::PRIORITY[..=index] {
                    let outcome = if kind == failing {
                        failed(*kind)
                    } else if kind == winner {
                        ProbeOutcome::Items(content.clone())
                    } else {
                        ProbeOutcome::Empty
                    };
                    resolver = resolver.with_probe(scripted(*kind, outcome, &calls));
                }

                let resolution = resolver.resolve().await;
                assert_eq!(resolution.source(), Some(*winner));
                assert_eq!(resolution.items(), expected.as_slice());
                assert_eq!(calls.lock().len(), index + 1);
            }
        }
    }

    #[tokio::test]
    async fn first_valid_source_wins_and_later_sources_are_not_consulted() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = Resolver::new(normalizer())
            .with_probe(scripted(
                SourceKind::DirectoryListing,
                ProbeOutcome::Items(batch(json!({"videos": ["z.mp4"]}))),
                &calls,
            ))
            .with_probe(scripted(
                SourceKind::PrimaryCatalog,
                ProbeOutcome::Items(batch(json!({"videos": ["a.mp4"]}))),
                &calls,
            ));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.source(), Some(SourceKind::PrimaryCatalog));
        assert_eq!(resolution.items()[0].title, "a");
        assert_eq!(*calls.lock(), vec![SourceKind::PrimaryCatalog]);
    }

    #[tokio::test]
    async fn payload_with_only_rejected_records_falls_through() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = Resolver::new(normalizer())
            .with_probe(scripted(
                SourceKind::PrimaryCatalog,
                ProbeOutcome::Items(batch(json!({"videos": ["notes.txt"]}))),
                &calls,
            ))
            .with_probe(scripted(
                SourceKind::LegacyCatalog,
                ProbeOutcome::Items(batch(json!({"images": ["c.png"]}))),
                &calls,
            ));
        let resolution = resolver.resolve().await;
        assert_eq!(resolution.source(), Some(SourceKind::LegacyCatalog));
        assert_eq!(
            resolution.attempts()[0],
            Attempt::Empty {
                source: SourceKind::PrimaryCatalog
            }
        );
    }

    #[tokio::test]
    async fn all_sources_failing_yields_no_media() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut resolver = Resolver::new(normalizer());
        for kind in SourceKind::PRIORITY {
            resolver = resolver.with_probe(scripted(kind, failed(kind), &calls));
        }
        let resolution = resolver.resolve().await;
        assert!(matches!(resolution, Resolution::NoMedia { .. }));
        assert_eq!(resolution.attempts().len(), 4);
        assert!(resolution.items().is_empty());

        let bare = Resolver::new(normalizer()).resolve().await;
        assert!(matches!(bare, Resolution::NoMedia { .. }));
    }

    #[tokio::test]
    async fn video_override_replaces_only_videos() {
        let fetcher = FakeFetcher::default().with_page(
            CATALOG_URL,
            r#"{"videos": ["a.mp4", "b.mp4"], "images": ["c.png"], "cloud_links": []}"#,
        );
        let store = Arc::new(MemoryStore::new());
        store
            .set(OVERRIDE_VIDEOS_KEY, r#"[{"file": "override.webm", "title": "Fresh"}]"#)
            .await
            .unwrap();

        let resolver = Resolver::new(normalizer())
            .with_probe(Box::new(PrimaryCatalogProbe::new(
                CatalogLocation::parse(CATALOG_URL),
                Arc::new(fetcher),
            )))
            .with_override_store(OverrideStoreProbe::new(store.clone()));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.source(), Some(SourceKind::PrimaryCatalog));
        let videos: Vec<_> = resolution
            .items()
            .iter()
            .filter(|item| item.kind == MediaKind::Video)
            .map(|item| item.title.as_str())
            .collect();
        let images: Vec<_> = resolution
            .items()
            .iter()
            .filter(|item| item.kind == MediaKind::Image)
            .map(|item| item.locator.as_str())
            .collect();
        assert_eq!(videos, vec!["Fresh"]);
        assert_eq!(images, vec!["media/images/full/c.png"]);
    }

    #[tokio::test]
    async fn empty_image_override_removes_primary_images() {
        let fetcher = FakeFetcher::default().with_page(
            CATALOG_URL,
            r#"{"videos": ["a.mp4"], "images": ["c.png"]}"#,
        );
        let store = Arc::new(MemoryStore::with_entries([(OVERRIDE_IMAGES_KEY, "[]")]));
        let resolver = Resolver::new(normalizer())
            .with_override_store(OverrideStoreProbe::new(store))
            .with_probe(Box::new(PrimaryCatalogProbe::new(
                CatalogLocation::parse(CATALOG_URL),
                Arc::new(fetcher),
            )));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.items().len(), 1);
        assert_eq!(resolution.items()[0].kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn unreadable_override_keeps_primary_items() {
        let fetcher = FakeFetcher::default().with_page(CATALOG_URL, r#"{"videos": ["a.mp4"]}"#);
        let store = Arc::new(MemoryStore::with_entries([(OVERRIDE_VIDEOS_KEY, "not json")]));
        let resolver = Resolver::new(normalizer())
            .with_probe(Box::new(PrimaryCatalogProbe::new(
                CatalogLocation::parse(CATALOG_URL),
                Arc::new(fetcher),
            )))
            .with_override_store(OverrideStoreProbe::new(store));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.items()[0].title, "a");
    }

    /// Primary catalog unreachable, no overrides, legacy catalog holds one
    /// video: the feed shows that video and no empty state.
    #[tokio::test]
    async fn falls_back_to_legacy_catalog_end_to_end() {
        let legacy = batch(json!({"videos": ["a.mp4"], "images": []}));
        let resolver = Resolver::new(normalizer())
            .with_probe(Box::new(PrimaryCatalogProbe::new(
                CatalogLocation::parse(CATALOG_URL),
                Arc::new(FakeFetcher::default()),
            )))
            .with_override_store(OverrideStoreProbe::new(Arc::new(MemoryStore::new())))
            .with_probe(Box::new(LegacyCatalogProbe::new(Some(legacy))));

        let resolution = resolver.resolve().await;
        assert_eq!(resolution.source(), Some(SourceKind::LegacyCatalog));
        let items = resolution.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, MediaKind::Video);
        assert_eq!(items[0].title, "a");
        assert!(matches!(
            resolution.attempts()[0],
            Attempt::Failed {
                source: SourceKind::PrimaryCatalog,
                ..
            }
        ));
        assert_eq!(
            resolution.attempts()[1],
            Attempt::Empty {
                source: SourceKind::OverrideStore
            }
        );
    }

    #[tokio::test]
    async fn ids_are_stable_across_resolves_and_unique_within_one() {
        let legacy = batch(json!({"videos": ["a.mp4", "a.mp4"]}));
        let resolver =
            Resolver::new(normalizer()).with_probe(Box::new(LegacyCatalogProbe::new(Some(legacy))));

        let first = resolver.resolve().await.into_items();
        let second = resolver.resolve().await.into_items();
        assert_eq!(first, second);
        assert_ne!(first[0].id, first[1].id);
        assert_eq!(first[1].id.as_str(), format!("{}-2", first[0].id));
    }

    #[test]
    fn suffixed_ids_never_collide_with_existing_ones() {
        let legacy = batch(json!({"videos": [
            {"id": "x", "file": "a.mp4"},
            {"id": "x", "file": "b.mp4"},
            {"id": "x-2", "file": "c.mp4"},
        ]}));
        let ids: Vec<String> = dedupe_ids(normalizer().normalize_batch(&legacy))
            .into_iter()
            .map(|item| item.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["x", "x-3", "x-2"]);
    }
}
