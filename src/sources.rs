//! The four producers of raw media records, each wrapped as a probe that
//! reports a tagged outcome instead of throwing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde_json::Value;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

use crate::error::{CatalogError, FetchError, SourceError};
use crate::media::MediaKind;
use crate::normalize::{CatalogBatch, RawRecord, parse_records};
use crate::store::{KeyValueStore, OVERRIDE_IMAGES_KEY, OVERRIDE_VIDEOS_KEY};

/// Sources in resolver priority order. The derived ordering is the priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    PrimaryCatalog,
    OverrideStore,
    LegacyCatalog,
    DirectoryListing,
}

impl SourceKind {
    pub const PRIORITY: [SourceKind; 4] = [
        SourceKind::PrimaryCatalog,
        SourceKind::OverrideStore,
        SourceKind::LegacyCatalog,
        SourceKind::DirectoryListing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryCatalog => "primary-catalog",
            Self::OverrideStore => "override-store",
            Self::LegacyCatalog => "legacy-catalog",
            Self::DirectoryListing => "directory-listing",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking one source for its records.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Items(CatalogBatch),
    Empty,
    Failed(SourceError),
}

impl ProbeOutcome {
    fn from_batch(batch: CatalogBatch) -> Self {
        if batch.is_empty() {
            Self::Empty
        } else {
            Self::Items(batch)
        }
    }
}

#[async_trait]
pub trait SourceProbe: Send + Sync {
    fn kind(&self) -> SourceKind;
    async fn probe(&self) -> ProbeOutcome;
}

/// Retrieves a text document by URL.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Blocking `ureq` agent driven from tokio's blocking pool.
#[derive(Clone)]
pub struct UreqFetcher {
    agent: ureq::Agent,
}

impl UreqFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

#[async_trait]
impl Fetch for UreqFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let agent = self.agent.clone();
        let owned = url.to_owned();
        tokio::task::spawn_blocking(move || {
            let transport = |reason: String| FetchError::Transport {
                url: owned.clone(),
                reason,
            };
            match agent.get(&owned).call() {
                Ok(response) => response.into_string().map_err(|err| transport(err.to_string())),
                Err(ureq::Error::Status(status, _)) => Err(FetchError::Status {
                    url: owned.clone(),
                    status,
                }),
                Err(err) => Err(transport(err.to_string())),
            }
        })
        .await
        .map_err(|err| FetchError::Transport {
            url: url.to_owned(),
            reason: format!("fetch task failed: {err}"),
        })?
    }
}

/// Where the primary catalog document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogLocation {
    Remote(String),
    Local(PathBuf),
}

impl CatalogLocation {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Remote(trimmed.to_string())
        } else {
            Self::Local(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for CatalogLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(url) => f.write_str(url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// `{videos, images, cloud_links}` document at a fixed location.
pub struct PrimaryCatalogProbe {
    location: CatalogLocation,
    fetcher: Arc<dyn Fetch>,
}

impl PrimaryCatalogProbe {
    pub fn new(location: CatalogLocation, fetcher: Arc<dyn Fetch>) -> Self {
        Self { location, fetcher }
    }

    async fn load_text(&self) -> Result<String, CatalogError> {
        match &self.location {
            CatalogLocation::Remote(url) => {
                self.fetcher
                    .fetch_text(url)
                    .await
                    .map_err(|err| CatalogError::Read {
                        location: url.clone(),
                        reason: err.to_string(),
                    })
            }
            CatalogLocation::Local(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| CatalogError::Read {
                        location: path.display().to_string(),
                        reason: err.to_string(),
                    })
            }
        }
    }
}

#[async_trait]
impl SourceProbe for PrimaryCatalogProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::PrimaryCatalog
    }

    async fn probe(&self) -> ProbeOutcome {
        let kind = self.kind();
        let text = match self.load_text().await {
            Ok(text) => text,
            Err(err) => return ProbeOutcome::Failed(SourceError::unavailable(kind, err.to_string())),
        };
        match CatalogBatch::from_json(&text) {
            Ok(batch) => ProbeOutcome::from_batch(batch),
            Err(err @ CatalogError::Json(_)) => ProbeOutcome::Failed(SourceError::unavailable(
                kind,
                format!("{}: {err}", self.location),
            )),
            Err(err) => ProbeOutcome::Failed(SourceError::schema(kind, err.to_string())),
        }
    }
}

/// Per-kind replacement collections held in the key-value store.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub videos: Option<Vec<RawRecord>>,
    pub images: Option<Vec<RawRecord>>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.videos.is_none() && self.images.is_none()
    }

    /// Replaces whole sections of `batch`; never merges.
    pub fn apply(self, batch: &mut CatalogBatch) {
        if let Some(videos) = self.videos {
            batch.videos = videos;
        }
        if let Some(images) = self.images {
            batch.images = images;
        }
    }
}

/// Reads the override keys. Also acts as the second source of the chain.
#[derive(Clone)]
pub struct OverrideStoreProbe {
    store: Arc<dyn KeyValueStore>,
}

impl OverrideStoreProbe {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Loads both override collections. A blank or missing key is "no
    /// override"; a value that is not a JSON array is a schema mismatch.
    pub async fn read_overrides(&self) -> Result<Overrides, SourceError> {
        Ok(Overrides {
            videos: self.read_key(OVERRIDE_VIDEOS_KEY).await?,
            images: self.read_key(OVERRIDE_IMAGES_KEY).await?,
        })
    }

    async fn read_key(&self, key: &str) -> Result<Option<Vec<RawRecord>>, SourceError> {
        let kind = SourceKind::OverrideStore;
        let raw = self
            .store
            .get(key)
            .await
            .map_err(|err| SourceError::unavailable(kind, format!("reading {key}: {err}")))?;
        let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| SourceError::schema(kind, format!("{key}: {err}")))?;
        match value {
            Value::Array(values) => Ok(Some(parse_records(&values, key))),
            _ => Err(SourceError::schema(kind, format!("{key} is not an array"))),
        }
    }
}

#[async_trait]
impl SourceProbe for OverrideStoreProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::OverrideStore
    }

    async fn probe(&self) -> ProbeOutcome {
        match self.read_overrides().await {
            Ok(overrides) if overrides.is_empty() => ProbeOutcome::Empty,
            Ok(overrides) => {
                let mut batch = CatalogBatch::default();
                overrides.apply(&mut batch);
                ProbeOutcome::from_batch(batch)
            }
            Err(err) => ProbeOutcome::Failed(err),
        }
    }
}

/// Catalog compiled into (or shipped next to) the host, `{videos, images}`.
#[derive(Debug, Clone, Default)]
pub struct LegacyCatalogProbe {
    catalog: Option<CatalogBatch>,
}

impl LegacyCatalogProbe {
    pub fn new(catalog: Option<CatalogBatch>) -> Self {
        Self { catalog }
    }

    /// Reads the legacy catalog from a JSON file. A malformed file is treated
    /// as "no legacy catalog" so the chain can still fall through.
    pub fn from_file(path: &Path) -> Self {
        let catalog = std::fs::read_to_string(path)
            .map_err(|err| CatalogError::Read {
                location: path.display().to_string(),
                reason: err.to_string(),
            })
            .and_then(|raw| CatalogBatch::from_json(&raw));
        match catalog {
            Ok(catalog) => Self::new(Some(catalog)),
            Err(err) => {
                debug!(path = %path.display(), %err, "legacy catalog unavailable");
                Self::new(None)
            }
        }
    }
}

#[async_trait]
impl SourceProbe for LegacyCatalogProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::LegacyCatalog
    }

    async fn probe(&self) -> ProbeOutcome {
        match &self.catalog {
            Some(catalog) => ProbeOutcome::from_batch(CatalogBatch {
                videos: catalog.videos.clone(),
                images: catalog.images.clone(),
                cloud_links: Vec::new(),
            }),
            None => ProbeOutcome::Failed(SourceError::unavailable(
                self.kind(),
                "no legacy catalog loaded",
            )),
        }
    }
}

/// Where directory indexes come from.
#[derive(Debug, Clone)]
pub enum ListingRoot {
    /// HTML index pages under this base URL (`<base>/<base path>/`).
    Remote(Url),
    /// Local media root; folders are scanned one level deep.
    Local(PathBuf),
}

/// Folder of one media kind, as seen by the listing.
#[derive(Debug, Clone)]
pub struct ListingFolder {
    pub kind: MediaKind,
    /// URL-style base path, e.g. `media/videos/sd`.
    pub base_path: String,
    /// Folder on disk relative to the local media root, e.g. `videos/sd`.
    pub local_dir: PathBuf,
}

pub struct DirectoryListingProbe {
    root: ListingRoot,
    folders: Vec<ListingFolder>,
    fetcher: Arc<dyn Fetch>,
}

static HREF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("valid href pattern")
});

impl DirectoryListingProbe {
    pub fn new(root: ListingRoot, folders: Vec<ListingFolder>, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            root,
            folders,
            fetcher,
        }
    }

    async fn list_folder(&self, folder: &ListingFolder) -> Result<Vec<String>, SourceError> {
        let unavailable = |reason: String| SourceError::unavailable(self.kind(), reason);
        let names = match &self.root {
            ListingRoot::Remote(base) => {
                let index_url = base
                    .join(&format!("{}/", folder.base_path.trim_matches('/')))
                    .map_err(|err| unavailable(format!("building index url: {err}")))?;
                let html = self
                    .fetcher
                    .fetch_text(index_url.as_str())
                    .await
                    .map_err(|err| unavailable(err.to_string()))?;
                anchor_file_names(&html)
            }
            ListingRoot::Local(media_root) => {
                let dir = media_root.join(&folder.local_dir);
                tokio::task::spawn_blocking(move || scan_local_folder(&dir))
                    .await
                    .map_err(|err| unavailable(format!("scan task failed: {err}")))??
            }
        };
        Ok(names
            .into_iter()
            .filter(|name| folder.kind.accepts_file(name))
            .collect())
    }
}

#[async_trait]
impl SourceProbe for DirectoryListingProbe {
    fn kind(&self) -> SourceKind {
        SourceKind::DirectoryListing
    }

    async fn probe(&self) -> ProbeOutcome {
        let mut batch = CatalogBatch::default();
        let mut failures = Vec::new();
        for folder in &self.folders {
            let names = match self.list_folder(folder).await {
                Ok(names) => names,
                Err(err) => {
                    debug!(kind = %folder.kind, %err, "directory listing failed for kind");
                    failures.push(err.reason().to_string());
                    continue;
                }
            };
            let records = names.into_iter().map(RawRecord::File);
            match folder.kind {
                MediaKind::Video => batch.videos.extend(records),
                MediaKind::Image => batch.images.extend(records),
                MediaKind::CloudLink => {}
            }
        }

        if !self.folders.is_empty() && failures.len() == self.folders.len() {
            return ProbeOutcome::Failed(SourceError::unavailable(self.kind(), failures.join("; ")));
        }
        ProbeOutcome::from_batch(batch)
    }
}

/// Extracts file names from the anchors of an HTML directory index. Parent
/// links, sub-directories and query-only links are ignored.
pub fn anchor_file_names(html: &str) -> Vec<String> {
    let mut names = Vec::new();
    for capture in HREF_PATTERN.captures_iter(html) {
        let href = capture[1].trim();
        if href.starts_with('?') || href.starts_with('#') || href.ends_with('/') {
            continue;
        }
        let path = href.split(['?', '#']).next().unwrap_or(href);
        let Some(last) = path.rsplit('/').next().filter(|last| !last.is_empty()) else {
            continue;
        };
        let name = percent_decode_str(last).decode_utf8_lossy().into_owned();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn scan_local_folder(dir: &Path) -> Result<Vec<String>, SourceError> {
    let unavailable = |reason: String| SourceError::unavailable(SourceKind::DirectoryListing, reason);
    if !dir.is_dir() {
        return Err(unavailable(format!("{} is not a directory", dir.display())));
    }
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| unavailable(format!("scanning {}: {err}", dir.display())))?;
        if entry.file_type().is_file()
            && let Some(name) = entry.file_name().to_str()
        {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Canned responses keyed by URL; unknown URLs fail like a dead network.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pages: HashMap<String, String>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub(crate) fn with_page(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }
    }

    #[async_trait]
    impl Fetch for FakeFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            self.requests.lock().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Transport {
                    url: url.to_string(),
                    reason: "connection refused".into(),
                })
        }
    }

    fn folders() -> Vec<ListingFolder> {
        vec![
            ListingFolder {
                kind: MediaKind::Video,
                base_path: "media/videos/sd".into(),
                local_dir: PathBuf::from("videos/sd"),
            },
            ListingFolder {
                kind: MediaKind::Image,
                base_path: "media/images/full".into(),
                local_dir: PathBuf::from("images/full"),
            },
        ]
    }

    #[test]
    fn priority_order_matches_derived_ordering() {
        let mut shuffled = vec![
            SourceKind::DirectoryListing,
            SourceKind::PrimaryCatalog,
            SourceKind::LegacyCatalog,
            SourceKind::OverrideStore,
        ];
        shuffled.sort();
        assert_eq!(shuffled, SourceKind::PRIORITY.to_vec());
    }

    #[tokio::test]
    async fn primary_catalog_reads_remote_document() {
        let fetcher = FakeFetcher::default().with_page(
            "https://gallery.test/data/media.json",
            r#"{"videos": ["a.mp4"], "images": [], "cloud_links": []}"#,
        );
        let probe = PrimaryCatalogProbe::new(
            CatalogLocation::parse("https://gallery.test/data/media.json"),
            Arc::new(fetcher),
        );
        let ProbeOutcome::Items(batch) = probe.probe().await else {
            panic!("expected items");
        };
        assert_eq!(batch.videos.len(), 1);
    }

    #[tokio::test]
    async fn primary_catalog_failures_are_tagged() {
        let dir = tempdir().unwrap();
        let missing = PrimaryCatalogProbe::new(
            CatalogLocation::Local(dir.path().join("missing.json")),
            Arc::new(FakeFetcher::default()),
        );
        assert!(matches!(
            missing.probe().await,
            ProbeOutcome::Failed(SourceError::Unavailable { .. })
        ));

        let wrong_shape = dir.path().join("media.json");
        std::fs::write(&wrong_shape, r#"{"videos": {"a": 1}}"#).unwrap();
        let probe = PrimaryCatalogProbe::new(
            CatalogLocation::Local(wrong_shape),
            Arc::new(FakeFetcher::default()),
        );
        assert!(matches!(
            probe.probe().await,
            ProbeOutcome::Failed(SourceError::SchemaMismatch { .. })
        ));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{"videos": [], "images": []}"#).unwrap();
        let probe =
            PrimaryCatalogProbe::new(CatalogLocation::Local(empty), Arc::new(FakeFetcher::default()));
        assert!(matches!(probe.probe().await, ProbeOutcome::Empty));
    }

    #[tokio::test]
    async fn fetch_errors_are_typed() {
        let err = FakeFetcher::default()
            .fetch_text("https://gallery.test/a")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Transport {
                url: "https://gallery.test/a".into(),
                reason: "connection refused".into(),
            }
        );
        assert_eq!(err.to_string(), "fetching https://gallery.test/a: connection refused");
        assert_eq!(
            FetchError::Status { url: "https://gallery.test/a".into(), status: 404 }.to_string(),
            "https://gallery.test/a returned HTTP 404"
        );
    }

    #[tokio::test]
    async fn override_probe_reads_present_keys_only() {
        let store = Arc::new(MemoryStore::with_entries([(OVERRIDE_IMAGES_KEY, r#"["x.png"]"#)]));
        let probe = OverrideStoreProbe::new(store.clone());
        let overrides = probe.read_overrides().await.unwrap();
        assert!(overrides.videos.is_none());
        assert_eq!(overrides.images.as_ref().map(Vec::len), Some(1));

        store.set(OVERRIDE_VIDEOS_KEY, "{\"not\": \"array\"}").await.unwrap();
        assert!(matches!(
            probe.probe().await,
            ProbeOutcome::Failed(SourceError::SchemaMismatch { .. })
        ));

        let blank = OverrideStoreProbe::new(Arc::new(MemoryStore::with_entries([(
            OVERRIDE_VIDEOS_KEY,
            "  ",
        )])));
        assert!(matches!(blank.probe().await, ProbeOutcome::Empty));
    }

    #[tokio::test]
    async fn legacy_probe_ignores_cloud_links_and_reports_absence() {
        let batch = CatalogBatch::from_document(&serde_json::json!({
            "videos": ["a.mp4"],
            "cloud_links": [{"url": "https://vimeo.com/1"}]
        }))
        .unwrap();
        let ProbeOutcome::Items(items) = LegacyCatalogProbe::new(Some(batch)).probe().await else {
            panic!("expected items");
        };
        assert_eq!(items.videos.len(), 1);
        assert!(items.cloud_links.is_empty());

        assert!(matches!(
            LegacyCatalogProbe::new(None).probe().await,
            ProbeOutcome::Failed(_)
        ));
    }

    #[test]
    fn anchors_are_decoded_and_filtered() {
        let html = r#"
            <html><body><h1>Index of /media/videos/sd</h1>
            <a href="../">Parent Directory</a>
            <a href="?C=N;O=D">Name</a>
            <a href="my%20clip.mp4">my clip.mp4</a>
            <A HREF='/media/videos/sd/b.webm'>b.webm</A>
            <a href="sub/">sub/</a>
            <a href="my%20clip.mp4">dup</a>
            </body></html>
        "#;
        assert_eq!(anchor_file_names(html), vec!["my clip.mp4", "b.webm"]);
    }

    #[tokio::test]
    async fn remote_listing_tolerates_one_failing_kind() {
        let fetcher = Arc::new(FakeFetcher::default().with_page(
            "https://gallery.test/media/videos/sd/",
            r#"<a href="a.mp4">a</a><a href="notes.txt">n</a><a href="c.png">c</a>"#,
        ));
        let probe = DirectoryListingProbe::new(
            ListingRoot::Remote(Url::parse("https://gallery.test/").unwrap()),
            folders(),
            fetcher.clone(),
        );
        let ProbeOutcome::Items(batch) = probe.probe().await else {
            panic!("expected items");
        };
        assert_eq!(batch.videos.len(), 1);
        assert!(batch.images.is_empty());
        assert_eq!(fetcher.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn local_listing_scans_folders() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("videos/sd")).unwrap();
        std::fs::create_dir_all(dir.path().join("images/full/nested")).unwrap();
        std::fs::write(dir.path().join("videos/sd/b.mp4"), b"").unwrap();
        std::fs::write(dir.path().join("videos/sd/a.mkv"), b"").unwrap();
        std::fs::write(dir.path().join("images/full/nested/deep.png"), b"").unwrap();
        std::fs::write(dir.path().join("images/full/readme.md"), b"").unwrap();

        let probe = DirectoryListingProbe::new(
            ListingRoot::Local(dir.path().to_path_buf()),
            folders(),
            Arc::new(FakeFetcher::default()),
        );
        let ProbeOutcome::Items(batch) = probe.probe().await else {
            panic!("expected items");
        };
        let names: Vec<_> = batch
            .videos
            .iter()
            .map(|record| match record {
                RawRecord::File(name) => name.as_str(),
                RawRecord::Entry(_) => "",
            })
            .collect();
        assert_eq!(names, vec!["a.mkv", "b.mp4"]);
        assert!(batch.images.is_empty());
    }

    #[tokio::test]
    async fn listing_fails_when_every_kind_fails() {
        let dir = tempdir().unwrap();
        let probe = DirectoryListingProbe::new(
            ListingRoot::Local(dir.path().join("absent")),
            folders(),
            Arc::new(FakeFetcher::default()),
        );
        assert!(matches!(probe.probe().await, ProbeOutcome::Failed(_)));
    }
}
