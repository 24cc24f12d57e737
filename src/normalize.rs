//! Converts the loosely shaped records found in catalogs, overrides and
//! directory listings into [`MediaItem`]s.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CatalogError, NormalizeError};
use crate::media::{MediaId, MediaItem, MediaKind, file_stem, join_locator};

/// Catalog section a record was found in. Decides the expected media kind for
/// local files and the base path their locator is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Videos,
    Images,
    CloudLinks,
}

impl Section {
    pub fn media_kind(self) -> MediaKind {
        match self {
            Self::Videos => MediaKind::Video,
            Self::Images => MediaKind::Image,
            Self::CloudLinks => MediaKind::CloudLink,
        }
    }
}

/// Ids in hand-written catalogs show up as strings or numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

/// Object form of a catalog entry. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntry {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "description")]
    pub desc: Option<String>,
    #[serde(default, rename = "isCloudLink")]
    pub is_cloud_link: Option<bool>,
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}

/// Legacy catalogs list bare file names next to object entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawRecord {
    File(String),
    Entry(RawEntry),
}

impl RawRecord {
    pub fn file(name: impl Into<String>) -> Self {
        Self::File(name.into())
    }
}

/// Raw records of one source, grouped by section, before normalization.
#[derive(Debug, Clone, Default)]
pub struct CatalogBatch {
    pub videos: Vec<RawRecord>,
    pub images: Vec<RawRecord>,
    pub cloud_links: Vec<RawRecord>,
}

impl CatalogBatch {
    pub fn is_empty(&self) -> bool {
        self.videos.is_empty() && self.images.is_empty() && self.cloud_links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.videos.len() + self.images.len() + self.cloud_links.len()
    }

    /// Shape-checks a catalog document. The top level must be an object and
    /// every section that is present must be an array; records that fail to
    /// decode are dropped individually.
    pub fn from_document(document: &Value) -> Result<Self, CatalogError> {
        let object = document.as_object().ok_or(CatalogError::NotAnObject)?;
        if !["videos", "images", "cloud_links"]
            .iter()
            .any(|key| object.contains_key(*key))
        {
            return Err(CatalogError::NoSections);
        }

        Ok(Self {
            videos: section_records(object.get("videos"), "videos")?,
            images: section_records(object.get("images"), "images")?,
            cloud_links: section_records(object.get("cloud_links"), "cloud_links")?,
        })
    }

    /// Parses and shape-checks catalog text.
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let document: Value =
            serde_json::from_str(text).map_err(|err| CatalogError::Json(err.to_string()))?;
        Self::from_document(&document)
    }
}

fn section_records(value: Option<&Value>, name: &'static str) -> Result<Vec<RawRecord>, CatalogError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(values)) => Ok(parse_records(values, name)),
        Some(_) => Err(CatalogError::SectionNotArray(name)),
    }
}

pub(crate) fn parse_records(values: &[Value], name: &str) -> Vec<RawRecord> {
    values
        .iter()
        .filter_map(|value| match RawRecord::deserialize(value) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(section = name, %err, "dropping undecodable record");
                None
            }
        })
        .collect()
}

/// Builds [`MediaItem`]s from raw records using kind-specific base paths.
#[derive(Debug, Clone)]
pub struct Normalizer {
    videos_base: String,
    images_base: String,
}

impl Normalizer {
    pub fn new(videos_base: impl Into<String>, images_base: impl Into<String>) -> Self {
        Self {
            videos_base: videos_base.into(),
            images_base: images_base.into(),
        }
    }

    pub fn base_path(&self, kind: MediaKind) -> &str {
        match kind {
            MediaKind::Video => &self.videos_base,
            MediaKind::Image => &self.images_base,
            MediaKind::CloudLink => "",
        }
    }

    /// Normalizes a single record found in `section`.
    ///
    /// Cloud links are recognised only by an explicit `url` or `isCloudLink`
    /// marker. Local files must match the section's extension allow-list.
    pub fn normalize(&self, raw: &RawRecord, section: Section) -> Result<MediaItem, NormalizeError> {
        let entry = match raw {
            RawRecord::File(name) => RawEntry {
                file: Some(name.clone()),
                ..RawEntry::default()
            },
            RawRecord::Entry(entry) => entry.clone(),
        };

        let explicit_cloud = entry.is_cloud_link.unwrap_or(false) || non_blank(&entry.url).is_some();
        if explicit_cloud || section == Section::CloudLinks {
            return self.normalize_cloud_link(entry, section);
        }

        let kind = section.media_kind();
        let file = non_blank(&entry.file)
            .or_else(|| non_blank(&entry.path).map(|path| path.rsplit('/').next().unwrap_or(path)))
            .ok_or(NormalizeError::MissingLocator)?
            .to_string();
        if !kind.accepts_file(&file) {
            return Err(NormalizeError::UnsupportedExtension { file, kind });
        }

        let locator = match non_blank(&entry.path) {
            Some(path) => path.to_string(),
            None => join_locator(self.base_path(kind), &file),
        };
        let title = non_blank(&entry.title)
            .map(str::to_string)
            .unwrap_or_else(|| file_stem(&file));
        let id = non_blank(&entry.id)
            .map(MediaId::new)
            .unwrap_or_else(|| MediaId::synthesize(kind, &locator));

        Ok(MediaItem {
            id,
            kind,
            locator,
            title,
            description: entry.desc.unwrap_or_default().trim().to_string(),
            media_hint: None,
        })
    }

    fn normalize_cloud_link(&self, entry: RawEntry, section: Section) -> Result<MediaItem, NormalizeError> {
        let url = non_blank(&entry.url)
            .or_else(|| non_blank(&entry.file))
            .ok_or(NormalizeError::MissingLocator)?
            .to_string();
        let title = non_blank(&entry.title)
            .map(str::to_string)
            .unwrap_or_else(|| url.clone());
        let id = non_blank(&entry.id)
            .map(MediaId::new)
            .unwrap_or_else(|| MediaId::synthesize(MediaKind::CloudLink, &url));
        let media_hint = entry
            .media_type
            .as_deref()
            .and_then(MediaKind::parse_hint)
            .or(match section {
                Section::Videos => Some(MediaKind::Video),
                Section::Images => Some(MediaKind::Image),
                Section::CloudLinks => None,
            });

        Ok(MediaItem {
            id,
            kind: MediaKind::CloudLink,
            locator: url,
            title,
            description: entry.desc.unwrap_or_default().trim().to_string(),
            media_hint,
        })
    }

    /// Normalizes every section of a batch in catalog order (videos, images,
    /// cloud links), skipping records that do not qualify.
    pub fn normalize_batch(&self, batch: &CatalogBatch) -> Vec<MediaItem> {
        let sections = [
            (Section::Videos, &batch.videos),
            (Section::Images, &batch.images),
            (Section::CloudLinks, &batch.cloud_links),
        ];
        let mut items = Vec::with_capacity(batch.len());
        for (section, records) in sections {
            for raw in records {
                match self.normalize(raw, section) {
                    Ok(item) => items.push(item),
                    Err(err) => debug!(?section, %err, "skipping record"),
                }
            }
        }
        items
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
