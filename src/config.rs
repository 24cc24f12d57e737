use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::media::MediaKind;
use crate::normalize::Normalizer;
use crate::sources::{CatalogLocation, ListingFolder, ListingRoot};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MEDIA_ROOT: &str = "media";
pub const DEFAULT_VIDEOS_FOLDER: &str = "videos/sd";
pub const DEFAULT_IMAGES_FOLDER: &str = "images/full";
pub const DEFAULT_CATALOG: &str = "data/media.json";
pub const DEFAULT_STORE_PATH: &str = "data/gallery.db";
pub const DEFAULT_PAGE_SIZE: usize = 12;
pub const DEFAULT_GALLERY_HOST: &str = "127.0.0.1";
pub const DEFAULT_GALLERY_PORT: u16 = 8080;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// URL prefix that local locators carry in front of the folder names.
pub const MEDIA_URL_PREFIX: &str = "media";

#[derive(Debug, Clone)]
pub struct GalleryConfig {
    pub media_root: PathBuf,
    pub videos_folder: String,
    pub images_folder: String,
    pub catalog: CatalogLocation,
    pub legacy_catalog: Option<PathBuf>,
    pub listing_base: Option<Url>,
    pub store_path: PathBuf,
    pub page_size: usize,
    pub host: String,
    pub port: u16,
    pub fetch_timeout: Duration,
}

impl GalleryConfig {
    /// URL-style base path of a local folder, e.g. `media/videos/sd`.
    pub fn base_path(&self, kind: MediaKind) -> String {
        let folder = match kind {
            MediaKind::Video => &self.videos_folder,
            MediaKind::Image => &self.images_folder,
            MediaKind::CloudLink => return String::new(),
        };
        format!("{MEDIA_URL_PREFIX}/{}", folder.trim_matches('/'))
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(
            self.base_path(MediaKind::Video),
            self.base_path(MediaKind::Image),
        )
    }

    pub fn listing_root(&self) -> ListingRoot {
        match &self.listing_base {
            Some(base) => ListingRoot::Remote(base.clone()),
            None => ListingRoot::Local(self.media_root.clone()),
        }
    }

    pub fn listing_folders(&self) -> Vec<ListingFolder> {
        [
            (MediaKind::Video, &self.videos_folder),
            (MediaKind::Image, &self.images_folder),
        ]
        .into_iter()
        .map(|(kind, folder)| ListingFolder {
            kind,
            base_path: self.base_path(kind),
            local_dir: PathBuf::from(folder.trim_matches('/')),
        })
        .collect()
    }
}

pub fn load_config() -> Result<GalleryConfig> {
    resolve_config(ConfigOverrides::default())
}

/// Values given on the command line; each one beats env and `.env`.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub media_root: Option<PathBuf>,
    pub catalog: Option<String>,
    pub store_path: Option<PathBuf>,
    pub page_size: Option<usize>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<GalleryConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<GalleryConfig> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<GalleryConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let media_root = overrides
        .media_root
        .or_else(|| lookup("MEDIA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));
    let videos_folder = lookup("VIDEOS_FOLDER").unwrap_or_else(|| DEFAULT_VIDEOS_FOLDER.into());
    let images_folder = lookup("IMAGES_FOLDER").unwrap_or_else(|| DEFAULT_IMAGES_FOLDER.into());
    let catalog = non_blank(overrides.catalog)
        .or_else(|| lookup("GALLERY_CATALOG"))
        .unwrap_or_else(|| DEFAULT_CATALOG.into());
    let legacy_catalog = lookup("GALLERY_LEGACY_CATALOG").map(PathBuf::from);
    let listing_base = lookup("GALLERY_LISTING_BASE")
        .map(|raw| parse_listing_base(&raw))
        .transpose()?;
    let store_path = overrides
        .store_path
        .or_else(|| lookup("GALLERY_STORE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
    // A zero page would never advance the feed.
    let page_size = overrides
        .page_size
        .filter(|size| *size > 0)
        .or_else(|| {
            lookup("GALLERY_PAGE_SIZE")
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|size| *size > 0)
        })
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let host = non_blank(overrides.host)
        .or_else(|| lookup("GALLERY_HOST"))
        .unwrap_or_else(|| DEFAULT_GALLERY_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("GALLERY_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_GALLERY_PORT);
    let fetch_timeout = lookup("GALLERY_FETCH_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

    Ok(GalleryConfig {
        media_root,
        videos_folder,
        images_folder,
        catalog: CatalogLocation::parse(&catalog),
        legacy_catalog,
        listing_base,
        store_path,
        page_size,
        host,
        port,
        fetch_timeout: Duration::from_secs(fetch_timeout),
    })
}

/// Directory index URLs are joined onto the base, so it must end in `/`.
fn parse_listing_base(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("GALLERY_LISTING_BASE {raw:?}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("GALLERY_LISTING_BASE must be an http(s) URL, got {raw}"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses `KEY=value` lines. Comments, blank lines, an `export ` prefix and
/// one level of single or double quotes are handled; anything else is skipped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value_raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
