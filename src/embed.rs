//! Provider URL rewriting for cloud-link cards.
//!
//! Rules are tried in order and the first match wins. A URL no rule accepts
//! and that does not point straight at a media file has no embeddable form;
//! the card falls back to an "open externally" link.

use serde::Serialize;
use url::Url;

use crate::media::{IMAGE_EXTENSIONS, MediaKind, VIDEO_EXTENSIONS, extension_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    YouTube,
    Vimeo,
    Dropbox,
    GoogleDrive,
    OneDrive,
}

type Rule = fn(&Url) -> Option<String>;

const RULES: [(Provider, Rule); 5] = [
    (Provider::YouTube, youtube),
    (Provider::Vimeo, vimeo),
    (Provider::Dropbox, dropbox),
    (Provider::GoogleDrive, google_drive),
    (Provider::OneDrive, onedrive),
];

/// How a cloud link should be presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Embed {
    /// Provider player or preview page for an inline frame.
    Frame { src: String, provider: Provider },
    /// URL of a media file usable directly in a media element.
    Direct { src: String, kind: MediaKind },
    /// No embeddable form.
    External { href: String },
}

/// Rewrites `raw` into an embeddable URL, or `None` when it has none.
pub fn to_embeddable(raw: &str) -> Option<String> {
    match classify(raw) {
        Embed::Frame { src, .. } | Embed::Direct { src, .. } => Some(src),
        Embed::External { .. } => None,
    }
}

pub fn classify(raw: &str) -> Embed {
    let raw = raw.trim();
    let external = || Embed::External {
        href: raw.to_string(),
    };
    let Ok(url) = Url::parse(raw) else {
        return external();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return external();
    }

    for (provider, rule) in RULES {
        if let Some(src) = rule(&url) {
            return Embed::Frame { src, provider };
        }
    }

    match extension_of(url.path()) {
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => Embed::Direct {
            src: raw.to_string(),
            kind: MediaKind::Video,
        },
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => Embed::Direct {
            src: raw.to_string(),
            kind: MediaKind::Image,
        },
        _ => external(),
    }
}

fn host(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches("www.")
        .trim_start_matches("m.")
        .to_ascii_lowercase()
}

fn valid_youtube_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn youtube(url: &Url) -> Option<String> {
    let host = host(url);
    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
    let id = match host.as_str() {
        "youtu.be" => segments.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            match segments.next()? {
                "watch" => url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned()),
                "shorts" | "embed" | "live" => segments.next().map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    }?;
    valid_youtube_id(&id).then(|| format!("https://www.youtube.com/embed/{id}"))
}

fn vimeo(url: &Url) -> Option<String> {
    if !matches!(host(url).as_str(), "vimeo.com" | "player.vimeo.com") {
        return None;
    }
    let id = url
        .path_segments()?
        .find(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()))?;
    Some(format!("https://player.vimeo.com/video/{id}"))
}

fn dropbox(url: &Url) -> Option<String> {
    let host = host(url);
    if host != "dropbox.com" && !host.ends_with(".dropbox.com") {
        return None;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "dl" && key != "raw")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut rewritten = url.clone();
    rewritten
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("raw", "1");
    Some(rewritten.to_string())
}

fn google_drive(url: &Url) -> Option<String> {
    if host(url) != "drive.google.com" {
        return None;
    }
    let segments: Vec<&str> = url.path_segments()?.collect();
    let id = segments
        .windows(2)
        .find(|pair| pair[0] == "d" && !pair[1].is_empty())
        .map(|pair| pair[1])?;
    Some(format!("https://drive.google.com/file/d/{id}/preview"))
}

fn onedrive(url: &Url) -> Option<String> {
    if !matches!(host(url).as_str(), "onedrive.live.com" | "1drv.ms") {
        return None;
    }
    if url.query_pairs().any(|(key, _)| key == "embed") {
        return Some(url.to_string());
    }
    let mut rewritten = url.clone();
    rewritten.query_pairs_mut().append_pair("embed", "1");
    Some(rewritten.to_string())
}
