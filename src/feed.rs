//! Incremental, paginated presentation of a resolved feed.
//!
//! [`FeedContext`] owns everything a page load needs: the resolved items, how
//! many are on screen and which refresh generation they belong to. A refresh
//! replaces the context's contents and restarts pagination.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::embed::{Embed, classify};
use crate::error::MediaLoadFailure;
use crate::media::{MediaItem, MediaKind};
use crate::reactions::{ReactionStore, ReactionView, VoterId};
use crate::resolver::{Attempt, Resolution};
use crate::sources::SourceKind;

/// Shown when every source came back empty or failed.
pub const EMPTY_STATE_MESSAGE: &str = "No media found. Add videos or images to the media folders, \
     or check that the catalog is reachable, then refresh.";

#[derive(Debug, Clone, Default)]
pub struct FeedContext {
    items: Vec<MediaItem>,
    displayed: usize,
    generation: u64,
    source: Option<SourceKind>,
    attempts: Vec<Attempt>,
}

impl FeedContext {
    /// Context for a fresh page load.
    pub fn new(resolution: Resolution) -> Self {
        let mut context = Self::default();
        context.load(resolution);
        context
    }

    /// Replaces the feed with a new resolution. Pagination restarts at zero;
    /// nothing from the previous generation is kept.
    pub fn refresh(&mut self, resolution: Resolution) {
        self.generation += 1;
        self.load(resolution);
    }

    fn load(&mut self, resolution: Resolution) {
        self.source = resolution.source();
        self.attempts = resolution.attempts().to_vec();
        self.items = resolution.into_items();
        self.displayed = 0;
    }

    /// Reveals up to `page_size` more items and returns only the new ones.
    /// Once everything is displayed further calls return an empty slice.
    pub fn display_next(&mut self, page_size: usize) -> &[MediaItem] {
        let start = self.displayed;
        let end = start.saturating_add(page_size).min(self.items.len());
        self.displayed = end;
        debug!(start, end, total = self.items.len(), "revealing feed page");
        &self.items[start..end]
    }

    /// Read-only slice for clients that track their own offset. Out of range
    /// offsets yield an empty slice.
    pub fn window(&self, offset: usize, limit: usize) -> &[MediaItem] {
        let start = offset.min(self.items.len());
        let end = start.saturating_add(limit).min(self.items.len());
        &self.items[start..end]
    }

    /// Everything revealed so far, in display order.
    pub fn visible(&self) -> &[MediaItem] {
        &self.items[..self.displayed]
    }

    pub fn displayed(&self) -> usize {
        self.displayed
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn remaining(&self) -> usize {
        self.total() - self.displayed
    }

    pub fn is_exhausted(&self) -> bool {
        self.displayed == self.items.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source(&self) -> Option<SourceKind> {
        self.source
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    /// User-visible guidance when no source produced media.
    pub fn empty_state(&self) -> Option<&'static str> {
        self.source.is_none().then_some(EMPTY_STATE_MESSAGE)
    }
}

/// What a card displays in its media slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CardBody {
    Video { src: String },
    Image { src: String },
    Embed { embed: Embed },
    /// The media could not be loaded; only this card degrades.
    Unavailable { reason: String, href: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub item: MediaItem,
    pub body: CardBody,
    pub reactions: ReactionView,
}

/// Confirms that an item's underlying media can be loaded.
#[async_trait]
pub trait AvailabilityCheck: Send + Sync {
    async fn check(&self, item: &MediaItem) -> Result<(), MediaLoadFailure>;
}

/// Maps local locators (`media/...`) onto the media root and checks the file
/// exists. Cloud links are not checked.
pub struct LocalFileCheck {
    media_root: PathBuf,
    url_prefix: String,
}

impl LocalFileCheck {
    pub fn new(media_root: PathBuf, url_prefix: impl Into<String>) -> Self {
        Self {
            media_root,
            url_prefix: url_prefix.into(),
        }
    }

    pub fn path_for(&self, locator: &str) -> Result<PathBuf, MediaLoadFailure> {
        let relative = locator.trim_start_matches('/');
        let relative = relative
            .strip_prefix(self.url_prefix.trim_matches('/'))
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(relative);
        let candidate = Path::new(relative);
        if relative.is_empty()
            || candidate
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(MediaLoadFailure::OutsideRoot(locator.to_string()));
        }
        Ok(self.media_root.join(candidate))
    }
}

#[async_trait]
impl AvailabilityCheck for LocalFileCheck {
    async fn check(&self, item: &MediaItem) -> Result<(), MediaLoadFailure> {
        if !item.is_local() {
            return Ok(());
        }
        let path = self.path_for(&item.locator)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(MediaLoadFailure::Missing(path)),
        }
    }
}

/// Builds cards for a page, rehydrating the viewer's reactions first.
pub struct CardRenderer {
    availability: Box<dyn AvailabilityCheck>,
    reactions: ReactionStore,
}

impl CardRenderer {
    pub fn new(availability: Box<dyn AvailabilityCheck>, reactions: ReactionStore) -> Self {
        Self {
            availability,
            reactions,
        }
    }

    pub async fn render(&self, item: &MediaItem, voter: &VoterId) -> Card {
        let reactions = self.reactions.view(&item.id, voter).await;
        let body = match self.availability.check(item).await {
            Ok(()) => body_for(item),
            Err(failure) => {
                debug!(media = %item.id, %failure, "card degraded");
                CardBody::Unavailable {
                    reason: failure.to_string(),
                    href: item.locator.clone(),
                }
            }
        };
        Card {
            item: item.clone(),
            body,
            reactions,
        }
    }

    /// Renders items in order; a failing item never stops its siblings.
    pub async fn render_page(&self, items: &[MediaItem], voter: &VoterId) -> Vec<Card> {
        let mut cards = Vec::with_capacity(items.len());
        for item in items {
            cards.push(self.render(item, voter).await);
        }
        cards
    }
}

fn body_for(item: &MediaItem) -> CardBody {
    match item.kind {
        MediaKind::Video => CardBody::Video {
            src: item.locator.clone(),
        },
        MediaKind::Image => CardBody::Image {
            src: item.locator.clone(),
        },
        MediaKind::CloudLink => CardBody::Embed {
            embed: classify(&item.locator),
        },
    }
}
