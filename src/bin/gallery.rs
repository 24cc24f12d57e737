#![forbid(unsafe_code)]

//! Host for the gallery feed: prints pages and reactions from the terminal,
//! or serves the feed, reactions and local media files over HTTP.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use gallery_feed::{
    config::{ConfigOverrides, GalleryConfig, MEDIA_URL_PREFIX, resolve_config},
    embed::Embed,
    feed::{Card, CardBody, CardRenderer, FeedContext, LocalFileCheck},
    media::MediaId,
    reactions::{ReactionKind, ReactionStore, ReactionView, VoterId},
    resolver::{Attempt, Resolver},
    sources::{
        DirectoryListingProbe, Fetch, LegacyCatalogProbe, OverrideStoreProbe,
        PrimaryCatalogProbe, SourceKind, UreqFetcher,
    },
    store::{KeyValueStore, SqliteStore},
};
use mime_guess::MimeGuess;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gallery")]
#[command(about = "Resolve, page and react to the media gallery feed")]
#[command(version)]
struct Cli {
    /// `.env` file consulted after the process environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Filesystem root of local media
    #[arg(long, global = true)]
    media_root: Option<PathBuf>,

    /// Primary catalog URL or path
    #[arg(long, global = true)]
    catalog: Option<String>,

    /// Database holding overrides and reactions
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the feed and print the first pages of cards
    Feed {
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Click a reaction on an item as the local voter
    React { media_id: String, kind: String },
    /// Print the stored reaction record of an item
    Reactions { media_id: String },
    /// Serve the feed API and local media over HTTP
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            media_root: self.media_root.clone(),
            catalog: self.catalog.clone(),
            store_path: self.store.clone(),
            env_path: self.env_file.clone(),
            ..ConfigOverrides::default()
        };
        match &self.command {
            Command::Feed { page_size, .. } => overrides.page_size = *page_size,
            Command::Serve { host, port } => {
                overrides.host = host.clone();
                overrides.port = *port;
            }
            Command::React { .. } | Command::Reactions { .. } => {}
        }
        overrides
    }
}

/// Everything one session needs, wired from configuration.
struct Gallery {
    config: GalleryConfig,
    store: Arc<dyn KeyValueStore>,
    resolver: Resolver,
    reactions: ReactionStore,
    renderer: CardRenderer,
}

impl Gallery {
    async fn open(config: GalleryConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.store_path)
            .await
            .with_context(|| format!("opening store {}", config.store_path.display()))?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    fn with_store(config: GalleryConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let fetcher: Arc<dyn Fetch> = Arc::new(UreqFetcher::new(config.fetch_timeout));
        let resolver = build_resolver(&config, store.clone(), fetcher);
        let reactions = ReactionStore::new(store.clone());
        let renderer = CardRenderer::new(Box::new(local_files(&config)), reactions.clone());
        Self {
            config,
            store,
            resolver,
            reactions,
            renderer,
        }
    }
}

fn local_files(config: &GalleryConfig) -> LocalFileCheck {
    LocalFileCheck::new(config.media_root.clone(), MEDIA_URL_PREFIX)
}

fn build_resolver(
    config: &GalleryConfig,
    store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn Fetch>,
) -> Resolver {
    let legacy = config
        .legacy_catalog
        .as_deref()
        .map(LegacyCatalogProbe::from_file)
        .unwrap_or_default();
    Resolver::new(config.normalizer())
        .with_probe(Box::new(PrimaryCatalogProbe::new(
            config.catalog.clone(),
            fetcher.clone(),
        )))
        .with_override_store(OverrideStoreProbe::new(store))
        .with_probe(Box::new(legacy))
        .with_probe(Box::new(DirectoryListingProbe::new(
            config.listing_root(),
            config.listing_folders(),
            fetcher,
        )))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gallery_feed=info,gallery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = resolve_config(cli.overrides()).context("loading configuration")?;
    let gallery = Gallery::open(config).await?;

    match cli.command {
        Command::Feed { pages, .. } => print_feed(&gallery, pages).await,
        Command::React { media_id, kind } => react(&gallery, &media_id, &kind).await,
        Command::Reactions { media_id } => {
            let record = gallery.reactions.load(&MediaId::new(media_id)).await;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Serve { .. } => serve(gallery).await,
    }
}

async fn print_feed(gallery: &Gallery, pages: usize) -> Result<()> {
    let voter = VoterId::load_or_create(gallery.store.as_ref()).await;
    let mut feed = FeedContext::new(gallery.resolver.resolve().await);
    if let Some(message) = feed.empty_state() {
        println!("{message}");
        for attempt in feed.attempts() {
            println!("  {}", describe_attempt(attempt));
        }
        return Ok(());
    }

    if let Some(source) = feed.source() {
        println!("{} items from {source}", feed.total());
    }
    for page in 0..pages {
        let items = feed.display_next(gallery.config.page_size).to_vec();
        if items.is_empty() {
            break;
        }
        println!("-- page {} --", page + 1);
        for card in gallery.renderer.render_page(&items, &voter).await {
            println!("{}", describe_card(&card));
        }
    }
    if feed.remaining() > 0 {
        println!("{} more not shown", feed.remaining());
    }
    Ok(())
}

async fn react(gallery: &Gallery, media_id: &str, kind: &str) -> Result<()> {
    let kind = ReactionKind::parse(kind)?;
    let voter = VoterId::load_or_create(gallery.store.as_ref()).await;
    let record = gallery
        .reactions
        .click(&MediaId::new(media_id), &voter, &kind)
        .await
        .context("saving reaction")?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn describe_attempt(attempt: &Attempt) -> String {
    match attempt {
        Attempt::Accepted { source, items } => format!("{source}: {items} items"),
        Attempt::Empty { source } => format!("{source}: empty"),
        Attempt::Failed { source, reason } => format!("{source}: {reason}"),
    }
}

fn describe_card(card: &Card) -> String {
    let body = match &card.body {
        CardBody::Video { src } => format!("video {src}"),
        CardBody::Image { src } => format!("image {src}"),
        CardBody::Embed { embed } => match embed {
            Embed::Frame { src, provider } => format!("frame {src} ({provider:?})"),
            Embed::Direct { src, kind } => format!("{kind} {src}"),
            Embed::External { href } => format!("open externally {href}"),
        },
        CardBody::Unavailable { reason, .. } => format!("unavailable: {reason}"),
    };
    let mut line = format!("{}  {}  [{body}]", card.item.id, card.item.title);
    if !card.reactions.counts.is_empty() {
        let counts: Vec<String> = card
            .reactions
            .counts
            .iter()
            .map(|(kind, count)| {
                let marker = if card.reactions.mine.as_ref() == Some(kind) { "*" } else { "" };
                format!("{kind}{marker}={count}")
            })
            .collect();
        line.push_str(&format!("  {}", counts.join(" ")));
    }
    line
}

#[derive(Clone)]
struct AppState {
    gallery: Arc<Gallery>,
    feed: Arc<RwLock<FeedContext>>,
    voter: Arc<VoterId>,
    media: Arc<LocalFileCheck>,
}

impl AppState {
    async fn new(gallery: Gallery) -> Self {
        let voter = VoterId::load_or_create(gallery.store.as_ref()).await;
        let feed = FeedContext::new(gallery.resolver.resolve().await);
        let media = local_files(&gallery.config);
        Self {
            gallery: Arc::new(gallery),
            feed: Arc::new(RwLock::new(feed)),
            voter: Arc::new(voter),
            media: Arc::new(media),
        }
    }

    /// Clients without their own identity share the host's voter id.
    fn voter(&self, requested: Option<String>) -> VoterId {
        requested
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(VoterId::new)
            .unwrap_or_else(|| (*self.voter).clone())
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/feed", get(get_feed))
        .route("/api/feed/refresh", post(refresh_feed))
        .route("/api/reactions/{id}", get(get_reactions).post(post_reaction))
        .route("/media/{*path}", get(stream_media))
        .fallback(fallback)
        .with_state(state)
}

async fn serve(gallery: Gallery) -> Result<()> {
    let host: IpAddr = gallery
        .config
        .host
        .parse()
        .with_context(|| format!("invalid host {}", gallery.config.host))?;
    let addr = SocketAddr::new(host, gallery.config.port);
    let state = AppState::new(gallery).await;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "gallery listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running gallery server")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
}

async fn fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
    voter: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedPage {
    generation: u64,
    source: Option<SourceKind>,
    total: usize,
    offset: usize,
    next_offset: Option<usize>,
    cards: Vec<Card>,
    #[serde(skip_serializing_if = "Option::is_none")]
    empty_state: Option<&'static str>,
    attempts: Vec<Attempt>,
}

async fn get_feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> ApiResult<Json<FeedPage>> {
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(state.gallery.config.page_size);
    let voter = state.voter(query.voter);
    let (mut page, items) = {
        let feed = state.feed.read();
        let items = feed.window(query.offset, limit).to_vec();
        let end = query.offset.min(feed.total()) + items.len();
        let page = FeedPage {
            generation: feed.generation(),
            source: feed.source(),
            total: feed.total(),
            offset: query.offset,
            next_offset: (end < feed.total()).then_some(end),
            cards: Vec::new(),
            empty_state: feed.empty_state(),
            attempts: feed.attempts().to_vec(),
        };
        (page, items)
    };
    page.cards = state.gallery.renderer.render_page(&items, &voter).await;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshSummary {
    generation: u64,
    source: Option<SourceKind>,
    total: usize,
}

async fn refresh_feed(State(state): State<AppState>) -> ApiResult<Json<RefreshSummary>> {
    let resolution = state.gallery.resolver.resolve().await;
    let mut feed = state.feed.write();
    feed.refresh(resolution);
    Ok(Json(RefreshSummary {
        generation: feed.generation(),
        source: feed.source(),
        total: feed.total(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct VoterQuery {
    voter: Option<String>,
}

async fn get_reactions(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<VoterQuery>,
) -> ApiResult<Json<ReactionView>> {
    let voter = state.voter(query.voter);
    Ok(Json(
        state.gallery.reactions.view(&MediaId::new(id), &voter).await,
    ))
}

#[derive(Debug, Deserialize)]
struct ReactRequest {
    voter: Option<String>,
    kind: String,
}

async fn post_reaction(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(payload): Json<ReactRequest>,
) -> ApiResult<Json<ReactionView>> {
    let kind =
        ReactionKind::parse(&payload.kind).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let voter = state.voter(payload.voter);
    let record = state
        .gallery
        .reactions
        .click(&MediaId::new(id), &voter, &kind)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(ReactionView::of(&record, &voter)))
}

async fn stream_media(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let target = state
        .media
        .path_for(&format!("{MEDIA_URL_PREFIX}/{path}"))
        .map_err(|_| ApiError::not_found("file not found"))?;
    stream_file(target, &headers).await
}

/// Streams a file with a guessed content type. A single `bytes=` range is
/// honoured so video elements can seek.
async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, size));

    let mut response = match range {
        Some((start, end)) => {
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let length = end - start + 1;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
            insert_header(&mut response, header::CONTENT_LENGTH, length.to_string());
            response
        }
        None => Body::from_stream(ReaderStream::new(file)).into_response(),
    };

    insert_header(&mut response, header::ACCEPT_RANGES, "bytes".to_string());
    if let Some(mime) = MimeGuess::from_path(&path).first() {
        insert_header(&mut response, header::CONTENT_TYPE, mime.to_string());
    }
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

/// Parses `bytes=start-[end]`. Unsatisfiable or multi-part ranges are ignored
/// and the whole file is sent instead.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let last = size.checked_sub(1)?;
    let end = match end.trim() {
        "" => last,
        value => value.parse::<u64>().ok()?.min(last),
    };
    (start <= end).then_some((start, end))
}
