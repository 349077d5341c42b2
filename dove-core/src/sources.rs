// Upstream link sources: mirror pages, public channel previews, local files

use crate::model::{Channel, Mirror, SourcedLink};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use dove_scanner::LinkExtractor;
use dove_scanner::link::decode_base64;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHANNEL_PREVIEW_BASE: &str = "https://t.me";
pub const DEFAULT_CHANNEL_PAGES: usize = 5;

const USER_AGENT: &str = "Dove/0.1 (https://github.com/trapdoorsec/dove)";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// A stored mirror or channel row that was fetched successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRow {
    Mirror(i64),
    Channel(i64),
}

#[async_trait]
pub trait LinkSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_raw_links(&self) -> Result<Vec<String>>;

    /// Rows whose `last_checked` should be refreshed after the fetch.
    fn checked_rows(&self) -> Vec<SourceRow> {
        Vec::new()
    }
}

fn build_client() -> Result<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(FETCH_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()?)
}

async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.text().await?)
}

// ============================================================================
// Mirrors
// ============================================================================

/// Pages that list links in plain text, or as one base64 subscription blob.
pub struct MirrorSource {
    mirrors: Vec<Mirror>,
    client: Client,
    extractor: Arc<LinkExtractor>,
    checked: Mutex<Vec<SourceRow>>,
}

impl MirrorSource {
    pub fn new(mirrors: Vec<Mirror>, extractor: Arc<LinkExtractor>) -> Result<Self> {
        Ok(Self {
            mirrors,
            client: build_client()?,
            extractor,
            checked: Mutex::new(Vec::new()),
        })
    }

    fn links_in(&self, body: &str) -> Vec<String> {
        let links = self.extractor.extract(body);
        if !links.is_empty() {
            return links;
        }
        match decode_base64(body.trim()) {
            Ok(decoded) => self.extractor.extract(&decoded),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl LinkSource for MirrorSource {
    fn name(&self) -> &str {
        "mirrors"
    }

    async fn fetch_raw_links(&self) -> Result<Vec<String>> {
        let mut links = Vec::new();
        for mirror in &self.mirrors {
            match fetch_text(&self.client, &mirror.url).await {
                Ok(body) => {
                    let found = self.links_in(&body);
                    info!("Fetched {} links from mirror {}", found.len(), mirror.name);
                    links.extend(found);
                    self.checked
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(SourceRow::Mirror(mirror.id));
                }
                Err(e) => warn!("Failed to fetch mirror {} ({}): {}", mirror.name, mirror.url, e),
            }
        }
        Ok(links)
    }

    fn checked_rows(&self) -> Vec<SourceRow> {
        self.checked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ============================================================================
// Channels
// ============================================================================

/// One message from a channel's public web preview.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub id: u64,
    pub date: Option<NaiveDate>,
    pub text: String,
}

/// Reads today's messages from public channel previews (`<base>/s/<name>`).
pub struct ChannelSource {
    channels: Vec<Channel>,
    base_url: String,
    max_pages: usize,
    today: NaiveDate,
    client: Client,
    extractor: Arc<LinkExtractor>,
    checked: Mutex<Vec<SourceRow>>,
}

impl ChannelSource {
    pub fn new(channels: Vec<Channel>, extractor: Arc<LinkExtractor>) -> Result<Self> {
        Ok(Self {
            channels,
            base_url: CHANNEL_PREVIEW_BASE.to_string(),
            max_pages: DEFAULT_CHANNEL_PAGES,
            today: Local::now().date_naive(),
            client: build_client()?,
            extractor,
            checked: Mutex::new(Vec::new()),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    async fn read_channel(&self, username: &str) -> Result<Vec<String>> {
        let mut links = Vec::new();
        let mut before: Option<u64> = None;

        for page in 0..self.max_pages {
            let url = match before {
                Some(id) => format!("{}/s/{}?before={}", self.base_url, username, id),
                None => format!("{}/s/{}", self.base_url, username),
            };
            let body = match fetch_text(&self.client, &url).await {
                Ok(body) => body,
                // the first page failing means the channel is unreadable
                Err(e) if page == 0 => return Err(e),
                Err(e) => {
                    warn!("{}: stopping after page {}: {}", username, page, e);
                    break;
                }
            };
            let messages = parse_channel_page(&body);
            debug!("{}: page {} has {} messages", username, page + 1, messages.len());
            if messages.is_empty() {
                break;
            }

            for message in &messages {
                if message.date == Some(self.today) {
                    links.extend(self.extractor.extract(&message.text));
                }
            }

            // pages run newest-last; once the oldest one predates today we are done
            let oldest = messages.iter().min_by_key(|m| m.id);
            match oldest {
                Some(m) if m.date.is_some_and(|d| d >= self.today) && m.id > 1 => {
                    before = Some(m.id);
                }
                _ => break,
            }
        }

        Ok(links)
    }
}

#[async_trait]
impl LinkSource for ChannelSource {
    fn name(&self) -> &str {
        "channels"
    }

    async fn fetch_raw_links(&self) -> Result<Vec<String>> {
        let mut links = Vec::new();
        for channel in &self.channels {
            match self.read_channel(&channel.username).await {
                Ok(found) => {
                    info!("Read {} links from channel {}", found.len(), channel.username);
                    links.extend(found);
                    self.checked
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(SourceRow::Channel(channel.id));
                }
                Err(e) => warn!("Cannot read channel {}: {}", channel.username, e),
            }
        }
        Ok(links)
    }

    fn checked_rows(&self) -> Vec<SourceRow> {
        self.checked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Messages on one preview page, in page order. Message dates are converted
/// to the local calendar day.
pub fn parse_channel_page(html: &str) -> Vec<ChannelMessage> {
    let document = Html::parse_document(html);
    let (Ok(message_selector), Ok(text_selector), Ok(time_selector)) = (
        Selector::parse("div.tgme_widget_message[data-post]"),
        Selector::parse("div.tgme_widget_message_text"),
        Selector::parse("time[datetime]"),
    ) else {
        return Vec::new();
    };

    document
        .select(&message_selector)
        .filter_map(|element| {
            let id = element
                .value()
                .attr("data-post")?
                .rsplit('/')
                .next()?
                .parse::<u64>()
                .ok()?;
            let date = element
                .select(&time_selector)
                .next()
                .and_then(|t| t.value().attr("datetime"))
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Local).date_naive());
            let text = element
                .select(&text_selector)
                .map(element_text)
                .collect::<Vec<_>>()
                .join("\n");
            Some(ChannelMessage { id, date, text })
        })
        .collect()
}

/// Text nodes joined by newlines so `<br>`-separated links stay apart.
fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join("\n")
}

// ============================================================================
// Local files
// ============================================================================

/// Newline-delimited links from a file on disk.
pub struct FileSource {
    path: PathBuf,
    extractor: Arc<LinkExtractor>,
}

impl FileSource {
    pub fn new(path: PathBuf, extractor: Arc<LinkExtractor>) -> Self {
        Self { path, extractor }
    }
}

#[async_trait]
impl LinkSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch_raw_links(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(content
            .lines()
            .flat_map(|line| self.extractor.extract(line))
            .collect())
    }
}

// ============================================================================
// Collection
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LinkCollection {
    /// Sorted by link text, no duplicates.
    pub links: Vec<SourcedLink>,
    pub checked: Vec<SourceRow>,
}

/// Union of every source's output. A failing source contributes nothing; a
/// link reported by several sources belongs to the first of them.
pub async fn collect_links(sources: &[Box<dyn LinkSource>]) -> LinkCollection {
    let results =
        futures::future::join_all(sources.iter().map(|source| source.fetch_raw_links())).await;

    let mut union: BTreeMap<String, String> = BTreeMap::new();
    let mut checked = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(links) => {
                debug!("{} returned {} links", source.name(), links.len());
                for raw in links {
                    union
                        .entry(raw)
                        .or_insert_with(|| source.name().to_string());
                }
            }
            Err(e) => warn!("Source {} failed, continuing without it: {}", source.name(), e),
        }
        checked.extend(source.checked_rows());
    }

    if union.is_empty() {
        info!("No links collected from any source");
    }

    LinkCollection {
        links: union
            .into_iter()
            .map(|(raw, source)| SourcedLink { raw, source })
            .collect(),
        checked,
    }
}
