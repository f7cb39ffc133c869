//! Notion API layer: property model, page-to-deal mapping, and the query client.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pipeboard_core::{stage_for_status, Deal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pipeboard-notion";

const NOTION_API_BASE: &str = "https://api.notion.com";
const NOTION_VERSION_HEADER: &str = "Notion-Version";
const NOTION_VERSION: &str = "2022-06-28";
const DEFAULT_TIMEOUT_SECS: u64 = 20;
/// Upper bound on continuation pages per query; the remote serves at most
/// 100 records per page.
const MAX_QUERY_PAGES: usize = 20;

const FALLBACK_TITLE: &str = "Sem nome";

/// One property value as the remote API ships it, tagged by its `type` field.
/// Shapes the dashboard does not consume collapse into `Unsupported` instead
/// of failing deserialization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyValue {
    Title { title: Vec<RichTextFragment> },
    RichText { rich_text: Vec<RichTextFragment> },
    Number { number: Option<f64> },
    Select { select: Option<SelectOption> },
    Status { status: Option<SelectOption> },
    People { people: Vec<Person> },
    Date { date: Option<DateValue> },
    PhoneNumber { phone_number: Option<String> },
    Email { email: Option<String> },
    Url { url: Option<String> },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RichTextFragment {
    pub plain_text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelectOption {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Person {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DateValue {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// One unprocessed record from the remote collection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPage {
    pub id: String,
    pub created_time: String,
    pub last_edited_time: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryResponse {
    results: Vec<RawPage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaResponse {
    properties: BTreeMap<String, SchemaProperty>,
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaProperty {
    #[serde(rename = "type")]
    kind: String,
}

/// Name/type pair describing one column of the remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

fn first_plain_text(fragments: &[RichTextFragment]) -> String {
    fragments
        .first()
        .map(|fragment| fragment.plain_text.clone())
        .unwrap_or_default()
}

fn title_text(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::Title { title }) => first_plain_text(title),
        _ => String::new(),
    }
}

fn rich_text_text(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::RichText { rich_text }) => first_plain_text(rich_text),
        _ => String::new(),
    }
}

fn number_value(prop: Option<&PropertyValue>) -> f64 {
    match prop {
        Some(PropertyValue::Number { number }) => number.unwrap_or(0.0),
        _ => 0.0,
    }
}

fn select_name(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::Select {
            select: Some(option),
        }) => option.name.clone(),
        _ => String::new(),
    }
}

/// The status column has shifted between select-typed and status-typed
/// across schema generations; both shapes are accepted.
fn status_label(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::Status {
            status: Some(option),
        }) => option.name.clone(),
        Some(PropertyValue::Select {
            select: Some(option),
        }) => option.name.clone(),
        _ => String::new(),
    }
}

fn people_names(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::People { people }) => people
            .iter()
            .filter_map(|person| person.name.as_deref())
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

fn date_start(prop: Option<&PropertyValue>) -> Option<String> {
    match prop {
        Some(PropertyValue::Date { date: Some(value) }) => value.start.clone(),
        _ => None,
    }
}

fn phone_text(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::PhoneNumber {
            phone_number: Some(number),
        }) => number.clone(),
        Some(PropertyValue::RichText { rich_text }) => first_plain_text(rich_text),
        _ => String::new(),
    }
}

fn email_text(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::Email { email: Some(email) }) => email.clone(),
        Some(PropertyValue::RichText { rich_text }) => first_plain_text(rich_text),
        _ => String::new(),
    }
}

fn url_text(prop: Option<&PropertyValue>) -> String {
    match prop {
        Some(PropertyValue::Url { url: Some(url) }) => url.clone(),
        _ => String::new(),
    }
}

/// Flattens one remote page into a dashboard deal. Pure: absent or mistyped
/// properties fall back to the field defaults, never to an error.
///
/// Title resolution order: the page's title-shaped property under any name
/// (the remote guarantees at most one per collection), then the joined
/// negotiating-people list, then a fixed placeholder.
pub fn map_page(page: &RawPage) -> Deal {
    let props = &page.properties;

    let status = status_label(props.get("Status"));
    let stage = stage_for_status(&status);
    let negotiating = people_names(props.get("Quem está negociando"));

    let mut title = props
        .values()
        .find_map(|prop| match prop {
            PropertyValue::Title { .. } => Some(title_text(Some(prop))),
            _ => None,
        })
        .unwrap_or_default();
    if title.is_empty() {
        title = negotiating.clone();
    }
    if title.is_empty() {
        title = FALLBACK_TITLE.to_string();
    }

    let created_at =
        date_start(props.get("Criado em")).unwrap_or_else(|| page.created_time.clone());
    let last_update =
        date_start(props.get("Última atualização")).unwrap_or_else(|| page.last_edited_time.clone());

    Deal {
        id: page.id.clone(),
        title,
        value: number_value(props.get("Valor Proposta")),
        status,
        created_at,
        last_update,
        gk: select_name(props.get("GK")),
        quality: select_name(props.get("Qualidade")),
        loss_reason: rich_text_text(props.get("Motivo de perda")),
        phone: phone_text(props.get("Telefone")),
        whatsapp: phone_text(props.get("WhatsApp")),
        email: email_text(props.get("E-mail")),
        instagram: url_text(props.get("Instagram")),
        site: url_text(props.get("Site")),
        decisor: rich_text_text(props.get("Decisor")),
        cidade: rich_text_text(props.get("Cidade")),
        cnpj: rich_text_text(props.get("CNPJ")),
        negotiating,
        stage,
    }
}

/// Connection settings for the remote API.
#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
    pub timeout: Duration,
}

impl NotionConfig {
    /// Validates credentials: the token must be non-empty and the collection
    /// id must parse as a UUID (dashed or bare 32-hex form). The id is kept
    /// in the bare form for URL building.
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> anyhow::Result<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            anyhow::bail!("NOTION_TOKEN must not be empty");
        }
        let database_id = normalize_database_id(&database_id.into())?;
        Ok(Self {
            token,
            database_id,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    /// Reads connection settings from the environment. Missing or malformed
    /// variables are startup errors; there are no baked-in fallbacks.
    pub fn from_env() -> anyhow::Result<Self> {
        let token = std::env::var("NOTION_TOKEN").context("NOTION_TOKEN is not set")?;
        let database_id =
            std::env::var("NOTION_DATABASE_ID").context("NOTION_DATABASE_ID is not set")?;
        let timeout_secs = std::env::var("PIPEBOARD_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut config = Self::new(token, database_id)?;
        config.timeout = Duration::from_secs(timeout_secs);
        Ok(config)
    }

    /// Twelve hex chars of the token's SHA-256, for diagnostics surfaces
    /// that must never carry token bytes.
    pub fn token_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.token.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..12].to_string()
    }
}

fn normalize_database_id(raw: &str) -> anyhow::Result<String> {
    let raw = raw.trim();
    let parsed = Uuid::parse_str(raw)
        .with_context(|| format!("NOTION_DATABASE_ID {raw:?} is not a valid collection id"))?;
    Ok(parsed.simple().to_string())
}

#[derive(Debug, Error)]
pub enum NotionError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notion api status {status}: {message}")]
    Api { status: u16, message: String },
}

/// Seam between the web layer and the remote API, so handlers can be
/// exercised against fakes.
#[async_trait]
pub trait DealSource: Send + Sync {
    async fn fetch_deals(&self) -> Result<Vec<Deal>, NotionError>;
    async fn list_properties(&self) -> Result<Vec<PropertyDescriptor>, NotionError>;
}

/// Thin client over the remote HTTP API. One call sequence per invocation;
/// no retries, no caching.
#[derive(Debug, Clone)]
pub struct NotionClient {
    client: reqwest::Client,
    config: NotionConfig,
    base_url: String,
}

impl NotionClient {
    pub fn new(config: NotionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            config,
            base_url: NOTION_API_BASE.to_string(),
        })
    }

    pub fn database_id(&self) -> &str {
        &self.config.database_id
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Queries the collection with an empty filter, following continuation
    /// cursors until the remote reports no more pages (bounded by
    /// `MAX_QUERY_PAGES`).
    pub async fn query_pages(&self) -> Result<Vec<RawPage>, NotionError> {
        let url = format!(
            "{}/v1/databases/{}/query",
            self.base_url, self.config.database_id
        );
        debug!(database_id = %self.config.database_id, "querying collection");

        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        for page_index in 0..MAX_QUERY_PAGES {
            let body = match &cursor {
                Some(cursor) => serde_json::json!({ "start_cursor": cursor }),
                None => serde_json::json!({}),
            };

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.config.token)
                .header(NOTION_VERSION_HEADER, NOTION_VERSION)
                .json(&body)
                .send()
                .await?;

            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }

            let batch = resp.json::<QueryResponse>().await?;
            debug!(page_index, results = batch.results.len(), "fetched record batch");
            pages.extend(batch.results);

            if !batch.has_more {
                return Ok(pages);
            }
            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(pages),
            }
        }

        warn!(page_cap = MAX_QUERY_PAGES, "stopping continuation at page cap");
        Ok(pages)
    }

    /// Retrieves the collection schema as a name-sorted property listing.
    pub async fn list_schema(&self) -> Result<Vec<PropertyDescriptor>, NotionError> {
        let url = format!("{}/v1/databases/{}", self.base_url, self.config.database_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .header(NOTION_VERSION_HEADER, NOTION_VERSION)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let schema = resp.json::<SchemaResponse>().await?;
        Ok(schema
            .properties
            .into_iter()
            .map(|(name, prop)| PropertyDescriptor {
                name,
                kind: prop.kind,
            })
            .collect())
    }
}

async fn error_from_response(resp: reqwest::Response) -> NotionError {
    let status = resp.status();
    let message = resp
        .json::<ApiErrorBody>()
        .await
        .map(|body| body.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    NotionError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl DealSource for NotionClient {
    async fn fetch_deals(&self) -> Result<Vec<Deal>, NotionError> {
        let pages = self.query_pages().await?;
        Ok(pages.iter().map(map_page).collect())
    }

    async fn list_properties(&self) -> Result<Vec<PropertyDescriptor>, NotionError> {
        self.list_schema().await
    }
}
