use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::FetchError;

pub const ANILIST_URL: &str = "https://graphql.anilist.co";

const GRAPHQL_QUERY: &str = r#"
query ($page: Int, $perPage: Int) {
    Page(page: $page, perPage: $perPage) {
        pageInfo {
            currentPage
            hasNextPage
        }
        media(type: ANIME, sort: POPULARITY_DESC) {
            id
            title {
                romaji
                english
            }
            description
            genres
            tags {
                name
            }
            averageScore
            studios(isMain: true) {
                nodes {
                    name
                }
            }
        }
    }
}
"#;

// ── Wire shapes ──
//
// Every field is optional, and a value of the wrong JSON type is treated as
// absent so one odd item never sinks the rest of its page.

/// One `media` entry as the service returns it.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCatalogItem {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<RawTitle>,
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub genres: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub tags: Option<Vec<NamedNode>>,
    #[serde(default, deserialize_with = "lenient")]
    pub average_score: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub studios: Option<NodeList>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawTitle {
    #[serde(default, deserialize_with = "lenient")]
    pub romaji: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub english: Option<String>,
}

/// Any `{ name }` object: tags and studio nodes share this shape.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NamedNode {
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NodeList {
    #[serde(default, deserialize_with = "lenient_list")]
    pub nodes: Option<Vec<NamedNode>>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Like `lenient`, but per element: entries that are null or of the wrong
/// shape are dropped and the rest of the list survives.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let serde_json::Value::Array(entries) = value else {
        return Ok(None);
    };
    Ok(Some(
        entries
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
    ))
}

/// One page of results plus the continuation flag.
#[derive(Debug, Default, Clone)]
pub struct PageEnvelope {
    pub current_page: u32,
    pub has_next_page: bool,
    pub items: Vec<RawCatalogItem>,
}

#[derive(Deserialize)]
struct Response {
    data: Option<Data>,
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct Data {
    #[serde(rename = "Page")]
    page: Option<RawPage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPage {
    #[serde(default)]
    page_info: Option<PageInfo>,
    #[serde(default, deserialize_with = "lenient_list")]
    media: Option<Vec<RawCatalogItem>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    current_page: Option<u32>,
    has_next_page: Option<bool>,
}

/// Parse a 2xx response body into a page.
///
/// An `errors` list wins over any `data` sitting next to it.
pub fn parse_envelope(body: &str, requested_page: u32) -> Result<PageEnvelope, FetchError> {
    let resp: Response =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    if let Some(messages) = resp.errors {
        return Err(FetchError::Protocol { messages });
    }

    let page = resp
        .data
        .and_then(|d| d.page)
        .ok_or_else(|| FetchError::Malformed("missing data.Page".into()))?;

    let info = page.page_info;
    Ok(PageEnvelope {
        current_page: info
            .as_ref()
            .and_then(|i| i.current_page)
            .unwrap_or(requested_page),
        has_next_page: info.and_then(|i| i.has_next_page).unwrap_or(false),
        items: page.media.unwrap_or_default(),
    })
}

// ── Fetching ──

/// Something that can hand out catalog pages one at a time.
#[async_trait]
pub trait PageSource {
    async fn fetch_page(&mut self, page: u32, per_page: u32) -> Result<PageEnvelope, FetchError>;
}

/// Posts the fixed AniList query for each page.
pub struct GraphqlFetcher {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl GraphqlFetcher {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PageSource for GraphqlFetcher {
    async fn fetch_page(&mut self, page: u32, per_page: u32) -> Result<PageEnvelope, FetchError> {
        let body = serde_json::json!({
            "query": GRAPHQL_QUERY,
            "variables": { "page": page, "perPage": per_page },
        });

        debug!("POST {} page={} perPage={}", self.endpoint, page, per_page);
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::Transport {
                status: Some(status.as_u16()),
                retry_after,
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let text = resp.text().await?;
        parse_envelope(&text, page)
    }
}
