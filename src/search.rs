#![forbid(unsafe_code)]

//! Two-phase search: one `search` call for the result page, then one `list`
//! call per video for the requested detail parts. Merged pages are cached by
//! request fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::cache::{DAY, ResponseCache};
use crate::client::{ClientError, SearchClient};
use crate::format::{escape_html, format_definition, parse_duration, parse_view_count};
use crate::query::{Attributes, QuerySpec};

/// Parts requested from the primary search call.
pub const SEARCH_PART: &str = "id,snippet";

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    /// Default-resolution thumbnail.
    pub thumbnail: String,
    /// High-resolution thumbnail, when the API reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub view_count: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_html: Option<String>,
}

impl Video {
    /// A new video carrying the base fields of `self` and the detail fields
    /// of `details`.
    pub fn with_details(&self, details: VideoDetails) -> Video {
        Video {
            duration: details.duration,
            definition: details.definition,
            view_count: details.view_count,
            embed_html: details.embed_html,
            ..self.clone()
        }
    }

    /// Best available thumbnail.
    pub fn image_url(&self) -> &str {
        self.image.as_deref().unwrap_or(&self.thumbnail)
    }

    /// Description followed by a linked thumbnail.
    pub fn summary_html(&self) -> String {
        let title = escape_html(&self.title);
        format!(
            "{description}<br/><br/><a href=\"{url}\" title=\"{url}\" target=\"_blank\">\
             <img src=\"{image}\" alt=\"{title}\" title=\"{title}\" /></a>",
            description = self.description,
            url = self.url,
            image = self.image_url(),
        )
    }

    /// Description followed by the embedded player, or the summary when no
    /// player markup is known.
    pub fn content_html(&self) -> String {
        match &self.embed_html {
            Some(embed) => format!("{}<br/><br/>{embed}", self.description),
            None => self.summary_html(),
        }
    }
}

/// Formatted fields from one `list` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoDetails {
    pub duration: Option<String>,
    pub definition: Option<String>,
    pub view_count: Option<String>,
    pub embed_html: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub videos: Vec<Video>,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub prev_page: Option<String>,
}

/// Parses a raw `search` response. Rows without a video id (channels,
/// playlists) or without a readable publish date are skipped.
pub fn parse_search_response(raw: &Value) -> SearchResult {
    let videos = raw
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_search_item).collect())
        .unwrap_or_default();
    SearchResult {
        videos,
        next_page: string_at(raw, "/nextPageToken"),
        prev_page: string_at(raw, "/prevPageToken"),
    }
}

fn parse_search_item(item: &Value) -> Option<Video> {
    let id = string_at(item, "/id/videoId")?;
    let published = string_at(item, "/snippet/publishedAt")?;
    let published_at = match DateTime::parse_from_rfc3339(&published) {
        Ok(at) => at.with_timezone(&Utc),
        Err(err) => {
            debug!(video_id = %id, error = %err, "skipping row with bad publish date");
            return None;
        }
    };
    Some(Video {
        url: watch_url(&id),
        title: string_at(item, "/snippet/title").unwrap_or_default(),
        description: string_at(item, "/snippet/description").unwrap_or_default(),
        published_at,
        thumbnail: string_at(item, "/snippet/thumbnails/default/url").unwrap_or_default(),
        image: string_at(item, "/snippet/thumbnails/high/url"),
        duration: None,
        definition: None,
        view_count: None,
        embed_html: None,
        id,
    })
}

/// Parses a raw `list` response scoped to one id. `None` when the API
/// returned no row.
pub fn parse_list_response(raw: &Value) -> Option<VideoDetails> {
    let item = raw.get("items")?.as_array()?.first()?;
    let view_count = match item.pointer("/statistics/viewCount") {
        Some(Value::String(count)) => parse_view_count(count),
        Some(Value::Number(count)) => count.as_u64().and_then(crate::format::format_view_count),
        _ => None,
    };
    Some(VideoDetails {
        duration: string_at(item, "/contentDetails/duration").and_then(|d| parse_duration(&d)),
        definition: string_at(item, "/contentDetails/definition")
            .and_then(|d| format_definition(&d)),
        view_count,
        embed_html: string_at(item, "/player/embedHtml"),
    })
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

/// Cache-fronted search pipeline.
#[derive(Clone)]
pub struct SearchAggregator {
    client: SearchClient,
    cache: ResponseCache,
}

impl SearchAggregator {
    pub fn new(client: SearchClient, cache: ResponseCache) -> Self {
        Self { client, cache }
    }

    /// Returns the merged result page for `spec`, from cache when possible.
    /// Upstream failures propagate; nothing is cached for a failed search.
    pub async fn search(&self, spec: &QuerySpec) -> Result<SearchResult, ClientError> {
        let spec = spec.normalized();
        let key = spec.fingerprint();
        if let Some(cached) = self.cache.get::<SearchResult>(&key).await {
            debug!(%key, "search cache hit");
            return Ok(cached);
        }

        let raw = self.client.search(SEARCH_PART, &spec.search_params()).await?;
        let mut result = parse_search_response(&raw);

        if !spec.detail_parts.is_empty() {
            let part = spec.detail_parts.as_param();
            let mut merged = Vec::with_capacity(result.videos.len());
            for video in &result.videos {
                let mut params = Attributes::new();
                params.insert("id".into(), json!(video.id));
                let raw = self.client.list(&part, &params).await?;
                merged.push(match parse_list_response(&raw) {
                    Some(details) => video.with_details(details),
                    None => video.clone(),
                });
            }
            result.videos = merged;
        }

        self.cache.set(&key, &result, Some(DAY)).await;
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{Value, json};

    pub fn search_item(id: &str, title: &str) -> Value {
        json!({
            "id": { "kind": "youtube#video", "videoId": id },
            "snippet": {
                "publishedAt": "2020-07-03T12:30:00Z",
                "title": title,
                "description": format!("About {title}"),
                "thumbnails": {
                    "default": { "url": format!("https://i.ytimg.com/vi/{id}/default.jpg") },
                    "high": { "url": format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg") }
                }
            }
        })
    }

    pub fn search_page(items: Vec<Value>) -> Value {
        json!({ "items": items, "nextPageToken": "CAEQAA" })
    }

    pub fn detail_row(id: &str) -> Value {
        json!({
            "id": id,
            "contentDetails": { "duration": "PT1M5S", "definition": "hd" },
            "statistics": { "viewCount": "1200" },
            "player": { "embedHtml": format!("<iframe src=\"//www.youtube.com/embed/{id}\"></iframe>") }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::client::ApiMethod;
    use crate::client::fake::FakeTransport;
    use crate::query::DetailParts;
    use crate::ratelimit::unthrottled;
    use crate::store::{KeyValueStore, SqliteStore, temp_store};
    use anyhow::Result;
    use std::sync::Arc;

    fn aggregator(store: &SqliteStore, transport: Arc<FakeTransport>) -> SearchAggregator {
        let store: Arc<dyn KeyValueStore> = Arc::new(store.clone());
        SearchAggregator::new(
            SearchClient::new(transport, unthrottled(store.clone())),
            ResponseCache::new(store),
        )
    }

    fn spec_with_details() -> QuerySpec {
        QuerySpec {
            term: "rust".into(),
            detail_parts: DetailParts {
                content_details: true,
                statistics: true,
                player: false,
            },
            ..QuerySpec::default()
        }
    }

    #[test]
    fn search_rows_without_video_id_are_skipped() {
        let raw = json!({
            "items": [
                search_item("abc", "First"),
                { "id": { "kind": "youtube#channel", "channelId": "UC1" }, "snippet": {} }
            ],
            "prevPageToken": "PREV"
        });
        let result = parse_search_response(&raw);
        assert_eq!(result.videos.len(), 1);
        let video = &result.videos[0];
        assert_eq!(video.id, "abc");
        assert_eq!(video.url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(video.image_url(), "https://i.ytimg.com/vi/abc/hqdefault.jpg");
        assert_eq!(result.next_page, None);
        assert_eq!(result.prev_page.as_deref(), Some("PREV"));
    }

    #[test]
    fn list_rows_are_formatted() {
        let details = parse_list_response(&json!({ "items": [detail_row("abc")] }))
            .expect("one row");
        assert_eq!(details.duration.as_deref(), Some("01:05"));
        assert_eq!(details.definition.as_deref(), Some("HD"));
        assert_eq!(details.view_count.as_deref(), Some("1.200"));
        assert!(details.embed_html.is_some());
        assert_eq!(parse_list_response(&json!({ "items": [] })), None);
    }

    #[test]
    fn record_bodies_prefer_the_player() {
        let mut video = parse_search_response(&search_page(vec![search_item("abc", "A & B")]))
            .videos
            .remove(0);
        let summary = video.summary_html();
        assert!(summary.starts_with("About A & B<br/><br/><a href=\"https://www.youtube.com/watch?v=abc\""));
        assert!(summary.contains("alt=\"A &amp; B\""));
        assert!(summary.contains("src=\"https://i.ytimg.com/vi/abc/hqdefault.jpg\""));
        assert_eq!(video.content_html(), summary);

        video.embed_html = Some("<iframe></iframe>".into());
        assert_eq!(video.content_html(), "About A & B<br/><br/><iframe></iframe>");
    }

    /// The cache holds the merged page, not the bare search response.
    #[tokio::test]
    async fn miss_merges_details_and_caches_merged_value() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let transport = Arc::new(FakeTransport::default());
        transport.push_search(Ok(search_page(vec![search_item("abc", "First")])));
        transport.add_detail("abc", detail_row("abc"));

        let spec = spec_with_details();
        let result = aggregator(&store, transport.clone()).search(&spec).await?;
        let video = &result.videos[0];
        assert_eq!(video.duration.as_deref(), Some("01:05"));
        assert_eq!(video.definition.as_deref(), Some("HD"));
        assert_eq!(video.view_count.as_deref(), Some("1.200"));
        assert_eq!(result.next_page.as_deref(), Some("CAEQAA"));

        let cached = store.get(&spec.fingerprint()).await?.expect("cached");
        assert_eq!(serde_json::from_value::<SearchResult>(cached)?, result);

        let lists = transport.calls_of(ApiMethod::List);
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].part, "id,contentDetails,statistics");
        assert_eq!(lists[0].params.get("id"), Some(&json!("abc")));
        let searches = transport.calls_of(ApiMethod::Search);
        assert_eq!(searches[0].part, SEARCH_PART);
        assert!(!searches[0].params.contains_key("listPart"));
        Ok(())
    }

    #[tokio::test]
    async fn hit_skips_the_network() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let transport = Arc::new(FakeTransport::default());
        transport.push_search(Ok(search_page(vec![search_item("abc", "First")])));
        let aggregator = aggregator(&store, transport.clone());

        let first = aggregator.search(&QuerySpec::default()).await?;
        let second = aggregator.search(&QuerySpec::default()).await?;
        assert_eq!(first, second);
        assert_eq!(transport.calls.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_detail_row_leaves_fields_empty() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let transport = Arc::new(FakeTransport::default());
        transport.push_search(Ok(search_page(vec![search_item("gone", "Gone")])));

        let result = aggregator(&store, transport).search(&spec_with_details()).await?;
        assert_eq!(result.videos.len(), 1);
        assert_eq!(result.videos[0].duration, None);
        assert_eq!(result.videos[0].view_count, None);
        Ok(())
    }

    #[tokio::test]
    async fn upstream_failure_propagates_and_is_not_cached() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        let transport = Arc::new(FakeTransport::default());
        transport.push_search(Err(ClientError::upstream("quotaExceeded")));

        let spec = QuerySpec::default();
        let err = aggregator(&store, transport).search(&spec).await.unwrap_err();
        assert_eq!(err.message, "Error calling youtube api: quotaExceeded");
        assert!(store.get(&spec.fingerprint()).await?.is_none());
        Ok(())
    }
}
