#![forbid(unsafe_code)]

//! Request normalization.
//!
//! Search requests arrive as loose JSON maps (query strings, block attributes
//! embedded in source content). They are filtered against a schema of known
//! keys, default-filled and stripped of empty values so that a field left
//! unset and a field set to its default produce the same parameter map. That
//! map, serialized with sorted keys, is the cache fingerprint input.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub type Attributes = Map<String, Value>;

pub const DEFAULT_MAX_RESULTS: u32 = 10;
pub const MAX_RESULTS_LIMIT: u32 = 50;
const FINGERPRINT_PREFIX: &str = "youtube-search-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Order {
    #[default]
    Relevance,
    Date,
    Rating,
    Title,
    ViewCount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SafeSearch {
    None,
    #[default]
    Moderate,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VideoDefinition {
    Any,
    High,
    Standard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VideoDuration {
    #[default]
    Any,
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VideoType {
    Any,
    Episode,
    Movie,
}

/// Secondary resource parts fetched per video through the `videos` endpoint.
/// The `id` part is implied whenever any other part is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailParts {
    pub content_details: bool,
    pub statistics: bool,
    pub player: bool,
}

impl DetailParts {
    /// Everything the materialization path needs.
    pub fn full() -> Self {
        Self {
            content_details: true,
            statistics: true,
            player: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.content_details || self.statistics || self.player)
    }

    /// Comma-separated part list, empty when nothing is requested.
    pub fn as_param(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut parts = vec!["id"];
        if self.content_details {
            parts.push("contentDetails");
        }
        if self.statistics {
            parts.push("statistics");
        }
        if self.player {
            parts.push("player");
        }
        parts.join(",")
    }

    pub fn parse(value: &str) -> Self {
        let mut parts = Self::default();
        for part in value.split(',').map(str::trim) {
            match part {
                "contentDetails" => parts.content_details = true,
                "statistics" => parts.statistics = true,
                "player" => parts.player = true,
                _ => {}
            }
        }
        parts
    }
}

/// Canonical, fully defaulted search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub term: String,
    pub order: Order,
    pub max_results: u32,
    pub published_after: Option<NaiveDate>,
    pub safe_search: SafeSearch,
    pub video_definition: Option<VideoDefinition>,
    pub video_duration: VideoDuration,
    pub video_type: Option<VideoType>,
    pub detail_parts: DetailParts,
    pub page_token: Option<String>,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            term: String::new(),
            order: Order::default(),
            max_results: DEFAULT_MAX_RESULTS,
            published_after: None,
            safe_search: SafeSearch::default(),
            video_definition: None,
            video_duration: VideoDuration::default(),
            video_type: None,
            detail_parts: DetailParts::default(),
            page_token: None,
        }
    }
}

impl QuerySpec {
    /// Builds a request from loose parameters named after the remote API
    /// (`q`, `order`, `maxResults`, `listPart`, ...). Unknown keys are ignored,
    /// invalid values fall back to the defaults.
    pub fn from_params(raw: &Attributes) -> Self {
        let params = parse_args(raw, &search_defaults(), false);
        let defaults = Self::default();
        Self {
            term: params.get("q").and_then(value_as_string).unwrap_or_default(),
            order: enum_value(params.get("order")).unwrap_or(defaults.order),
            max_results: params
                .get("maxResults")
                .and_then(value_as_u64)
                .map(clamp_max_results)
                .unwrap_or(defaults.max_results),
            published_after: params
                .get("publishedAfter")
                .and_then(value_as_string)
                .and_then(|value| parse_day(&value)),
            safe_search: enum_value(params.get("safeSearch")).unwrap_or(defaults.safe_search),
            video_definition: enum_value(params.get("videoDefinition")),
            video_duration: enum_value(params.get("videoDuration"))
                .unwrap_or(defaults.video_duration),
            video_type: enum_value(params.get("videoType")),
            detail_parts: params
                .get("listPart")
                .and_then(value_as_string)
                .map(|value| DetailParts::parse(&value))
                .unwrap_or_default(),
            page_token: params.get("pageToken").and_then(value_as_string),
        }
    }

    /// Derives the search request declared by an embedded block.
    pub fn from_attributes(attributes: &BlockAttributes) -> Self {
        Self {
            term: attributes.query.clone(),
            order: attributes.order,
            max_results: attributes.max_results,
            published_after: attributes.published_after,
            safe_search: attributes.safe_search,
            video_definition: attributes.video_definition,
            video_duration: attributes.video_duration,
            video_type: attributes.video_type,
            detail_parts: DetailParts {
                content_details: attributes.show_duration || attributes.show_definition,
                statistics: attributes.show_view_count,
                player: false,
            },
            page_token: None,
        }
    }

    pub fn with_detail_parts(mut self, detail_parts: DetailParts) -> Self {
        self.detail_parts = detail_parts;
        self
    }

    pub fn with_page_token(mut self, page_token: Option<String>) -> Self {
        self.page_token = page_token.filter(|token| !token.is_empty());
        self
    }

    /// Round-trips the request through its parameter map. Equal requests come
    /// out identical no matter how they were spelled.
    pub fn normalized(&self) -> Self {
        Self::from_params(&self.to_params())
    }

    /// The normalized parameter map: every key known to the search schema,
    /// empty values removed.
    pub fn to_params(&self) -> Attributes {
        let mut params = Attributes::new();
        params.insert("listPart".into(), json!(self.detail_parts.as_param()));
        params.insert("type".into(), json!("video"));
        params.insert("q".into(), json!(self.term));
        params.insert("maxResults".into(), json!(self.max_results));
        params.insert("order".into(), to_param(&self.order));
        params.insert(
            "publishedAfter".into(),
            self.published_after
                .map(|day| json!(day.format("%Y-%m-%dT00:00:00Z").to_string()))
                .unwrap_or(Value::Null),
        );
        params.insert("safeSearch".into(), to_param(&self.safe_search));
        params.insert(
            "videoDefinition".into(),
            self.video_definition.as_ref().map(to_param).unwrap_or(Value::Null),
        );
        params.insert("videoDuration".into(), to_param(&self.video_duration));
        params.insert(
            "videoType".into(),
            self.video_type.as_ref().map(to_param).unwrap_or(Value::Null),
        );
        params.insert(
            "pageToken".into(),
            json!(self.page_token.clone().unwrap_or_default()),
        );
        parse_args(&params, &search_defaults(), false)
    }

    /// Parameters for the primary search call: the normalized map without
    /// the detail part list, which only the per-video lookup uses.
    pub fn search_params(&self) -> Attributes {
        let mut params = self.to_params();
        params.remove("listPart");
        params
    }

    /// Cache key derived from the normalized parameter map. `serde_json::Map`
    /// keeps keys sorted, so the serialization is canonical.
    pub fn fingerprint(&self) -> String {
        let serialized = Value::Object(self.to_params()).to_string();
        format!(
            "{FINGERPRINT_PREFIX}{}",
            blake3::hash(serialized.as_bytes()).to_hex()
        )
    }
}

/// Attributes of a search block embedded in source content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockAttributes {
    pub max_results: u32,
    pub query: String,
    pub order: Order,
    pub published_after: Option<NaiveDate>,
    pub safe_search: SafeSearch,
    pub video_definition: Option<VideoDefinition>,
    pub video_duration: VideoDuration,
    pub video_type: Option<VideoType>,
    pub show_published_at: bool,
    pub show_duration: bool,
    pub show_definition: bool,
    pub show_view_count: bool,
    pub use_paging: bool,
    /// Marks the block for materialization into records.
    pub make_posts: bool,
    pub posts_categories: Vec<i64>,
    pub posts_author: Option<i64>,
}

impl BlockAttributes {
    /// Parses block attributes. Unlike search parameters, explicit empty
    /// values are kept: `showPublishedAt: false` must override its `true`
    /// default.
    pub fn parse(raw: &Attributes) -> Self {
        let attrs = parse_args(raw, &block_defaults(), true);
        let flag = |key: &str| attrs.get(key).is_some_and(|value| !is_empty_value(value));
        Self {
            max_results: attrs
                .get("maxResults")
                .and_then(value_as_u64)
                .map(clamp_max_results)
                .unwrap_or(DEFAULT_MAX_RESULTS),
            query: attrs.get("query").and_then(value_as_string).unwrap_or_default(),
            order: enum_value(attrs.get("order")).unwrap_or_default(),
            published_after: attrs
                .get("publishedAfter")
                .and_then(value_as_string)
                .and_then(|value| parse_day(&value)),
            safe_search: enum_value(attrs.get("safeSearch")).unwrap_or_default(),
            video_definition: enum_value(attrs.get("videoDefinition")),
            video_duration: enum_value(attrs.get("videoDuration")).unwrap_or_default(),
            video_type: enum_value(attrs.get("videoType")),
            show_published_at: flag("showPublishedAt"),
            show_duration: flag("showDuration"),
            show_definition: flag("showDefinition"),
            show_view_count: flag("showViewCount"),
            use_paging: flag("usePaging"),
            make_posts: flag("makePosts"),
            posts_categories: attrs
                .get("postsCategories")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|item| object_id(item, "term_id")).collect())
                .unwrap_or_default(),
            posts_author: attrs
                .get("postsAuthor")
                .and_then(|value| object_id(value, "id")),
        }
    }
}

impl Default for BlockAttributes {
    fn default() -> Self {
        Self::parse(&Attributes::new())
    }
}

/// Filters `raw` down to the keys present in `defaults`, fills in the
/// defaults for missing keys and, unless `allow_empty` is set, drops every
/// key whose value is empty.
pub fn parse_args(raw: &Attributes, defaults: &Attributes, allow_empty: bool) -> Attributes {
    let mut args = defaults.clone();
    for (key, value) in raw {
        if defaults.contains_key(key) {
            args.insert(key.clone(), value.clone());
        }
    }
    if !allow_empty {
        args.retain(|_, value| !is_empty_value(value));
    }
    args
}

/// Loose truthiness: null, `false`, zero, `""`, `"0"` and empty
/// collections count as empty.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n == 0.0),
        Value::String(text) => text.is_empty() || text == "0",
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn search_defaults() -> Attributes {
    [
        ("listPart", json!("")),
        ("type", json!("video")),
        ("q", json!("")),
        ("maxResults", json!(DEFAULT_MAX_RESULTS)),
        ("order", json!("relevance")),
        ("publishedAfter", Value::Null),
        ("safeSearch", json!("moderate")),
        ("videoDefinition", Value::Null),
        ("videoDuration", json!("any")),
        ("videoType", Value::Null),
        ("pageToken", json!("")),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

fn block_defaults() -> Attributes {
    [
        ("maxResults", json!(DEFAULT_MAX_RESULTS)),
        ("query", json!("")),
        ("order", json!("relevance")),
        ("publishedAfter", Value::Null),
        ("safeSearch", json!("moderate")),
        ("videoDefinition", Value::Null),
        ("videoDuration", json!("any")),
        ("videoType", Value::Null),
        ("showPublishedAt", json!(true)),
        ("showDuration", json!(false)),
        ("showDefinition", json!(false)),
        ("showViewCount", json!(false)),
        ("usePaging", json!(false)),
        ("makePosts", json!(false)),
        ("postsCategories", json!([])),
        ("postsAuthor", Value::Null),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

fn to_param<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn enum_value<T: DeserializeOwned>(value: Option<&Value>) -> Option<T> {
    value.and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn clamp_max_results(value: u64) -> u32 {
    value.clamp(1, MAX_RESULTS_LIMIT as u64) as u32
}

/// Day precision only; anything after `YYYY-MM-DD` is discarded.
fn parse_day(value: &str) -> Option<NaiveDate> {
    let day = value.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Accepts `{"<key>": 3}`, `{"<key>": "3"}` or a bare id.
fn object_id(value: &Value, key: &str) -> Option<i64> {
    let id = match value {
        Value::Object(map) => map.get(key)?,
        other => other,
    };
    let parsed = match id {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|id| *id > 0)
}
