#![forbid(unsafe_code)]

//! RSS 2.0 feed over every search block on the site.
//!
//! Rendering is skipped when the item list has not changed since the last
//! build: the checksum of the items and the rendered bytes are kept in the
//! option store and the cached bytes are replayed verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{DAY, ResponseCache};
use crate::format::escape_html;
use crate::query::{BlockAttributes, DetailParts, QuerySpec};
use crate::scanner::ContentSourceScanner;
use crate::search::SearchAggregator;

pub const BLOCKS_KEY: &str = "youtube-search-blocks";
pub const CHECKSUM_KEY: &str = "youtube-search-feed-checksum";
pub const CONTENT_KEY: &str = "youtube-search-feed-content";
pub const CONTENT_TYPE: &str = "application/rss+xml; charset=UTF-8";

const SCAN_PAGE_SIZE: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// HTML, emitted as CDATA.
    pub description: String,
    pub date: DateTime<Utc>,
    /// Permalink used as the item guid.
    pub url: String,
}

/// Channel metadata plus the RSS writer.
#[derive(Debug, Clone)]
pub struct FeedGenerator {
    pub title: String,
    pub link: String,
    pub description: String,
    pub self_link: Option<String>,
}

impl FeedGenerator {
    pub fn generate(&self, pub_date: DateTime<Utc>, items: &[FeedItem]) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str(
            "<rss version=\"2.0\" xmlns:content=\"http://purl.org/rss/1.0/modules/content/\" \
             xmlns:atom=\"http://www.w3.org/2005/Atom\">\n",
        );
        out.push_str("<channel>\n");
        push_element(&mut out, 1, "title", &self.title);
        push_element(&mut out, 1, "link", &self.link);
        push_element(&mut out, 1, "description", &self.description);
        push_element(&mut out, 1, "pubDate", &pub_date.to_rfc2822());
        if let Some(self_link) = &self.self_link {
            out.push_str(&format!(
                "  <atom:link href=\"{}\" rel=\"self\" type=\"application/rss+xml\"/>\n",
                escape_html(self_link)
            ));
        }
        push_element(
            &mut out,
            1,
            "generator",
            concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
        );

        for item in items {
            out.push_str("  <item>\n");
            push_element(&mut out, 2, "title", &item.title);
            push_element(&mut out, 2, "link", &item.link);
            out.push_str(&format!(
                "    <description>{}</description>\n",
                cdata(&item.description)
            ));
            push_element(&mut out, 2, "pubDate", &item.date.to_rfc2822());
            if !item.url.is_empty() {
                out.push_str(&format!(
                    "    <guid isPermaLink=\"true\">{}</guid>\n",
                    escape_html(&item.url)
                ));
            }
            out.push_str("  </item>\n");
        }

        out.push_str("</channel>\n</rss>\n");
        out
    }
}

fn push_element(out: &mut String, depth: usize, name: &str, text: &str) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&format!("<{name}>{}</{name}>\n", escape_html(text)));
}

fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

pub fn checksum(items: &[FeedItem]) -> String {
    let serialized = serde_json::to_vec(items).unwrap_or_default();
    blake3::hash(&serialized).to_hex().to_string()
}

#[derive(Clone)]
pub struct FeedBuilder {
    scanner: ContentSourceScanner,
    aggregator: SearchAggregator,
    cache: ResponseCache,
    generator: FeedGenerator,
}

impl FeedBuilder {
    pub fn new(
        scanner: ContentSourceScanner,
        aggregator: SearchAggregator,
        cache: ResponseCache,
        generator: FeedGenerator,
    ) -> Self {
        Self {
            scanner,
            aggregator,
            cache,
            generator,
        }
    }

    /// Rendered feed bytes. Only a failing content scan is an error; failing
    /// searches leave their items out.
    pub async fn build_feed(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<u8>> {
        let items = self.items().await?;
        let sum = checksum(&items);

        let saved = self.cache.get::<String>(CHECKSUM_KEY).await;
        if saved.as_deref() == Some(sum.as_str()) {
            if let Some(content) = self.cache.get::<String>(CONTENT_KEY).await {
                debug!(checksum = %sum, "feed unchanged, replaying cached output");
                return Ok(content.into_bytes());
            }
        }

        let content = self.generator.generate(now, &items);
        self.cache.set(CHECKSUM_KEY, &sum, None).await;
        self.cache.set(CONTENT_KEY, &content, None).await;
        Ok(content.into_bytes())
    }

    /// Items of every search block, newest first.
    pub async fn items(&self) -> anyhow::Result<Vec<FeedItem>> {
        let mut items = Vec::new();
        for block in self.blocks().await? {
            let spec = QuerySpec::from_attributes(&block).with_detail_parts(DetailParts::default());
            let result = match self.aggregator.search(&spec).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(query = %block.query, error = %err, "feed search failed");
                    continue;
                }
            };
            items.extend(result.videos.iter().map(|video| FeedItem {
                title: video.title.clone(),
                link: video.url.clone(),
                description: video.summary_html(),
                date: video.published_at,
                url: video.url.clone(),
            }));
        }
        items.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(items)
    }

    async fn blocks(&self) -> anyhow::Result<Vec<BlockAttributes>> {
        if let Some(blocks) = self.cache.get::<Vec<BlockAttributes>>(BLOCKS_KEY).await {
            return Ok(blocks);
        }
        let blocks = self.scanner.all_blocks(SCAN_PAGE_SIZE).await?;
        self.cache.set(BLOCKS_KEY, &blocks, Some(DAY)).await;
        Ok(blocks)
    }
}
