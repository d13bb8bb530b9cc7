#![forbid(unsafe_code)]

use std::sync::{Arc, LazyLock};

use anyhow::Result;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

use crate::query::{Attributes, BlockAttributes};
use crate::store::{ContentStore, SourceRecord};

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--\s+wp:youtube-search/search(?:\s+(\{.*?\}))?\s*/?-->")
        .expect("block pattern compiles")
});

/// Renders the comment marker that embeds a search block in content.
pub fn render_block(attributes: &Attributes) -> String {
    if attributes.is_empty() {
        "<!-- wp:youtube-search/search /-->".to_owned()
    } else {
        format!(
            "<!-- wp:youtube-search/search {} /-->",
            Value::Object(attributes.clone())
        )
    }
}

fn parse_marker(captures: &Captures<'_>) -> Option<BlockAttributes> {
    let Some(raw) = captures.get(1) else {
        return Some(BlockAttributes::default());
    };
    match serde_json::from_str::<Attributes>(raw.as_str()) {
        Ok(attributes) => Some(BlockAttributes::parse(&attributes)),
        Err(err) => {
            warn!(error = %err, "skipping search block with malformed attributes");
            None
        }
    }
}

/// Extracts every search block embedded in `content`, in document order.
/// Blocks whose attribute JSON does not parse are skipped.
pub fn parse_blocks(content: &str) -> Vec<BlockAttributes> {
    BLOCK_RE
        .captures_iter(content)
        .filter_map(|captures| parse_marker(&captures))
        .collect()
}

/// A run of content or one parsed search block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Block(BlockAttributes),
}

/// Splits `content` around its search block markers. Markers with
/// malformed attributes stay in the surrounding text.
pub fn split_blocks(content: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut tail = 0;
    for captures in BLOCK_RE.captures_iter(content) {
        let Some(block) = parse_marker(&captures) else {
            continue;
        };
        let Some(marker) = captures.get(0) else {
            continue;
        };
        if marker.start() > tail {
            segments.push(Segment::Text(&content[tail..marker.start()]));
        }
        segments.push(Segment::Block(block));
        tail = marker.end();
    }
    if tail < content.len() {
        segments.push(Segment::Text(&content[tail..]));
    }
    segments
}

/// A source record and the search blocks it declares.
#[derive(Debug, Clone)]
pub struct SourceQueries {
    pub source: SourceRecord,
    pub blocks: Vec<BlockAttributes>,
}

/// Read-only, offset-paginated view of the eligible source records.
#[derive(Clone)]
pub struct ContentSourceScanner {
    store: Arc<dyn ContentStore>,
}

impl ContentSourceScanner {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Returns one page of eligible records with their blocks, plus the
    /// total number of eligible records.
    pub async fn find_query_specs(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<SourceQueries>, u64)> {
        let total = self.store.count_eligible().await?;
        let page = self
            .store
            .list_eligible(offset, limit)
            .await?
            .into_iter()
            .map(|source| SourceQueries {
                blocks: parse_blocks(&source.content),
                source,
            })
            .collect();
        Ok((page, total))
    }

    /// Every block of every eligible record, walking the store page by page.
    pub async fn all_blocks(&self, page_size: u64) -> Result<Vec<BlockAttributes>> {
        let page_size = page_size.max(1);
        let mut blocks = Vec::new();
        let mut offset = 0;
        loop {
            let (page, total) = self.find_query_specs(offset, page_size).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            blocks.extend(page.into_iter().flat_map(|entry| entry.blocks));
            if offset >= total {
                break;
            }
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Order;
    use crate::store::{STATUS_PUBLISH, temp_store};
    use serde_json::json;

    #[test]
    fn parses_blocks_with_nested_attributes() {
        let content = concat!(
            "<p>intro</p>\n",
            r#"<!-- wp:youtube-search/search {"query":"rust","order":"date","postsAuthor":{"id":3},"makePosts":true} /-->"#,
            "\n<!-- wp:paragraph --><p>middle</p><!-- /wp:paragraph -->\n",
            "<!-- wp:youtube-search/search /-->",
        );
        let blocks = parse_blocks(content);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].query, "rust");
        assert_eq!(blocks[0].order, Order::Date);
        assert_eq!(blocks[0].posts_author, Some(3));
        assert!(blocks[0].make_posts);
        assert_eq!(blocks[1], BlockAttributes::default());
    }

    #[test]
    fn malformed_attributes_are_skipped() {
        let content = r#"<!-- wp:youtube-search/search {"query": /-->"#;
        assert!(parse_blocks(content).is_empty());
    }

    #[test]
    fn split_keeps_text_around_blocks() {
        let content = concat!(
            "<p>intro</p>",
            r#"<!-- wp:youtube-search/search {"query":"rust"} /-->"#,
            r#"<!-- wp:youtube-search/search {"query": /-->"#,
            "<p>outro</p>",
        );
        let segments = split_blocks(content);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Text("<p>intro</p>"));
        assert!(matches!(&segments[1], Segment::Block(block) if block.query == "rust"));
        assert_eq!(
            segments[2],
            Segment::Text(r#"<!-- wp:youtube-search/search {"query": /--><p>outro</p>"#)
        );
    }

    #[test]
    fn render_block_roundtrips_through_parser() {
        let mut attributes = Attributes::new();
        attributes.insert("query".into(), json!("tokio"));
        attributes.insert("showViewCount".into(), json!(true));
        let blocks = parse_blocks(&render_block(&attributes));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].query, "tokio");
        assert!(blocks[0].show_view_count);
    }

    #[tokio::test]
    async fn pages_follow_creation_order() -> Result<()> {
        let (_temp, store) = temp_store().await?;
        for query in ["a", "b", "c"] {
            let mut attributes = Attributes::new();
            attributes.insert("query".into(), json!(query));
            store
                .insert_source(query, &render_block(&attributes), STATUS_PUBLISH)
                .await?;
        }
        store.insert_source("plain", "<p>nothing</p>", STATUS_PUBLISH).await?;
        let scanner = ContentSourceScanner::new(Arc::new(store));

        let (page, total) = scanner.find_query_specs(1, 1).await?;
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].source.title, "b");
        assert_eq!(page[0].blocks[0].query, "b");

        let all = scanner.all_blocks(2).await?;
        let queries: Vec<_> = all.iter().map(|block| block.query.as_str()).collect();
        assert_eq!(queries, ["a", "b", "c"]);
        Ok(())
    }
}
