#![forbid(unsafe_code)]

//! Server-side HTML for search blocks embedded in content and for the
//! details of a materialized record.

use std::fmt::Write;
use std::path::Path;

use tracing::warn;
use url::form_urlencoded;

use crate::format::escape_html;
use crate::query::{BlockAttributes, QuerySpec};
use crate::scanner::{Segment, split_blocks};
use crate::search::{SearchAggregator, SearchResult};
use crate::store::MaterializedRecord;

/// Shown in place of a block whose search failed.
pub const LOAD_ERROR: &str = "Er is een fout opgetreden bij het laden van de video's";

const PUBLISHED_LABEL: &str = "Gepubliceerd";
const PREV_LABEL: &str = "Vorige";
const NEXT_LABEL: &str = "Volgende";

/// Which detail fields make it into a details line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailFlags {
    pub duration: bool,
    pub definition: bool,
    pub view_count: bool,
}

impl DetailFlags {
    pub fn all() -> Self {
        Self {
            duration: true,
            definition: true,
            view_count: true,
        }
    }

    pub fn from_block(block: &BlockAttributes) -> Self {
        Self {
            duration: block.show_duration,
            definition: block.show_definition,
            view_count: block.show_view_count,
        }
    }
}

/// `01:05 - HD - 1.200 views`. Fields that are switched off or empty are
/// left out; the result is empty when nothing remains.
pub fn details_line(
    flags: DetailFlags,
    duration: Option<&str>,
    definition: Option<&str>,
    view_count: Option<&str>,
) -> String {
    let present = |on: bool, value: Option<&str>| {
        value.filter(|value| on && !value.is_empty()).map(str::to_owned)
    };
    [
        present(flags.duration, duration),
        present(flags.definition, definition),
        present(flags.view_count, view_count).map(|count| format!("{count} views")),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" - ")
}

/// Path and query string of the page a block is rendered on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl PageContext {
    pub fn new(path: impl Into<String>, query: Vec<(String, String)>) -> Self {
        Self {
            path: path.into(),
            query,
        }
    }

    pub fn page_token(&self) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == "pageToken")
            .map(|(_, value)| value.as_str())
            .filter(|token| !token.is_empty())
    }

    /// Link to the same page with `pageToken` replaced.
    pub fn nav_link(&self, page_token: &str) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in self.query.iter().filter(|(key, _)| key != "pageToken") {
            query.append_pair(key, value);
        }
        query.append_pair("pageToken", page_token);
        format!("{}?{}", self.path, query.finish())
    }
}

/// The result grid of one block. Empty results render nothing.
pub fn render_videos(result: &SearchResult, block: &BlockAttributes, page: &PageContext) -> String {
    if result.videos.is_empty() {
        return String::new();
    }
    let flags = DetailFlags::from_block(block);
    let mut out = String::new();
    out.push_str("<div class=\"youtube-search\">\n");
    out.push_str("  <div class=\"youtube-search-result-grid\">\n");
    out.push_str("    <ul class=\"youtube-search-results\">\n");
    for video in &result.videos {
        let title = escape_html(&video.title);
        let _ = writeln!(
            out,
            "      <li>\n        <a href=\"{url}\" target=\"_blank\">\n          \
             <img src=\"{thumbnail}\" alt=\"{title}\" align=\"top\" />\n          \
             <div class=\"youtube-search-video-details\">\n            {title}",
            url = escape_html(&video.url),
            thumbnail = escape_html(&video.thumbnail),
        );
        if block.show_published_at {
            let _ = writeln!(
                out,
                "            <br/><em>{PUBLISHED_LABEL}: {}</em>",
                video.published_at.format("%d-%m-%Y")
            );
        }
        let details = details_line(
            flags,
            video.duration.as_deref(),
            video.definition.as_deref(),
            video.view_count.as_deref(),
        );
        if !details.is_empty() {
            let _ = writeln!(out, "            <br/>{}", escape_html(&details));
        }
        out.push_str("          </div>\n        </a>\n      </li>\n");
    }
    out.push_str("    </ul>\n");
    if block.use_paging {
        out.push_str("    <div class=\"youtube-search-paging-container\">\n");
        out.push_str("      <ul class=\"youtube-search-paging\">\n");
        for (token, label) in [
            (result.prev_page.as_deref(), PREV_LABEL),
            (result.next_page.as_deref(), NEXT_LABEL),
        ] {
            match token.filter(|token| !token.is_empty()) {
                Some(token) => {
                    let _ = writeln!(
                        out,
                        "        <li><a href=\"{}\">{label}</a></li>",
                        escape_html(&page.nav_link(token))
                    );
                }
                None => {
                    let _ = writeln!(out, "        <li>{label}</li>");
                }
            }
        }
        out.push_str("      </ul>\n    </div>\n");
    }
    out.push_str("  </div>\n</div>\n");
    out
}

pub fn render_error() -> String {
    format!("<div class=\"youtube-search\"><p class=\"youtube-search-error\">{LOAD_ERROR}</p></div>\n")
}

/// Player (or linked thumbnail) plus the details line of a stored record.
/// Thumbnails are linked as `{thumbnail_base}/{file name}`.
pub fn render_record(record: &MaterializedRecord, thumbnail_base: &str) -> String {
    let fields = &record.fields;
    let mut out = String::from("<div class=\"youtube-search-video\">\n");
    match fields.embed_html.as_deref().filter(|embed| !embed.is_empty()) {
        Some(embed) => {
            let _ = writeln!(out, "  {embed}");
        }
        None => {
            let file = record
                .thumbnail_path
                .as_deref()
                .and_then(|path| Path::new(path).file_name())
                .and_then(|name| name.to_str());
            if let Some(file) = file {
                let _ = writeln!(
                    out,
                    "  <a href=\"{url}\" target=\"_blank\"><img src=\"{base}/{file}\" alt=\"{title}\" /></a>",
                    url = escape_html(&fields.youtube_url),
                    base = thumbnail_base.trim_end_matches('/'),
                    file = escape_html(file),
                    title = escape_html(&fields.title),
                );
            }
        }
    }
    let details = details_line(
        DetailFlags::all(),
        fields.duration.as_deref(),
        fields.definition.as_deref(),
        fields.view_count.as_deref(),
    );
    if !details.is_empty() {
        let _ = writeln!(out, "  <p><em>{}</em></p>", escape_html(&details));
    }
    out.push_str("</div>\n");
    out
}

/// Renders search blocks live, the way a visitor sees them.
#[derive(Clone)]
pub struct BlockRenderer {
    aggregator: SearchAggregator,
}

impl BlockRenderer {
    pub fn new(aggregator: SearchAggregator) -> Self {
        Self { aggregator }
    }

    /// One block. The page token only applies to blocks with paging on.
    /// A failing search renders the error notice instead of the grid.
    pub async fn render_block(&self, block: &BlockAttributes, page: &PageContext) -> String {
        let mut spec = QuerySpec::from_attributes(block);
        if block.use_paging {
            spec = spec.with_page_token(page.page_token().map(str::to_owned));
        }
        match self.aggregator.search(&spec).await {
            Ok(result) => render_videos(&result, block, page),
            Err(err) => {
                warn!(query = %block.query, error = %err, "rendering search block failed");
                render_error()
            }
        }
    }

    /// `content` with every search block marker replaced by its rendering.
    pub async fn render_content(&self, content: &str, page: &PageContext) -> String {
        let mut out = String::with_capacity(content.len());
        for segment in split_blocks(content) {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Block(block) => out.push_str(&self.render_block(&block, page).await),
            }
        }
        out
    }
}
