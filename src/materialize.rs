#![forbid(unsafe_code)]

//! Batch job turning search blocks into durable records.
//!
//! Each run handles one page of eligible source records starting at a
//! persisted cursor. For every block flagged `makePosts` the job runs the
//! search with all detail parts, creates a record per video it has not
//! materialized yet, downloads the thumbnail, and finally deletes the
//! records of videos that dropped out of the results. Records remember the
//! block they came from: a failing search only skips its own block, and the
//! records of that block are left alone until it succeeds again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::assets::{AssetDownloader, thumbnail_path};
use crate::format::slugify;
use crate::query::{BlockAttributes, DetailParts, QuerySpec};
use crate::scanner::{ContentSourceScanner, SourceQueries};
use crate::search::{SearchAggregator, Video};
use crate::store::{ContentStore, KeyValueStore, NewRecord, record_map_key};

pub const CURSOR_KEY: &str = "youtube-search-materialize-cursor";
pub const DEFAULT_BATCH_SIZE: u64 = 10;

/// video id -> materialized record id, per source record.
type RecordMap = BTreeMap<String, i64>;

/// What a single run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Cursor the run started from, after wrapping.
    pub cursor: u64,
    pub eligible: u64,
    /// Source record ids handled, in order.
    pub visited: Vec<i64>,
    pub created: usize,
    pub kept: usize,
    pub deleted: usize,
    pub thumbnails: usize,
    pub failed_specs: usize,
    pub failed_sources: usize,
}

enum Outcome {
    Kept(i64),
    Created(i64),
}

#[derive(Clone)]
pub struct MaterializationJob {
    content: Arc<dyn ContentStore>,
    options: Arc<dyn KeyValueStore>,
    scanner: ContentSourceScanner,
    aggregator: SearchAggregator,
    downloader: AssetDownloader,
    thumbnails_dir: PathBuf,
    batch_size: u64,
}

impl MaterializationJob {
    pub fn new(
        content: Arc<dyn ContentStore>,
        options: Arc<dyn KeyValueStore>,
        aggregator: SearchAggregator,
        downloader: AssetDownloader,
        thumbnails_dir: PathBuf,
        batch_size: u64,
    ) -> Self {
        Self {
            scanner: ContentSourceScanner::new(content.clone()),
            content,
            options,
            aggregator,
            downloader,
            thumbnails_dir,
            batch_size: batch_size.max(1),
        }
    }

    /// Processes one page of source records and advances the cursor.
    ///
    /// Only failures to read the cursor or the page abort the run. Search
    /// and per-source failures are logged and counted in the report.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        match self.options.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged expired options"),
            Err(err) => warn!(error = %err, "purging expired options failed"),
        }

        let eligible = self.content.count_eligible().await?;
        let mut cursor = self.read_cursor().await?;
        if cursor >= eligible {
            cursor = 0;
        }

        let (page, _) = self
            .scanner
            .find_query_specs(cursor, self.batch_size)
            .await?;
        let mut report = BatchReport {
            cursor,
            eligible,
            ..BatchReport::default()
        };

        for entry in &page {
            report.visited.push(entry.source.id);
            if let Err(err) = self.process_source(entry, &mut report).await {
                report.failed_sources += 1;
                warn!(source_id = entry.source.id, error = %err, "materializing source failed");
            }
        }

        let next = cursor + self.batch_size;
        self.options
            .set(CURSOR_KEY, &Value::from(next), None)
            .await
            .context("persisting materialization cursor")?;

        info!(
            cursor,
            eligible,
            created = report.created,
            kept = report.kept,
            deleted = report.deleted,
            failed_specs = report.failed_specs,
            "materialization batch finished"
        );
        Ok(report)
    }

    async fn read_cursor(&self) -> Result<u64> {
        let value = self
            .options
            .get(CURSOR_KEY)
            .await
            .context("reading materialization cursor")?;
        Ok(value.and_then(|value| value.as_u64()).unwrap_or(0))
    }

    async fn process_source(&self, entry: &SourceQueries, report: &mut BatchReport) -> Result<()> {
        let source_id = entry.source.id;
        let mut linked: HashMap<i64, String> = self
            .content
            .list_linked_to(source_id)
            .await?
            .into_iter()
            .map(|record| (record.id, record.block_key))
            .collect();
        let mut records = self.read_record_map(source_id).await?;
        let mut kept = HashSet::new();
        let mut held_back = HashSet::new();

        for block in entry.blocks.iter().filter(|block| block.make_posts) {
            let spec = QuerySpec::from_attributes(block).with_detail_parts(DetailParts::full());
            let block_key = spec.fingerprint();
            let result = match self.aggregator.search(&spec).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(source_id, query = %block.query, error = %err, "skipping search block");
                    report.failed_specs += 1;
                    held_back.insert(block_key);
                    continue;
                }
            };

            for video in &result.videos {
                match self
                    .materialize_video(source_id, block, &block_key, video, &mut linked, &mut records)
                    .await
                {
                    Ok(Outcome::Kept(id)) => {
                        if kept.insert(id) {
                            report.kept += 1;
                        }
                    }
                    Ok(Outcome::Created(id)) => {
                        kept.insert(id);
                        report.created += 1;
                        if self.attach_thumbnail(id, video).await {
                            report.thumbnails += 1;
                        }
                    }
                    Err(err) => {
                        warn!(source_id, video_id = %video.id, error = %err, "creating record failed");
                        held_back.insert(block_key.clone());
                    }
                }
            }
        }

        if !held_back.is_empty() {
            info!(
                source_id,
                blocks = held_back.len(),
                "results incomplete, keeping records of the affected blocks"
            );
        }

        let mut stale: Vec<i64> = linked
            .iter()
            .filter(|(id, block_key)| !kept.contains(*id) && !held_back.contains(*block_key))
            .map(|(id, _)| *id)
            .collect();
        stale.sort_unstable();
        for id in stale {
            self.content.delete_record(id).await?;
            linked.remove(&id);
            report.deleted += 1;
            debug!(source_id, record_id = id, "deleted stale record");
        }
        records.retain(|_, id| linked.contains_key(id));
        self.write_record_map(source_id, &records).await
    }

    async fn materialize_video(
        &self,
        source_id: i64,
        block: &BlockAttributes,
        block_key: &str,
        video: &Video,
        linked: &mut HashMap<i64, String>,
        records: &mut RecordMap,
    ) -> Result<Outcome> {
        if let Some(id) = records.get(&video.id).copied() {
            if linked.contains_key(&id) {
                return Ok(Outcome::Kept(id));
            }
            records.remove(&video.id);
        }

        let id = self
            .content
            .create_record(&new_record(source_id, block, block_key, video))
            .await?;
        records.insert(video.id.clone(), id);
        if let Err(err) = self.write_record_map(source_id, records).await {
            records.remove(&video.id);
            if let Err(rollback) = self.content.delete_record(id).await {
                warn!(source_id, record_id = id, error = %rollback, "orphaned record left behind");
            }
            return Err(err.context(format!("recording record {id} for video {}", video.id)));
        }
        linked.insert(id, block_key.to_owned());
        debug!(source_id, video_id = %video.id, record_id = id, "created record");
        Ok(Outcome::Created(id))
    }

    async fn attach_thumbnail(&self, record_id: i64, video: &Video) -> bool {
        let url = video.image_url();
        if url.is_empty() {
            return false;
        }
        let dest = thumbnail_path(&self.thumbnails_dir, &video.id, url);
        if !self.downloader.save(url, &dest).await {
            return false;
        }
        let path = dest.to_string_lossy();
        match self.content.set_thumbnail(record_id, &path).await {
            Ok(()) => true,
            Err(err) => {
                warn!(record_id, error = %err, "attaching thumbnail failed");
                false
            }
        }
    }

    async fn read_record_map(&self, source_id: i64) -> Result<RecordMap> {
        let key = record_map_key(source_id);
        let Some(value) = self.options.get(&key).await? else {
            return Ok(RecordMap::new());
        };
        match serde_json::from_value(value) {
            Ok(map) => Ok(map),
            Err(err) => {
                warn!(source_id, error = %err, "discarding unreadable record map");
                Ok(RecordMap::new())
            }
        }
    }

    async fn write_record_map(&self, source_id: i64, records: &RecordMap) -> Result<()> {
        let value = serde_json::to_value(records).context("serializing record map")?;
        self.options
            .set(&record_map_key(source_id), &value, None)
            .await
    }
}

/// Fields of the record materialized from `video` for a block.
pub fn new_record(
    source_id: i64,
    block: &BlockAttributes,
    block_key: &str,
    video: &Video,
) -> NewRecord {
    NewRecord {
        source_id,
        youtube_id: video.id.clone(),
        title: video.title.clone(),
        slug: slugify(&video.title),
        published_at: video.published_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        content: video.content_html(),
        excerpt: video.summary_html(),
        youtube_url: video.url.clone(),
        duration: video.duration.clone(),
        definition: video.definition.clone(),
        view_count: video.view_count.clone(),
        embed_html: video.embed_html.clone(),
        author_id: block.posts_author,
        categories: block.posts_categories.clone(),
        block_key: block_key.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::fake::FakeFetch;
    use crate::cache::ResponseCache;
    use crate::client::fake::FakeTransport;
    use crate::client::{ApiMethod, ClientError, SearchClient};
    use crate::query::Attributes;
    use crate::ratelimit::unthrottled;
    use crate::scanner::render_block;
    use crate::search::fixtures::{detail_row, search_item, search_page};
    use crate::store::{STATUS_PUBLISH, SqliteStore, temp_store};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Option store that refuses to write record maps.
    struct MapWriteFails(SqliteStore);

    #[async_trait]
    impl KeyValueStore for MapWriteFails {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
            if key.starts_with("youtube-search-records-") {
                return Err(anyhow!("option table locked"));
            }
            self.0.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }
        async fn purge_expired(&self) -> Result<u64> {
            self.0.purge_expired().await
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        thumbs: tempfile::TempDir,
        store: SqliteStore,
        transport: Arc<FakeTransport>,
        fetch: Arc<FakeFetch>,
    }

    impl Harness {
        async fn new() -> Result<Self> {
            let (temp, store) = temp_store().await?;
            Ok(Self {
                _temp: temp,
                thumbs: tempfile::tempdir()?,
                store,
                transport: Arc::new(FakeTransport::default()),
                fetch: Arc::new(FakeFetch::default()),
            })
        }

        fn job(&self, batch_size: u64) -> MaterializationJob {
            self.job_with_options(Arc::new(self.store.clone()), batch_size)
        }

        fn job_with_options(
            &self,
            options: Arc<dyn KeyValueStore>,
            batch_size: u64,
        ) -> MaterializationJob {
            let store = Arc::new(self.store.clone());
            let aggregator = SearchAggregator::new(
                SearchClient::new(self.transport.clone(), unthrottled(store.clone())),
                ResponseCache::new(store.clone()),
            );
            MaterializationJob::new(
                store,
                options,
                aggregator,
                AssetDownloader::new(self.fetch.clone()),
                self.thumbs.path().to_path_buf(),
                batch_size,
            )
        }

        fn video(&self, id: &str) -> serde_json::Value {
            self.transport.add_detail(id, detail_row(id));
            self.fetch.serve(
                &format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"),
                "image/jpeg",
                id.as_bytes(),
            );
            search_item(id, &format!("Video {id}"))
        }

        async fn source(&self, blocks: &[Attributes]) -> Result<i64> {
            let content: String = blocks.iter().map(render_block).collect();
            self.store.insert_source("source", &content, STATUS_PUBLISH).await
        }

        /// Simulates the search cache expiring between runs.
        async fn expire_search(&self, block: &Attributes) -> Result<()> {
            let spec = QuerySpec::from_attributes(&BlockAttributes::parse(block))
                .with_detail_parts(DetailParts::full());
            self.store.delete(&spec.fingerprint()).await
        }

        async fn youtube_ids(&self, source_id: i64) -> Result<Vec<String>> {
            Ok(self
                .store
                .list_records(source_id)
                .await?
                .into_iter()
                .map(|record| record.fields.youtube_id)
                .collect())
        }
    }

    fn posts_block(query: &str) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("query".into(), json!(query));
        attributes.insert("makePosts".into(), json!(true));
        attributes.insert("postsCategories".into(), json!([{ "term_id": 4 }]));
        attributes.insert("postsAuthor".into(), json!({ "id": 2 }));
        attributes
    }

    #[tokio::test]
    async fn creates_records_with_details_and_thumbnails() -> Result<()> {
        let h = Harness::new().await?;
        let block = posts_block("rust");
        let source = h.source(&[block]).await?;
        h.transport.push_search(Ok(search_page(vec![h.video("a")])));

        let report = h.job(10).run_batch().await?;
        assert_eq!(report.created, 1);
        assert_eq!(report.thumbnails, 1);

        let records = h.store.list_records(source).await?;
        let record = &records[0];
        assert_eq!(record.fields.title, "Video a");
        assert_eq!(record.fields.slug, "video-a");
        assert_eq!(record.fields.published_at, "2020-07-03 12:30:00");
        assert_eq!(record.fields.duration.as_deref(), Some("01:05"));
        assert_eq!(record.fields.view_count.as_deref(), Some("1.200"));
        assert!(record.fields.content.contains("<iframe"));
        assert_eq!(record.fields.categories, vec![4]);
        assert_eq!(record.fields.author_id, Some(2));

        let thumb = h.thumbs.path().join("a.jpg");
        assert_eq!(record.thumbnail_path.as_deref(), Some(&*thumb.to_string_lossy()));
        assert_eq!(std::fs::read(thumb)?, b"a");

        let list = &h.transport.calls_of(ApiMethod::List)[0];
        assert_eq!(list.part, "id,contentDetails,statistics,player");
        Ok(())
    }

    /// A second run over unchanged results touches nothing.
    #[tokio::test]
    async fn rerun_is_idempotent() -> Result<()> {
        let h = Harness::new().await?;
        let block = posts_block("rust");
        let source = h.source(&[block.clone()]).await?;
        let page = search_page(vec![h.video("a"), h.video("b")]);
        h.transport.push_search(Ok(page.clone()));

        let job = h.job(10);
        let first = job.run_batch().await?;
        assert_eq!(first.created, 2);
        let before = h.store.list_records(source).await?;

        h.expire_search(&block).await?;
        h.transport.push_search(Ok(page));
        let second = job.run_batch().await?;
        assert_eq!((second.created, second.deleted, second.kept), (0, 0, 2));
        assert_eq!(h.store.list_records(source).await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_videos_are_garbage_collected() -> Result<()> {
        let h = Harness::new().await?;
        let block = posts_block("rust");
        let source = h.source(&[block.clone()]).await?;
        h.transport
            .push_search(Ok(search_page(vec![h.video("a"), h.video("b")])));
        let job = h.job(10);
        job.run_batch().await?;
        let b_before = h.store.list_records(source).await?[1].clone();

        h.expire_search(&block).await?;
        h.transport
            .push_search(Ok(search_page(vec![h.video("b"), h.video("c")])));
        let report = job.run_batch().await?;
        assert_eq!((report.created, report.kept, report.deleted), (1, 1, 1));
        assert_eq!(h.youtube_ids(source).await?, vec!["b", "c"]);
        assert_eq!(h.store.list_records(source).await?[0], b_before);

        let map = h.store.get(&record_map_key(source)).await?.expect("map");
        assert!(map.get("a").is_none());
        assert!(map.get("b").is_some());
        Ok(())
    }

    /// A record deleted behind the job's back is recreated, not trusted.
    #[tokio::test]
    async fn stale_map_entries_are_recreated() -> Result<()> {
        let h = Harness::new().await?;
        let block = posts_block("rust");
        let source = h.source(&[block.clone()]).await?;
        let page = search_page(vec![h.video("a")]);
        h.transport.push_search(Ok(page.clone()));
        let job = h.job(10);
        job.run_batch().await?;
        let old = h.store.list_linked_to(source).await?[0].id;
        h.store.delete_record(old).await?;

        h.expire_search(&block).await?;
        h.transport.push_search(Ok(page));
        let report = job.run_batch().await?;
        assert_eq!(report.created, 1);
        let linked = h.store.list_linked_to(source).await?;
        assert_eq!(linked.len(), 1);
        assert_ne!(linked[0].id, old);
        Ok(())
    }

    #[tokio::test]
    async fn cursor_wraps_around() -> Result<()> {
        let h = Harness::new().await?;
        let mut sources = Vec::new();
        for query in ["one", "two", "three"] {
            sources.push(h.source(&[posts_block(query)]).await?);
        }
        let job = h.job(1);

        let mut visited = Vec::new();
        for _ in 0..4 {
            visited.extend(job.run_batch().await?.visited);
        }
        assert_eq!(visited, vec![sources[0], sources[1], sources[2], sources[0]]);
        Ok(())
    }

    /// One failing block neither blocks its siblings nor loses records.
    #[tokio::test]
    async fn failing_block_is_isolated() -> Result<()> {
        let h = Harness::new().await?;
        let first = posts_block("first");
        let second = posts_block("second");
        let source = h.source(&[first.clone(), second.clone()]).await?;
        h.transport.push_search(Ok(search_page(vec![h.video("a")])));
        h.transport.push_search(Ok(search_page(vec![h.video("b")])));
        let job = h.job(10);
        assert_eq!(job.run_batch().await?.created, 2);

        h.expire_search(&first).await?;
        h.expire_search(&second).await?;
        h.transport
            .push_search(Err(ClientError::upstream("quotaExceeded")));
        h.transport.push_search(Ok(search_page(vec![h.video("c")])));
        let report = job.run_batch().await?;
        assert_eq!(report.failed_specs, 1);
        assert_eq!(report.created, 1);
        // `b` dropped out of the healthy block; `a` waits for its block to recover.
        assert_eq!(report.deleted, 1);
        assert_eq!(h.youtube_ids(source).await?, vec!["a", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn edited_blocks_drop_their_old_records() -> Result<()> {
        let h = Harness::new().await?;
        let source = h.source(&[posts_block("old")]).await?;
        h.transport.push_search(Ok(search_page(vec![h.video("a")])));
        let job = h.job(10);
        job.run_batch().await?;

        h.store
            .update_source_content(source, &render_block(&posts_block("new")))
            .await?;
        h.transport.push_search(Ok(search_page(vec![h.video("b")])));
        let report = job.run_batch().await?;
        assert_eq!((report.created, report.deleted), (1, 1));
        assert_eq!(h.youtube_ids(source).await?, vec!["b"]);
        Ok(())
    }

    /// A record whose map entry cannot be written is removed again, so the
    /// next run does not create a duplicate next to it.
    #[tokio::test]
    async fn unrecorded_records_are_rolled_back() -> Result<()> {
        let h = Harness::new().await?;
        let source = h.source(&[posts_block("rust")]).await?;
        h.transport.push_search(Ok(search_page(vec![h.video("a")])));

        let job = h.job_with_options(Arc::new(MapWriteFails(h.store.clone())), 10);
        let report = job.run_batch().await?;
        assert_eq!(report.created, 0);
        assert_eq!(report.failed_sources, 1);
        assert!(h.store.list_linked_to(source).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn batches_purge_expired_options() -> Result<()> {
        let h = Harness::new().await?;
        h.store
            .set("youtube-search-stale", &json!({"videos": []}), Some(Duration::ZERO))
            .await?;

        h.job(10).run_batch().await?;
        // Only the cursor is left.
        assert_eq!(h.store.count_options().await?, 1);
        assert_eq!(h.store.get(CURSOR_KEY).await?, Some(json!(10)));
        Ok(())
    }

    #[tokio::test]
    async fn display_only_blocks_and_missing_thumbnails() -> Result<()> {
        let h = Harness::new().await?;
        let mut display = Attributes::new();
        display.insert("query".into(), json!("display"));
        let posts = posts_block("posts");
        let source = h.source(&[display, posts]).await?;
        // No image served for this video.
        h.transport.add_detail("x", detail_row("x"));
        h.transport
            .push_search(Ok(search_page(vec![search_item("x", "No thumb")])));

        let report = h.job(10).run_batch().await?;
        assert_eq!(report.created, 1);
        assert_eq!(report.thumbnails, 0);
        assert_eq!(h.transport.calls_of(ApiMethod::Search).len(), 1);
        let record = &h.store.list_records(source).await?[0];
        assert_eq!(record.thumbnail_path, None);
        Ok(())
    }
}
