#![forbid(unsafe_code)]

//! Wiring shared by the binaries: one libsql store behind every component.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::assets::{AssetDownloader, UreqFetch};
use crate::cache::ResponseCache;
use crate::client::{HttpTransport, SearchClient};
use crate::config::Settings;
use crate::feed::{FeedBuilder, FeedGenerator};
use crate::materialize::MaterializationJob;
use crate::ratelimit::RateLimiter;
use crate::render::BlockRenderer;
use crate::scanner::ContentSourceScanner;
use crate::search::SearchAggregator;
use crate::store::SqliteStore;

/// Installs the `fmt` subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<SqliteStore>,
    pub aggregator: SearchAggregator,
    pub job: MaterializationJob,
    pub feed: FeedBuilder,
    pub renderer: BlockRenderer,
}

impl Pipeline {
    pub async fn open(settings: &Settings) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&settings.db_path)
                .await
                .context("opening content database")?,
        );
        let transport = HttpTransport::new(
            &settings.api_base,
            settings.api_key()?,
            settings.http_timeout,
        );
        let cache = ResponseCache::new(store.clone());
        let aggregator = SearchAggregator::new(
            SearchClient::new(Arc::new(transport), RateLimiter::new(store.clone())),
            cache.clone(),
        );
        let job = MaterializationJob::new(
            store.clone(),
            store.clone(),
            aggregator.clone(),
            AssetDownloader::new(Arc::new(UreqFetch::new(settings.http_timeout))),
            settings.thumbnails_dir.clone(),
            settings.batch_size,
        );
        let feed = FeedBuilder::new(
            ContentSourceScanner::new(store.clone()),
            aggregator.clone(),
            cache,
            FeedGenerator {
                title: settings.feed_title.clone(),
                link: settings.feed_link.clone(),
                description: settings.feed_description.clone(),
                self_link: Some(settings.feed_link.clone()),
            },
        );
        Ok(Self {
            store,
            renderer: BlockRenderer::new(aggregator.clone()),
            aggregator,
            job,
            feed,
        })
    }
}
