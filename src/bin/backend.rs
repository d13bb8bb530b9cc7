#![forbid(unsafe_code)]

//! HTTP host for the search pipeline.
//!
//! Serves live searches as JSON, the RSS feed, source pages with their
//! search blocks rendered, record details and stored thumbnails. Runs the
//! materialization batch on a fixed interval in the background.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use clap::Parser;
use mime_guess::MimeGuess;
use serde_json::{Value, json};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use ytsearch_tools::client::ClientError;
use ytsearch_tools::config::{SettingsOverrides, resolve_settings};
use ytsearch_tools::feed::{CONTENT_TYPE, FeedBuilder};
use ytsearch_tools::format::escape_html;
use ytsearch_tools::materialize::MaterializationJob;
use ytsearch_tools::pipeline::{Pipeline, init_tracing};
use ytsearch_tools::query::{Attributes, QuerySpec};
use ytsearch_tools::render::{BlockRenderer, PageContext, render_record};
use ytsearch_tools::search::SearchAggregator;
use ytsearch_tools::store::{STATUS_PUBLISH, SqliteStore};

const THUMBNAIL_ROUTE: &str = "/thumbnails";

#[derive(Parser, Debug)]
#[command(name = "backend", about = "Search API, feed and scheduled materialization")]
struct BackendArgs {
    /// Database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Thumbnail directory
    #[arg(long)]
    thumbnails: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Alternative .env file
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Serve requests without the background materialization loop
    #[arg(long)]
    no_schedule: bool,
}

#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    aggregator: SearchAggregator,
    feed: FeedBuilder,
    renderer: BlockRenderer,
    thumbnails_dir: PathBuf,
}

/// JSON error in the same envelope as successful search responses.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn upstream(err: ClientError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: err.message,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "data": { "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse();

    let settings = resolve_settings(SettingsOverrides {
        db_path: args.db,
        thumbnails_dir: args.thumbnails,
        host: args.host,
        port: args.port,
        env_path: args.env_file,
        ..SettingsOverrides::default()
    })?;
    let pipeline = Pipeline::open(&settings).await?;

    if !args.no_schedule {
        tokio::spawn(schedule_materialization(
            pipeline.job.clone(),
            settings.interval,
        ));
    }

    let state = AppState {
        store: pipeline.store.clone(),
        aggregator: pipeline.aggregator.clone(),
        feed: pipeline.feed.clone(),
        renderer: pipeline.renderer.clone(),
        thumbnails_dir: settings.thumbnails_dir.clone(),
    };
    let app = Router::new()
        .route("/api/search", get(search))
        .route("/feed/youtube-search", get(feed))
        .route("/sources/{id}", get(source_page))
        .route("/records/{id}", get(record_details))
        .route(&format!("{THUMBNAIL_ROUTE}/{{file}}"), get(thumbnail))
        .with_state(state);

    let host = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", settings.host))?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

/// Runs one batch per tick. A tick that fires while the previous batch is
/// still running is skipped.
async fn schedule_materialization(job: MaterializationJob, period: Duration) {
    let running = Arc::new(Mutex::new(()));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Ok(guard) = running.clone().try_lock_owned() else {
            warn!("previous materialization batch still running, skipping tick");
            continue;
        };
        let job = job.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = job.run_batch().await {
                error!(error = %err, "materialization batch failed");
            }
        });
    }
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let spec = QuerySpec::from_params(&query_to_attributes(params));
    let result = state
        .aggregator
        .search(&spec)
        .await
        .map_err(ApiError::upstream)?;
    Ok(Json(json!({ "success": true, "data": result })))
}

async fn feed(State(state): State<AppState>) -> ApiResult<Response> {
    let body = state.feed.build_feed(Utc::now()).await.map_err(|err| {
        error!(error = %err, "building feed failed");
        ApiError::internal("feed unavailable")
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static(CONTENT_TYPE));
    Ok((headers, body).into_response())
}

/// A published source record with its search blocks rendered in place.
async fn source_page(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Query(query): Query<Vec<(String, String)>>,
) -> ApiResult<Html<String>> {
    let source = state
        .store
        .get_source(id)
        .await
        .map_err(|err| {
            error!(source_id = id, error = %err, "loading source failed");
            ApiError::internal("source unavailable")
        })?
        .filter(|source| source.status == STATUS_PUBLISH)
        .ok_or_else(|| ApiError::not_found("source not found"))?;

    let page = PageContext::new(format!("/sources/{id}"), query);
    let body = state.renderer.render_content(&source.content, &page).await;
    Ok(Html(format!(
        "<article>\n<h1>{}</h1>\n{body}</article>\n",
        escape_html(&source.title)
    )))
}

async fn record_details(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Html<String>> {
    let record = state
        .store
        .get_record(id)
        .await
        .map_err(|err| {
            error!(record_id = id, error = %err, "loading record failed");
            ApiError::internal("record unavailable")
        })?
        .ok_or_else(|| ApiError::not_found("record not found"))?;
    Ok(Html(render_record(&record, THUMBNAIL_ROUTE)))
}

async fn thumbnail(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
) -> ApiResult<Response> {
    let path = thumbnail_file(&state.thumbnails_dir, &file)
        .ok_or_else(|| ApiError::not_found("thumbnail not found"))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("thumbnail not found"))?;
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    if let Ok(value) = header::HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok((headers, bytes).into_response())
}

/// Plain file names inside the thumbnail directory only.
fn thumbnail_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\']);
    plain.then(|| dir.join(name))
}

fn query_to_attributes(params: HashMap<String, String>) -> Attributes {
    params
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect()
}
