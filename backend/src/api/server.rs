//! HTTP Server for the xml2csv API.
//!
//! Provides REST endpoints for previewing and converting XML documents,
//! either uploaded or fetched from a URL.
//!
//! # API Endpoints
//!
//! | Method | Path                   | Description                          |
//! |--------|------------------------|--------------------------------------|
//! | GET    | `/health`              | Health check                         |
//! | POST   | `/api/preview`         | Infer record tag and sample columns  |
//! | POST   | `/api/convert`         | Convert to CSV (attachment)          |
//! | POST   | `/api/jobs/{id}/stop`  | Stop a running conversion            |
//! | GET    | `/api/logs`            | SSE stream for real-time logs        |
//!
//! Both POST endpoints take `multipart/form-data` with either a `file` part
//! or a `url` text part. Optional parts: `options` (JSON conversion
//! options), `jobId`, and `stream` (`true` to parse a URL while it
//! downloads).
//!
//! A preview keeps its opened document under the returned job id. A
//! following `/api/convert` with that `jobId` and no `file` or `url` part
//! converts the kept document instead of fetching it again. URL previews
//! always stream, so only the sampled part of the body is downloaded up
//! front.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{sse::Event, IntoResponse, Json, Response, Sse},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::stream::Stream;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{convert::Infallible, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use super::logs::{BroadcastProgress, LogEntry, LOG_BROADCASTER};
use super::types::{
    PreviewResponse, StopResponse, HEADER_JOB_ID, HEADER_RECORD_COUNT, HEADER_RUN_STATUS, OUTPUT_FILE_NAME,
};
use crate::config::{ConvertOptions, MAX_UPLOAD_BYTES};
use crate::error::{ServerError, ServerResult};
use crate::models::RunState;
use crate::source::{FetchMode, OpenedSource, XmlSource};
use crate::transform::pipeline::{convert_opened, convert_source, open_preview, Converter};

type ApiError = (StatusCode, Json<Value>);

/// Previewed documents kept for a following conversion.
pub const MAX_KEPT_PREVIEWS: usize = 32;

/// Shared server state: stop flags of running conversions and documents
/// kept from previews.
#[derive(Clone, Default)]
pub struct AppState {
    defaults: ConvertOptions,
    jobs: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    previews: Arc<Mutex<IndexMap<String, OpenedSource>>>,
}

impl AppState {
    pub fn new(defaults: ConvertOptions) -> Self {
        Self {
            defaults,
            jobs: Arc::default(),
            previews: Arc::default(),
        }
    }

    /// Keep a previewed document for the job. The oldest kept document is
    /// dropped once [`MAX_KEPT_PREVIEWS`] are held.
    pub fn keep_preview(&self, job_id: &str, input: OpenedSource) {
        let Ok(mut previews) = self.previews.lock() else {
            return;
        };
        previews.shift_remove(job_id);
        while previews.len() >= MAX_KEPT_PREVIEWS {
            match previews.shift_remove_index(0) {
                Some((evicted, _)) => log::debug!("Dropping kept preview of job {}", evicted),
                None => break,
            }
        }
        previews.insert(job_id.to_string(), input);
    }

    /// Take the document kept by the job's preview, if any.
    pub fn take_preview(&self, job_id: &str) -> Option<OpenedSource> {
        self.previews.lock().ok()?.shift_remove(job_id)
    }

    pub fn kept_previews(&self) -> usize {
        self.previews.lock().map(|previews| previews.len()).unwrap_or(0)
    }

    /// Register a job and return its stop flag.
    pub fn register(&self, job_id: &str) -> ServerResult<Arc<AtomicBool>> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| ServerError::Internal("job table poisoned".into()))?;
        if jobs.contains_key(job_id) {
            return Err(ServerError::BadRequest(format!("Job {} is already running", job_id)));
        }
        let flag = Arc::new(AtomicBool::new(false));
        jobs.insert(job_id.to_string(), flag.clone());
        Ok(flag)
    }

    /// Raise the stop flag of a running job.
    pub fn stop(&self, job_id: &str) -> ServerResult<()> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| ServerError::Internal("job table poisoned".into()))?;
        let flag = jobs
            .get(job_id)
            .ok_or_else(|| ServerError::JobNotFound(job_id.to_string()))?;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn finish(&self, job_id: &str) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(job_id);
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    // Permissive CORS for browser clients
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([
            header::CONTENT_TYPE,
            header::CONTENT_DISPOSITION,
            HeaderName::from_static(HEADER_JOB_ID),
            HeaderName::from_static(HEADER_RUN_STATUS),
            HeaderName::from_static(HEADER_RECORD_COUNT),
        ]);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/api/preview", post(preview_xml))
        .route("/api/convert", post(convert_xml))
        .route("/api/jobs/{id}/stop", post(stop_job))
        .route("/api/logs", get(sse_logs))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Start the HTTP server
pub async fn start_server(port: u16, defaults: ConvertOptions) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    log::info!("xml2csv server running on http://localhost:{}", port);
    log::info!("   POST /api/preview        - Infer record tag and columns");
    log::info!("   POST /api/convert        - Convert to CSV");
    log::info!("   POST /api/jobs/{{id}}/stop - Stop a conversion");
    log::info!("   GET  /api/logs           - SSE log stream");
    log::info!("   GET  /health             - Health check");

    serve(listener, AppState::new(defaults)).await?;
    Ok(())
}

/// Health check endpoint
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "xml2csv",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "preview": "POST /api/preview",
            "convert": "POST /api/convert",
            "stop": "POST /api/jobs/{id}/stop",
            "logs": "GET /api/logs (SSE)"
        }
    }))
}

/// SSE endpoint for real-time log streaming
async fn sse_logs() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = LOG_BROADCASTER.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(entry) => {
            let json = serde_json::to_string(&entry).ok()?;
            Some(Ok(Event::default().data(json)))
        }
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Parts of a preview or convert form.
#[derive(Default)]
struct JobForm {
    file: Option<Bytes>,
    file_name: Option<String>,
    url: Option<String>,
    stream: bool,
    options: Option<ConvertOptions>,
    job_id: Option<String>,
}

impl JobForm {
    async fn read(mut multipart: Multipart) -> ServerResult<Self> {
        let mut form = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
        {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "file" => {
                    form.file_name = field.file_name().map(|s| s.to_string());
                    form.file = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| ServerError::BadRequest(format!("Read error: {}", e)))?,
                    );
                }
                "url" | "options" | "jobId" | "stream" => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| ServerError::BadRequest(format!("Read error: {}", e)))?;
                    match name.as_str() {
                        "url" => form.url = Some(text.trim().to_string()).filter(|u| !u.is_empty()),
                        "options" => {
                            let options = ConvertOptions::from_json(&text)
                                .map_err(|e| ServerError::BadRequest(e.to_string()))?;
                            form.options = Some(options);
                        }
                        "jobId" => form.job_id = Some(text.trim().to_string()).filter(|id| !id.is_empty()),
                        _ => form.stream = matches!(text.trim(), "true" | "1" | "yes"),
                    }
                }
                other => log::debug!("Ignoring multipart field '{}'", other),
            }
        }

        Ok(form)
    }

    fn source(&mut self) -> ServerResult<XmlSource> {
        if let Some(data) = self.file.take() {
            log::info!(
                "Received upload {} ({} bytes)",
                self.file_name.as_deref().unwrap_or("unknown"),
                data.len()
            );
            return Ok(XmlSource::Bytes(data));
        }
        match self.url.take() {
            Some(url) => {
                let mode = if self.stream { FetchMode::Streaming } else { FetchMode::Full };
                Ok(XmlSource::url(url, mode))
            }
            None => Err(ServerError::BadRequest("No file or url provided".into())),
        }
    }

    fn job_id(&self) -> ServerResult<String> {
        match &self.job_id {
            Some(id) if HeaderValue::from_str(id).is_ok() => Ok(id.clone()),
            Some(id) => Err(ServerError::BadRequest(format!("Invalid job id '{}'", id))),
            None => Ok(Uuid::new_v4().to_string()),
        }
    }
}

/// What a conversion reads from.
enum JobInput {
    Source(XmlSource),
    Kept(OpenedSource),
}

/// Preview endpoint
async fn preview_xml(State(state): State<AppState>, multipart: Multipart) -> Result<Json<PreviewResponse>, ApiError> {
    let mut form = JobForm::read(multipart).await.map_err(ServerError::into_response_parts)?;
    let job_id = form.job_id().map_err(ServerError::into_response_parts)?;
    let source = form.source().map_err(ServerError::into_response_parts)?;
    let options = form.options.take().unwrap_or_else(|| state.defaults.clone());

    let (preview, input) = open_preview(source, &options, false).await.map_err(|e| {
        LOG_BROADCASTER.log(LogEntry::error(format!("Preview failed: {}", e)).with_job(job_id.clone()));
        ServerError::from(e).into_response_parts()
    })?;
    state.keep_preview(&job_id, input);

    match &preview.record_tag {
        Some(tag) => LOG_BROADCASTER.log(
            LogEntry::success(format!("Detected <{}> records with {} columns", tag, preview.columns.len()))
                .with_job(job_id.clone()),
        ),
        None => LOG_BROADCASTER.log(LogEntry::warning("No record element found in sample").with_job(job_id.clone())),
    }

    Ok(Json(PreviewResponse::new(job_id, preview)))
}

/// Convert endpoint
async fn convert_xml(State(state): State<AppState>, multipart: Multipart) -> Result<Response, ApiError> {
    let mut form = JobForm::read(multipart).await.map_err(ServerError::into_response_parts)?;
    let job_id = form.job_id().map_err(ServerError::into_response_parts)?;
    // A file or url in the form replaces whatever the preview kept.
    let kept = state.take_preview(&job_id);
    let input = match (form.source(), kept) {
        (Ok(source), _) => JobInput::Source(source),
        (Err(_), Some(opened)) => JobInput::Kept(opened),
        (Err(e), None) => return Err(e.into_response_parts()),
    };
    let options = form.options.take().unwrap_or_else(|| state.defaults.clone());

    let stop = state.register(&job_id).map_err(ServerError::into_response_parts)?;
    let converter = Converter::new(options)
        .with_stop_signal(stop)
        .with_progress(Arc::new(BroadcastProgress::new(job_id.clone())));

    let result = match input {
        JobInput::Source(source) => {
            LOG_BROADCASTER.log(LogEntry::info(format!("Converting {}", source)).with_job(job_id.clone()));
            convert_source(&converter, source, Vec::new()).await
        }
        JobInput::Kept(opened) => {
            LOG_BROADCASTER.log(LogEntry::info("Converting previewed document").with_job(job_id.clone()));
            convert_opened(&converter, opened, Vec::new()).await
        }
    };
    state.finish(&job_id);

    let outcome = result
        .and_then(|outcome| outcome.into_result())
        .map_err(|e| ServerError::from(e).into_response_parts())?;

    for warning in &outcome.mapping_warnings {
        LOG_BROADCASTER.log(LogEntry::warning(warning.to_string()).with_job(job_id.clone()));
    }
    if outcome.status == RunState::Completed {
        LOG_BROADCASTER.log(
            LogEntry::success(format!("Wrote {} rows", outcome.rows_written)).with_job(job_id.clone()),
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8"));
    let disposition = format!("attachment; filename=\"{}\"", OUTPUT_FILE_NAME);
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|e| ServerError::Internal(e.to_string()).into_response_parts())?,
    );
    headers.insert(
        HEADER_JOB_ID,
        HeaderValue::from_str(&job_id).map_err(|e| ServerError::Internal(e.to_string()).into_response_parts())?,
    );
    headers.insert(HEADER_RUN_STATUS, HeaderValue::from_static(outcome.status.as_str()));
    headers.insert(HEADER_RECORD_COUNT, HeaderValue::from(outcome.rows_written));

    Ok((headers, outcome.output).into_response())
}

/// Stop endpoint
async fn stop_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<StopResponse>, ApiError> {
    state.stop(&id).map_err(ServerError::into_response_parts)?;
    LOG_BROADCASTER.log(LogEntry::warning("Stop requested").with_job(id.clone()));
    Ok(Json(StopResponse {
        job_id: id,
        stopping: true,
    }))
}
