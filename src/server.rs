use crate::config::Config;
use crate::models::{Book, RunSummary};
use crate::services::epub;
use crate::services::ledger::ProgressLedger;
use crate::services::llm::Oracle;
use crate::services::pipeline::Pipeline;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use http::header;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done { summary: RunSummary },
    Failed { error: String },
}

impl JobStatus {
    fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Done { .. } | JobStatus::Failed { .. })
    }
}

struct JobEntry {
    status: JobStatus,
    updated: Instant,
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    oracle: Arc<dyn Oracle>,
    work_dir: PathBuf,
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    job_ttl: Duration,
    // one summarization at a time; the backend serializes requests anyway
    oracle_gate: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(config: Config, oracle: Arc<dyn Oracle>, work_dir: PathBuf) -> Self {
        Self {
            config: Arc::new(config),
            oracle,
            work_dir,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            job_ttl: DEFAULT_JOB_TTL,
            oracle_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// How long a finished job and its files are kept before the next upload
    /// removes them.
    pub fn with_job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = ttl;
        self
    }

    fn set_status(&self, id: Uuid, status: JobStatus) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(
                id,
                JobEntry {
                    status,
                    updated: Instant::now(),
                },
            );
        }
    }

    fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(&id).map(|entry| entry.status.clone()))
    }

    /// Forgets finished jobs older than the TTL and deletes their directories.
    async fn evict_expired(&self) {
        let expired: Vec<Uuid> = match self.jobs.lock() {
            Ok(mut jobs) => {
                let ids: Vec<Uuid> = jobs
                    .iter()
                    .filter(|(_, entry)| {
                        entry.status.is_finished() && entry.updated.elapsed() >= self.job_ttl
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ids {
                    jobs.remove(id);
                }
                ids
            }
            Err(_) => return,
        };

        for id in expired {
            match tokio::fs::remove_dir_all(self.job_dir(id)).await {
                Ok(()) => tracing::info!(job = %id, "Evicted finished job"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(job = %id, error = %e, "Cannot remove job directory"),
            }
        }
    }

    fn job_dir(&self, id: Uuid) -> PathBuf {
        self.work_dir.join(id.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/upload", post(upload_file))
        .route("/jobs/:id", get(job_status))
        .route("/download/:id", get(download))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        )
}

async fn index() -> Html<&'static str> {
    Html(
        r#"
    <!DOCTYPE html>
    <html>
    <head>
        <title>E-book Abridger</title>
        <meta charset="utf-8">
        <style>
            body { font-family: Arial, sans-serif; margin: 40px; }
            .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
            .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
        </style>
    </head>
    <body>
        <h1>E-book Abridger</h1>

        <div class="info-box">
            <h2>Service Information</h2>
            <p>Upload an EPUB and an LLM rewrites it, chunk by chunk, into a much shorter book.</p>
            <p>Jobs run one at a time and resume chapter by chapter after a restart.</p>
        </div>

        <h2>Available Endpoints:</h2>
        <div class="endpoint">GET / - This information page</div>
        <div class="endpoint">GET /health - Health check</div>
        <div class="endpoint">POST /upload - Upload an EPUB to abridge</div>
        <div class="endpoint">GET /jobs/{id} - Job status</div>
        <div class="endpoint">GET /download/{id} - Download the finished EPUB</div>

        <h2>How to Use:</h2>
        <p>Make a POST request to /upload with a multipart form containing an 'epub_file' field</p>
    </body>
    </html>
    "#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, StatusCode> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        if field.name() != Some("epub_file") {
            continue;
        }
        let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;

        let book = tokio::task::spawn_blocking(move || {
            epub::read_book_from(std::io::Cursor::new(data.as_ref()))
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Upload parser panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            tracing::warn!(error = %format!("{e:#}"), "Rejected upload");
            StatusCode::BAD_REQUEST
        })?;

        state.evict_expired().await;

        let id = Uuid::new_v4();
        std::fs::create_dir_all(state.job_dir(id)).map_err(|e| {
            tracing::error!(error = %e, "Cannot create job directory");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        state.set_status(id, JobStatus::Queued);
        tracing::info!(job = %id, chapters = book.chapters.len(), "Queued summarization job");
        tokio::spawn(run_job(state.clone(), id, book));

        return Ok(Json(serde_json::json!({
            "success": true,
            "job_id": id.to_string(),
            "status_url": format!("/jobs/{id}"),
            "download_url": format!("/download/{id}")
        })));
    }

    Err(StatusCode::BAD_REQUEST)
}

async fn run_job(state: AppState, id: Uuid, book: Book) {
    let _turn = state.oracle_gate.lock().await;
    state.set_status(id, JobStatus::Running);

    let status = match summarize(&state, id, book).await {
        Ok(summary) => JobStatus::Done { summary },
        Err(e) => {
            tracing::error!(job = %id, error = %format!("{e:#}"), "Summarization job failed");
            JobStatus::Failed {
                error: format!("{e:#}"),
            }
        }
    };
    state.set_status(id, status);
}

async fn summarize(state: &AppState, id: Uuid, book: Book) -> anyhow::Result<RunSummary> {
    let dir = state.job_dir(id);
    let ledger = ProgressLedger::new(dir.join("progress.json"));
    let output = Pipeline::new(&state.config, state.oracle.as_ref(), &ledger)
        .run(&book.chapters)
        .await?;

    let out_path = dir.join("summary.epub");
    let Book {
        metadata,
        resources,
        ..
    } = book;
    let chapters = output.chapters;
    tokio::task::spawn_blocking(move || {
        epub::write_book(&out_path, &metadata, &chapters, &resources)
    })
    .await??;
    Ok(output.summary)
}

fn parse_id(raw: &str) -> Result<Uuid, StatusCode> {
    Uuid::parse_str(raw).map_err(|_| StatusCode::NOT_FOUND)
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, StatusCode> {
    let id = parse_id(&id)?;
    state.status(id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    let id = parse_id(&id)?;
    match state.status(id) {
        None => return Err(StatusCode::NOT_FOUND),
        Some(JobStatus::Done { .. }) => {}
        Some(_) => return Err(StatusCode::CONFLICT),
    }

    let bytes = tokio::fs::read(state.job_dir(id).join("summary.epub"))
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/epub+zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"summary-{id}.epub\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
