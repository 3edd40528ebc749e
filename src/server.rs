//! HTTP front end: one endpoint that takes a video upload and answers with a verdict.

use anyhow::{Context, Result};
use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use vidface_vision::{SharedExtractor, VideoDecoder};

use crate::config::Config;
use crate::context::ReferenceSet;
use crate::error::{Verdict, VerifyError};
use crate::matcher::{MatchSettings, Outcome, Verifier};
use crate::sampler::RandomPicker;
use crate::storage::UploadStore;

#[derive(Clone)]
pub struct AppState {
    pub references: Arc<ReferenceSet>,
    pub extractor: SharedExtractor,
    pub decoder: Arc<dyn VideoDecoder>,
    pub uploads: UploadStore,
    pub settings: MatchSettings,
    pub timeout: Duration,
}

impl AppState {
    pub fn new(
        cfg: &Config,
        references: Arc<ReferenceSet>,
        extractor: SharedExtractor,
        decoder: Arc<dyn VideoDecoder>,
    ) -> Result<Self> {
        Ok(Self {
            references,
            extractor,
            decoder,
            uploads: UploadStore::open(&cfg.video_dir, cfg.keep_uploads)?,
            settings: MatchSettings::from(cfg),
            timeout: cfg.request_timeout(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub status: String,
    pub message: String,
}

impl VerifyResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

impl From<&Verdict> for VerifyResponse {
    fn from(verdict: &Verdict) -> Self {
        let status = if verdict.is_match() { "success" } else { "error" };
        Self {
            status: status.to_string(),
            message: verdict.message(),
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/verify-video/", post(verify_video))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str, max_upload_bytes: usize) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state, max_upload_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}

async fn verify_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> (StatusCode, Json<VerifyResponse>) {
    let path = match receive_upload(&state.uploads, &mut multipart).await {
        Ok(Some(path)) => path,
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(VerifyResponse::error("missing multipart field 'file'")),
            )
        }
        Err(e @ VerifyError::Upload(_)) => {
            info!("rejected upload: {}", e);
            return (StatusCode::BAD_REQUEST, Json(VerifyResponse::error(e.category())))
        }
        Err(e) => {
            error!("storing upload: {}", e);
            let verdict = Verdict::from(Err(e));
            return (StatusCode::INTERNAL_SERVER_ERROR, Json((&verdict).into()));
        }
    };

    let result = run_verification(&state, path.clone()).await;
    state.uploads.finish(&path);

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            error!("{}: {}", path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let verdict = Verdict::from(result);
    info!("{}: {}", path.display(), verdict.message());
    (status, Json((&verdict).into()))
}

/// Stream the `file` field to a fresh path in the upload store.
async fn receive_upload(
    store: &UploadStore,
    multipart: &mut Multipart,
) -> Result<Option<PathBuf>, VerifyError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| VerifyError::Upload(e.into()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let path = store.reserve(field.file_name());
        if let Err(e) = write_field(&path, &mut field).await {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!("could not remove partial upload {}: {}", path.display(), rm);
            }
            return Err(e);
        }
        return Ok(Some(path));
    }
    Ok(None)
}

async fn write_field(path: &Path, field: &mut Field<'_>) -> Result<(), VerifyError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VerifyError::Internal(format!("creating {}: {}", path.display(), e)))?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| VerifyError::Upload(e.into()))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| VerifyError::Internal(format!("writing {}: {}", path.display(), e)))?;
    }
    file.flush()
        .await
        .map_err(|e| VerifyError::Internal(format!("writing {}: {}", path.display(), e)))
}

/// Run the blocking pipeline off the async workers, bounded by the request timeout.
async fn run_verification(state: &AppState, path: PathBuf) -> Result<Outcome, VerifyError> {
    let references = Arc::clone(&state.references);
    let decoder = Arc::clone(&state.decoder);
    let mut extractor = state.extractor.clone();
    let settings = state.settings;
    let timeout = state.timeout;

    // the deadline inside the task stops it at the next frame once the response has gone out
    let task = tokio::task::spawn_blocking(move || {
        let mut picker = RandomPicker::from_entropy();
        Verifier::new(&references, settings)
            .with_timeout(timeout)
            .verify_path(&path, decoder.as_ref(), &mut extractor, &mut picker)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(VerifyError::Internal(format!(
            "verification task failed: {}",
            join
        ))),
        Err(_) => Err(VerifyError::Timeout(timeout)),
    }
}
