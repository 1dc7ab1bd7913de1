//! HTTP server for stash endpoints
//!
//! Provides /health, POST /stash (multipart upload) and GET /stash/{id}.

use crate::body::{delivery_stream, ChunkReader};
use crate::content_type;
use crate::types::{ErrorResponse, HealthResponse};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use file_stash::{Stash, StashId};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub stash: Stash,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(stash: Stash) -> Self {
        Self {
            stash,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stash", get(not_found).post(upload))
        .route("/stash/{id}", get(retrieve))
        // Upload size is left to whatever sits in front of the service
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server, stopping on ctrl-c
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        stash: state.stash.stats(),
    })
}

/// Stash every part of a multipart upload, answering with one id per part
/// in submission order (`""` for parts that could not be stored)
async fn upload(State(state): State<SharedState>, mut request: Request) -> Response {
    treat_as_form_data(request.headers_mut());
    let mut multipart = match Multipart::from_request(request, &state).await {
        Ok(multipart) => multipart,
        Err(rejection) => {
            debug!(error = %rejection, "Upload is not a multipart body");
            return rejection.into_response();
        }
    };
    let mut slots: Vec<String> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, parts = slots.len(), "Malformed multipart upload");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: "Malformed multipart body".to_string(),
                    }),
                )
                    .into_response();
            }
        };

        // Clients name the field after the file; the part's own file name
        // is often a placeholder such as "blob"
        let name = field
            .name()
            .filter(|name| !name.is_empty())
            .or_else(|| field.file_name())
            .unwrap_or_default()
            .to_string();

        match state
            .stash
            .put(&name, ChunkReader::new(Box::pin(field)))
            .await
        {
            Ok(id) => {
                debug!(id = %id, name = %name, "Stashed upload part");
                slots.push(id.to_string());
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to stash upload part");
                slots.push(String::new());
            }
        }
    }

    Json(slots).into_response()
}

/// Relabel any `multipart/*` body as form-data. The parser only accepts
/// form-data, but every multipart subtype shares the same framing.
fn treat_as_form_data(headers: &mut HeaderMap) {
    let Some(value) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return;
    };

    let (mime, params) = value.split_once(';').unwrap_or((value, ""));
    let Some((kind, subtype)) = mime.trim().split_once('/') else {
        return;
    };
    if !kind.eq_ignore_ascii_case("multipart") || subtype.eq_ignore_ascii_case("form-data") {
        return;
    }

    let relabeled = if params.is_empty() {
        "multipart/form-data".to_string()
    } else {
        format!("multipart/form-data;{}", params)
    };
    if let Ok(value) = HeaderValue::from_str(&relabeled) {
        headers.insert(header::CONTENT_TYPE, value);
    }
}

/// Stream a stashed file back
async fn retrieve(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let Some(id) = StashId::parse(&id) else {
        debug!(id = %id, "Retrieval with malformed id");
        return not_found().await;
    };
    let Some(delivery) = state.stash.get(&id).await else {
        return not_found().await;
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type::for_name(delivery.name()))
        .header(header::CONTENT_LENGTH, delivery.size());

    let disposition = format!("inline; filename=\"{}\"", delivery.name().replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        builder = builder.header(header::CONTENT_DISPOSITION, value);
    }

    builder
        .body(Body::from_stream(delivery_stream(delivery)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Unknown, expired and consumed ids all get an empty answer
async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}
