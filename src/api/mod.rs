//! HTTP adapter over the core service.
//!
//! Routes are a thin mapping onto `VectorService` operations; error kinds
//! translate onto canonical status codes (not_found → 404, validation →
//! 400, conflict and busy → 409, internal → 500).

pub mod dto;

use crate::error::Error;
use crate::service::{ChunkInput, SearchFilter, VectorService};
use crate::snapshot;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use dto::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<VectorService>,
    pub snapshot_path: Option<PathBuf>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: Arc<VectorService>, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            service,
            snapshot_path,
            started_at: Instant::now(),
        }
    }
}

/// API error newtype so the core error enum can carry an HTTP rendering.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) | Error::Busy(_) => StatusCode::CONFLICT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "internal error surfaced to client");
        }
        let body = json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/snapshot", post(save_snapshot))
        .route("/libraries", post(create_library).get(list_libraries))
        .route("/libraries/:id", get(get_library).delete(delete_library))
        .route("/libraries/:id/config", put(update_library_config))
        .route("/libraries/:id/stats", get(library_stats))
        .route(
            "/libraries/:id/documents",
            post(create_document).get(list_documents),
        )
        .route(
            "/libraries/:id/documents-with-chunks",
            post(create_document_with_chunks),
        )
        .route("/libraries/:id/chunks", post(create_chunk))
        .route("/libraries/:id/chunks/bulk", post(bulk_upsert_chunks))
        .route("/libraries/:id/search", post(search))
        .route("/documents/:id", get(get_document).delete(delete_document))
        .route("/documents/:id/chunks", get(list_document_chunks))
        .route(
            "/chunks/:id",
            get(get_chunk).patch(update_chunk).delete(delete_chunk),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        libraries: state.service.list_libraries().len(),
    })
}

async fn save_snapshot(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let Some(path) = state.snapshot_path.clone() else {
        return Err(Error::validation("snapshot persistence is disabled").into());
    };
    snapshot::save(&state.service.stores(), &path)?;
    Ok(Json(json!({ "saved": true, "path": path.display().to_string() })))
}

// === Libraries ===

async fn create_library(
    State(state): State<AppState>,
    Json(req): Json<CreateLibraryRequest>,
) -> ApiResult<(StatusCode, Json<crate::model::Library>)> {
    let library = state
        .service
        .create_library(req.name, req.embedding_dim, req.index_config, req.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(library)))
}

async fn list_libraries(State(state): State<AppState>) -> Json<Vec<crate::model::Library>> {
    Json(state.service.list_libraries())
}

async fn get_library(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<crate::model::Library>> {
    Ok(Json(state.service.get_library(id).await?))
}

async fn update_library_config(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateConfigRequest>,
) -> ApiResult<Json<crate::model::Library>> {
    let library = state
        .service
        .update_library_config(id, req.index_config, req.expected_version)
        .await?;
    Ok(Json(library))
}

async fn delete_library(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AckResponse>> {
    state.service.delete_library(id).await?;
    Ok(Json(AckResponse { deleted: true }))
}

async fn library_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LibraryStatsResponse>> {
    Ok(Json(state.service.library_stats(id).await?.into()))
}

// === Documents ===

async fn create_document(
    State(state): State<AppState>,
    Path(library_id): Path<Uuid>,
    Json(req): Json<CreateDocumentRequest>,
) -> ApiResult<(StatusCode, Json<crate::model::Document>)> {
    let document = state
        .service
        .create_document(library_id, req.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn list_documents(
    State(state): State<AppState>,
    Path(library_id): Path<Uuid>,
) -> ApiResult<Json<Vec<crate::model::Document>>> {
    Ok(Json(state.service.list_documents(library_id).await?))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<crate::model::Document>> {
    Ok(Json(state.service.get_document(id).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AckResponse>> {
    state.service.delete_document(id).await?;
    Ok(Json(AckResponse { deleted: true }))
}

async fn list_document_chunks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<crate::model::Chunk>>> {
    Ok(Json(state.service.list_document_chunks(id).await?))
}

async fn create_document_with_chunks(
    State(state): State<AppState>,
    Path(library_id): Path<Uuid>,
    Json(req): Json<CreateDocumentWithChunksRequest>,
) -> ApiResult<(StatusCode, Json<DocumentWithChunksResponse>)> {
    let (document, chunks) = state
        .service
        .create_document_with_chunks(library_id, req.metadata, req.chunks)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DocumentWithChunksResponse { document, chunks }),
    ))
}

// === Chunks ===

async fn create_chunk(
    State(state): State<AppState>,
    Path(library_id): Path<Uuid>,
    Json(req): Json<ChunkInput>,
) -> ApiResult<(StatusCode, Json<crate::model::Chunk>)> {
    let chunk = state.service.create_chunk(library_id, req).await?;
    Ok((StatusCode::CREATED, Json(chunk)))
}

async fn bulk_upsert_chunks(
    State(state): State<AppState>,
    Path(library_id): Path<Uuid>,
    Json(req): Json<BulkUpsertRequest>,
) -> ApiResult<Json<Vec<crate::model::Chunk>>> {
    Ok(Json(
        state
            .service
            .bulk_upsert_chunks(library_id, req.chunks)
            .await?,
    ))
}

async fn get_chunk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<crate::model::Chunk>> {
    Ok(Json(state.service.get_chunk(id).await?))
}

async fn update_chunk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateChunkRequest>,
) -> ApiResult<Json<crate::model::Chunk>> {
    Ok(Json(
        state
            .service
            .update_chunk(id, req.fields, req.expected_version)
            .await?,
    ))
}

async fn delete_chunk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AckResponse>> {
    state.service.delete_chunk(id).await?;
    Ok(Json(AckResponse { deleted: true }))
}

// === Search ===

async fn search(
    State(state): State<AppState>,
    Path(library_id): Path<Uuid>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<Vec<SearchHitResponse>>> {
    if req.k < 0 {
        return Err(Error::validation(format!("k must be non-negative, got {}", req.k)).into());
    }
    let filter: SearchFilter = req.filter;
    let hits = state
        .service
        .search(library_id, req.query, req.k as usize, filter)
        .await?;
    Ok(Json(hits.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let service = Arc::new(VectorService::new());
        create_router(AppState::new(service, None))
    }

    async fn send(app: Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_create_search_and_delete_flow() {
        let service = Arc::new(VectorService::new());
        let state = AppState::new(service, None);

        let (status, library) = send(
            create_router(state.clone()),
            "POST",
            "/libraries",
            json!({ "name": "docs", "embedding_dim": 3, "index_config": { "type": "flat" } }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let library_id = library["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            create_router(state.clone()),
            "POST",
            &format!("/libraries/{library_id}/chunks"),
            json!({ "text": "hello", "embedding": [1.0, 0.0, 0.0] }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, hits) = send(
            create_router(state.clone()),
            "POST",
            &format!("/libraries/{library_id}/search"),
            json!({ "query": [1.0, 0.0, 0.0], "k": 5 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hits.as_array().unwrap().len(), 1);

        let (status, _) = send(
            create_router(state.clone()),
            "DELETE",
            &format!("/libraries/{library_id}"),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            create_router(state),
            "GET",
            &format!("/libraries/{library_id}"),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let service = Arc::new(VectorService::new());
        let state = AppState::new(service, None);

        // Zero dim → validation → 400.
        let (status, body) = send(
            create_router(state.clone()),
            "POST",
            "/libraries",
            json!({ "name": "bad", "embedding_dim": 0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");

        // Negative k → validation → 400.
        let (_, library) = send(
            create_router(state.clone()),
            "POST",
            "/libraries",
            json!({ "name": "ok", "embedding_dim": 2 }),
        )
        .await;
        let library_id = library["id"].as_str().unwrap().to_string();
        let (status, _) = send(
            create_router(state.clone()),
            "POST",
            &format!("/libraries/{library_id}/search"),
            json!({ "query": [1.0, 0.0], "k": -1 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Stale expected_version → conflict → 409.
        let (status, _) = send(
            create_router(state),
            "PUT",
            &format!("/libraries/{library_id}/config"),
            json!({ "index_config": { "type": "flat" }, "expected_version": 99 }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
