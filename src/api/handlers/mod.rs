use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::db::Database;
use crate::error::Error;
use crate::models::*;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Map an engine error to a response. Validation and lookup failures are
/// returned to the client as-is; everything else is logged and sanitized.
fn api_error(e: Error) -> (StatusCode, String) {
    match e {
        Error::Validation(msg) => {
            tracing::warn!("Validation error: {}", msg);
            (StatusCode::BAD_REQUEST, msg)
        }
        Error::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        other => {
            tracing::error!("Internal error: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn manifest_not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "Manifest not found".to_string())
}

fn require_manifest(db: &Database, id: Uuid) -> ApiResult<Manifest> {
    db.get_manifest(id)
        .map_err(api_error)?
        .ok_or_else(manifest_not_found)
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Manifests
// ============================================================

pub async fn list_manifests(State(db): State<Database>) -> ApiResult<Json<Vec<Manifest>>> {
    db.get_all_manifests().map(Json).map_err(api_error)
}

pub async fn get_manifest(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ManifestWithReleases>> {
    db.get_manifest_with_releases(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(manifest_not_found)
}

pub async fn create_manifest(
    State(db): State<Database>,
    Json(input): Json<CreateManifestInput>,
) -> ApiResult<(StatusCode, Json<ManifestWithReleases>)> {
    db.create_manifest(input)
        .map(|m| (StatusCode::CREATED, Json(m)))
        .map_err(api_error)
}

pub async fn update_manifest(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateManifestInput>,
) -> ApiResult<Json<Manifest>> {
    db.update_manifest(id, input)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(manifest_not_found)
}

pub async fn delete_manifest(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if db.delete_manifest(id).map_err(api_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(manifest_not_found())
    }
}

// ============================================================
// Releases
// ============================================================

pub async fn list_releases(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Release>>> {
    require_manifest(&db, id)?;
    db.get_releases(id).map(Json).map_err(api_error)
}

/// Responds 201 when a release was cut and 200 when the input changed nothing.
pub async fn create_release(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
    Json(input): Json<ReleaseInput>,
) -> ApiResult<(StatusCode, Json<ReleaseOutcome>)> {
    let outcome = db.release(id, input).map_err(api_error)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

pub async fn get_latest_release(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Release>> {
    db.get_latest_release(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(manifest_not_found)
}

pub async fn get_release(
    State(db): State<Database>,
    Path((id, version)): Path<(Uuid, u32)>,
) -> ApiResult<Json<Release>> {
    db.get_release(id, version)
        .map_err(api_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Release not found".to_string()))
}

// ============================================================
// Forks and Followers
// ============================================================

pub async fn fork_manifest(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
    Json(input): Json<CreateManifestInput>,
) -> ApiResult<(StatusCode, Json<ManifestWithReleases>)> {
    db.fork(id, input)
        .map(|m| (StatusCode::CREATED, Json(m)))
        .map_err(api_error)
}

pub async fn list_followers(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Manifest>>> {
    require_manifest(&db, id)?;
    db.get_followers(id).map(Json).map_err(api_error)
}

pub async fn add_follower(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
    Json(input): Json<CreateManifestInput>,
) -> ApiResult<(StatusCode, Json<ManifestWithReleases>)> {
    db.add_follower(id, input)
        .map(|m| (StatusCode::CREATED, Json(m)))
        .map_err(api_error)
}

pub async fn unfollow(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Manifest>> {
    db.unfollow(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(manifest_not_found)
}

pub async fn sync_follower(
    State(db): State<Database>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReleaseOutcome>> {
    db.sync_follower(id).map(Json).map_err(api_error)
}
