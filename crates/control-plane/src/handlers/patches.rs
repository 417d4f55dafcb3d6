use axum::{Json, http::StatusCode, extract::{Path, Query, State}};
use serde::Deserialize;
use utoipa::ToSchema;
use crate::{AppState, error::ApiResult, models::PatchSummary, services::{self, patches::{DistributionReport, PatchAction, PatchSpec}}, store::PatchFilter};

#[derive(Deserialize, ToSchema)]
pub struct CreatePatchRequest {
    pub release_group: String,
    pub app: String,
    #[serde(flatten)]
    pub spec: PatchSpec,
}

/// Create a patch on one bench or on every Active bench of a release group
///
/// Responds 201 when at least one patch was created, 200 with only failures otherwise.
#[utoipa::path(post, path = "/patches", request_body = CreatePatchRequest, responses(
    (status=201, body=DistributionReport, description="patches created"),
    (status=200, body=DistributionReport, description="no bench accepted the patch"),
    (status=400, body=crate::error::ApiErrorBody), (status=502, body=crate::error::ApiErrorBody, description="patch url could not be fetched") ))]
#[tracing::instrument(level="info", skip(state, req), fields(release_group=%req.release_group, app=%req.app))]
pub async fn create_patch(State(state): State<AppState>, Json(req): Json<CreatePatchRequest>) -> ApiResult<(StatusCode, Json<DistributionReport>)> {
    let report = services::patches::distribute(&state, &req.release_group, &req.app, &req.spec).await?;
    let status = if report.created.is_empty() { StatusCode::OK } else { StatusCode::CREATED };
    tracing::info!(created=report.created.len(), failed=report.failed.len(), "patch.distributed");
    Ok((status, Json(report)))
}

#[derive(Deserialize, ToSchema)]
pub struct PatchQuery { pub release_group: Option<String>, pub bench: Option<String> }

/// List patches, optionally by release group or bench
#[utoipa::path(get, path = "/patches", params( ("release_group" = Option<String>, Query, description = "Filter by release group"), ("bench" = Option<String>, Query, description = "Filter by bench") ), responses( (status=200, body=[PatchSummary]) ))]
#[tracing::instrument(level="debug", skip(state, q), fields(release_group=?q.release_group, bench=?q.bench))]
pub async fn list_patches(State(state): State<AppState>, Query(q): Query<PatchQuery>) -> ApiResult<Json<Vec<PatchSummary>>> {
    let filter = PatchFilter { release_group: q.release_group, bench: q.bench };
    Ok(Json(services::patches::list_patches(state.store.as_ref(), &filter).await?))
}

#[utoipa::path(get, path = "/patches/{name}", params( ("name" = String, Path, description = "Patch name") ), responses( (status=200, body=PatchSummary), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn get_patch(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<PatchSummary>> {
    Ok(Json(services::patches::get_patch(state.store.as_ref(), &name).await?))
}

/// Apply a patch to its bench
#[utoipa::path(post, path = "/patches/{name}/apply", params( ("name" = String, Path, description = "Patch name") ), responses( (status=200, body=PatchAction), (status=404, body=crate::error::ApiErrorBody), (status=502, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state))]
pub async fn apply_patch(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<PatchAction>> {
    Ok(Json(services::patches::apply_patch(&state, &name).await?))
}

/// Revert a patch on its bench
#[utoipa::path(post, path = "/patches/{name}/revert", params( ("name" = String, Path, description = "Patch name") ), responses( (status=200, body=PatchAction), (status=404, body=crate::error::ApiErrorBody), (status=502, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state))]
pub async fn revert_patch(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<PatchAction>> {
    Ok(Json(services::patches::revert_patch(&state, &name).await?))
}
