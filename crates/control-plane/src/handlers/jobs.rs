use axum::{Json, extract::{Path, State}};
use uuid::Uuid;
use crate::{AppState, error::ApiResult, models::JobDetail, services};

/// Job with its steps in creation order
#[utoipa::path(get, path = "/jobs/{id}", params( ("id" = Uuid, Path, description = "Job id") ), responses( (status=200, body=JobDetail), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="debug", skip(state))]
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<JobDetail>> {
    Ok(Json(services::jobs::get_job(state.store.as_ref(), id).await?))
}
