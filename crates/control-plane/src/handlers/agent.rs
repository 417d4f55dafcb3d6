//! Callbacks the execution agent uses to report job and step progress.
use axum::{Json, extract::{Path, State}};
use uuid::Uuid;
use crate::{AppState, error::ApiResult, models::{JobDetail, StepDetail}, services::{self, jobs::{JobUpdate, StepReport}}};

/// Report a job status change
#[utoipa::path(post, path = "/agent/jobs/{id}", request_body = JobUpdate, params( ("id" = Uuid, Path, description = "Job id") ),
    responses( (status=200, body=JobDetail), (status=400, body=crate::error::ApiErrorBody, description="illegal transition"), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, update), fields(status=%update.status))]
pub async fn job_update(State(state): State<AppState>, Path(id): Path<Uuid>, Json(update): Json<JobUpdate>) -> ApiResult<Json<JobDetail>> {
    Ok(Json(services::jobs::record_job_update(&state, id, update).await?))
}

/// Report progress of one step of a job
#[utoipa::path(post, path = "/agent/jobs/{id}/steps", request_body = StepReport, params( ("id" = Uuid, Path, description = "Job id") ),
    responses( (status=200, body=StepDetail), (status=400, body=crate::error::ApiErrorBody), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="debug", skip(state, report), fields(step_name=%report.step_name))]
pub async fn step_update(State(state): State<AppState>, Path(id): Path<Uuid>, Json(report): Json<StepReport>) -> ApiResult<Json<StepDetail>> {
    Ok(Json(services::jobs::record_step_update(&state, id, report).await?))
}
