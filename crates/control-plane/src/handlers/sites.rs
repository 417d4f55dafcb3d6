use axum::{Json, http::{HeaderMap, StatusCode}, extract::{Path, Query, State}};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use crate::{AppState, error::ApiResult, models::*, services};
use crate::services::{analytics::{Period, SiteAnalytics}, sites::{NewSiteRequest, SiteCreationOptions}};
use super::actor;

#[derive(Serialize, ToSchema)]
pub struct CreateSiteResponse { pub name: String }

/// Create a site on the newest active bench of a release group
#[utoipa::path(post, path = "/sites", request_body = NewSiteRequest, responses( (status=201, body=CreateSiteResponse), (status=400, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, headers, req), fields(subdomain=%req.name))]
pub async fn create_site(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<NewSiteRequest>) -> ApiResult<(StatusCode, Json<CreateSiteResponse>)> {
    let name = services::sites::create_site(&state, req, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(CreateSiteResponse { name })))
}

#[utoipa::path(get, path = "/sites", responses( (status=200, body=[SiteSummary]) ))]
pub async fn list_sites(State(state): State<AppState>) -> ApiResult<Json<Vec<SiteSummary>>> {
    Ok(Json(services::sites::list_sites(state.store.as_ref()).await?))
}

/// Release group, apps and domain a new site would get
#[utoipa::path(get, path = "/sites/options", responses( (status=200, body=SiteCreationOptions), (status=404, body=crate::error::ApiErrorBody, description="no default release group") ))]
pub async fn creation_options(State(state): State<AppState>) -> ApiResult<Json<SiteCreationOptions>> {
    Ok(Json(services::sites::creation_options(&state).await?))
}

#[derive(Serialize, ToSchema)]
pub struct ExistsResponse { pub exists: bool }

#[utoipa::path(get, path = "/sites/exists/{subdomain}", params( ("subdomain" = String, Path, description = "Subdomain to check") ), responses( (status=200, body=ExistsResponse) ))]
pub async fn site_exists(State(state): State<AppState>, Path(subdomain): Path<String>) -> ApiResult<Json<ExistsResponse>> {
    Ok(Json(ExistsResponse { exists: services::sites::site_exists(state.store.as_ref(), &subdomain).await? }))
}

#[utoipa::path(get, path = "/sites/{name}", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=SiteDetail), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="debug", skip(state))]
pub async fn get_site(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<SiteDetail>> {
    Ok(Json(services::sites::get_site(state.store.as_ref(), &name).await?))
}

/// Ten most recent jobs of a site
#[utoipa::path(get, path = "/sites/{name}/jobs", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=[JobSummary]), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn list_jobs(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<JobSummary>>> {
    Ok(Json(services::sites::list_jobs(state.store.as_ref(), &name).await?))
}

/// Pending and Running jobs of a site, oldest first, with steps
#[utoipa::path(get, path = "/sites/{name}/jobs/running", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=[JobDetail]), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn list_running_jobs(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<JobDetail>>> {
    Ok(Json(services::sites::list_running_jobs(state.store.as_ref(), &name).await?))
}

#[utoipa::path(get, path = "/sites/{name}/backups", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=[BackupSummary]), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn list_backups(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<BackupSummary>>> {
    Ok(Json(services::sites::list_backups(state.store.as_ref(), &name).await?))
}

/// Take a backup of the site database
#[utoipa::path(post, path = "/sites/{name}/backups", params( ("name" = String, Path, description = "Site name") ), responses( (status=202, body=JobSummary), (status=404, body=crate::error::ApiErrorBody), (status=502, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, headers))]
pub async fn backup(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>) -> ApiResult<(StatusCode, Json<JobSummary>)> {
    let job = services::sites::backup(&state, &name, &actor(&headers)).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[utoipa::path(get, path = "/sites/{name}/domains", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=[DomainSummary]), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn list_domains(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<DomainSummary>>> {
    Ok(Json(services::sites::list_domains(state.store.as_ref(), &name).await?))
}

#[derive(Deserialize, ToSchema)]
pub struct AddDomainRequest { pub domain: String }

#[utoipa::path(post, path = "/sites/{name}/domains", request_body = AddDomainRequest, params( ("name" = String, Path, description = "Site name") ), responses( (status=201, body=DomainSummary), (status=400, body=crate::error::ApiErrorBody, description="domain already in use"), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, headers, req), fields(domain=%req.domain))]
pub async fn add_domain(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>, Json(req): Json<AddDomainRequest>) -> ApiResult<(StatusCode, Json<DomainSummary>)> {
    let domain = services::sites::add_domain(&state, &name, &req.domain, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(domain)))
}

#[utoipa::path(get, path = "/sites/{name}/activities", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=[ActivitySummary]), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn list_activities(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<ActivitySummary>>> {
    Ok(Json(services::sites::list_activities(state.store.as_ref(), &name).await?))
}

#[derive(Deserialize, ToSchema)]
pub struct AnalyticsQuery { pub period: Option<String> }

/// Request, job and uptime series for a site; `period` defaults to "1 hour"
#[utoipa::path(get, path = "/sites/{name}/analytics",
    params( ("name" = String, Path, description = "Site name"), ("period" = Option<String>, Query, description = "1 hour | 6 hours | 24 hours | 7 days | 30 days") ),
    responses( (status=200, body=SiteAnalytics), (status=400, body=crate::error::ApiErrorBody, description="unknown period"), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="debug", skip(state, q), fields(period=?q.period))]
pub async fn analytics(State(state): State<AppState>, Path(name): Path<String>, Query(q): Query<AnalyticsQuery>) -> ApiResult<Json<SiteAnalytics>> {
    let period: Period = q.period.as_deref().unwrap_or("1 hour").parse()?;
    Ok(Json(services::analytics::aggregate(state.store.as_ref(), &name, period, Utc::now()).await?))
}

#[derive(Serialize, ToSchema)]
pub struct LoginResponse { pub sid: String }

/// Administrator session on the site
#[utoipa::path(post, path = "/sites/{name}/login", params( ("name" = String, Path, description = "Site name") ), responses( (status=200, body=LoginResponse), (status=404, body=crate::error::ApiErrorBody), (status=502, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, headers))]
pub async fn login(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>) -> ApiResult<Json<LoginResponse>> {
    let sid = services::sites::login(&state, &name, &actor(&headers)).await?;
    Ok(Json(LoginResponse { sid }))
}

#[utoipa::path(post, path = "/sites/{name}/archive", params( ("name" = String, Path, description = "Site name") ), responses( (status=202, body=JobSummary), (status=400, body=crate::error::ApiErrorBody, description="already archived"), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, headers))]
pub async fn archive(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>) -> ApiResult<(StatusCode, Json<JobSummary>)> {
    let job = services::sites::archive(&state, &name, &actor(&headers)).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ConfigPatch(#[schema(value_type = Object)] pub serde_json::Map<String, serde_json::Value>);

/// Merge keys into the site config and push it to the bench
#[utoipa::path(patch, path = "/sites/{name}/config", request_body = ConfigPatch, params( ("name" = String, Path, description = "Site name") ), responses( (status=202, body=JobSummary), (status=400, body=crate::error::ApiErrorBody, description="config updates disabled"), (status=404, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state, headers, patch), fields(keys=patch.0.len()))]
pub async fn update_config(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>, Json(patch): Json<ConfigPatch>) -> ApiResult<(StatusCode, Json<JobSummary>)> {
    let job = services::sites::update_config(&state, &name, patch.0, &actor(&headers)).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}
