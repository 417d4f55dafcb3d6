pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod test_support;

use axum::{Router, routing::{get, post}};
use std::sync::Arc;
use utoipa::OpenApi;
use agent::ExecutionAgent;
use config::Config;
use handlers::{health::health, readiness::readiness, jobs::get_job, agent::{job_update, step_update}, patches, sites};
use services::patches::PatchSource;
use store::Store;
use crate::telemetry::metrics_handler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub agent: Arc<dyn ExecutionAgent>,
    pub patch_source: Arc<dyn PatchSource>,
    pub config: Arc<Config>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::sites::create_site,
        handlers::sites::list_sites,
        handlers::sites::creation_options,
        handlers::sites::site_exists,
        handlers::sites::get_site,
        handlers::sites::list_jobs,
        handlers::sites::list_running_jobs,
        handlers::sites::list_backups,
        handlers::sites::backup,
        handlers::sites::list_domains,
        handlers::sites::add_domain,
        handlers::sites::list_activities,
        handlers::sites::analytics,
        handlers::sites::login,
        handlers::sites::archive,
        handlers::sites::update_config,
        handlers::jobs::get_job,
        handlers::patches::create_patch,
        handlers::patches::list_patches,
        handlers::patches::get_patch,
        handlers::patches::apply_patch,
        handlers::patches::revert_patch,
        handlers::agent::job_update,
        handlers::agent::step_update,
    ),
    components(schemas(
        error::ApiErrorBody,
        handlers::health::HealthResponse,
        handlers::readiness::ReadinessResponse,
        handlers::sites::CreateSiteResponse,
        handlers::sites::ExistsResponse,
        handlers::sites::AddDomainRequest,
        handlers::sites::LoginResponse,
        handlers::sites::ConfigPatch,
        handlers::patches::CreatePatchRequest,
        services::sites::NewSiteRequest,
        services::sites::SiteCreationOptions,
        services::patches::PatchSpec,
        services::patches::DistributionReport,
        services::patches::CreatedPatch,
        services::patches::BenchFailure,
        services::patches::PatchAction,
        services::analytics::SiteAnalytics,
        services::analytics::UptimePoint,
        services::jobs::JobUpdate,
        services::jobs::StepReport,
        models::JobStatus, models::JobType, models::PatchStatus, models::SiteStatus,
        models::DomainStatus, models::BackupStatus,
        models::JobSummary, models::JobDetail, models::StepDetail, models::PatchSummary,
        models::SiteSummary, models::SiteDetail, models::InstalledApp, models::AppSource,
        models::DomainSummary, models::BackupSummary, models::ActivitySummary,
    )),
    tags( (name = "control-plane", description = "Site hosting control plane API") )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route("/sites", post(sites::create_site).get(sites::list_sites))
        .route("/sites/options", get(sites::creation_options))
        .route("/sites/exists/:subdomain", get(sites::site_exists))
        .route("/sites/:name", get(sites::get_site))
        .route("/sites/:name/jobs", get(sites::list_jobs))
        .route("/sites/:name/jobs/running", get(sites::list_running_jobs))
        .route("/sites/:name/backups", get(sites::list_backups).post(sites::backup))
        .route("/sites/:name/domains", get(sites::list_domains).post(sites::add_domain))
        .route("/sites/:name/activities", get(sites::list_activities))
        .route("/sites/:name/analytics", get(sites::analytics))
        .route("/sites/:name/login", post(sites::login))
        .route("/sites/:name/archive", post(sites::archive))
        .route("/sites/:name/config", axum::routing::patch(sites::update_config))
        .route("/jobs/:id", get(get_job))
        .route("/patches", post(patches::create_patch).get(patches::list_patches))
        .route("/patches/:name", get(patches::get_patch))
        .route("/patches/:name/apply", post(patches::apply_patch))
        .route("/patches/:name/revert", post(patches::revert_patch))
        .route("/agent/jobs/:id", post(job_update))
        .route("/agent/jobs/:id/steps", post(step_update))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::{Request, StatusCode}, body::Body};
    use tower::util::ServiceExt;
    use serde_json::json;
    use crate::telemetry::normalize_path;

    #[tokio::test]
    async fn health_ok() {
        let app = build_router(test_support::test_state().state);
        let res = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], json!("ok"));
    }

    #[tokio::test]
    async fn readiness_against_memory_store() {
        let app = build_router(test_support::test_state().state);
        let res = app.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn openapi_lists_patch_routes() {
        let app = build_router(test_support::test_state().state);
        let res = app.oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v["paths"]["/patches"].is_object());
        assert!(v["paths"]["/sites/{name}/analytics"].is_object());
    }

    #[test]
    fn metric_paths_are_normalized() {
        assert_eq!(normalize_path("/sites/acme.example.com/jobs/running"), "/sites/:name/jobs/running");
        assert_eq!(normalize_path("/sites/options"), "/sites/options");
        assert_eq!(normalize_path("/sites/exists/acme"), "/sites/exists/:subdomain");
        assert_eq!(normalize_path("/patches/b1-p2/apply"), "/patches/:name/apply");
        assert_eq!(normalize_path("/jobs/6a1f0c52-6d5a-4a9b-8f5c-0f0e7c1d2b3a"), "/jobs/:id");
        assert_eq!(normalize_path("/agent/jobs/6a1f/steps"), "/agent/jobs/:id/steps");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/patches"), "/patches");
    }
}
