use control_plane::{build_router, config::Config, error::Error, models::*, services::{patches::StaticPatchSource, sites::{self, NewSiteRequest}}};
use control_plane::store::{JobFilter, JobRepository, SiteDirectory};
use control_plane::test_support::{test_config, test_state, TestState};
use axum::{body::Body, http::{Request, StatusCode}, Router};
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn request(name: &str) -> NewSiteRequest {
    NewSiteRequest { name: name.into(), group: "g1".into(), apps: vec!["frappe".into(), "erpnext".into()], backups: true, monitor: false }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri).header("x-actor", "ops@sites.test");
    let body = match body {
        Some(v) => { builder = builder.header("content-type", "application/json"); Body::from(v.to_string()) }
        None => Body::empty(),
    };
    let res = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn new_site_lands_on_the_newest_active_bench() {
    let t = test_state();
    t.seed_group();
    let name = sites::create_site(&t.state, request("acme"), "Administrator").await.unwrap();
    assert_eq!(name, "acme.sites.test");

    let site = t.store.get_site(&name).await.unwrap().unwrap();
    assert_eq!(site.bench, "b2");
    assert_eq!(site.status, SiteStatus::Pending);
    let jobs = t.store.list_jobs(&JobFilter::site(&name), 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JobType::NewSite);
    assert_eq!(jobs[0].bench.as_deref(), Some("b2"));
    let activities = t.store.list_activities(&name, 5).await.unwrap();
    assert_eq!(activities[0].action, "Create");
    assert!(sites::site_exists(t.state.store.as_ref(), "acme").await.unwrap());
}

#[tokio::test]
async fn taken_subdomain_and_empty_group_are_invalid() {
    let t = test_state();
    t.seed_group();
    sites::create_site(&t.state, request("acme"), "Administrator").await.unwrap();
    let err = sites::create_site(&t.state, request("acme"), "Administrator").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let mut req = request("fresh");
    req.group = "g-empty".into();
    let err = sites::create_site(&t.state, req, "Administrator").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("no active bench")));
}

#[tokio::test]
async fn site_flows_over_http() {
    let t = test_state();
    t.seed_group();
    let app = build_router(t.state.clone());

    let (status, created) = call(&app, "POST", "/sites", Some(json!({"name":"acme","group":"g1","apps":["frappe","erpnext"]}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let name = created["name"].as_str().unwrap().to_string();

    let (status, detail) = call(&app, "GET", &format!("/sites/{name}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "Pending");
    assert_eq!(detail["installed_apps"].as_array().unwrap().len(), 2);

    let (status, _) = call(&app, "POST", &format!("/sites/{name}/backups"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, backups) = call(&app, "GET", &format!("/sites/{name}/backups"), None).await;
    assert_eq!(backups[0]["status"], "Pending");

    let (status, domain) = call(&app, "POST", &format!("/sites/{name}/domains"), Some(json!({"domain":"ERP.Acme.test"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(domain["domain"], "erp.acme.test");
    let (status, body) = call(&app, "POST", &format!("/sites/{name}/domains"), Some(json!({"domain":"erp.acme.test"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, login) = call(&app, "POST", &format!("/sites/{name}/login"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(login["sid"].as_str().is_some_and(|s| !s.is_empty()));

    let (_, jobs) = call(&app, "GET", &format!("/sites/{name}/jobs"), None).await;
    let mut types: Vec<&str> = jobs.as_array().unwrap().iter().map(|j| j["job_type"].as_str().unwrap()).collect();
    types.sort();
    assert_eq!(types, vec!["Add Domain", "Backup Site", "New Site"]);

    let (_, activities) = call(&app, "GET", &format!("/sites/{name}/activities"), None).await;
    let activities = activities.as_array().unwrap();
    assert_eq!(activities.len(), 4);
    assert!(activities.iter().all(|a| a["owner"] == "ops@sites.test"));
    assert!(activities.iter().any(|a| a["action"] == "Login as Administrator"));

    let (_, listed) = call(&app, "GET", "/sites", None).await;
    assert_eq!(listed[0]["name"], name.as_str());
}

#[tokio::test]
async fn archive_completes_through_the_job_callback() {
    let t = test_state();
    t.seed_group();
    let name = t.site("acme", SiteStatus::Active);
    let app = build_router(t.state.clone());

    let (status, job) = call(&app, "POST", &format!("/sites/{name}/archive"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_uri = format!("/agent/jobs/{}", job["id"].as_str().unwrap());
    call(&app, "POST", &job_uri, Some(json!({"status":"Running"}))).await;
    call(&app, "POST", &job_uri, Some(json!({"status":"Success"}))).await;
    assert_eq!(t.store.get_site(&name).await.unwrap().unwrap().status, SiteStatus::Archived);

    let (status, _) = call(&app, "POST", &format!("/sites/{name}/archive"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rejected_archive_leaves_the_site_untouched() {
    let t = test_state();
    t.seed_group();
    let name = t.site("acme", SiteStatus::Active);
    t.agent.set_rejecting(true);

    let err = sites::archive(&t.state, &name, "Administrator").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamAgent { .. }), "{err:?}");
    assert_eq!(t.store.get_site(&name).await.unwrap().unwrap().status, SiteStatus::Active);
    let jobs = t.store.list_jobs(&JobFilter::site(&name), 10).await.unwrap();
    assert_eq!((jobs[0].job_type, jobs[0].status), (JobType::ArchiveSite, JobStatus::Failure));

    // the backup record exists only for its job and fails with it
    sites::backup(&t.state, &name, "Administrator").await.unwrap_err();
    assert_eq!(t.store.list_backups(&name, 5).await.unwrap()[0].status, BackupStatus::Failure);
    assert_eq!(t.store.get_site(&name).await.unwrap().unwrap().status, SiteStatus::Active);

    t.agent.set_rejecting(false);
    let job = sites::archive(&t.state, &name, "Administrator").await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn unknown_site_is_404_everywhere() {
    let t = test_state();
    t.seed_group();
    let app = build_router(t.state.clone());
    let ghost = "ghost.sites.test";
    for (method, path) in [
        ("GET", ""), ("GET", "/jobs"), ("GET", "/jobs/running"), ("GET", "/backups"), ("POST", "/backups"),
        ("GET", "/domains"), ("GET", "/activities"), ("POST", "/login"), ("POST", "/archive"),
    ] {
        let (status, body) = call(&app, method, &format!("/sites/{ghost}{path}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {path}");
        assert_eq!(body["code"], "not_found");
    }
    let (status, _) = call(&app, "POST", &format!("/sites/{ghost}/domains"), Some(json!({"domain":"x.test"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn creation_options_follow_the_group_order() {
    let t = test_state();
    t.seed_group();
    let app = build_router(t.state.clone());
    let (status, opts) = call(&app, "GET", "/sites/options", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(opts["domain"], "sites.test");
    assert_eq!(opts["group"], "g1");
    assert_eq!(opts["apps"][0]["name"], "frappe");
    assert_eq!(opts["apps"][1]["name"], "erpnext");

    let (_, exists) = call(&app, "GET", "/sites/exists/acme", None).await;
    assert_eq!(exists["exists"], false);
}

#[tokio::test]
async fn config_updates_are_off_unless_enabled() {
    let t = test_state();
    t.seed_group();
    let name = t.site("acme", SiteStatus::Active);
    let app = build_router(t.state.clone());
    let (status, body) = call(&app, "PATCH", &format!("/sites/{name}/config"), Some(json!({"maintenance_mode": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "site config updates are disabled");
    assert_eq!(t.store.get_site(&name).await.unwrap().unwrap().config, json!({}));

    let enabled = TestState::new(Config { site_config_updates: true, ..test_config() }, StaticPatchSource::default());
    enabled.seed_group();
    let name = enabled.site("acme", SiteStatus::Active);
    let app = build_router(enabled.state.clone());
    let (status, job) = call(&app, "PATCH", &format!("/sites/{name}/config"), Some(json!({"maintenance_mode": 1}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["job_type"], "Update Site Configuration");
    call(&app, "PATCH", &format!("/sites/{name}/config"), Some(json!({"allow_tests": true}))).await;
    let site = enabled.store.get_site(&name).await.unwrap().unwrap();
    assert_eq!(site.config, json!({"maintenance_mode": 1, "allow_tests": true}));
}

#[tokio::test]
async fn login_failure_surfaces_as_upstream_error() {
    let t = test_state();
    t.seed_group();
    let name = t.site("acme", SiteStatus::Active);
    t.agent.set_rejecting(true);
    let err = sites::login(&t.state, &name, "Administrator").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamAgent { .. }));
    assert!(t.store.list_activities(&name, 5).await.unwrap().is_empty());
}
