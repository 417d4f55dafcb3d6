use control_plane::{build_router, models::*, services::{jobs::{self, NewJob}, patches::{self, PatchSpec}}};
use control_plane::{error::Error, store::{JobFilter, JobRepository, PatchRepository, SiteDirectory}};
use control_plane::test_support::{at, test_state};
use axum::{body::Body, http::{Request, StatusCode}, Router};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder().method("POST").uri(uri).header("content-type", "application/json").body(Body::from(body.to_string())).unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let res = app.clone().oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn running_job_carries_a_start_time() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    let job = jobs::create_job(&t.state, NewJob::new(JobType::BackupSite).site(&site)).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    let app = build_router(t.state.clone());

    let (status, v) = post(&app, &format!("/agent/jobs/{}", job.id), json!({"status":"Running"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["status"], "Running");
    assert!(v["start"].is_string());
    assert!(v["end"].is_null());

    let (_, running) = get(&app, &format!("/sites/{site}/jobs/running")).await;
    assert_eq!(running.as_array().unwrap().len(), 1);
    assert!(running[0]["start"].is_string());
}

#[tokio::test]
async fn terminal_status_is_never_overwritten() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    let job = jobs::create_job(&t.state, NewJob::new(JobType::BackupSite).site(&site)).await.unwrap();
    let app = build_router(t.state.clone());
    let uri = format!("/agent/jobs/{}", job.id);

    assert_eq!(post(&app, &uri, json!({"status":"Running"})).await.0, StatusCode::OK);
    let (status, done) = post(&app, &uri, json!({"status":"Success"})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(done["end"].is_string());

    let (status, body) = post(&app, &uri, json!({"status":"Failure"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
    let (status, body) = post(&app, &uri, json!({"status":"Running"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    // re-reporting the same terminal status is accepted and changes nothing
    let (status, again) = post(&app, &uri, json!({"status":"Success"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["end"], done["end"]);

    let (_, stored) = get(&app, &format!("/jobs/{}", job.id)).await;
    assert_eq!(stored["status"], "Success");
}

#[tokio::test]
async fn steps_come_back_in_creation_order() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    let job = jobs::create_job(&t.state, NewJob::new(JobType::NewSite).site(&site)).await.unwrap();
    let app = build_router(t.state.clone());
    let steps_uri = format!("/agent/jobs/{}/steps", job.id);

    let (status, first) = post(&app, &steps_uri, json!({"step_name":"Create Database","status":"Running"})).await;
    assert_eq!(status, StatusCode::OK);
    post(&app, &steps_uri, json!({"step_name":"Install Apps","status":"Pending"})).await;
    post(&app, &steps_uri, json!({"step_name":"Update Config","status":"Pending"})).await;
    let step_id = first["id"].as_str().unwrap();
    let (status, finished) = post(&app, &steps_uri, json!({"step":step_id,"step_name":"Create Database","status":"Success","output":"ok"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["status"], "Success");

    let (_, detail) = get(&app, &format!("/jobs/{}", job.id)).await;
    let names: Vec<&str> = detail["steps"].as_array().unwrap().iter().map(|s| s["step_name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["Create Database", "Install Apps", "Update Config"]);
    assert_eq!(detail["steps"][0]["output"], "ok");
}

#[tokio::test]
async fn steps_of_a_finished_job_are_frozen() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    let job = jobs::create_job(&t.state, NewJob::new(JobType::BackupSite).site(&site)).await.unwrap();
    let app = build_router(t.state.clone());
    post(&app, &format!("/agent/jobs/{}", job.id), json!({"status":"Failure"})).await;
    let (status, _) = post(&app, &format!("/agent/jobs/{}/steps", job.id), json!({"step_name":"Late","status":"Running"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callbacks_for_an_unknown_job_are_404() {
    let t = test_state();
    let app = build_router(t.state.clone());
    let (status, body) = post(&app, &format!("/agent/jobs/{}", Uuid::new_v4()), json!({"status":"Running"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn apply_success_marks_the_patch_applied_and_revert_undoes_it() {
    let t = test_state();
    t.seed_group();
    let spec = PatchSpec { patch: Some("--- diff ---".into()), patch_bench: Some("b1".into()), ..Default::default() };
    let report = patches::distribute(&t.state, "g1", "erpnext", &spec).await.unwrap();
    let app = build_router(t.state.clone());
    let job_uri = format!("/agent/jobs/{}", report.created[0].job);
    post(&app, &job_uri, json!({"status":"Running"})).await;
    post(&app, &job_uri, json!({"status":"Success"})).await;
    assert_eq!(t.store.get_patch("b1-p").await.unwrap().unwrap().status, PatchStatus::Applied);

    // applying again has nothing to do
    let (status, action) = post(&app, "/patches/b1-p/apply", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(action["job"].is_null());

    let (_, action) = post(&app, "/patches/b1-p/revert", json!({})).await;
    assert_eq!(action["status"], "In Progress");
    let revert_uri = format!("/agent/jobs/{}", action["job"]["id"].as_str().unwrap());
    post(&app, &revert_uri, json!({"status":"Running"})).await;
    post(&app, &revert_uri, json!({"status":"Success"})).await;
    assert_eq!(t.store.get_patch("b1-p").await.unwrap().unwrap().status, PatchStatus::NotApplied);
}

#[tokio::test]
async fn failed_new_site_job_marks_the_site_broken() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Pending);
    let job = jobs::create_job(&t.state, NewJob::new(JobType::NewSite).site(&site)).await.unwrap();
    let app = build_router(t.state.clone());
    post(&app, &format!("/agent/jobs/{}", job.id), json!({"status":"Failure"})).await;
    assert_eq!(t.store.get_site(&site).await.unwrap().unwrap().status, SiteStatus::Broken);
}

#[tokio::test]
async fn recent_jobs_are_newest_first_and_capped_at_ten() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    let other = t.site("other", SiteStatus::Active);
    let job = |id: u128, secs: i64, site: &str| Job {
        id: Uuid::from_u128(id), job_type: JobType::BackupSite, site: Some(site.into()), bench: None, patch: None,
        status: JobStatus::Success, created_at: at(secs), start: None, end: None,
    };
    for i in 0..11u128 {
        t.store.insert_job(&job(i + 1, 1_700_000_000 + i as i64, &site)).await.unwrap();
    }
    // same creation time as the newest job, ordered after it by id
    t.store.insert_job(&job(0xff, 1_700_000_010, &site)).await.unwrap();
    t.store.insert_job(&job(0x100, 1_700_000_100, &other)).await.unwrap();

    let recent = jobs::list_recent(t.state.store.as_ref(), &JobFilter::site(&site), 10).await.unwrap();
    let ids: Vec<u128> = recent.iter().map(|j| j.id.as_u128()).collect();
    assert_eq!(ids, vec![0xff, 11, 10, 9, 8, 7, 6, 5, 4, 3]);

    let app = build_router(t.state.clone());
    let (status, listed) = get(&app, &format!("/sites/{site}/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<&str> = listed.as_array().unwrap().iter().map(|j| j["id"].as_str().unwrap()).collect();
    let expected: Vec<String> = ids.iter().map(|id| Uuid::from_u128(*id).to_string()).collect();
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn failed_bench_lookup_leaves_no_job_behind() {
    let t = test_state();
    t.bench("b1", "g1", BenchStatus::Active, 60);
    t.store.set_benches_down(true);
    let err = jobs::create_job(&t.state, NewJob::new(JobType::ApplyPatch).bench("b1").patch("b1-p")).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)), "{err:?}");
    assert!(t.store.list_jobs(&JobFilter::patch("b1-p"), 10).await.unwrap().is_empty());
    assert!(t.agent.dispatched().is_empty());

    t.store.set_benches_down(false);
    jobs::create_job(&t.state, NewJob::new(JobType::ApplyPatch).bench("b1").patch("b1-p")).await.unwrap();
    assert_eq!(t.agent.dispatched()[0].server.as_deref(), Some("server-1"));
}
