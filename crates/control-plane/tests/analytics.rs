use control_plane::{build_router, models::*, services::analytics::{self, Period}};
use control_plane::test_support::{at, test_state};
use axum::{body::Body, http::{Request, StatusCode}};
use chrono::{Duration, Utc};
use tower::util::ServiceExt;

const NOW: i64 = 1_700_003_640;

#[tokio::test]
async fn requests_in_one_minute_share_a_bucket() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    // NOW is minute-aligned
    for (secs, duration) in [(NOW - 20, 0.25), (NOW - 5, 0.5), (NOW - 90, 1.0)] {
        t.store.add_request_log(RequestLog { site: site.clone(), timestamp: at(secs), duration });
    }
    let out = analytics::aggregate(t.state.store.as_ref(), &site, Period::Hour, at(NOW)).await.unwrap();
    assert_eq!(out.request_count.len(), 2);
    assert_eq!(out.request_count[0].timestamp, at(NOW - 120));
    assert_eq!(out.request_count[0].value, 1);
    assert_eq!(out.request_count[1].timestamp, at(NOW - 60));
    assert_eq!(out.request_count[1].value, 2);
    assert_eq!(out.request_cpu_time[1].value, 0.75);
    assert!(out.job_count.is_empty());
}

#[tokio::test]
async fn rows_outside_the_lookback_are_ignored() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    t.store.add_job_log(JobLog { site: site.clone(), timestamp: at(NOW - 3600), duration: 2.0 });
    t.store.add_job_log(JobLog { site: site.clone(), timestamp: at(NOW - 3601), duration: 9.0 });
    t.store.add_job_log(JobLog { site: "other.sites.test".into(), timestamp: at(NOW - 10), duration: 9.0 });
    let out = analytics::aggregate(t.state.store.as_ref(), &site, Period::Hour, at(NOW)).await.unwrap();
    assert_eq!(out.job_count.len(), 1);
    assert_eq!(out.job_cpu_time[0].value, 2.0);
}

#[tokio::test]
async fn uptime_signals_average_independently() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    t.store.add_uptime_log(UptimeLog { site: site.clone(), timestamp: at(NOW - 30), web: Some(1.0), scheduler: Some(0.0), socketio: None });
    t.store.add_uptime_log(UptimeLog { site: site.clone(), timestamp: at(NOW - 10), web: Some(0.0), scheduler: Some(0.0), socketio: None });
    let out = analytics::aggregate(t.state.store.as_ref(), &site, Period::Hour, at(NOW)).await.unwrap();
    assert_eq!(out.uptime.len(), 1);
    assert_eq!(out.uptime[0].web, Some(0.5));
    assert_eq!(out.uptime[0].scheduler, Some(0.0));
    assert_eq!(out.uptime[0].socketio, None);
}

#[tokio::test]
async fn analytics_route_on_an_empty_site_returns_empty_series() {
    let t = test_state();
    let site = t.site("quiet", SiteStatus::Active);
    let app = build_router(t.state.clone());
    let uri = format!("/sites/{site}/analytics?period=24%20hours");
    let res = app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    for key in ["request_count", "request_cpu_time", "job_count", "job_cpu_time", "uptime"] {
        assert_eq!(v[key], serde_json::json!([]), "{key} should be empty");
    }
}

#[tokio::test]
async fn analytics_route_buckets_recent_requests() {
    let t = test_state();
    let site = t.site("busy", SiteStatus::Active);
    let recent = Utc::now() - Duration::minutes(5);
    t.store.add_request_log(RequestLog { site: site.clone(), timestamp: recent, duration: 0.1 });
    let app = build_router(t.state.clone());
    let res = app.oneshot(Request::builder().uri(format!("/sites/{site}/analytics")).body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["request_count"][0]["value"], 1);
}

#[tokio::test]
async fn unknown_period_is_400_and_unknown_site_is_404() {
    let t = test_state();
    let site = t.site("acme", SiteStatus::Active);
    let app = build_router(t.state.clone());
    let res = app.clone().oneshot(Request::builder().uri(format!("/sites/{site}/analytics?period=2%20hours")).body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let res = app.oneshot(Request::builder().uri("/sites/ghost.sites.test/analytics").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
