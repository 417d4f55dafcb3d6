//! Time-bucketed site analytics over the request, job and uptime logs.
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use utoipa::ToSchema;
use crate::error::{Error, Result};
use crate::store::Store;

/// Lookback periods offered to callers, each with a fixed bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum Period {
    #[serde(rename = "1 hour")] Hour,
    #[serde(rename = "6 hours")] SixHours,
    #[serde(rename = "24 hours")] Day,
    #[serde(rename = "7 days")] Week,
    #[serde(rename = "30 days")] Month,
}

impl Period {
    pub fn window_seconds(&self) -> i64 {
        match self { Self::Hour => 60, Self::SixHours => 300, Self::Day => 1800, Self::Week => 3600, Self::Month => 43200 }
    }

    pub fn lookback(&self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::SixHours => Duration::hours(6),
            Self::Day => Duration::hours(24),
            Self::Week => Duration::days(7),
            Self::Month => Duration::days(30),
        }
    }
}

impl FromStr for Period {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1 hour" => Ok(Self::Hour),
            "6 hours" => Ok(Self::SixHours),
            "24 hours" => Ok(Self::Day),
            "7 days" => Ok(Self::Week),
            "30 days" => Ok(Self::Month),
            other => Err(Error::invalid(format!("unknown analytics period '{other}'"))),
        }
    }
}

/// Start of the `window_seconds`-wide bucket containing `ts`.
pub fn bucket_start(ts: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(window_seconds) * window_seconds;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point<T> { pub timestamp: DateTime<Utc>, pub value: T }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UptimePoint {
    pub timestamp: DateTime<Utc>,
    pub web: Option<f64>,
    pub scheduler: Option<f64>,
    pub socketio: Option<f64>,
}

/// Sparse series, ascending by bucket. Buckets without rows are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SiteAnalytics {
    #[schema(value_type = Vec<Object>)]
    pub request_count: Vec<Point<i64>>,
    #[schema(value_type = Vec<Object>)]
    pub request_cpu_time: Vec<Point<f64>>,
    #[schema(value_type = Vec<Object>)]
    pub job_count: Vec<Point<i64>>,
    #[schema(value_type = Vec<Object>)]
    pub job_cpu_time: Vec<Point<f64>>,
    pub uptime: Vec<UptimePoint>,
}

/// Count and summed duration per bucket.
fn count_and_sum(rows: impl Iterator<Item = (DateTime<Utc>, f64)>, width: i64) -> (Vec<Point<i64>>, Vec<Point<f64>>) {
    let mut buckets: BTreeMap<DateTime<Utc>, (i64, f64)> = BTreeMap::new();
    for (ts, duration) in rows {
        let slot = buckets.entry(bucket_start(ts, width)).or_insert((0, 0.0));
        slot.0 += 1;
        slot.1 += duration;
    }
    buckets.into_iter()
        .map(|(timestamp, (n, sum))| (Point { timestamp, value: n }, Point { timestamp, value: sum }))
        .unzip()
}

#[derive(Default)]
struct Mean { sum: f64, n: u32 }

impl Mean {
    fn add(&mut self, v: Option<f64>) { if let Some(v) = v { self.sum += v; self.n += 1; } }
    fn value(&self) -> Option<f64> { (self.n > 0).then(|| self.sum / self.n as f64) }
}

pub async fn aggregate(store: &dyn Store, site: &str, period: Period, now: DateTime<Utc>) -> Result<SiteAnalytics> {
    if store.get_site(site).await?.is_none() { return Err(Error::not_found("site", site)); }
    let since = now - period.lookback();
    let width = period.window_seconds();

    let requests = store.request_logs(site, since).await?;
    let (request_count, request_cpu_time) = count_and_sum(requests.iter().map(|r| (r.timestamp, r.duration)), width);
    let job_rows = store.job_logs(site, since).await?;
    let (job_count, job_cpu_time) = count_and_sum(job_rows.iter().map(|r| (r.timestamp, r.duration)), width);

    let mut uptime: BTreeMap<DateTime<Utc>, [Mean; 3]> = BTreeMap::new();
    for row in store.uptime_logs(site, since).await? {
        let slot = uptime.entry(bucket_start(row.timestamp, width)).or_default();
        slot[0].add(row.web);
        slot[1].add(row.scheduler);
        slot[2].add(row.socketio);
    }
    let uptime = uptime.into_iter()
        .map(|(timestamp, [web, scheduler, socketio])| UptimePoint { timestamp, web: web.value(), scheduler: scheduler.value(), socketio: socketio.value() })
        .collect();

    Ok(SiteAnalytics { request_count, request_cpu_time, job_count, job_cpu_time, uptime })
}
