//! Patch resolution and distribution across benches.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use crate::{AppState, error::{Error, Result}};
use crate::models::*;
use crate::services::jobs::{self, NewJob};
use crate::store::{JobFilter, PatchFilter, Store};
use crate::telemetry::PATCHES_CREATED;

/// Where patch text comes from when it is not given inline.
#[async_trait]
pub trait PatchSource: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpPatchSource { client: reqwest::Client, max_bytes: usize }

impl HttpPatchSource {
    /// Every fetch is bounded by `timeout` and by `max_bytes` of body; running
    /// past either surfaces as [`Error::Fetch`].
    pub fn new(timeout: Duration, max_bytes: usize) -> anyhow::Result<Self> {
        Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()?, max_bytes })
    }
}

#[async_trait]
impl PatchSource for HttpPatchSource {
    async fn fetch(&self, url: &str) -> Result<String> {
        let fetch_err = |reason: String| Error::Fetch { url: url.to_string(), reason };
        let mut resp = self.client.get(url).send().await.map_err(|e| fetch_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() { return Err(fetch_err(format!("status {status}"))); }
        let too_large = || fetch_err(format!("body exceeds {} bytes", self.max_bytes));
        if resp.content_length().is_some_and(|len| len > self.max_bytes as u64) { return Err(too_large()); }
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| fetch_err(e.to_string()))? {
            if body.len() + chunk.len() > self.max_bytes { return Err(too_large()); }
            body.extend_from_slice(&chunk);
        }
        String::from_utf8(body).map_err(|e| fetch_err(e.to_string()))
    }
}

/// Fixed url -> body map; unknown urls fail like an unreachable host.
#[derive(Debug, Clone, Default)]
pub struct StaticPatchSource { bodies: HashMap<String, String> }

impl StaticPatchSource {
    pub fn with(mut self, url: impl Into<String>, body: impl Into<String>) -> Self { self.bodies.insert(url.into(), body.into()); self }
}

#[async_trait]
impl PatchSource for StaticPatchSource {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.bodies.get(url).cloned().ok_or_else(|| Error::Fetch { url: url.to_string(), reason: "connection refused".into() })
    }
}

/// How to obtain a patch and which benches it targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PatchSpec {
    /// Inline patch text. Takes precedence over `patch_url`.
    pub patch: Option<String>,
    pub patch_url: Option<String>,
    pub patch_filename: Option<String>,
    #[serde(default)]
    pub build_assets: bool,
    /// Target bench when `patch_all_benches` is false.
    pub patch_bench: Option<String>,
    #[serde(default)]
    pub patch_all_benches: bool,
}

/// SHA-256 hex of the patch text; the storage-level uniqueness key together with the bench.
pub fn content_digest(content: &str) -> String {
    let mut h = Sha256::new();
    h.update(content.as_bytes());
    format!("{:x}", h.finalize())
}

pub async fn resolve_content(source: &dyn PatchSource, spec: &PatchSpec) -> Result<String> {
    if let Some(patch) = &spec.patch { return Ok(patch.clone()); }
    match spec.patch_url.as_deref() {
        Some(url) if !url.is_empty() => source.fetch(url).await,
        _ => Err(Error::invalid("either patch or patch_url is required")),
    }
}

/// Bench names a patch applies to. An Active-bench sweep may legitimately be empty.
pub async fn resolve_benches(store: &dyn Store, release_group: &str, spec: &PatchSpec) -> Result<Vec<String>> {
    if !spec.patch_all_benches {
        return match spec.patch_bench.as_deref() {
            Some(bench) if !bench.is_empty() => Ok(vec![bench.to_string()]),
            _ => Err(Error::invalid("patch_bench is required unless patch_all_benches is set")),
        };
    }
    Ok(store.list_benches(release_group, BenchStatus::Active).await?.into_iter().map(|b| b.name).collect())
}

pub async fn resolve_revision(store: &dyn Store, bench: &str, app: &str) -> Result<BenchApp> {
    store.find_bench_app(bench, app).await?
        .ok_or_else(|| Error::not_found("installed app", format!("{app} on bench {bench}")))
}

#[derive(Debug, Clone)]
pub struct BenchTarget { pub bench: String, pub revision: Result<BenchApp> }

#[derive(Debug, Clone)]
pub struct Resolution { pub content: String, pub targets: Vec<BenchTarget> }

/// Content and bench set are resolved once and fail the whole request;
/// revision lookups fail per bench.
pub async fn resolve(store: &dyn Store, source: &dyn PatchSource, release_group: &str, app: &str, spec: &PatchSpec) -> Result<Resolution> {
    let content = resolve_content(source, spec).await?;
    let benches = resolve_benches(store, release_group, spec).await?;
    let mut targets = Vec::with_capacity(benches.len());
    for bench in benches {
        let revision = resolve_revision(store, &bench, app).await;
        targets.push(BenchTarget { bench, revision });
    }
    Ok(Resolution { content, targets })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CreatedPatch { pub name: String, pub bench: String, pub job: Uuid }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BenchFailure {
    pub bench: String,
    pub code: String,
    pub message: String,
    /// Patch already holding the same content on this bench, or the patch whose apply job was rejected.
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DistributionReport { pub created: Vec<CreatedPatch>, pub failed: Vec<BenchFailure> }

impl DistributionReport {
    pub fn patch_names(&self) -> Vec<String> { self.created.iter().map(|c| c.name.clone()).collect() }

    fn fail(&mut self, bench: &str, err: &Error, patch: Option<String>) {
        warn!(%bench, code=err.code(), error=%err, "patch.bench_failed");
        self.failed.push(BenchFailure { bench: bench.to_string(), code: err.code().to_string(), message: err.to_string(), patch });
    }
}

/// Create one patch (and one Apply Patch job) per target bench. A failing
/// bench is reported in `failed` and does not affect the others.
#[tracing::instrument(level = "info", skip(state, spec), fields(all_benches = spec.patch_all_benches))]
pub async fn distribute(state: &AppState, release_group: &str, app: &str, spec: &PatchSpec) -> Result<DistributionReport> {
    let resolution = resolve(state.store.as_ref(), state.patch_source.as_ref(), release_group, app, spec).await?;
    let digest = content_digest(&resolution.content);
    let mut report = DistributionReport::default();
    for target in resolution.targets {
        let bench_app = match target.revision {
            Ok(rev) => rev,
            Err(e) => { report.fail(&target.bench, &e, None); continue; }
        };
        let candidate = NewPatch {
            bench: target.bench.clone(), release_group: release_group.to_string(), app: app.to_string(),
            app_release: bench_app.revision, patch: resolution.content.clone(), patch_digest: digest.clone(),
            url: spec.patch_url.clone(), filename: spec.patch_filename.clone(), build_assets: spec.build_assets,
        };
        let patch = match state.store.insert_patch(&candidate).await {
            Ok(p) => p,
            Err(e) => {
                let existing = match &e { Error::DuplicatePatch { existing, .. } => Some(existing.clone()), _ => None };
                report.fail(&target.bench, &e, existing);
                continue;
            }
        };
        PATCHES_CREATED.inc();
        info!(patch=%patch.name, bench=%patch.bench, app_release=%patch.app_release, "patch.created");
        match enqueue(state, &patch, JobType::ApplyPatch).await {
            Ok(job) => report.created.push(CreatedPatch { name: patch.name, bench: patch.bench, job: job.id }),
            Err(e) => report.fail(&target.bench, &e, Some(patch.name)),
        }
    }
    Ok(report)
}

async fn enqueue(state: &AppState, patch: &Patch, job_type: JobType) -> Result<Job> {
    state.store.set_patch_status(&patch.name, PatchStatus::InProgress).await?;
    let params = serde_json::json!({
        "patch": patch.name, "app": patch.app, "app_release": patch.app_release,
        "build_assets": patch.build_assets, "filename": patch.filename,
    });
    let queued = jobs::create_job(state, NewJob::new(job_type).bench(&patch.bench).patch(&patch.name).params(params)).await;
    if queued.is_err() {
        // nothing ran on the bench, so the patch keeps its previous state
        if let Err(e) = state.store.set_patch_status(&patch.name, patch.status).await {
            warn!(patch=%patch.name, error=%e, "patch.status_restore_failed");
        }
    }
    queued
}

/// Result of an apply/revert request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PatchAction {
    pub patch: String,
    pub status: PatchStatus,
    /// Job doing the work, `None` when there was nothing to do.
    pub job: Option<JobSummary>,
}

async fn act(state: &AppState, name: &str, job_type: JobType, done: PatchStatus) -> Result<PatchAction> {
    let patch = state.store.get_patch(name).await?.ok_or_else(|| Error::not_found("patch", name))?;
    let in_flight = state.store.list_unfinished_jobs(&JobFilter::patch(name)).await?;
    if let Some(other) = in_flight.iter().find(|j| j.job_type != job_type) {
        return Err(Error::invalid(format!("patch {name} has {} job {} in flight", other.job_type, other.id)));
    }
    // a job of the same kind already in flight answers the request
    if let Some(job) = in_flight.first() {
        info!(patch=%name, job_id=%job.id, "patch.action_in_flight");
        return Ok(PatchAction { patch: patch.name, status: patch.status, job: Some(JobSummary::from(job)) });
    }
    if patch.status == done {
        return Ok(PatchAction { patch: patch.name, status: patch.status, job: None });
    }
    let job = enqueue(state, &patch, job_type).await?;
    Ok(PatchAction { patch: patch.name, status: PatchStatus::InProgress, job: Some(JobSummary::from(&job)) })
}

pub async fn apply_patch(state: &AppState, name: &str) -> Result<PatchAction> {
    act(state, name, JobType::ApplyPatch, PatchStatus::Applied).await
}

pub async fn revert_patch(state: &AppState, name: &str) -> Result<PatchAction> {
    act(state, name, JobType::RevertPatch, PatchStatus::NotApplied).await
}

pub async fn get_patch(store: &dyn Store, name: &str) -> Result<PatchSummary> {
    store.get_patch(name).await?.map(|p| PatchSummary::from(&p)).ok_or_else(|| Error::not_found("patch", name))
}

pub async fn list_patches(store: &dyn Store, filter: &PatchFilter) -> Result<Vec<PatchSummary>> {
    Ok(store.list_patches(filter).await?.iter().map(PatchSummary::from).collect())
}
