//! Job ledger: creation and dispatch of jobs, read models, and the intake of
//! status reports coming back from the execution agent.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use crate::{AppState, agent::DispatchRequest, error::{Error, Result}};
use crate::models::*;
use crate::store::{JobFilter, JobTransition, StepTransition, Store};
use crate::telemetry::{JOBS_DISPATCHED, JOB_DISPATCH_FAILURES};

/// A job about to be created. The id is fixed up front so callers can link
/// records (backups, domains) to it before dispatch.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub site: Option<String>,
    pub bench: Option<String>,
    pub patch: Option<String>,
    pub params: serde_json::Value,
}

impl NewJob {
    pub fn new(job_type: JobType) -> Self {
        Self { id: Uuid::new_v4(), job_type, site: None, bench: None, patch: None, params: serde_json::Value::Null }
    }
    pub fn site(mut self, site: impl Into<String>) -> Self { self.site = Some(site.into()); self }
    pub fn bench(mut self, bench: impl Into<String>) -> Self { self.bench = Some(bench.into()); self }
    pub fn patch(mut self, patch: impl Into<String>) -> Self { self.patch = Some(patch.into()); self }
    pub fn params(mut self, params: serde_json::Value) -> Self { self.params = params; self }
}

/// Insert a Pending job and hand it to the execution agent.
///
/// If the agent refuses the job it is closed as Failure right away, with a
/// failed "Dispatch Job" step carrying the agent's error, and
/// [`Error::UpstreamAgent`] is returned. Sites being archived or reconfigured
/// keep their status in that case; patch status is left to the caller.
#[tracing::instrument(level = "debug", skip(state, new), fields(job_id = %new.id, job_type = %new.job_type))]
pub async fn create_job(state: &AppState, new: NewJob) -> Result<Job> {
    let server = match &new.bench {
        Some(bench) => state.store.get_bench(bench).await?.map(|b| b.server),
        None => None,
    };
    let job = Job {
        id: new.id, job_type: new.job_type, site: new.site, bench: new.bench, patch: new.patch,
        status: JobStatus::Pending, created_at: Utc::now(), start: None, end: None,
    };
    state.store.insert_job(&job).await?;
    let req = DispatchRequest {
        job_id: job.id, job_type: job.job_type, server, bench: job.bench.clone(), site: job.site.clone(), params: new.params,
    };
    match state.agent.dispatch(&req).await {
        Ok(()) => {
            JOBS_DISPATCHED.with_label_values(&[job.job_type.as_str()]).inc();
            info!(job_id=%job.id, job_type=%job.job_type, bench=?job.bench, site=?job.site, "job.dispatched");
            Ok(job)
        }
        Err(e) => {
            JOB_DISPATCH_FAILURES.with_label_values(&[job.job_type.as_str()]).inc();
            let reason = format!("{e:#}");
            warn!(job_id=%job.id, error=%reason, "job.dispatch_rejected");
            close_rejected(state, &job, &reason).await?;
            Err(Error::UpstreamAgent { target: format!("job {}", job.id), reason })
        }
    }
}

async fn close_rejected(state: &AppState, job: &Job, reason: &str) -> Result<()> {
    let now = Utc::now();
    let step = JobStep {
        id: Uuid::new_v4(), job_id: job.id, step_name: "Dispatch Job".into(), status: JobStatus::Failure,
        created_at: now, start: None, end: Some(now), output: None, traceback: Some(reason.to_string()),
    };
    state.store.insert_step(&step).await?;
    let tr = JobTransition { expected: JobStatus::Pending, status: JobStatus::Failure, start: None, end: Some(now) };
    let Some(closed) = state.store.transition_job(job.id, &tr).await? else { return Ok(()) };
    // only records created for this job follow it into Failure
    if matches!(closed.job_type, JobType::NewSite | JobType::BackupSite | JobType::AddDomain) {
        settle_owner(state, &closed).await?;
    }
    Ok(())
}

pub async fn get_job(store: &dyn Store, id: Uuid) -> Result<JobDetail> {
    let job = store.get_job(id).await?.ok_or_else(|| Error::not_found("job", id.to_string()))?;
    let steps = store.list_steps(id).await?;
    Ok(JobDetail::new(&job, &steps))
}

/// Pending and Running jobs for a target, each with its steps.
pub async fn list_running(store: &dyn Store, filter: &JobFilter) -> Result<Vec<JobDetail>> {
    let jobs = store.list_unfinished_jobs(filter).await?;
    let mut out = Vec::with_capacity(jobs.len());
    for job in &jobs {
        debug_assert!(job.status != JobStatus::Running || job.start.is_some());
        let steps = store.list_steps(job.id).await?;
        out.push(JobDetail::new(job, &steps));
    }
    Ok(out)
}

pub async fn list_recent(store: &dyn Store, filter: &JobFilter, limit: i64) -> Result<Vec<JobSummary>> {
    Ok(store.list_jobs(filter, limit).await?.iter().map(JobSummary::from).collect())
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct JobUpdate {
    pub status: JobStatus,
    /// When the agent observed the change. Defaults to receipt time.
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StepReport {
    /// Existing step to update. A report without one creates a new step.
    pub step: Option<Uuid>,
    pub step_name: String,
    pub status: JobStatus,
    pub output: Option<String>,
    pub traceback: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

/// Apply a job status report from the agent. Re-reporting the current status
/// is a no-op; anything else must follow Pending -> Running -> terminal.
#[tracing::instrument(level = "info", skip(state, update), fields(status = %update.status))]
pub async fn record_job_update(state: &AppState, id: Uuid, update: JobUpdate) -> Result<JobDetail> {
    let job = state.store.get_job(id).await?.ok_or_else(|| Error::not_found("job", id.to_string()))?;
    if job.status == update.status { return get_job(state.store.as_ref(), id).await; }
    if !job.status.can_transition_to(update.status) {
        return Err(Error::invalid(format!("job {id} cannot move from {} to {}", job.status, update.status)));
    }
    let at = update.at.unwrap_or_else(Utc::now);
    let tr = match update.status {
        JobStatus::Running => JobTransition { expected: job.status, status: update.status, start: Some(at), end: None },
        _ => JobTransition { expected: job.status, status: update.status, start: job.start, end: Some(at) },
    };
    let Some(updated) = state.store.transition_job(id, &tr).await? else {
        return Err(Error::invalid(format!("job {id} changed while applying {}", update.status)));
    };
    info!(job_id=%id, from=%job.status, to=%updated.status, "job.transition");
    if updated.status.is_terminal() { settle_owner(state, &updated).await?; }
    get_job(state.store.as_ref(), id).await
}

/// Record progress of one step. Steps of a finished job are immutable.
#[tracing::instrument(level = "debug", skip(state, report), fields(step_name = %report.step_name, status = %report.status))]
pub async fn record_step_update(state: &AppState, job_id: Uuid, report: StepReport) -> Result<StepDetail> {
    let job = state.store.get_job(job_id).await?.ok_or_else(|| Error::not_found("job", job_id.to_string()))?;
    if job.status.is_terminal() {
        return Err(Error::invalid(format!("job {job_id} is already {}", job.status)));
    }
    let at = report.at.unwrap_or_else(Utc::now);
    let Some(step_id) = report.step else {
        let step = JobStep {
            id: Uuid::new_v4(), job_id, step_name: report.step_name, status: report.status, created_at: Utc::now(),
            start: (report.status != JobStatus::Pending).then_some(at),
            end: report.status.is_terminal().then_some(at),
            output: report.output, traceback: report.traceback,
        };
        state.store.insert_step(&step).await?;
        return Ok(StepDetail::from(&step));
    };
    let step = state.store.get_step(step_id).await?
        .filter(|s| s.job_id == job_id)
        .ok_or_else(|| Error::not_found("job step", step_id.to_string()))?;
    if step.status.is_terminal() && step.status == report.status { return Ok(StepDetail::from(&step)); }
    if step.status != report.status && !step.status.can_transition_to(report.status) {
        return Err(Error::invalid(format!("step {step_id} cannot move from {} to {}", step.status, report.status)));
    }
    let start = if report.status == JobStatus::Running && step.status == JobStatus::Pending { Some(at) } else { step.start };
    let tr = StepTransition {
        expected: step.status, status: report.status, start,
        end: if report.status.is_terminal() { Some(at) } else { None },
        output: report.output.or(step.output),
        traceback: report.traceback.or(step.traceback),
    };
    let updated = state.store.transition_step(step_id, &tr).await?
        .ok_or_else(|| Error::invalid(format!("step {step_id} changed while applying {}", report.status)))?;
    Ok(StepDetail::from(&updated))
}

/// Carry a finished job's outcome over to the record that owns it.
async fn settle_owner(state: &AppState, job: &Job) -> Result<()> {
    let ok = job.status == JobStatus::Success;
    let now = Utc::now();
    match job.job_type {
        JobType::ApplyPatch | JobType::RevertPatch => {
            if let Some(patch) = &job.patch {
                let status = match (job.job_type, ok) {
                    (JobType::ApplyPatch, true) => PatchStatus::Applied,
                    (JobType::RevertPatch, true) => PatchStatus::NotApplied,
                    _ => PatchStatus::Failure,
                };
                state.store.set_patch_status(patch, status).await?;
            }
        }
        JobType::NewSite | JobType::ArchiveSite => {
            if let Some(site) = &job.site {
                let status = match (job.job_type, ok) {
                    (JobType::NewSite, true) => SiteStatus::Active,
                    (JobType::ArchiveSite, true) => SiteStatus::Archived,
                    _ => SiteStatus::Broken,
                };
                state.store.set_site_status(site, status, now).await?;
            }
        }
        JobType::BackupSite => {
            let status = if ok { BackupStatus::Success } else { BackupStatus::Failure };
            state.store.set_backup_status_for_job(job.id, status).await?;
        }
        JobType::AddDomain => {
            let status = if ok { DomainStatus::Active } else { DomainStatus::Broken };
            state.store.set_domain_status_for_job(job.id, status).await?;
        }
        JobType::UpdateSiteConfiguration => {}
    }
    info!(job_id=%job.id, job_type=%job.job_type, status=%job.status, "job.settled");
    Ok(())
}
