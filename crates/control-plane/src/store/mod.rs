//! Storage interface for every record the control plane reads or writes.
//!
//! Services only talk to these traits. [`memory::MemoryStore`] backs tests and
//! local runs, [`postgres::PgStore`] backs production. Both enforce the same
//! atomicity guarantees: patch uniqueness and naming happen in one
//! check-and-insert, and status changes are compare-and-set against the
//! expected current status.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use crate::config::{Config, StoreMode};
use crate::error::Result;
use crate::models::*;

pub mod memory;
pub mod postgres;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub site: Option<String>,
    pub bench: Option<String>,
    pub patch: Option<String>,
    pub job_type: Option<JobType>,
}

impl JobFilter {
    pub fn site(name: impl Into<String>) -> Self { Self { site: Some(name.into()), ..Self::default() } }
    pub fn patch(name: impl Into<String>) -> Self { Self { patch: Some(name.into()), ..Self::default() } }
    pub fn with_type(mut self, job_type: Option<JobType>) -> Self { self.job_type = job_type; self }

    pub fn matches(&self, job: &Job) -> bool {
        fn eq(want: &Option<String>, have: &Option<String>) -> bool { want.is_none() || want == have }
        eq(&self.site, &job.site) && eq(&self.bench, &job.bench) && eq(&self.patch, &job.patch)
            && self.job_type.map_or(true, |t| t == job.job_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchFilter { pub release_group: Option<String>, pub bench: Option<String> }

/// Compare-and-set of a job's status and timing. Applied only while the job is still in `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub expected: JobStatus,
    pub status: JobStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepTransition {
    pub expected: JobStatus,
    pub status: JobStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub traceback: Option<String>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    /// Newest first (creation time, then id).
    async fn list_jobs(&self, filter: &JobFilter, limit: i64) -> Result<Vec<Job>>;
    /// Pending and Running jobs, oldest first.
    async fn list_unfinished_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    /// Returns `None` when the job was no longer in `transition.expected`.
    async fn transition_job(&self, id: Uuid, transition: &JobTransition) -> Result<Option<Job>>;
    async fn insert_step(&self, step: &JobStep) -> Result<()>;
    async fn get_step(&self, id: Uuid) -> Result<Option<JobStep>>;
    /// Steps of a job in creation order.
    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>>;
    async fn transition_step(&self, id: Uuid, transition: &StepTransition) -> Result<Option<JobStep>>;
}

#[async_trait]
pub trait PatchRepository: Send + Sync {
    /// Atomically rejects a duplicate (bench, content) pair, assigns the next free
    /// `<bench>-p[N]` name and persists the patch.
    async fn insert_patch(&self, candidate: &NewPatch) -> Result<Patch>;
    async fn get_patch(&self, name: &str) -> Result<Option<Patch>>;
    /// Newest first.
    async fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<Patch>>;
    async fn set_patch_status(&self, name: &str, status: PatchStatus) -> Result<()>;
}

#[async_trait]
pub trait BenchDirectory: Send + Sync {
    async fn get_bench(&self, name: &str) -> Result<Option<Bench>>;
    /// Benches of a group in a given status, oldest first.
    async fn list_benches(&self, release_group: &str, status: BenchStatus) -> Result<Vec<Bench>>;
    /// First installed-app record (insertion order) linking `bench` and `app`.
    async fn find_bench_app(&self, bench: &str, app: &str) -> Result<Option<BenchApp>>;
    async fn default_release_group(&self) -> Result<Option<ReleaseGroup>>;
    async fn list_app_sources(&self, names: &[String]) -> Result<Vec<AppSource>>;
}

#[async_trait]
pub trait SiteDirectory: Send + Sync {
    async fn insert_site(&self, site: &Site) -> Result<()>;
    async fn get_site(&self, name: &str) -> Result<Option<Site>>;
    async fn subdomain_exists(&self, subdomain: &str) -> Result<bool>;
    /// Newest first.
    async fn list_sites(&self) -> Result<Vec<Site>>;
    async fn update_site_config(&self, name: &str, config: &serde_json::Value, at: DateTime<Utc>) -> Result<()>;
    async fn set_site_status(&self, name: &str, status: SiteStatus, at: DateTime<Utc>) -> Result<()>;
    async fn insert_domain(&self, domain: &SiteDomain) -> Result<()>;
    async fn domain_exists(&self, domain: &str) -> Result<bool>;
    async fn list_domains(&self, site: &str) -> Result<Vec<SiteDomain>>;
    async fn set_domain_status_for_job(&self, job: Uuid, status: DomainStatus) -> Result<()>;
    async fn insert_backup(&self, backup: &SiteBackup) -> Result<()>;
    /// Newest first.
    async fn list_backups(&self, site: &str, limit: i64) -> Result<Vec<SiteBackup>>;
    async fn set_backup_status_for_job(&self, job: Uuid, status: BackupStatus) -> Result<()>;
    async fn insert_activity(&self, activity: &SiteActivity) -> Result<()>;
    /// Newest first.
    async fn list_activities(&self, site: &str, limit: i64) -> Result<Vec<SiteActivity>>;
}

/// Read-only view over the externally ingested log tables.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn request_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<RequestLog>>;
    async fn job_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<JobLog>>;
    async fn uptime_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<UptimeLog>>;
}

#[async_trait]
pub trait Store: JobRepository + PatchRepository + BenchDirectory + SiteDirectory + LogStore + 'static {
    /// Cheap connectivity probe used by readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// Picks the store backend named by configuration.
pub async fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match cfg.store {
        StoreMode::Postgres => {
            let Some(url) = cfg.database_url.as_deref() else {
                anyhow::bail!("CP_STORE=postgres requires DATABASE_URL");
            };
            let pool = crate::db::init_db(url).await?;
            info!("store.init_postgres");
            Ok(Arc::new(postgres::PgStore::new(pool)))
        }
        StoreMode::Memory => {
            warn!("store.init_memory (state is lost on restart)");
            Ok(Arc::new(memory::MemoryStore::default()))
        }
    }
}

/// Next free name for `base` given the names already taken: `base`, then `base1`, `base2`, ...
pub fn next_free_name<'a>(base: &str, taken: impl IntoIterator<Item = &'a str>) -> String {
    let mut base_taken = false;
    let mut highest = 0u64;
    for name in taken {
        if name == base { base_taken = true; continue; }
        if let Some(suffix) = name.strip_prefix(base) {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = suffix.parse::<u64>() { highest = highest.max(n); }
            }
        }
    }
    if !base_taken { return base.to_string(); }
    format!("{base}{}", highest + 1)
}
