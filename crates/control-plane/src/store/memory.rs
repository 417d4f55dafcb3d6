use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, atomic::{AtomicBool, Ordering}};
use uuid::Uuid;
use crate::error::{Error, Result};
use crate::models::*;
use super::*;

#[derive(Debug, Default)]
struct Tables {
    jobs: Vec<Job>,
    steps: Vec<JobStep>,
    patches: Vec<Patch>,
    benches: Vec<Bench>,
    bench_apps: Vec<BenchApp>,
    release_groups: Vec<ReleaseGroup>,
    app_sources: Vec<AppSource>,
    sites: Vec<Site>,
    domains: Vec<SiteDomain>,
    backups: Vec<SiteBackup>,
    activities: Vec<SiteActivity>,
    request_logs: Vec<RequestLog>,
    job_logs: Vec<JobLog>,
    uptime_logs: Vec<UptimeLog>,
}

/// Process-local store. Every operation runs under one lock, so reads are
/// point-in-time snapshots and check-and-insert sequences are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore { tables: Mutex<Tables>, benches_down: AtomicBool }

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Make bench lookups fail, as an unreachable bench directory would.
    pub fn set_benches_down(&self, down: bool) { self.benches_down.store(down, Ordering::SeqCst); }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // a panic while holding the lock cannot leave a half-applied write behind
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Seeding for collaborator-owned records (bench directory, app sources, log tables).

    pub fn add_bench(&self, bench: Bench) { self.tables().benches.push(bench); }

    pub fn add_bench_app(&self, bench: &str, app: &str, revision: &str) -> BenchApp {
        let mut t = self.tables();
        let seq = t.bench_apps.len() as i64 + 1;
        let rec = BenchApp { id: Uuid::new_v4(), bench: bench.into(), app: app.into(), revision: revision.into(), seq };
        t.bench_apps.push(rec.clone());
        rec
    }

    pub fn add_release_group(&self, group: ReleaseGroup) { self.tables().release_groups.push(group); }
    pub fn add_app_source(&self, app: AppSource) { self.tables().app_sources.push(app); }
    pub fn add_request_log(&self, row: RequestLog) { self.tables().request_logs.push(row); }
    pub fn add_job_log(&self, row: JobLog) { self.tables().job_logs.push(row); }
    pub fn add_uptime_log(&self, row: UptimeLog) { self.tables().uptime_logs.push(row); }
    pub fn seed_site(&self, site: Site) { self.tables().sites.push(site); }
}

fn newest_first<T>(rows: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, Uuid)) {
    rows.sort_by(|a, b| creation_order(key(b), key(a)));
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut t = self.tables();
        if t.jobs.iter().any(|j| j.id == job.id) { return Err(Error::Storage(format!("job {} already exists", job.id))); }
        t.jobs.push(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.tables().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: i64) -> Result<Vec<Job>> {
        let mut rows: Vec<Job> = self.tables().jobs.iter().filter(|j| filter.matches(j)).cloned().collect();
        newest_first(&mut rows, |j| (j.created_at, j.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_unfinished_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut rows: Vec<Job> = self.tables().jobs.iter()
            .filter(|j| !j.status.is_terminal() && filter.matches(j))
            .cloned().collect();
        rows.sort_by(|a, b| creation_order((a.created_at, a.id), (b.created_at, b.id)));
        Ok(rows)
    }

    async fn transition_job(&self, id: Uuid, tr: &JobTransition) -> Result<Option<Job>> {
        let mut t = self.tables();
        let Some(job) = t.jobs.iter_mut().find(|j| j.id == id) else { return Ok(None) };
        if job.status != tr.expected { return Ok(None); }
        job.status = tr.status;
        job.start = tr.start;
        job.end = tr.end;
        Ok(Some(job.clone()))
    }

    async fn insert_step(&self, step: &JobStep) -> Result<()> {
        self.tables().steps.push(step.clone());
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<JobStep>> {
        Ok(self.tables().steps.iter().find(|s| s.id == id).cloned())
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>> {
        // appended in creation order
        Ok(self.tables().steps.iter().filter(|s| s.job_id == job_id).cloned().collect())
    }

    async fn transition_step(&self, id: Uuid, tr: &StepTransition) -> Result<Option<JobStep>> {
        let mut t = self.tables();
        let Some(step) = t.steps.iter_mut().find(|s| s.id == id) else { return Ok(None) };
        if step.status != tr.expected { return Ok(None); }
        step.status = tr.status;
        step.start = tr.start;
        step.end = tr.end;
        step.output = tr.output.clone();
        step.traceback = tr.traceback.clone();
        Ok(Some(step.clone()))
    }
}

#[async_trait]
impl PatchRepository for MemoryStore {
    async fn insert_patch(&self, c: &NewPatch) -> Result<Patch> {
        let mut t = self.tables();
        if let Some(existing) = t.patches.iter().find(|p| p.bench == c.bench && p.patch_digest == c.patch_digest && p.patch == c.patch) {
            return Err(Error::DuplicatePatch { bench: c.bench.clone(), existing: existing.name.clone(), filename: existing.filename.clone() });
        }
        let base = format!("{}-p", c.bench);
        let name = next_free_name(&base, t.patches.iter().map(|p| p.name.as_str()));
        let patch = Patch {
            name, bench: c.bench.clone(), release_group: c.release_group.clone(), app: c.app.clone(), app_release: c.app_release.clone(),
            patch: c.patch.clone(), patch_digest: c.patch_digest.clone(), url: c.url.clone(), filename: c.filename.clone(),
            build_assets: c.build_assets, status: PatchStatus::NotApplied, created_at: Utc::now(),
        };
        t.patches.push(patch.clone());
        Ok(patch)
    }

    async fn get_patch(&self, name: &str) -> Result<Option<Patch>> {
        Ok(self.tables().patches.iter().find(|p| p.name == name).cloned())
    }

    async fn list_patches(&self, filter: &PatchFilter) -> Result<Vec<Patch>> {
        let t = self.tables();
        let mut rows: Vec<Patch> = t.patches.iter()
            .filter(|p| filter.release_group.as_ref().map_or(true, |g| &p.release_group == g))
            .filter(|p| filter.bench.as_ref().map_or(true, |b| &p.bench == b))
            .cloned().collect();
        // insertion order breaks creation-time ties
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn set_patch_status(&self, name: &str, status: PatchStatus) -> Result<()> {
        let mut t = self.tables();
        let patch = t.patches.iter_mut().find(|p| p.name == name).ok_or_else(|| Error::not_found("patch", name))?;
        patch.status = status;
        Ok(())
    }
}

#[async_trait]
impl BenchDirectory for MemoryStore {
    async fn get_bench(&self, name: &str) -> Result<Option<Bench>> {
        if self.benches_down.load(Ordering::SeqCst) { return Err(Error::Storage(format!("bench directory unavailable for {name}"))); }
        Ok(self.tables().benches.iter().find(|b| b.name == name).cloned())
    }

    async fn list_benches(&self, release_group: &str, status: BenchStatus) -> Result<Vec<Bench>> {
        let mut rows: Vec<Bench> = self.tables().benches.iter()
            .filter(|b| b.release_group == release_group && b.status == status)
            .cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn find_bench_app(&self, bench: &str, app: &str) -> Result<Option<BenchApp>> {
        Ok(self.tables().bench_apps.iter()
            .filter(|a| a.bench == bench && a.app == app)
            .min_by_key(|a| a.seq)
            .cloned())
    }

    async fn default_release_group(&self) -> Result<Option<ReleaseGroup>> {
        Ok(self.tables().release_groups.iter().find(|g| g.is_default).cloned())
    }

    async fn list_app_sources(&self, names: &[String]) -> Result<Vec<AppSource>> {
        Ok(self.tables().app_sources.iter().filter(|a| names.contains(&a.name)).cloned().collect())
    }
}

#[async_trait]
impl SiteDirectory for MemoryStore {
    async fn insert_site(&self, site: &Site) -> Result<()> {
        let mut t = self.tables();
        if t.sites.iter().any(|s| s.name == site.name || s.subdomain == site.subdomain) {
            return Err(Error::invalid(format!("site {} already exists", site.name)));
        }
        t.sites.push(site.clone());
        Ok(())
    }

    async fn get_site(&self, name: &str) -> Result<Option<Site>> {
        Ok(self.tables().sites.iter().find(|s| s.name == name).cloned())
    }

    async fn subdomain_exists(&self, subdomain: &str) -> Result<bool> {
        Ok(self.tables().sites.iter().any(|s| s.subdomain == subdomain))
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        let mut rows = self.tables().sites.clone();
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_site_config(&self, name: &str, config: &serde_json::Value, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables();
        let site = t.sites.iter_mut().find(|s| s.name == name).ok_or_else(|| Error::not_found("site", name))?;
        site.config = config.clone();
        site.modified_at = at;
        Ok(())
    }

    async fn set_site_status(&self, name: &str, status: SiteStatus, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables();
        let site = t.sites.iter_mut().find(|s| s.name == name).ok_or_else(|| Error::not_found("site", name))?;
        site.status = status;
        site.modified_at = at;
        Ok(())
    }

    async fn insert_domain(&self, domain: &SiteDomain) -> Result<()> {
        let mut t = self.tables();
        if t.domains.iter().any(|d| d.domain == domain.domain) {
            return Err(Error::invalid(format!("domain {} is already in use", domain.domain)));
        }
        t.domains.push(domain.clone());
        Ok(())
    }

    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        Ok(self.tables().domains.iter().any(|d| d.domain == domain))
    }

    async fn list_domains(&self, site: &str) -> Result<Vec<SiteDomain>> {
        let mut rows: Vec<SiteDomain> = self.tables().domains.iter().filter(|d| d.site == site).cloned().collect();
        rows.sort_by(|a, b| creation_order((a.created_at, a.name), (b.created_at, b.name)));
        Ok(rows)
    }

    async fn set_domain_status_for_job(&self, job: Uuid, status: DomainStatus) -> Result<()> {
        for d in self.tables().domains.iter_mut().filter(|d| d.job == Some(job)) { d.status = status; }
        Ok(())
    }

    async fn insert_backup(&self, backup: &SiteBackup) -> Result<()> {
        self.tables().backups.push(backup.clone());
        Ok(())
    }

    async fn list_backups(&self, site: &str, limit: i64) -> Result<Vec<SiteBackup>> {
        let mut rows: Vec<SiteBackup> = self.tables().backups.iter().filter(|b| b.site == site).cloned().collect();
        newest_first(&mut rows, |b| (b.created_at, b.name));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn set_backup_status_for_job(&self, job: Uuid, status: BackupStatus) -> Result<()> {
        for b in self.tables().backups.iter_mut().filter(|b| b.job == Some(job)) { b.status = status; }
        Ok(())
    }

    async fn insert_activity(&self, activity: &SiteActivity) -> Result<()> {
        self.tables().activities.push(activity.clone());
        Ok(())
    }

    async fn list_activities(&self, site: &str, limit: i64) -> Result<Vec<SiteActivity>> {
        let mut rows: Vec<SiteActivity> = self.tables().activities.iter().filter(|a| a.site == site).cloned().collect();
        newest_first(&mut rows, |a| (a.created_at, a.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn request_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<RequestLog>> {
        Ok(self.tables().request_logs.iter().filter(|r| r.site == site && r.timestamp >= since).cloned().collect())
    }

    async fn job_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<JobLog>> {
        Ok(self.tables().job_logs.iter().filter(|r| r.site == site && r.timestamp >= since).cloned().collect())
    }

    async fn uptime_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<UptimeLog>> {
        Ok(self.tables().uptime_logs.iter().filter(|r| r.site == site && r.timestamp >= since).cloned().collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> { Ok(()) }
}
