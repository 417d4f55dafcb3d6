//! Site lifecycle: creation, read models, and the long-running site actions
//! (backup, archive, domains, config) that go through the job ledger.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;
use crate::{AppState, error::{Error, Result}};
use crate::models::*;
use crate::services::jobs::{self, NewJob};
use crate::store::{JobFilter, Store};

const RECENT_JOBS: i64 = 10;
const RECENT_BACKUPS: i64 = 5;
const RECENT_ACTIVITIES: i64 = 5;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewSiteRequest {
    /// Subdomain; the platform domain is appended.
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub backups: bool,
    #[serde(default)]
    pub monitor: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SiteCreationOptions { pub domain: String, pub group: String, pub apps: Vec<AppSource> }

async fn require_site(store: &dyn Store, name: &str) -> Result<Site> {
    store.get_site(name).await?.ok_or_else(|| Error::not_found("site", name))
}

async fn record_activity(store: &dyn Store, site: &str, action: &str, owner: &str) -> Result<()> {
    let activity = SiteActivity { id: Uuid::new_v4(), site: site.into(), action: action.into(), owner: owner.into(), created_at: Utc::now() };
    store.insert_activity(&activity).await
}

fn valid_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= 63 && !s.starts_with('-') && !s.ends_with('-')
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Creates the site on the newest Active bench of its group and dispatches a New Site job.
#[tracing::instrument(level = "info", skip(state, req), fields(subdomain = %req.name, group = %req.group))]
pub async fn create_site(state: &AppState, req: NewSiteRequest, owner: &str) -> Result<String> {
    if !valid_subdomain(&req.name) { return Err(Error::invalid(format!("'{}' is not a valid subdomain", req.name))); }
    if state.store.subdomain_exists(&req.name).await? {
        return Err(Error::invalid(format!("subdomain {} is already taken", req.name)));
    }
    let bench = state.store.list_benches(&req.group, BenchStatus::Active).await?
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at))
        .ok_or_else(|| Error::invalid(format!("release group {} has no active bench", req.group)))?;
    let now = Utc::now();
    let site = Site {
        name: format!("{}.{}", req.name, state.config.domain), subdomain: req.name, bench: bench.name.clone(),
        release_group: req.group, status: SiteStatus::Pending, apps: req.apps,
        enable_scheduled_backups: req.backups, enable_uptime_monitoring: req.monitor,
        config: serde_json::json!({}), created_at: now, modified_at: now,
    };
    state.store.insert_site(&site).await?;
    record_activity(state.store.as_ref(), &site.name, "Create", owner).await?;
    info!(site=%site.name, bench=%bench.name, "site.created");
    let params = serde_json::json!({ "apps": site.apps });
    jobs::create_job(state, NewJob::new(JobType::NewSite).site(&site.name).bench(&site.bench).params(params)).await?;
    Ok(site.name)
}

pub async fn site_exists(store: &dyn Store, subdomain: &str) -> Result<bool> {
    store.subdomain_exists(subdomain).await
}

pub async fn list_jobs(store: &dyn Store, site: &str) -> Result<Vec<JobSummary>> {
    require_site(store, site).await?;
    jobs::list_recent(store, &JobFilter::site(site), RECENT_JOBS).await
}

pub async fn list_running_jobs(store: &dyn Store, site: &str) -> Result<Vec<JobDetail>> {
    require_site(store, site).await?;
    jobs::list_running(store, &JobFilter::site(site)).await
}

pub async fn list_backups(store: &dyn Store, site: &str) -> Result<Vec<BackupSummary>> {
    require_site(store, site).await?;
    Ok(store.list_backups(site, RECENT_BACKUPS).await?.into_iter()
        .map(|b| BackupSummary { name: b.name, database: b.database_file, size: b.size, url: b.url, creation: b.created_at, status: b.status })
        .collect())
}

pub async fn list_domains(store: &dyn Store, site: &str) -> Result<Vec<DomainSummary>> {
    require_site(store, site).await?;
    Ok(store.list_domains(site).await?.into_iter()
        .map(|d| DomainSummary { name: d.name, domain: d.domain, status: d.status })
        .collect())
}

pub async fn list_activities(store: &dyn Store, site: &str) -> Result<Vec<ActivitySummary>> {
    require_site(store, site).await?;
    Ok(store.list_activities(site, RECENT_ACTIVITIES).await?.into_iter()
        .map(|a| ActivitySummary { action: a.action, creation: a.created_at, owner: a.owner })
        .collect())
}

/// Default release group with its apps in the group's order.
pub async fn creation_options(state: &AppState) -> Result<SiteCreationOptions> {
    let group = state.store.default_release_group().await?.ok_or_else(|| Error::not_found("release group", "default"))?;
    let order: HashMap<&str, usize> = group.apps.iter().enumerate().map(|(i, a)| (a.as_str(), i)).collect();
    let mut apps = state.store.list_app_sources(&group.apps).await?;
    apps.sort_by_key(|a| order.get(a.name.as_str()).copied().unwrap_or(usize::MAX));
    Ok(SiteCreationOptions { domain: state.config.domain.clone(), group: group.name, apps })
}

pub async fn list_sites(store: &dyn Store) -> Result<Vec<SiteSummary>> {
    Ok(store.list_sites().await?.into_iter().map(|s| SiteSummary { name: s.name, status: s.status, modified: s.modified_at }).collect())
}

pub async fn get_site(store: &dyn Store, name: &str) -> Result<SiteDetail> {
    let site = require_site(store, name).await?;
    let installed_apps = store.list_app_sources(&site.apps).await?.into_iter()
        .map(|a| InstalledApp { name: a.name, owner: a.repo_owner, repo: a.scrubbed, url: a.url, branch: a.branch })
        .collect();
    Ok(SiteDetail { name: site.name, status: site.status, installed_apps, creation: site.created_at, last_updated: site.modified_at })
}

/// Administrator session id from the agent on the site's bench.
pub async fn login(state: &AppState, name: &str, owner: &str) -> Result<String> {
    let site = require_site(state.store.as_ref(), name).await?;
    let server = state.store.get_bench(&site.bench).await?
        .map(|b| b.server)
        .ok_or_else(|| Error::not_found("bench", site.bench.clone()))?;
    let sid = state.agent.login_session(&server, &site.bench, &site.name).await
        .map_err(|e| Error::UpstreamAgent { target: format!("login for site {name}"), reason: format!("{e:#}") })?;
    record_activity(state.store.as_ref(), name, "Login as Administrator", owner).await?;
    Ok(sid)
}

#[tracing::instrument(level = "info", skip(state))]
pub async fn backup(state: &AppState, name: &str, owner: &str) -> Result<JobSummary> {
    let site = require_site(state.store.as_ref(), name).await?;
    let job = NewJob::new(JobType::BackupSite).site(&site.name).bench(&site.bench);
    let backup = SiteBackup {
        name: Uuid::new_v4(), site: site.name.clone(), job: Some(job.id), database_file: None, size: None, url: None,
        status: BackupStatus::Pending, created_at: Utc::now(),
    };
    state.store.insert_backup(&backup).await?;
    record_activity(state.store.as_ref(), name, "Backup", owner).await?;
    let job = jobs::create_job(state, job.params(serde_json::json!({ "backup": backup.name }))).await?;
    Ok(JobSummary::from(&job))
}

#[tracing::instrument(level = "info", skip(state))]
pub async fn archive(state: &AppState, name: &str, owner: &str) -> Result<JobSummary> {
    let site = require_site(state.store.as_ref(), name).await?;
    if site.status == SiteStatus::Archived { return Err(Error::invalid(format!("site {name} is already archived"))); }
    record_activity(state.store.as_ref(), name, "Archive", owner).await?;
    let job = jobs::create_job(state, NewJob::new(JobType::ArchiveSite).site(&site.name).bench(&site.bench)).await?;
    Ok(JobSummary::from(&job))
}

#[tracing::instrument(level = "info", skip(state))]
pub async fn add_domain(state: &AppState, name: &str, domain: &str, owner: &str) -> Result<DomainSummary> {
    let site = require_site(state.store.as_ref(), name).await?;
    let domain = domain.trim().to_ascii_lowercase();
    if domain.is_empty() { return Err(Error::invalid("domain is required")); }
    if state.store.domain_exists(&domain).await? { return Err(Error::invalid(format!("domain {domain} is already in use"))); }
    let job = NewJob::new(JobType::AddDomain).site(&site.name).bench(&site.bench).params(serde_json::json!({ "domain": domain }));
    let record = SiteDomain { name: Uuid::new_v4(), site: site.name.clone(), domain, status: DomainStatus::Pending, job: Some(job.id), created_at: Utc::now() };
    state.store.insert_domain(&record).await?;
    record_activity(state.store.as_ref(), name, "Add Domain", owner).await?;
    jobs::create_job(state, job).await?;
    Ok(DomainSummary { name: record.name, domain: record.domain, status: record.status })
}

/// Merge `config` into the site's config and push it to the bench.
/// Refused unless the `site_config_updates` flag is on.
#[tracing::instrument(level = "info", skip(state, config))]
pub async fn update_config(state: &AppState, name: &str, config: serde_json::Map<String, serde_json::Value>, owner: &str) -> Result<JobSummary> {
    if !state.config.site_config_updates {
        tracing::debug!(site=%name, keys=config.len(), "site.config_update_disabled");
        return Err(Error::invalid("site config updates are disabled"));
    }
    let site = require_site(state.store.as_ref(), name).await?;
    let mut merged = site.config.as_object().cloned().unwrap_or_default();
    merged.extend(config.clone());
    let merged = serde_json::Value::Object(merged);
    state.store.update_site_config(name, &merged, Utc::now()).await?;
    record_activity(state.store.as_ref(), name, "Update Configuration", owner).await?;
    let job = NewJob::new(JobType::UpdateSiteConfiguration).site(&site.name).bench(&site.bench)
        .params(serde_json::json!({ "config": config }));
    let job = jobs::create_job(state, job).await?;
    Ok(JobSummary::from(&job))
}

#[cfg(test)]
mod tests {
    use super::valid_subdomain;

    #[test]
    fn subdomain_rules() {
        assert!(valid_subdomain("acme-erp"));
        assert!(valid_subdomain("a1"));
        assert!(!valid_subdomain(""));
        assert!(!valid_subdomain("-acme"));
        assert!(!valid_subdomain("Acme"));
        assert!(!valid_subdomain("acme.erp"));
    }
}
