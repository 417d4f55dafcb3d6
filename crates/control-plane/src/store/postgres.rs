use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;
use crate::error::{Error, Result};
use super::*;

const JOB_COLUMNS: &str = "id, job_type, site, bench, patch, status, created_at, started_at, ended_at";
const STEP_COLUMNS: &str = "id, job_id, step_name, status, created_at, started_at, ended_at, output, traceback";
const PATCH_COLUMNS: &str = "name, bench, release_group, app, app_release, patch, patch_digest, url, filename, build_assets, status, created_at";
const SITE_COLUMNS: &str = "name, subdomain, bench, release_group, status, apps, enable_scheduled_backups, enable_uptime_monitoring, config, created_at, modified_at";

/// Postgres-backed store. Uniqueness of (bench, content) is enforced by the
/// `app_patches_bench_content_uniq` index, not only by the pre-insert lookup.
#[derive(Debug, Clone)]
pub struct PgStore { pool: Pool<Postgres> }

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    pub fn pool(&self) -> &Pool<Postgres> { &self.pool }

    async fn existing_patch(&self, bench: &str, digest: &str) -> Result<Option<(String, Option<String>)>> {
        Ok(sqlx::query_as("SELECT name, filename FROM app_patches WHERE bench=$1 AND patch_digest=$2")
            .bind(bench).bind(digest).fetch_optional(&self.pool).await?)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[async_trait]
impl JobRepository for PgStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query("INSERT INTO jobs (id, job_type, site, bench, patch, status, created_at, started_at, ended_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)")
            .bind(job.id).bind(job.job_type.as_str()).bind(&job.site).bind(&job.bench).bind(&job.patch)
            .bind(job.status.as_str()).bind(job.created_at).bind(job.start).bind(job.end)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=$1"))
            .bind(id).fetch_optional(&self.pool).await?)
    }

    async fn list_jobs(&self, f: &JobFilter, limit: i64) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs \
            WHERE ($1::text IS NULL OR site=$1) AND ($2::text IS NULL OR bench=$2) AND ($3::text IS NULL OR patch=$3) AND ($4::text IS NULL OR job_type=$4) \
            ORDER BY created_at DESC, id DESC LIMIT $5");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(&f.site).bind(&f.bench).bind(&f.patch).bind(f.job_type.map(|t| t.as_str()))
            .bind(limit.max(0))
            .fetch_all(&self.pool).await?)
    }

    async fn list_unfinished_jobs(&self, f: &JobFilter) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs \
            WHERE status IN ('Pending','Running') \
            AND ($1::text IS NULL OR site=$1) AND ($2::text IS NULL OR bench=$2) AND ($3::text IS NULL OR patch=$3) AND ($4::text IS NULL OR job_type=$4) \
            ORDER BY created_at, id");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(&f.site).bind(&f.bench).bind(&f.patch).bind(f.job_type.map(|t| t.as_str()))
            .fetch_all(&self.pool).await?)
    }

    async fn transition_job(&self, id: Uuid, tr: &JobTransition) -> Result<Option<Job>> {
        let sql = format!("UPDATE jobs SET status=$3, started_at=$4, ended_at=$5 WHERE id=$1 AND status=$2 RETURNING {JOB_COLUMNS}");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(id).bind(tr.expected.as_str()).bind(tr.status.as_str()).bind(tr.start).bind(tr.end)
            .fetch_optional(&self.pool).await?)
    }

    async fn insert_step(&self, s: &JobStep) -> Result<()> {
        sqlx::query("INSERT INTO job_steps (id, job_id, step_name, status, created_at, started_at, ended_at, output, traceback) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)")
            .bind(s.id).bind(s.job_id).bind(&s.step_name).bind(s.status.as_str()).bind(s.created_at)
            .bind(s.start).bind(s.end).bind(&s.output).bind(&s.traceback)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<JobStep>> {
        Ok(sqlx::query_as::<_, JobStep>(&format!("SELECT {STEP_COLUMNS} FROM job_steps WHERE id=$1"))
            .bind(id).fetch_optional(&self.pool).await?)
    }

    async fn list_steps(&self, job_id: Uuid) -> Result<Vec<JobStep>> {
        Ok(sqlx::query_as::<_, JobStep>(&format!("SELECT {STEP_COLUMNS} FROM job_steps WHERE job_id=$1 ORDER BY created_at, id"))
            .bind(job_id).fetch_all(&self.pool).await?)
    }

    async fn transition_step(&self, id: Uuid, tr: &StepTransition) -> Result<Option<JobStep>> {
        let sql = format!("UPDATE job_steps SET status=$3, started_at=$4, ended_at=$5, output=$6, traceback=$7 WHERE id=$1 AND status=$2 RETURNING {STEP_COLUMNS}");
        Ok(sqlx::query_as::<_, JobStep>(&sql)
            .bind(id).bind(tr.expected.as_str()).bind(tr.status.as_str()).bind(tr.start).bind(tr.end)
            .bind(&tr.output).bind(&tr.traceback)
            .fetch_optional(&self.pool).await?)
    }
}

#[async_trait]
impl PatchRepository for PgStore {
    async fn insert_patch(&self, c: &NewPatch) -> Result<Patch> {
        let mut tx = self.pool.begin().await?;
        // serializes naming per bench; the unique index still guards content
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))").bind(&c.bench).execute(&mut *tx).await?;
        let existing: Option<(String, Option<String>)> = sqlx::query_as("SELECT name, filename FROM app_patches WHERE bench=$1 AND patch_digest=$2")
            .bind(&c.bench).bind(&c.patch_digest).fetch_optional(&mut *tx).await?;
        if let Some((name, filename)) = existing {
            return Err(Error::DuplicatePatch { bench: c.bench.clone(), existing: name, filename });
        }
        let base = format!("{}-p", c.bench);
        let taken: Vec<String> = sqlx::query_scalar("SELECT name FROM app_patches WHERE name LIKE $1 ESCAPE '\\'")
            .bind(format!("{}%", escape_like(&base))).fetch_all(&mut *tx).await?;
        let name = next_free_name(&base, taken.iter().map(String::as_str));
        debug!(bench=%c.bench, %name, "patch.name_assigned");
        let sql = format!("INSERT INTO app_patches ({PATCH_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,NOW()) RETURNING {PATCH_COLUMNS}");
        let inserted = sqlx::query_as::<_, Patch>(&sql)
            .bind(&name).bind(&c.bench).bind(&c.release_group).bind(&c.app).bind(&c.app_release)
            .bind(&c.patch).bind(&c.patch_digest).bind(&c.url).bind(&c.filename).bind(c.build_assets)
            .bind(PatchStatus::NotApplied.as_str())
            .fetch_one(&mut *tx).await;
        match inserted {
            Ok(patch) => { tx.commit().await?; Ok(patch) }
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                match self.existing_patch(&c.bench, &c.patch_digest).await? {
                    Some((existing, filename)) => Err(Error::DuplicatePatch { bench: c.bench.clone(), existing, filename }),
                    None => Err(Error::Storage(format!("patch name {name} already taken"))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_patch(&self, name: &str) -> Result<Option<Patch>> {
        Ok(sqlx::query_as::<_, Patch>(&format!("SELECT {PATCH_COLUMNS} FROM app_patches WHERE name=$1"))
            .bind(name).fetch_optional(&self.pool).await?)
    }

    async fn list_patches(&self, f: &PatchFilter) -> Result<Vec<Patch>> {
        let sql = format!("SELECT {PATCH_COLUMNS} FROM app_patches WHERE ($1::text IS NULL OR release_group=$1) AND ($2::text IS NULL OR bench=$2) ORDER BY created_at DESC, name DESC");
        Ok(sqlx::query_as::<_, Patch>(&sql).bind(&f.release_group).bind(&f.bench).fetch_all(&self.pool).await?)
    }

    async fn set_patch_status(&self, name: &str, status: PatchStatus) -> Result<()> {
        let res = sqlx::query("UPDATE app_patches SET status=$2 WHERE name=$1").bind(name).bind(status.as_str()).execute(&self.pool).await?;
        if res.rows_affected() == 0 { return Err(Error::not_found("patch", name)); }
        Ok(())
    }
}

#[async_trait]
impl BenchDirectory for PgStore {
    async fn get_bench(&self, name: &str) -> Result<Option<Bench>> {
        Ok(sqlx::query_as::<_, Bench>("SELECT name, release_group, server, status, created_at FROM benches WHERE name=$1")
            .bind(name).fetch_optional(&self.pool).await?)
    }

    async fn list_benches(&self, release_group: &str, status: BenchStatus) -> Result<Vec<Bench>> {
        Ok(sqlx::query_as::<_, Bench>("SELECT name, release_group, server, status, created_at FROM benches WHERE release_group=$1 AND status=$2 ORDER BY created_at, name")
            .bind(release_group).bind(status.as_str()).fetch_all(&self.pool).await?)
    }

    async fn find_bench_app(&self, bench: &str, app: &str) -> Result<Option<BenchApp>> {
        Ok(sqlx::query_as::<_, BenchApp>("SELECT id, bench, app, revision, seq FROM bench_apps WHERE bench=$1 AND app=$2 ORDER BY seq LIMIT 1")
            .bind(bench).bind(app).fetch_optional(&self.pool).await?)
    }

    async fn default_release_group(&self) -> Result<Option<ReleaseGroup>> {
        Ok(sqlx::query_as::<_, ReleaseGroup>("SELECT name, is_default, apps FROM release_groups WHERE is_default LIMIT 1")
            .fetch_optional(&self.pool).await?)
    }

    async fn list_app_sources(&self, names: &[String]) -> Result<Vec<AppSource>> {
        Ok(sqlx::query_as::<_, AppSource>("SELECT name, frappe, branch, scrubbed, url, repo_owner FROM app_sources WHERE name = ANY($1)")
            .bind(names).fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl SiteDirectory for PgStore {
    async fn insert_site(&self, s: &Site) -> Result<()> {
        let res = sqlx::query(&format!("INSERT INTO sites ({SITE_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"))
            .bind(&s.name).bind(&s.subdomain).bind(&s.bench).bind(&s.release_group).bind(s.status.as_str())
            .bind(sqlx::types::Json(&s.apps)).bind(s.enable_scheduled_backups).bind(s.enable_uptime_monitoring)
            .bind(&s.config).bind(s.created_at).bind(s.modified_at)
            .execute(&self.pool).await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::invalid(format!("site {} already exists", s.name))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_site(&self, name: &str) -> Result<Option<Site>> {
        Ok(sqlx::query_as::<_, Site>(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE name=$1"))
            .bind(name).fetch_optional(&self.pool).await?)
    }

    async fn subdomain_exists(&self, subdomain: &str) -> Result<bool> {
        Ok(sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM sites WHERE subdomain=$1)")
            .bind(subdomain).fetch_one(&self.pool).await?)
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        Ok(sqlx::query_as::<_, Site>(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY created_at DESC"))
            .fetch_all(&self.pool).await?)
    }

    async fn update_site_config(&self, name: &str, config: &serde_json::Value, at: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query("UPDATE sites SET config=$2, modified_at=$3 WHERE name=$1")
            .bind(name).bind(config).bind(at).execute(&self.pool).await?;
        if res.rows_affected() == 0 { return Err(Error::not_found("site", name)); }
        Ok(())
    }

    async fn set_site_status(&self, name: &str, status: SiteStatus, at: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query("UPDATE sites SET status=$2, modified_at=$3 WHERE name=$1")
            .bind(name).bind(status.as_str()).bind(at).execute(&self.pool).await?;
        if res.rows_affected() == 0 { return Err(Error::not_found("site", name)); }
        Ok(())
    }

    async fn insert_domain(&self, d: &SiteDomain) -> Result<()> {
        let res = sqlx::query("INSERT INTO site_domains (name, site, domain, status, job, created_at) VALUES ($1,$2,$3,$4,$5,$6)")
            .bind(d.name).bind(&d.site).bind(&d.domain).bind(d.status.as_str()).bind(d.job).bind(d.created_at)
            .execute(&self.pool).await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::invalid(format!("domain {} is already in use", d.domain))),
            Err(e) => Err(e.into()),
        }
    }

    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        Ok(sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM site_domains WHERE domain=$1)")
            .bind(domain).fetch_one(&self.pool).await?)
    }

    async fn list_domains(&self, site: &str) -> Result<Vec<SiteDomain>> {
        Ok(sqlx::query_as::<_, SiteDomain>("SELECT name, site, domain, status, job, created_at FROM site_domains WHERE site=$1 ORDER BY created_at, name")
            .bind(site).fetch_all(&self.pool).await?)
    }

    async fn set_domain_status_for_job(&self, job: Uuid, status: DomainStatus) -> Result<()> {
        sqlx::query("UPDATE site_domains SET status=$2 WHERE job=$1").bind(job).bind(status.as_str()).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_backup(&self, b: &SiteBackup) -> Result<()> {
        sqlx::query("INSERT INTO site_backups (name, site, job, database_file, size, url, status, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)")
            .bind(b.name).bind(&b.site).bind(b.job).bind(&b.database_file).bind(b.size).bind(&b.url)
            .bind(b.status.as_str()).bind(b.created_at)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn list_backups(&self, site: &str, limit: i64) -> Result<Vec<SiteBackup>> {
        Ok(sqlx::query_as::<_, SiteBackup>("SELECT name, site, job, database_file, size, url, status, created_at FROM site_backups WHERE site=$1 ORDER BY created_at DESC, name DESC LIMIT $2")
            .bind(site).bind(limit.max(0)).fetch_all(&self.pool).await?)
    }

    async fn set_backup_status_for_job(&self, job: Uuid, status: BackupStatus) -> Result<()> {
        sqlx::query("UPDATE site_backups SET status=$2 WHERE job=$1").bind(job).bind(status.as_str()).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_activity(&self, a: &SiteActivity) -> Result<()> {
        sqlx::query("INSERT INTO site_activities (id, site, action, owner, created_at) VALUES ($1,$2,$3,$4,$5)")
            .bind(a.id).bind(&a.site).bind(&a.action).bind(&a.owner).bind(a.created_at)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn list_activities(&self, site: &str, limit: i64) -> Result<Vec<SiteActivity>> {
        Ok(sqlx::query_as::<_, SiteActivity>("SELECT id, site, action, owner, created_at FROM site_activities WHERE site=$1 ORDER BY created_at DESC, id DESC LIMIT $2")
            .bind(site).bind(limit.max(0)).fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl LogStore for PgStore {
    async fn request_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<RequestLog>> {
        Ok(sqlx::query_as::<_, RequestLog>("SELECT site, timestamp, duration FROM site_request_logs WHERE site=$1 AND timestamp >= $2")
            .bind(site).bind(since).fetch_all(&self.pool).await?)
    }

    async fn job_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<JobLog>> {
        Ok(sqlx::query_as::<_, JobLog>("SELECT site, timestamp, duration FROM site_job_logs WHERE site=$1 AND timestamp >= $2")
            .bind(site).bind(since).fetch_all(&self.pool).await?)
    }

    async fn uptime_logs(&self, site: &str, since: DateTime<Utc>) -> Result<Vec<UptimeLog>> {
        Ok(sqlx::query_as::<_, UptimeLog>("SELECT site, timestamp, web, scheduler, socketio FROM site_uptime_logs WHERE site=$1 AND timestamp >= $2")
            .bind(site).bind(since).fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
