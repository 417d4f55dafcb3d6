use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use crate::error::Error;

/// Text-backed status enums. Stored and serialized with their display names.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
        pub enum $name { $(#[serde(rename = $text)] $variant),+ }

        impl $name {
            pub fn as_str(&self) -> &'static str { match self { $(Self::$variant => $text),+ } }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
        }

        impl std::str::FromStr for $name {
            type Err = Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s { $($text => Ok(Self::$variant),)+ other => Err(Error::invalid(format!("unknown {} '{other}'", stringify!($name)))) }
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;
            fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
        }
    };
}

text_enum!(
    /// Lifecycle shared by jobs and job steps.
    JobStatus { Pending => "Pending", Running => "Running", Success => "Success", Failure => "Failure" }
);

impl JobStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Success | Self::Failure) }
    /// Pending -> Running -> {Success, Failure}; a job may also fail before it starts.
    /// Terminal states are final.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!((self, next), (Self::Pending, Self::Running) | (Self::Pending, Self::Failure) | (Self::Running, Self::Success) | (Self::Running, Self::Failure))
    }
}

text_enum!(JobType {
    NewSite => "New Site",
    BackupSite => "Backup Site",
    ArchiveSite => "Archive Site",
    AddDomain => "Add Domain",
    UpdateSiteConfiguration => "Update Site Configuration",
    ApplyPatch => "Apply Patch",
    RevertPatch => "Revert Patch",
});

text_enum!(PatchStatus { NotApplied => "Not Applied", InProgress => "In Progress", Applied => "Applied", Failure => "Failure" });
text_enum!(BenchStatus { Pending => "Pending", Active => "Active", Broken => "Broken", Archived => "Archived" });
text_enum!(SiteStatus { Pending => "Pending", Active => "Active", Inactive => "Inactive", Broken => "Broken", Archived => "Archived" });
text_enum!(DomainStatus { Pending => "Pending", Active => "Active", Broken => "Broken" });
text_enum!(BackupStatus { Pending => "Pending", Success => "Success", Failure => "Failure" });

fn seconds_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
        _ => None,
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub job_type: JobType,
    pub site: Option<String>,
    pub bench: Option<String>,
    pub patch: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "started_at")]
    pub start: Option<DateTime<Utc>>,
    #[sqlx(rename = "ended_at")]
    pub end: Option<DateTime<Utc>>,
}

impl Job {
    /// Only defined once the job has both started and ended.
    pub fn duration(&self) -> Option<f64> {
        if !self.status.is_terminal() { return None; }
        seconds_between(self.start, self.end)
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobStep {
    pub id: Uuid,
    pub job_id: Uuid,
    pub step_name: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "started_at")]
    pub start: Option<DateTime<Utc>>,
    #[sqlx(rename = "ended_at")]
    pub end: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub traceback: Option<String>,
}

/// Orders by creation time, then id.
pub fn creation_order(a: (DateTime<Utc>, Uuid), b: (DateTime<Utc>, Uuid)) -> std::cmp::Ordering {
    a.0.cmp(&b.0).then(a.1.cmp(&b.1))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct JobSummary {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub creation: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
}

impl From<&Job> for JobSummary {
    fn from(j: &Job) -> Self {
        Self { id: j.id, job_type: j.job_type, status: j.status, creation: j.created_at, start: j.start, end: j.end, duration: j.duration() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct StepDetail {
    pub id: Uuid,
    pub step_name: String,
    pub status: JobStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub output: Option<String>,
    pub traceback: Option<String>,
}

impl From<&JobStep> for StepDetail {
    fn from(s: &JobStep) -> Self {
        let duration = if s.status.is_terminal() { seconds_between(s.start, s.end) } else { None };
        Self { id: s.id, step_name: s.step_name.clone(), status: s.status, start: s.start, end: s.end, duration, output: s.output.clone(), traceback: s.traceback.clone() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct JobDetail {
    pub id: Uuid,
    pub job_type: JobType,
    pub site: Option<String>,
    pub bench: Option<String>,
    pub patch: Option<String>,
    pub status: JobStatus,
    pub creation: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub steps: Vec<StepDetail>,
}

impl JobDetail {
    pub fn new(job: &Job, steps: &[JobStep]) -> Self {
        Self {
            id: job.id, job_type: job.job_type, site: job.site.clone(), bench: job.bench.clone(), patch: job.patch.clone(),
            status: job.status, creation: job.created_at, start: job.start, end: job.end, duration: job.duration(),
            steps: steps.iter().map(StepDetail::from).collect(),
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Patch {
    pub name: String,
    pub bench: String,
    pub release_group: String,
    pub app: String,
    pub app_release: String,
    pub patch: String,
    pub patch_digest: String,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub build_assets: bool,
    #[sqlx(try_from = "String")]
    pub status: PatchStatus,
    pub created_at: DateTime<Utc>,
}

/// A patch that passed resolution but has no name yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPatch {
    pub bench: String,
    pub release_group: String,
    pub app: String,
    pub app_release: String,
    pub patch: String,
    pub patch_digest: String,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub build_assets: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct PatchSummary {
    pub name: String,
    pub bench: String,
    pub release_group: String,
    pub app: String,
    pub app_release: String,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub build_assets: bool,
    pub status: PatchStatus,
    pub creation: DateTime<Utc>,
}

impl From<&Patch> for PatchSummary {
    fn from(p: &Patch) -> Self {
        Self {
            name: p.name.clone(), bench: p.bench.clone(), release_group: p.release_group.clone(), app: p.app.clone(),
            app_release: p.app_release.clone(), filename: p.filename.clone(), url: p.url.clone(), build_assets: p.build_assets,
            status: p.status, creation: p.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Bench {
    pub name: String,
    pub release_group: String,
    pub server: String,
    #[sqlx(try_from = "String")]
    pub status: BenchStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BenchApp {
    pub id: Uuid,
    pub bench: String,
    pub app: String,
    pub revision: String,
    /// Insertion order within the bench.
    pub seq: i64,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReleaseGroup {
    pub name: String,
    pub is_default: bool,
    /// App names in the group's display order.
    #[sqlx(json)]
    pub apps: Vec<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct AppSource {
    pub name: String,
    pub frappe: bool,
    pub branch: String,
    pub scrubbed: String,
    pub url: String,
    pub repo_owner: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Site {
    pub name: String,
    pub subdomain: String,
    pub bench: String,
    pub release_group: String,
    #[sqlx(try_from = "String")]
    pub status: SiteStatus,
    #[sqlx(json)]
    pub apps: Vec<String>,
    pub enable_scheduled_backups: bool,
    pub enable_uptime_monitoring: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SiteDomain {
    pub name: Uuid,
    pub site: String,
    pub domain: String,
    #[sqlx(try_from = "String")]
    pub status: DomainStatus,
    pub job: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SiteBackup {
    pub name: Uuid,
    pub site: String,
    pub job: Option<Uuid>,
    pub database_file: Option<String>,
    pub size: Option<i64>,
    pub url: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SiteActivity {
    pub id: Uuid,
    pub site: String,
    pub action: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct SiteSummary { pub name: String, pub status: SiteStatus, pub modified: DateTime<Utc> }

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct InstalledApp { pub name: String, pub owner: String, pub repo: String, pub url: String, pub branch: String }

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct SiteDetail {
    pub name: String,
    pub status: SiteStatus,
    pub installed_apps: Vec<InstalledApp>,
    pub creation: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct DomainSummary { pub name: Uuid, pub domain: String, pub status: DomainStatus }

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct BackupSummary {
    pub name: Uuid,
    pub database: Option<String>,
    pub size: Option<i64>,
    pub url: Option<String>,
    pub creation: DateTime<Utc>,
    pub status: BackupStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct ActivitySummary { pub action: String, pub creation: DateTime<Utc>, pub owner: String }

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestLog { pub site: String, pub timestamp: DateTime<Utc>, pub duration: f64 }

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobLog { pub site: String, pub timestamp: DateTime<Utc>, pub duration: f64 }

/// One uptime probe. Each signal is 1.0 (up) or 0.0 (down); missing when the probe skipped it.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UptimeLog {
    pub site: String,
    pub timestamp: DateTime<Utc>,
    pub web: Option<f64>,
    pub scheduler: Option<f64>,
    pub socketio: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_state_machine() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failure));
        assert!(Pending.can_transition_to(Failure));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Failure));
        assert!(!Failure.can_transition_to(Running));
    }

    #[test]
    fn job_type_text_round_trips_through_storage_form() {
        assert_eq!("Apply Patch".parse::<JobType>().unwrap(), JobType::ApplyPatch);
        assert_eq!(JobType::UpdateSiteConfiguration.as_str(), "Update Site Configuration");
        assert!("Reboot".parse::<JobType>().is_err());
        assert_eq!(serde_json::to_value(PatchStatus::NotApplied).unwrap(), serde_json::json!("Not Applied"));
    }

    #[test]
    fn duration_undefined_until_terminal() {
        let start = Utc::now();
        let mut job = Job { id: Uuid::new_v4(), job_type: JobType::BackupSite, site: None, bench: None, patch: None,
            status: JobStatus::Running, created_at: start, start: Some(start), end: None };
        assert_eq!(job.duration(), None);
        job.status = JobStatus::Success;
        job.end = Some(start + chrono::Duration::milliseconds(2500));
        assert_eq!(job.duration(), Some(2.5));
    }
}
