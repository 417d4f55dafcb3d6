//! Test harness utilities for unit and integration tests.
//! Builds an [`AppState`] over the in-memory store, the recording agent and a
//! fixed patch source, and keeps typed handles to them so tests can seed and
//! inspect what the services did.
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use crate::{AppState, agent::MockAgent, config::Config, models::*, services::patches::StaticPatchSource, store::memory::MemoryStore};

pub const TEST_DOMAIN: &str = "sites.test";

pub struct TestState {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub agent: Arc<MockAgent>,
}

impl TestState {
    pub fn new(config: Config, source: StaticPatchSource) -> Self {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(MockAgent::new());
        let state = AppState { store: store.clone(), agent: agent.clone(), patch_source: Arc::new(source), config: Arc::new(config) };
        Self { state, store, agent }
    }

    /// Bench on `server-1` created `age_secs` seconds ago.
    pub fn bench(&self, name: &str, group: &str, status: BenchStatus, age_secs: i64) {
        self.store.add_bench(Bench {
            name: name.into(), release_group: group.into(), server: "server-1".into(), status,
            created_at: Utc::now() - Duration::seconds(age_secs),
        });
    }

    /// Default release group `g1` with frappe and erpnext, and Active benches
    /// `b1` (older) and `b2` each carrying an erpnext revision.
    pub fn seed_group(&self) {
        self.store.add_release_group(ReleaseGroup { name: "g1".into(), is_default: true, apps: vec!["frappe".into(), "erpnext".into()] });
        for (app, owner) in [("erpnext", "frappe"), ("frappe", "frappe")] {
            self.store.add_app_source(AppSource {
                name: app.into(), frappe: app == "frappe", branch: "version-15".into(), scrubbed: app.into(),
                url: format!("https://github.com/{owner}/{app}"), repo_owner: owner.into(),
            });
        }
        self.bench("b1", "g1", BenchStatus::Active, 600);
        self.bench("b2", "g1", BenchStatus::Active, 60);
        self.store.add_bench_app("b1", "erpnext", "r1");
        self.store.add_bench_app("b2", "erpnext", "r2");
    }

    /// Site record in `status` on bench `b1`, bypassing creation.
    pub fn site(&self, subdomain: &str, status: SiteStatus) -> String {
        let name = format!("{subdomain}.{TEST_DOMAIN}");
        let now = Utc::now();
        let site = Site {
            name: name.clone(), subdomain: subdomain.into(), bench: "b1".into(), release_group: "g1".into(), status,
            apps: vec!["frappe".into(), "erpnext".into()], enable_scheduled_backups: false, enable_uptime_monitoring: false,
            config: serde_json::json!({}), created_at: now, modified_at: now,
        };
        self.store.seed_site(site);
        name
    }
}

pub fn test_config() -> Config {
    Config { domain: TEST_DOMAIN.into(), ..Config::default() }
}

/// Empty store, default config on the test domain.
pub fn test_state() -> TestState { TestState::new(test_config(), StaticPatchSource::default()) }

/// Whole-second timestamp helper for analytics fixtures.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
