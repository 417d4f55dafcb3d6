//! Client side of the execution agent that runs on every bench server.
//!
//! The control plane only hands jobs over; progress comes back through the
//! callback routes (`/agent/jobs/...`).
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{atomic::{AtomicBool, Ordering}, Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;
use crate::config::{AgentMode, Config};
use crate::models::JobType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub server: Option<String>,
    pub bench: Option<String>,
    pub site: Option<String>,
    pub params: serde_json::Value,
}

#[async_trait]
pub trait ExecutionAgent: Send + Sync + 'static {
    /// Hand a job to the agent. An error means the agent did not accept it.
    async fn dispatch(&self, req: &DispatchRequest) -> anyhow::Result<()>;
    /// Ask the agent for an administrator session id on a site.
    async fn login_session(&self, server: &str, bench: &str, site: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpAgent { client: reqwest::Client, base_url: String }

impl HttpAgent {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }
}

#[derive(Deserialize)]
struct LoginResponse { sid: String }

#[async_trait]
impl ExecutionAgent for HttpAgent {
    async fn dispatch(&self, req: &DispatchRequest) -> anyhow::Result<()> {
        let url = format!("{}/jobs", self.base_url);
        debug!(%url, job_id=%req.job_id, job_type=%req.job_type, "agent.dispatch");
        self.client.post(&url).json(req).send().await?.error_for_status()?;
        Ok(())
    }

    async fn login_session(&self, server: &str, bench: &str, site: &str) -> anyhow::Result<String> {
        let url = format!("{}/benches/{bench}/sites/{site}/sid", self.base_url);
        debug!(%url, %server, "agent.login_session");
        let resp: LoginResponse = self.client.post(&url).query(&[("server", server)]).send().await?.error_for_status()?.json().await?;
        Ok(resp.sid)
    }
}

/// In-process agent that accepts (or rejects) everything and remembers what it was sent.
#[derive(Debug, Default)]
pub struct MockAgent { dispatched: Mutex<Vec<DispatchRequest>>, reject: AtomicBool }

impl MockAgent {
    pub fn new() -> Self { Self::default() }
    /// Make every following dispatch fail.
    pub fn set_rejecting(&self, reject: bool) { self.reject.store(reject, Ordering::SeqCst); }
    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.dispatched.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl ExecutionAgent for MockAgent {
    async fn dispatch(&self, req: &DispatchRequest) -> anyhow::Result<()> {
        if self.reject.load(Ordering::SeqCst) { anyhow::bail!("agent unavailable"); }
        self.dispatched.lock().unwrap_or_else(|p| p.into_inner()).push(req.clone());
        Ok(())
    }

    async fn login_session(&self, _server: &str, _bench: &str, _site: &str) -> anyhow::Result<String> {
        if self.reject.load(Ordering::SeqCst) { anyhow::bail!("agent unavailable"); }
        Ok(Uuid::new_v4().simple().to_string())
    }
}

pub fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn ExecutionAgent>> {
    match cfg.agent {
        AgentMode::Http => {
            info!(url=%cfg.agent_url, "agent.init_http");
            Ok(Arc::new(HttpAgent::new(cfg.agent_url.clone(), cfg.agent_timeout)?))
        }
        AgentMode::Mock => {
            info!("agent.init_mock");
            Ok(Arc::new(MockAgent::new()))
        }
    }
}
