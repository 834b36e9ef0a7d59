use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{NodeError, Result};
use crate::ipfs::IpfsClient;

/// Outcome of one pipeline step as recorded by the flow engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    #[default]
    NotRun,
    Ok,
    Error(String),
}

impl StepStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, StepStatus::Error(_))
    }
}

/// The slice of a flow's stored state the work loop reads back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlowResults {
    pub job_addr: String,
    pub run_addr: String,
    #[serde(default)]
    pub result_ipfs: Option<String>,
    #[serde(default)]
    pub clone: StepStatus,
    #[serde(default)]
    pub checkout: StepStatus,
}

/// One workflow execution, addressable by id. The engine owns the record;
/// the node only reads the results and dispatches effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub pipeline: Value,
    pub results: FlowResults,
}

impl Flow {
    /// A flow is finished once a result hash has been recorded.
    pub fn finished(&self) -> bool {
        self.results.result_ipfs.is_some()
    }

    /// A git stage failed; the compensating effect must run before
    /// finalization.
    pub fn git_failed(&self) -> bool {
        self.results.clone.is_error() || self.results.checkout.is_error()
    }
}

/// Effect dispatched when a flow's git stages failed: record a
/// failed-result artifact so the job can still be finalized.
pub const EFFECT_COMPLETE_JOB: &str = "complete-job";

/// Boundary to the external workflow engine. The node triggers flows,
/// reads their stored state, and dispatches named compensating effects;
/// pipeline execution itself lives behind this trait.
#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn trigger(&self, flow_id: &str) -> Result<()>;
    async fn load(&self, flow_id: &str) -> Result<Option<Flow>>;
    async fn save(&self, flow: &Flow) -> Result<()>;
    async fn handle_effect(&self, name: &str, flow_id: &str) -> Result<Flow>;
}

/// File-backed flow store: one JSON document per flow id under a state
/// directory. Survives node restarts; the external engine shares the
/// directory.
pub struct FileFlowEngine {
    dir: PathBuf,
    ipfs: IpfsClient,
}

impl FileFlowEngine {
    pub fn new(dir: impl AsRef<Path>, ipfs: IpfsClient) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), ipfs }
    }

    fn path(&self, flow_id: &str) -> PathBuf {
        self.dir.join(format!("{flow_id}.json"))
    }
}

#[async_trait]
impl FlowEngine for FileFlowEngine {
    async fn trigger(&self, flow_id: &str) -> Result<()> {
        // The engine watches the store; a fresh record is the signal.
        info!(flow_id, "flow triggered");
        Ok(())
    }

    async fn load(&self, flow_id: &str) -> Result<Option<Flow>> {
        let path = self.path(flow_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, flow: &Flow) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(flow)?;
        tokio::fs::write(self.path(&flow.id), bytes).await?;
        Ok(())
    }

    async fn handle_effect(&self, name: &str, flow_id: &str) -> Result<Flow> {
        if name != EFFECT_COMPLETE_JOB {
            return Err(NodeError::FlowFailed {
                flow_id: flow_id.to_string(),
                reason: format!("unknown effect `{name}`"),
            });
        }
        let mut flow = self.load(flow_id).await?.ok_or_else(|| NodeError::FlowFailed {
            flow_id: flow_id.to_string(),
            reason: "flow not in store".to_string(),
        })?;
        if flow.finished() {
            return Ok(flow);
        }
        warn!(flow_id, "git stage failed, pinning failure artifact");
        let artifact = serde_json::json!({
            "job": flow.results.job_addr,
            "run": flow.results.run_addr,
            "status": "failed",
            "steps": {
                "clone": flow.results.clone,
                "checkout": flow.results.checkout,
            },
        });
        let cid = self.ipfs.pin_json(&artifact).await?;
        flow.results.result_ipfs = Some(cid);
        self.save(&flow).await?;
        Ok(flow)
    }
}
