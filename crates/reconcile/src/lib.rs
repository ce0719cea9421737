//! Reconciliation boundary between the control plane and cluster agents.
//!
//! Each agent poll re-compiles the manifest set for every workspace it owns
//! from current persisted state. Polling is level-triggered and has no side
//! effects, so an agent retrying after a crash just reads again. Workspace
//! compilations are independent; the batch runs them concurrently and one
//! malformed devfile can never stall the rest of the cycle.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use futures::{stream, StreamExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use devspace_compile::{compile_or_empty, to_yaml_stream};
use devspace_core::config::AgentConfig;
use devspace_core::{ActualState, DesiredState, Workspace};
use devspace_persist::WorkspaceStore;

fn compile_concurrency() -> usize {
    std::env::var("DEVSPACE_COMPILE_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(8)
}

/// Shared agent policy slot. Compilations load one snapshot up front and use
/// it throughout, so a mid-batch replacement hands in-flight work either the
/// old or the new config, never a torn mix of both.
pub struct AgentConfigCell {
    inner: ArcSwap<AgentConfig>,
}

impl AgentConfigCell {
    pub fn new(config: AgentConfig) -> Self {
        Self { inner: ArcSwap::from_pointee(config) }
    }

    pub fn snapshot(&self) -> Arc<AgentConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, config: AgentConfig) {
        self.inner.store(Arc::new(config));
    }
}

/// One workspace's slice of the poll payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceManifests {
    pub name: String,
    pub namespace: String,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub deployment_resource_version: Option<String>,
    pub generator_version: u32,
    /// Multi-document YAML stream; empty when compilation failed for this
    /// workspace.
    pub manifests_yaml: String,
}

/// Payload handed to a polling agent: everything it still owes
/// reconciliation, in stable (namespace, name) order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentPollResponse {
    pub agent_id: String,
    pub workspaces: Vec<WorkspaceManifests>,
}

/// Observed actual state for one workspace, as reported by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceReportEntry {
    pub namespace: String,
    pub name: String,
    pub actual_state: ActualState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_resource_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentReport {
    pub agent_id: String,
    pub workspaces: Vec<WorkspaceReportEntry>,
}

/// What ingesting a report did. Unknown workspaces are counted, never an
/// error: an agent may report about rows another replica already pruned.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ReportOutcome {
    pub updated: usize,
    pub pruned: usize,
    pub unknown: usize,
}

pub struct Reconciler {
    store: Arc<dyn WorkspaceStore>,
    config: Arc<AgentConfigCell>,
}

/// Cleanup confirmed: the agent has already observed the terminated state,
/// nothing is owed for this row anymore.
fn cleanup_confirmed(workspace: &Workspace) -> bool {
    workspace.desired_state == DesiredState::Terminated
        && workspace.actual_state == ActualState::Terminated
}

fn render_or_empty(workspace: &Workspace, config: &AgentConfig) -> String {
    let manifests = compile_or_empty(workspace, config);
    if manifests.is_empty() {
        return String::new();
    }
    match to_yaml_stream(&manifests) {
        Ok(yaml) => yaml,
        Err(e) => {
            warn!(
                workspace = %workspace.name,
                namespace = %workspace.namespace,
                error = %format!("{:#}", e),
                "manifest serialization failed; emitting empty set"
            );
            String::new()
        }
    }
}

fn poll_entry(workspace: Workspace, config: &AgentConfig) -> WorkspaceManifests {
    let manifests_yaml = render_or_empty(&workspace, config);
    WorkspaceManifests {
        name: workspace.name,
        namespace: workspace.namespace,
        desired_state: workspace.desired_state,
        actual_state: workspace.actual_state,
        deployment_resource_version: workspace.deployment_resource_version,
        generator_version: workspace.desired_config_generator_version,
        manifests_yaml,
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn WorkspaceStore>, config: Arc<AgentConfigCell>) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AgentConfigCell {
        &self.config
    }

    /// Compile the full desired-state payload for one agent. Read-only:
    /// repeating the call from an unchanged store yields an identical
    /// response.
    pub async fn poll(&self, agent_id: &str) -> Result<AgentPollResponse> {
        let t0 = std::time::Instant::now();
        let workspaces = self.store.list_for_agent(agent_id)?;
        let total = workspaces.len();

        let entries: Vec<WorkspaceManifests> = stream::iter(
            workspaces.into_iter().filter(|ws| !cleanup_confirmed(ws)),
        )
        .map(|ws| {
            let config = self.config.snapshot();
            // compilation is pure CPU work; keep it off the async workers
            tokio::task::spawn_blocking(move || poll_entry(ws, &config))
        })
        .buffered(compile_concurrency())
        .map(|joined| joined.expect("manifest compilation task panicked"))
        .collect()
        .await;

        debug!(agent = %agent_id, total, compiled = entries.len(), "agent poll compiled");
        counter!("reconcile_poll_total", 1u64);
        histogram!("reconcile_poll_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(AgentPollResponse { agent_id: agent_id.to_string(), workspaces: entries })
    }

    /// Apply agent observations to persisted state. This is the only path
    /// that advances `actual_state`; rows whose termination the agent
    /// confirms are dropped here.
    pub fn ingest_report(&self, report: &AgentReport) -> Result<ReportOutcome> {
        let mut outcome = ReportOutcome::default();
        for entry in &report.workspaces {
            let Some(workspace) = self.store.get(&entry.namespace, &entry.name)? else {
                warn!(
                    agent = %report.agent_id,
                    namespace = %entry.namespace,
                    workspace = %entry.name,
                    "report names unknown workspace; skipping"
                );
                outcome.unknown += 1;
                continue;
            };
            if entry.actual_state == ActualState::Terminated
                && workspace.desired_state == DesiredState::Terminated
            {
                self.store.remove(&entry.namespace, &entry.name)?;
                outcome.pruned += 1;
                continue;
            }
            if self.store.record_actual_state(
                &entry.namespace,
                &entry.name,
                entry.actual_state,
                entry.deployment_resource_version.as_deref(),
            )? {
                outcome.updated += 1;
            }
        }
        counter!("reconcile_report_total", 1u64);
        if outcome.unknown > 0 {
            counter!("reconcile_report_unknown_total", outcome.unknown as u64);
        }
        Ok(outcome)
    }
}
