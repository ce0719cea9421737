//! Workspace creation pipeline.
//!
//! A fixed, ordered chain of steps turns raw request params plus a devfile
//! source into a persisted Workspace. Every fallible step returns a tagged
//! [`PipelineError`]; the orchestrator short-circuits on the first failure
//! and is the single place errors become a caller-facing response. All steps
//! before the Creator are pure, so a halted run leaves nothing to unwind.

#![forbid(unsafe_code)]

pub mod fs;
pub mod steps;

use std::sync::Arc;

use tracing::{debug, warn};

use devspace_core::config::AgentConfig;
use devspace_core::error::{PipelineError, PipelineResponse};
use devspace_core::{DesiredState, Workspace};
use devspace_devfile::flatten::ParentResolver;
use devspace_devfile::Devfile;
use devspace_inject::{ProjectSource, ToolsConfig, VolumeSettings, WorkspaceVolume};
use devspace_persist::WorkspaceStore;

/// Where the devfile text comes from.
#[derive(Debug, Clone)]
pub enum DevfileSource {
    Inline(String),
    /// Reference resolved through the repository collaborator.
    Repo(String),
}

/// Raw creation request accepted by the orchestrator.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub name: String,
    pub namespace: String,
    pub agent_id: String,
    pub desired_state: DesiredState,
    pub source: DevfileSource,
    pub project: Option<ProjectSource>,
}

/// External collaborator resolving repo-hosted devfile references.
pub trait DevfileRepository: Send + Sync {
    fn fetch(&self, reference: &str) -> anyhow::Result<String>;
}

/// Context threaded step to step. Steps own it for the duration of their
/// `run` call; there is no shared mutable state.
pub struct Context {
    pub params: CreateParams,
    pub devfile: Option<Devfile>,
    pub volume: Option<WorkspaceVolume>,
    pub workspace: Option<Workspace>,
}

impl Context {
    pub fn new(params: CreateParams) -> Self {
        Self { params, devfile: None, volume: None, workspace: None }
    }

    /// Fail-loud accessor: a step asking for a devfile before the fetcher
    /// ran is a wiring bug, never a runtime condition.
    pub fn devfile(&self) -> &Devfile {
        self.devfile.as_ref().expect("pipeline invariant: devfile not fetched yet")
    }

    pub fn take_devfile(&mut self) -> Devfile {
        self.devfile.take().expect("pipeline invariant: devfile not fetched yet")
    }

    pub fn volume(&self) -> &WorkspaceVolume {
        self.volume.as_ref().expect("pipeline invariant: volume not defined yet")
    }
}

/// A single pipeline stage. Infallible (`map`) stages simply never return
/// `Err`.
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: Context) -> Result<Context, PipelineError>;
}

/// Collaborators the standard step sequence is wired with.
pub struct PipelineDeps {
    pub repository: Arc<dyn DevfileRepository>,
    pub resolver: Arc<dyn ParentResolver + Send + Sync>,
    pub store: Arc<dyn WorkspaceStore>,
    pub config: Arc<AgentConfig>,
    pub volume_settings: VolumeSettings,
    pub tools: ToolsConfig,
}

pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    /// The fixed step order. Injectors depend on structures added by earlier
    /// steps, so this sequence is part of the contract.
    pub fn standard(deps: PipelineDeps) -> Self {
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(steps::DevfileFetcher::new(deps.repository)),
            Box::new(steps::PreFlattenDevfileValidator),
            Box::new(steps::DevfileFlattener::new(deps.resolver)),
            Box::new(steps::PostFlattenDevfileValidator::new(deps.config.max_components)),
            Box::new(steps::VolumeDefiner::new(deps.volume_settings)),
            Box::new(steps::ToolsInjectorComponentInserter::new(deps.tools.clone())),
            Box::new(steps::MainComponentUpdater),
            Box::new(steps::ProjectClonerComponentInserter::new(deps.tools)),
            Box::new(steps::VolumeComponentInserter),
            Box::new(steps::Creator::new(deps.store, deps.config)),
        ];
        Self { steps }
    }

    /// Custom step sequence; tests use this to probe orchestrator behavior.
    pub fn with_steps(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Run every step in order, stopping at the first failure. The final
    /// context must carry a workspace; anything else means the step list is
    /// incomplete, which panics rather than masquerading as success.
    pub fn run(&self, params: CreateParams) -> PipelineResponse<Workspace> {
        let mut ctx = Context::new(params);
        for step in &self.steps {
            debug!(step = step.name(), "pipeline step start");
            match step.run(ctx) {
                Ok(next) => ctx = next,
                Err(err) => {
                    warn!(step = step.name(), error = %err, "pipeline halted");
                    metrics::counter!("pipeline_error_total", 1u64);
                    return PipelineResponse::from_error(err);
                }
            }
        }
        let workspace =
            ctx.workspace.expect("pipeline invariant: step sequence finished without a workspace");
        metrics::counter!("pipeline_success_total", 1u64);
        PipelineResponse::Success { payload: workspace }
    }
}
