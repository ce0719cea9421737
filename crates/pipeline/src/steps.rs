//! The individual pipeline stages, in their fixed execution order.

use std::sync::Arc;

use uuid::Uuid;

use devspace_core::config::AgentConfig;
use devspace_core::error::PipelineError;
use devspace_core::{ActualState, Workspace, GENERATOR_VERSION};
use devspace_devfile::flatten::{self, ParentResolver};
use devspace_devfile::validate::{is_dns_label, post_flatten_violations, pre_flatten_violations};
use devspace_devfile::Devfile;
use devspace_inject as inject;
use devspace_inject::ToolsConfig;
use devspace_persist::WorkspaceStore;

use crate::{Context, DevfileRepository, DevfileSource, Step};

fn max_devfile_bytes() -> usize {
    std::env::var("DEVSPACE_MAX_DEVFILE_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

/// Fetch and parse the devfile source; validate request params along the
/// way. All failures here are client errors.
pub struct DevfileFetcher {
    repository: Arc<dyn DevfileRepository>,
}

impl DevfileFetcher {
    pub fn new(repository: Arc<dyn DevfileRepository>) -> Self {
        Self { repository }
    }
}

impl Step for DevfileFetcher {
    fn name(&self) -> &'static str {
        "devfile_fetcher"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let mut violations = Vec::new();
        if !is_dns_label(&ctx.params.name) {
            violations.push(format!("workspace name '{}' must be a DNS-1123 label", ctx.params.name));
        }
        if !is_dns_label(&ctx.params.namespace) {
            violations.push(format!("namespace '{}' must be a DNS-1123 label", ctx.params.namespace));
        }
        if ctx.params.agent_id.is_empty() {
            violations.push("agent id is required".to_string());
        }
        if !violations.is_empty() {
            return Err(PipelineError::ParamsValidationFailed { violations });
        }

        let raw = match &ctx.params.source {
            DevfileSource::Inline(yaml) => yaml.clone(),
            DevfileSource::Repo(reference) => self
                .repository
                .fetch(reference)
                .map_err(|e| PipelineError::DevfileLoadFailed { details: format!("{:#}", e) })?,
        };
        if raw.len() > max_devfile_bytes() {
            return Err(PipelineError::ParamsValidationFailed {
                violations: vec![format!("devfile too large (>{} bytes)", max_devfile_bytes())],
            });
        }

        let devfile = Devfile::from_yaml(&raw)
            .map_err(|e| PipelineError::DevfileYamlParseFailed { details: format!("{:#}", e) })?;
        if devfile.schema_version.is_empty() {
            return Err(PipelineError::ParamsValidationFailed {
                violations: vec!["devfile is missing schemaVersion".to_string()],
            });
        }

        ctx.devfile = Some(devfile);
        Ok(ctx)
    }
}

/// Reject disallowed shapes before any flattening work happens.
pub struct PreFlattenDevfileValidator;

impl Step for PreFlattenDevfileValidator {
    fn name(&self) -> &'static str {
        "pre_flatten_devfile_validator"
    }

    fn run(&self, ctx: Context) -> Result<Context, PipelineError> {
        let violations = pre_flatten_violations(ctx.devfile());
        if violations.is_empty() {
            Ok(ctx)
        } else {
            Err(PipelineError::PreFlattenValidationFailed { violations })
        }
    }
}

/// Inline parent references into one self-contained model.
pub struct DevfileFlattener {
    resolver: Arc<dyn ParentResolver + Send + Sync>,
}

impl DevfileFlattener {
    pub fn new(resolver: Arc<dyn ParentResolver + Send + Sync>) -> Self {
        Self { resolver }
    }
}

impl Step for DevfileFlattener {
    fn name(&self) -> &'static str {
        "devfile_flattener"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let devfile = ctx.take_devfile();
        let flat = flatten::flatten(devfile, self.resolver.as_ref())
            .map_err(|e| PipelineError::DevfileFlattenFailed { details: format!("{:#}", e) })?;
        ctx.devfile = Some(flat);
        Ok(ctx)
    }
}

/// Re-check invariants that only hold once parents are resolved.
pub struct PostFlattenDevfileValidator {
    max_components: usize,
}

impl PostFlattenDevfileValidator {
    pub fn new(max_components: usize) -> Self {
        Self { max_components }
    }
}

impl Step for PostFlattenDevfileValidator {
    fn name(&self) -> &'static str {
        "post_flatten_devfile_validator"
    }

    fn run(&self, ctx: Context) -> Result<Context, PipelineError> {
        let violations = post_flatten_violations(ctx.devfile(), self.max_components);
        if violations.is_empty() {
            Ok(ctx)
        } else {
            Err(PipelineError::PostFlattenValidationFailed { violations })
        }
    }
}

/// Infallible: derive the shared volume descriptor later steps build on.
pub struct VolumeDefiner {
    settings: inject::VolumeSettings,
}

impl VolumeDefiner {
    pub fn new(settings: inject::VolumeSettings) -> Self {
        Self { settings }
    }
}

impl Step for VolumeDefiner {
    fn name(&self) -> &'static str {
        "volume_definer"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        ctx.volume = Some(inject::define_volume(&self.settings));
        Ok(ctx)
    }
}

/// Infallible: add the tooling sidecar.
pub struct ToolsInjectorComponentInserter {
    tools: ToolsConfig,
}

impl ToolsInjectorComponentInserter {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }
}

impl Step for ToolsInjectorComponentInserter {
    fn name(&self) -> &'static str {
        "tools_injector_component_inserter"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let devfile = ctx.take_devfile();
        let volume = ctx.volume().clone();
        ctx.devfile = Some(inject::inject_tools(devfile, &volume, &self.tools));
        Ok(ctx)
    }
}

/// Infallible: wire the user's primary container onto the shared volume.
pub struct MainComponentUpdater;

impl Step for MainComponentUpdater {
    fn name(&self) -> &'static str {
        "main_component_updater"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let devfile = ctx.take_devfile();
        let volume = ctx.volume().clone();
        ctx.devfile = Some(inject::update_main_component(devfile, &volume));
        Ok(ctx)
    }
}

/// Infallible: add the init-phase project checkout when the request names a
/// project.
pub struct ProjectClonerComponentInserter {
    tools: ToolsConfig,
}

impl ProjectClonerComponentInserter {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }
}

impl Step for ProjectClonerComponentInserter {
    fn name(&self) -> &'static str {
        "project_cloner_component_inserter"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let Some(project) = ctx.params.project.clone() else {
            return Ok(ctx);
        };
        let devfile = ctx.take_devfile();
        let volume = ctx.volume().clone();
        ctx.devfile = Some(inject::insert_project_cloner(devfile, &volume, &self.tools, &project));
        Ok(ctx)
    }
}

/// Infallible: materialize the shared volume as a devfile volume component.
pub struct VolumeComponentInserter;

impl Step for VolumeComponentInserter {
    fn name(&self) -> &'static str {
        "volume_component_inserter"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let devfile = ctx.take_devfile();
        let volume = ctx.volume().clone();
        ctx.devfile = Some(inject::insert_volume_component(devfile, &volume));
        Ok(ctx)
    }
}

/// The only effectful step: persist the processed devfile as a Workspace.
pub struct Creator {
    store: Arc<dyn WorkspaceStore>,
    config: Arc<AgentConfig>,
}

impl Creator {
    pub fn new(store: Arc<dyn WorkspaceStore>, config: Arc<AgentConfig>) -> Self {
        Self { store, config }
    }
}

impl Step for Creator {
    fn name(&self) -> &'static str {
        "creator"
    }

    fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        let namespace = ctx.params.namespace.clone();
        let active = self
            .store
            .count_active_in_namespace(&namespace)
            .map_err(|e| PipelineError::WorkspaceCreateFailed { details: format!("{:#}", e) })?;
        if active >= self.config.max_workspaces_per_namespace {
            return Err(PipelineError::WorkspaceCreateFailed {
                details: format!(
                    "namespace '{}' is at its workspace quota ({})",
                    namespace, self.config.max_workspaces_per_namespace
                ),
            });
        }

        let devfile = ctx.take_devfile();
        let processed_devfile = devfile
            .to_yaml()
            .map_err(|e| PipelineError::WorkspaceCreateFailed { details: format!("{:#}", e) })?;

        let workspace = Workspace {
            id: Uuid::new_v4(),
            name: ctx.params.name.clone(),
            namespace,
            agent_id: ctx.params.agent_id.clone(),
            desired_state: ctx.params.desired_state,
            actual_state: ActualState::Creating,
            processed_devfile,
            deployment_resource_version: None,
            desired_config_generator_version: GENERATOR_VERSION,
            created_ts: chrono::Utc::now().timestamp(),
        };
        self.store
            .create(&workspace)
            .map_err(|e| PipelineError::WorkspaceCreateFailed { details: format!("{:#}", e) })?;
        ctx.workspace = Some(workspace);
        Ok(ctx)
    }
}
