use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use devspace_compile::{compile_or_empty, to_yaml_stream};
use devspace_core::config::AgentConfig;
use devspace_core::error::PipelineResponse;
use devspace_core::{DesiredState, Workspace};
use devspace_inject::{ProjectSource, ToolsConfig, VolumeSettings};
use devspace_persist::{SqliteStore, WorkspaceStore};
use devspace_pipeline::fs::{FsParentResolver, FsRepository};
use devspace_pipeline::{CreateParams, DevfileSource, Pipeline, PipelineDeps};
use devspace_reconcile::{AgentConfigCell, AgentReport, Reconciler};

#[derive(Parser, Debug)]
#[command(name = "devspacectl", version, about = "Devspace workspace control plane CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Workspace namespace
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Agent config YAML; built-in defaults when omitted
    #[arg(long = "agent-config", global = true)]
    agent_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StartState {
    Running,
    Stopped,
}

impl From<StartState> for DesiredState {
    fn from(s: StartState) -> Self {
        match s {
            StartState::Running => DesiredState::Running,
            StartState::Stopped => DesiredState::Stopped,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the creation pipeline on a devfile and persist the workspace
    Create {
        /// Workspace name (DNS-1123 label)
        name: String,
        /// Target cluster agent id
        #[arg(long)]
        agent: String,
        /// Path to the devfile; parent references resolve next to it
        #[arg(long)]
        devfile: PathBuf,
        #[arg(long = "desired-state", value_enum, default_value_t = StartState::Running)]
        desired_state: StartState,
        /// Git URL checked out before the main container starts
        #[arg(long = "project-url")]
        project_url: Option<String>,
        /// Directory name for the checkout (derived from the URL when omitted)
        #[arg(long = "project-name")]
        project_name: Option<String>,
        /// Branch or tag to check out
        #[arg(long = "project-ref")]
        project_ref: Option<String>,
    },
    /// Show one workspace
    Get { name: String },
    /// List workspaces in the namespace, or everything an agent owns
    List {
        #[arg(long)]
        agent: Option<String>,
    },
    /// Set desired state to stopped
    Stop { name: String },
    /// Set desired state back to running
    Restart { name: String },
    /// Soft-terminate: the row stays until the agent confirms cluster cleanup
    Terminate { name: String },
    /// Print the compiled manifest set for one workspace
    Manifests { name: String },
    /// Compile the full reconciliation payload an agent would receive
    Poll {
        #[arg(long)]
        agent: String,
    },
    /// Ingest an agent's actual-state report (JSON file)
    Report { file: PathBuf },
}

fn init_tracing() {
    let env = std::env::var("DEVSPACE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DEVSPACE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DEVSPACE_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_agent_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("reading agent config {}", p.display()))?;
            AgentConfig::from_yaml(&raw)
        }
        None => Ok(AgentConfig::default()),
    }
}

fn project_name_from_url(url: &str) -> String {
    let stem = url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let stem = stem.trim_end_matches(".git");
    if stem.is_empty() {
        "project".to_string()
    } else {
        stem.to_string()
    }
}

fn print_workspace(ws: &Workspace) {
    println!("name:               {}", ws.name);
    println!("namespace:          {}", ws.namespace);
    println!("id:                 {}", ws.id);
    println!("agent:              {}", ws.agent_id);
    println!("desired state:      {}", ws.desired_state.as_str());
    println!("actual state:       {}", ws.actual_state.as_str());
    println!(
        "deployment rv:      {}",
        ws.deployment_resource_version.as_deref().unwrap_or("-")
    );
    println!("generator version:  {}", ws.desired_config_generator_version);
}

fn set_state(store: &dyn WorkspaceStore, ns: &str, name: &str, state: DesiredState) -> Result<()> {
    if store.set_desired_state(ns, name, state)? {
        println!("{}/{} desired state set to {}", ns, name, state.as_str());
    } else {
        eprintln!("workspace {}/{} not found", ns, name);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let store = Arc::new(SqliteStore::open_default()?);
    let config = load_agent_config(cli.agent_config.as_ref())?;
    let ns = cli.namespace.clone();

    match cli.command {
        Commands::Create {
            name,
            agent,
            devfile,
            desired_state,
            project_url,
            project_name,
            project_ref,
        } => {
            let dir = devfile
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let reference = devfile
                .file_name()
                .ok_or_else(|| anyhow!("devfile path has no file name"))?
                .to_string_lossy()
                .into_owned();

            let project = project_url.map(|url| ProjectSource {
                name: project_name.unwrap_or_else(|| project_name_from_url(&url)),
                clone_url: url,
                ref_name: project_ref,
            });

            let pipeline = Pipeline::standard(PipelineDeps {
                repository: Arc::new(FsRepository::new(&dir)),
                resolver: Arc::new(FsParentResolver::new(&dir)),
                store: store.clone(),
                config: Arc::new(config),
                volume_settings: VolumeSettings::default(),
                tools: ToolsConfig::default(),
            });

            info!(name = %name, ns = %ns, agent = %agent, "create invoked");
            let resp = pipeline.run(CreateParams {
                name,
                namespace: ns,
                agent_id: agent,
                desired_state: desired_state.into(),
                source: DevfileSource::Repo(reference),
                project,
            });
            match cli.output {
                Output::Human => match &resp {
                    PipelineResponse::Success { payload } => {
                        println!(
                            "{}/{} created (desired {})",
                            payload.namespace,
                            payload.name,
                            payload.desired_state.as_str()
                        );
                    }
                    PipelineResponse::Error { message, reason } => {
                        eprintln!("create failed ({}): {}", reason.as_str(), message);
                        std::process::exit(1);
                    }
                },
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(&resp)?);
                    if !resp.is_success() {
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Get { name } => match store.get(&ns, &name)? {
            Some(ws) => match cli.output {
                Output::Human => print_workspace(&ws),
                Output::Json => println!("{}", serde_json::to_string_pretty(&ws)?),
            },
            None => eprintln!("workspace {}/{} not found", ns, name),
        },
        Commands::List { agent } => {
            let workspaces = match agent {
                Some(agent_id) => store.list_for_agent(&agent_id)?,
                None => store.list_in_namespace(&ns)?,
            };
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE        NAME                     DESIRED     ACTUAL       AGE");
                    for ws in &workspaces {
                        println!(
                            "{:<16} {:<24} {:<11} {:<12} {}",
                            ws.namespace,
                            ws.name,
                            ws.desired_state.as_str(),
                            ws.actual_state.as_str(),
                            render_age(ws.created_ts)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&workspaces)?),
            }
        }
        Commands::Stop { name } => set_state(store.as_ref(), &ns, &name, DesiredState::Stopped)?,
        Commands::Restart { name } => set_state(store.as_ref(), &ns, &name, DesiredState::Running)?,
        Commands::Terminate { name } => {
            set_state(store.as_ref(), &ns, &name, DesiredState::Terminated)?
        }
        Commands::Manifests { name } => match store.get(&ns, &name)? {
            Some(ws) => {
                let manifests = compile_or_empty(&ws, &config);
                if manifests.is_empty() {
                    eprintln!("compilation produced no manifests for {}/{}", ns, name);
                    std::process::exit(1);
                }
                print!("{}", to_yaml_stream(&manifests)?);
            }
            None => eprintln!("workspace {}/{} not found", ns, name),
        },
        Commands::Poll { agent } => {
            let reconciler = Reconciler::new(store.clone(), Arc::new(AgentConfigCell::new(config)));
            let resp = reconciler.poll(&agent).await?;
            match cli.output {
                Output::Human => {
                    for entry in &resp.workspaces {
                        let docs = entry.manifests_yaml.matches("---\n").count();
                        println!(
                            "{}/{} desired={} actual={} docs={}",
                            entry.namespace,
                            entry.name,
                            entry.desired_state.as_str(),
                            entry.actual_state.as_str(),
                            docs
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
            }
        }
        Commands::Report { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading report {}", file.display()))?;
            let report: AgentReport =
                serde_json::from_str(&raw).context("parsing agent report JSON")?;
            let reconciler = Reconciler::new(store.clone(), Arc::new(AgentConfigCell::new(config)));
            let outcome = reconciler.ingest_report(&report)?;
            match cli.output {
                Output::Human => println!(
                    "updated {} pruned {} unknown {}",
                    outcome.updated, outcome.pruned, outcome.unknown
                ),
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
        }
    }

    Ok(())
}

fn render_age(created_ts: i64) -> String {
    if created_ts <= 0 {
        return "-".to_string();
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let mut secs = (now - created_ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
