//! Devspace core types: workspace records, agent policy, and the closed
//! pipeline failure taxonomy.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version of the manifest generator. Pinned onto every workspace at
/// creation time so its manifests can always be reproduced by the generator
/// revision that first compiled them.
pub const GENERATOR_VERSION: u32 = 2;

/// User-declared target condition of a workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
    Terminated,
}

impl DesiredState {
    /// Deployment replica count implied by this state.
    pub fn replicas(self) -> i32 {
        match self {
            DesiredState::Running => 1,
            DesiredState::Stopped | DesiredState::Terminated => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
            DesiredState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(DesiredState::Running),
            "stopped" => Some(DesiredState::Stopped),
            "terminated" => Some(DesiredState::Terminated),
            _ => None,
        }
    }
}

/// Cluster-observed condition of a workspace. Only ever advanced by agent
/// reports, never by the creation pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActualState {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Failed,
    Unknown,
}

impl ActualState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActualState::Creating => "creating",
            ActualState::Starting => "starting",
            ActualState::Running => "running",
            ActualState::Stopping => "stopping",
            ActualState::Stopped => "stopped",
            ActualState::Terminating => "terminating",
            ActualState::Terminated => "terminated",
            ActualState::Failed => "failed",
            ActualState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(ActualState::Creating),
            "starting" => Some(ActualState::Starting),
            "running" => Some(ActualState::Running),
            "stopping" => Some(ActualState::Stopping),
            "stopped" => Some(ActualState::Stopped),
            "terminating" => Some(ActualState::Terminating),
            "terminated" => Some(ActualState::Terminated),
            "failed" => Some(ActualState::Failed),
            "unknown" => Some(ActualState::Unknown),
            _ => None,
        }
    }
}

/// Persisted desired-state record. `processed_devfile` holds the fully
/// flattened and injected devfile as YAML; the raw user submission is not
/// retained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub agent_id: String,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub processed_devfile: String,
    /// Opaque cluster version token, for optimistic concurrency on the agent
    /// side. None until the agent has applied the deployment once.
    pub deployment_resource_version: Option<String>,
    pub desired_config_generator_version: u32,
    pub created_ts: i64,
}

/// 64-bit FNV-1a over raw bytes. Used for config content hashes carried in
/// inventory annotations (drift detection).
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

pub mod prelude {
    pub use super::config::{AgentConfig, EgressRule, ResourceDefaults};
    pub use super::error::{ErrorReason, PipelineError, PipelineResponse};
    pub use super::{ActualState, DesiredState, Workspace, GENERATOR_VERSION};
}
