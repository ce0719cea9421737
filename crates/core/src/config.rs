//! Per-agent policy. Owned by the agent's administrator and shared read-only
//! by every compilation targeting that agent.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Resource defaults applied to containers that declare no limits of their
/// own. Values are Kubernetes quantity strings ("500m", "1Gi").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceDefaults {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cpu_request: "100m".into(),
            cpu_limit: "500m".into(),
            memory_request: "512Mi".into(),
            memory_limit: "1Gi".into(),
        }
    }
}

impl ResourceDefaults {
    /// Stable content hash carried in workspace annotations so the agent can
    /// detect drift without diffing full manifests.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:016x}", crate::fnv1a_64(&bytes))
    }
}

/// One egress allowance: a CIDR plus carve-outs that stay blocked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EgressRule {
    pub allow: String,
    #[serde(default)]
    pub except: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// DNS zone workspace host names are minted under.
    pub dns_zone: String,
    /// Secret names attached as imagePullSecrets on every pod.
    pub image_pull_secrets: Vec<String>,
    pub default_resources: ResourceDefaults,
    pub runtime_class_name: Option<String>,
    pub allow_privilege_escalation: bool,
    pub use_kubernetes_user_namespaces: bool,
    pub network_egress: Vec<EgressRule>,
    /// Labels and annotations stamped on every generated resource, merged
    /// under workspace-specific ones.
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Post-flatten component count limit.
    pub max_components: usize,
    /// Creator quota: live workspaces allowed per namespace.
    pub max_workspaces_per_namespace: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dns_zone: "workspaces.localdev.me".into(),
            image_pull_secrets: Vec::new(),
            default_resources: ResourceDefaults::default(),
            runtime_class_name: None,
            allow_privilege_escalation: false,
            use_kubernetes_user_namespaces: false,
            network_egress: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            max_components: 30,
            max_workspaces_per_namespace: 50,
        }
    }
}

impl AgentConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing agent config YAML")
    }
}
