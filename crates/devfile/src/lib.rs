//! Devfile model: parse, validate, flatten.
//!
//! The in-memory tree mirrors the devfile 2.x wire shape (camelCase YAML).
//! It is mutated only by the flattener and the component injectors; once a
//! workspace is persisted, only the processed form is kept.

#![forbid(unsafe_code)]

pub mod flatten;
pub mod validate;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Component names with this prefix are reserved for injected components.
/// User devfiles may not declare them, so injection can never collide.
pub const RESERVED_COMPONENT_PREFIX: &str = "ws-";

/// Attribute marking the user's primary container component.
pub const ATTR_MAIN: &str = "workspace.io/main";

/// Attribute stamped on every component added by an injector.
pub const ATTR_INJECTED: &str = "workspace.io/injected";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devfile {
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Events>,
}

/// Reference to another devfile to inline: a fetchable URI or a registry id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_url: Option<String>,
}

impl ParentRef {
    /// Stable key used for cycle detection and resolver lookup.
    pub fn key(&self) -> Option<&str> {
        self.uri.as_deref().or(self.id.as_deref())
    }
}

/// A named component declaring exactly one kind payload. The wire format
/// carries the kind as a nested key (`container:` / `volume:` / `image:`),
/// so the discriminant is recovered through [`Component::kind`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageComponent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Container,
    Volume,
    Image,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Container => "container",
            ComponentKind::Volume => "volume",
            ComponentKind::Image => "image",
        }
    }
}

impl Component {
    /// None when zero or more than one kind payload is set; validation
    /// rejects such components before anything downstream sees them.
    pub fn kind(&self) -> Option<ComponentKind> {
        match (&self.container, &self.volume, &self.image) {
            (Some(_), None, None) => Some(ComponentKind::Container),
            (None, Some(_), None) => Some(ComponentKind::Volume),
            (None, None, Some(_)) => Some(ComponentKind::Image),
            _ => None,
        }
    }

    pub fn is_injected(&self) -> bool {
        matches!(self.attributes.get(ATTR_INJECTED), Some(serde_json::Value::Bool(true)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerComponent {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub target_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommand {
    pub component: String,
    pub command_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCommand {
    pub component: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Events {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_start: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_start: Vec<String>,
}

impl Devfile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing devfile YAML")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing devfile YAML")
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn container_components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(|c| c.container.is_some())
    }

    /// The user's primary container: the one flagged with the
    /// `workspace.io/main` attribute, else the first non-injected container.
    pub fn main_component(&self) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| {
                c.container.is_some()
                    && matches!(c.attributes.get(ATTR_MAIN), Some(serde_json::Value::Bool(true)))
            })
            .or_else(|| self.components.iter().find(|c| c.container.is_some() && !c.is_injected()))
    }

    /// Names of components started before the main container: those targeted
    /// by an `apply` command referenced from `events.preStart`.
    pub fn pre_start_component_names(&self) -> Vec<String> {
        let Some(events) = &self.events else { return Vec::new() };
        let mut out = Vec::new();
        for id in &events.pre_start {
            if let Some(cmd) = self.commands.iter().find(|c| &c.id == id) {
                if let Some(apply) = &cmd.apply {
                    if !out.contains(&apply.component) {
                        out.push(apply.component.clone());
                    }
                }
            }
        }
        out
    }
}
