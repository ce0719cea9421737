//! Component injectors: augment a flattened devfile with the operational
//! components the runtime needs (shared volume, tooling sidecar, project
//! cloner). All transformations here are infallible; they assume a devfile
//! that already passed post-flatten validation.
//!
//! Ordering matters: the volume descriptor from [`define_volume`] must exist
//! before any injector references it, and the volume component itself is
//! materialized last so every earlier mount resolves at compile time.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use devspace_devfile::{
    Component, ContainerComponent, Devfile, EnvVar, Events, VolumeComponent, VolumeMount,
    ATTR_INJECTED,
};

/// Name of the injected tooling sidecar component.
pub const TOOLS_COMPONENT: &str = "ws-tools-injector";

/// Name of the injected project cloner component.
pub const CLONER_COMPONENT: &str = "ws-project-cloner";

/// Command id wiring the cloner into `events.preStart`.
pub const CLONE_COMMAND: &str = "ws-clone-project";

/// Environment variables wired into the main component.
pub const ENV_DATA_DIR: &str = "WORKSPACE_DATA_DIR";
pub const ENV_TOOLS_DIR: &str = "WORKSPACE_TOOLS_DIR";

/// Explicit settings for the shared filesystem layout. Passed in rather than
/// read from globals so every step sees the same values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VolumeSettings {
    pub name: String,
    pub mount_path: String,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self { name: "ws-workspace-data".into(), mount_path: "/workspaces".into() }
    }
}

/// Canonical shared-volume descriptor computed once per pipeline run. Every
/// injector that mounts or references the shared filesystem goes through
/// this value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceVolume {
    pub name: String,
    pub mount_path: String,
    /// Sub-path where injected tooling lands.
    pub tools_dir: String,
}

/// Images used by the injected components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub injector_image: String,
    pub cloner_image: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            injector_image: "ghcr.io/devspace/tools-injector:stable".into(),
            cloner_image: "alpine/git:2.43.0".into(),
        }
    }
}

/// The project checked out into the workspace before the main container
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSource {
    /// Directory name under the shared volume.
    pub name: String,
    pub clone_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
}

/// VolumeDefiner: derive the canonical volume-mount descriptor and tools
/// directory from explicit settings.
pub fn define_volume(settings: &VolumeSettings) -> WorkspaceVolume {
    WorkspaceVolume {
        name: settings.name.clone(),
        mount_path: settings.mount_path.clone(),
        tools_dir: format!("{}/.tools", settings.mount_path),
    }
}

fn injected_attributes() -> BTreeMap<String, serde_json::Value> {
    let mut attributes = BTreeMap::new();
    attributes.insert(ATTR_INJECTED.to_string(), serde_json::Value::Bool(true));
    attributes
}

fn shared_mount(volume: &WorkspaceVolume) -> VolumeMount {
    VolumeMount { name: volume.name.clone(), path: volume.mount_path.clone() }
}

fn push_env_if_absent(env: &mut Vec<EnvVar>, name: &str, value: String) {
    if !env.iter().any(|e| e.name == name) {
        env.push(EnvVar { name: name.to_string(), value });
    }
}

fn push_mount_if_absent(mounts: &mut Vec<VolumeMount>, mount: VolumeMount) {
    if !mounts.iter().any(|m| m.name == mount.name) {
        mounts.push(mount);
    }
}

/// Add the tooling sidecar that provisions editor/runtime tooling into the
/// shared tools directory.
pub fn inject_tools(mut devfile: Devfile, volume: &WorkspaceVolume, tools: &ToolsConfig) -> Devfile {
    let container = ContainerComponent {
        image: tools.injector_image.clone(),
        args: vec![
            "/bin/sh".into(),
            "-c".into(),
            format!("mkdir -p {dir} && cp -a /opt/tools/. {dir}/", dir = volume.tools_dir),
        ],
        env: vec![EnvVar { name: ENV_TOOLS_DIR.into(), value: volume.tools_dir.clone() }],
        volume_mounts: vec![shared_mount(volume)],
        ..Default::default()
    };
    devfile.components.push(Component {
        name: TOOLS_COMPONENT.into(),
        attributes: injected_attributes(),
        container: Some(container),
        volume: None,
        image: None,
    });
    debug!(component = TOOLS_COMPONENT, "injected tooling sidecar");
    devfile
}

/// Rewire the user's primary container onto the shared volume without
/// altering their chosen image.
pub fn update_main_component(mut devfile: Devfile, volume: &WorkspaceVolume) -> Devfile {
    let Some(main_name) = devfile.main_component().map(|c| c.name.clone()) else {
        return devfile;
    };
    for component in devfile.components.iter_mut() {
        if component.name != main_name {
            continue;
        }
        if let Some(container) = component.container.as_mut() {
            push_mount_if_absent(&mut container.volume_mounts, shared_mount(volume));
            push_env_if_absent(&mut container.env, ENV_DATA_DIR, volume.mount_path.clone());
            push_env_if_absent(&mut container.env, ENV_TOOLS_DIR, volume.tools_dir.clone());
        }
    }
    devfile
}

/// Add the init-phase component that checks the project out before the main
/// container starts, wired through an `apply` command and `events.preStart`.
pub fn insert_project_cloner(
    mut devfile: Devfile,
    volume: &WorkspaceVolume,
    tools: &ToolsConfig,
    project: &ProjectSource,
) -> Devfile {
    let clone_dir = format!("{}/{}", volume.mount_path, project.name);
    let branch = project
        .ref_name
        .as_deref()
        .map(|r| format!("--branch {} ", r))
        .unwrap_or_default();
    let script = format!(
        "[ -d {dir}/.git ] || git clone {branch}{url} {dir}",
        dir = clone_dir,
        url = project.clone_url,
    );
    let container = ContainerComponent {
        image: tools.cloner_image.clone(),
        args: vec!["/bin/sh".into(), "-c".into(), script],
        volume_mounts: vec![shared_mount(volume)],
        ..Default::default()
    };
    devfile.components.push(Component {
        name: CLONER_COMPONENT.into(),
        attributes: injected_attributes(),
        container: Some(container),
        volume: None,
        image: None,
    });
    devfile.commands.push(devspace_devfile::Command {
        id: CLONE_COMMAND.into(),
        exec: None,
        apply: Some(devspace_devfile::ApplyCommand { component: CLONER_COMPONENT.into() }),
    });
    let events = devfile.events.get_or_insert_with(Events::default);
    if !events.pre_start.iter().any(|id| id == CLONE_COMMAND) {
        events.pre_start.push(CLONE_COMMAND.into());
    }
    debug!(component = CLONER_COMPONENT, url = %project.clone_url, "injected project cloner");
    devfile
}

/// Materialize the shared volume as an explicit devfile volume component so
/// the compiler emits a Kubernetes volume for it.
pub fn insert_volume_component(mut devfile: Devfile, volume: &WorkspaceVolume) -> Devfile {
    if devfile.component(&volume.name).is_none() {
        devfile.components.push(Component {
            name: volume.name.clone(),
            attributes: injected_attributes(),
            container: None,
            volume: Some(VolumeComponent::default()),
            image: None,
        });
    }
    devfile
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_devfile() -> Devfile {
        Devfile::from_yaml(
            r#"
schemaVersion: 2.2.0
components:
  - name: app
    container:
      image: quay.io/example/dev:latest
"#,
        )
        .unwrap()
    }

    fn volume() -> WorkspaceVolume {
        define_volume(&VolumeSettings::default())
    }

    #[test]
    fn tools_dir_lives_under_mount_path() {
        let v = volume();
        assert_eq!(v.mount_path, "/workspaces");
        assert_eq!(v.tools_dir, "/workspaces/.tools");
        assert!(v.name.starts_with("ws-"));
    }

    #[test]
    fn tools_injector_mounts_shared_volume() {
        let v = volume();
        let d = inject_tools(base_devfile(), &v, &ToolsConfig::default());
        let c = d.component(TOOLS_COMPONENT).unwrap();
        assert!(c.is_injected());
        let mounts = &c.container.as_ref().unwrap().volume_mounts;
        assert_eq!(mounts[0].name, v.name);
        assert_eq!(mounts[0].path, v.mount_path);
    }

    #[test]
    fn main_component_gains_mount_and_env_but_keeps_image() {
        let v = volume();
        let d = update_main_component(base_devfile(), &v);
        let c = d.component("app").unwrap().container.as_ref().unwrap();
        assert_eq!(c.image, "quay.io/example/dev:latest");
        assert!(c.volume_mounts.iter().any(|m| m.name == v.name));
        assert!(c.env.iter().any(|e| e.name == ENV_DATA_DIR && e.value == v.mount_path));
        assert!(c.env.iter().any(|e| e.name == ENV_TOOLS_DIR && e.value == v.tools_dir));
    }

    #[test]
    fn main_component_update_is_idempotent() {
        let v = volume();
        let once = update_main_component(base_devfile(), &v);
        let twice = update_main_component(once.clone(), &v);
        assert_eq!(once, twice);
    }

    #[test]
    fn cloner_is_wired_through_pre_start() {
        let v = volume();
        let project = ProjectSource {
            name: "demo".into(),
            clone_url: "https://git.example.com/demo.git".into(),
            ref_name: Some("main".into()),
        };
        let d = insert_project_cloner(base_devfile(), &v, &ToolsConfig::default(), &project);
        let c = d.component(CLONER_COMPONENT).unwrap();
        let args = &c.container.as_ref().unwrap().args;
        assert!(args[2].contains("git clone --branch main https://git.example.com/demo.git"), "{args:?}");
        assert!(args[2].contains("/workspaces/demo"), "{args:?}");
        assert_eq!(d.pre_start_component_names(), vec![CLONER_COMPONENT.to_string()]);
    }

    #[test]
    fn volume_component_added_once() {
        let v = volume();
        let d = insert_volume_component(base_devfile(), &v);
        let d = insert_volume_component(d, &v);
        let hits = d.components.iter().filter(|c| c.name == v.name).count();
        assert_eq!(hits, 1);
        assert!(d.component(&v.name).unwrap().volume.is_some());
    }

    #[test]
    fn full_injection_keeps_every_mount_on_shared_volume() {
        let v = volume();
        let tools = ToolsConfig::default();
        let project = ProjectSource {
            name: "demo".into(),
            clone_url: "https://git.example.com/demo.git".into(),
            ref_name: None,
        };
        let d = base_devfile();
        let d = inject_tools(d, &v, &tools);
        let d = update_main_component(d, &v);
        let d = insert_project_cloner(d, &v, &tools, &project);
        let d = insert_volume_component(d, &v);
        for component in d.container_components() {
            let mounts = &component.container.as_ref().unwrap().volume_mounts;
            assert!(
                mounts.iter().any(|m| m.name == v.name && m.path == v.mount_path),
                "component '{}' lost the shared mount",
                component.name
            );
        }
    }
}
