#![forbid(unsafe_code)]

use devspace_compile::{compile, to_yaml_stream};
use devspace_core::config::AgentConfig;
use devspace_core::{ActualState, DesiredState, Workspace, GENERATOR_VERSION};
use devspace_inject::{
    define_volume, inject_tools, insert_project_cloner, insert_volume_component,
    update_main_component, ProjectSource, ToolsConfig, VolumeSettings,
};

/// Build a processed devfile the way the pipeline does: flat user devfile
/// run through the full injector sequence.
fn processed_devfile() -> String {
    let user = devspace_devfile::Devfile::from_yaml(
        r#"
schemaVersion: 2.2.0
components:
  - name: dev
    container:
      image: quay.io/example/dev:latest
      endpoints:
        - name: http
          targetPort: 8080
"#,
    )
    .unwrap();
    let volume = define_volume(&VolumeSettings::default());
    let tools = ToolsConfig::default();
    let project = ProjectSource {
        name: "demo".to_string(),
        clone_url: "https://git.example.com/demo.git".to_string(),
        ref_name: None,
    };
    let d = inject_tools(user, &volume, &tools);
    let d = update_main_component(d, &volume);
    let d = insert_project_cloner(d, &volume, &tools, &project);
    let d = insert_volume_component(d, &volume);
    d.to_yaml().unwrap()
}

fn workspace() -> Workspace {
    Workspace {
        id: uuid::Uuid::nil(),
        name: "alpha".to_string(),
        namespace: "team-a".to_string(),
        agent_id: "agent-1".to_string(),
        desired_state: DesiredState::Running,
        actual_state: ActualState::Creating,
        processed_devfile: processed_devfile(),
        deployment_resource_version: None,
        desired_config_generator_version: GENERATOR_VERSION,
        created_ts: 1_700_000_000,
    }
}

#[test]
fn recompiling_unchanged_inputs_is_byte_identical() {
    let ws = workspace();
    let cfg = AgentConfig::default();
    let first = to_yaml_stream(&compile(&ws, &cfg).unwrap()).unwrap();
    let second = to_yaml_stream(&compile(&ws, &cfg).unwrap()).unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn every_injected_container_keeps_the_shared_mount_path() {
    let ws = workspace();
    let docs = compile(&ws, &AgentConfig::default()).unwrap();
    let dep = docs
        .iter()
        .find(|d| d.get("kind").and_then(|k| k.as_str()) == Some("Deployment"))
        .expect("deployment emitted");
    let spec = &dep["spec"]["template"]["spec"];

    let mut all = Vec::new();
    if let Some(containers) = spec["containers"].as_array() {
        all.extend(containers.iter());
    }
    if let Some(init) = spec["initContainers"].as_array() {
        all.extend(init.iter());
    }
    // main + tools sidecar as containers, cloner as init container
    assert_eq!(all.len(), 3);
    for container in all {
        let mounts = container["volumeMounts"].as_array().expect("volumeMounts present");
        assert!(
            mounts
                .iter()
                .any(|m| m["name"] == "ws-workspace-data" && m["mountPath"] == "/workspaces"),
            "container {} lost the shared mount",
            container["name"]
        );
    }
    // the shared volume itself materialized
    let volumes = spec["volumes"].as_array().unwrap();
    assert!(volumes.iter().any(|v| v["name"] == "ws-workspace-data"));
}
