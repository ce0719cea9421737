//! Manifest compiler: a persisted workspace plus agent policy in, a list of
//! Kubernetes resource documents out.
//!
//! Stateless per invocation. Given identical inputs the output is
//! byte-identical after canonical serialization: documents are built from
//! typed k8s-openapi structs, serialized through `serde_json::Value` (sorted
//! keys), and devfile ordering is preserved as-is. The agent's diff-and-apply
//! logic depends on this.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::warn;

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as netv1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use devspace_core::config::AgentConfig;
use devspace_core::{Workspace, GENERATOR_VERSION};
use devspace_devfile::{ContainerComponent, Devfile};

/// Label carried by every generated resource and used as the pod selector.
pub const LABEL_NAME: &str = "workspace.io/name";
pub const LABEL_AGENT: &str = "workspace.io/agent";

pub const ANNOTATION_ID: &str = "workspace.io/id";
pub const ANNOTATION_HOST_TEMPLATE: &str = "workspace.io/host-template";
pub const ANNOTATION_INVENTORY: &str = "workspace.io/inventory";
pub const ANNOTATION_RESOURCES_HASH: &str = "workspace.io/resources-hash";
pub const ANNOTATION_GENERATOR_VERSION: &str = "workspace.io/generator-version";

/// Ingress host template for this workspace: the proxy substitutes
/// `${port}` per exposed endpoint.
pub fn host_template(workspace_name: &str, dns_zone: &str) -> String {
    format!("${{port}}-{}.{}", workspace_name, dns_zone)
}

/// Compile the full manifest set. Fails on a malformed processed devfile or
/// a generator-version mismatch; batch callers isolate that per workspace
/// via [`compile_or_empty`].
pub fn compile(workspace: &Workspace, config: &AgentConfig) -> Result<Vec<Value>> {
    if workspace.desired_config_generator_version > GENERATOR_VERSION {
        return Err(anyhow!(
            "workspace requires generator version {} but this build provides {}",
            workspace.desired_config_generator_version,
            GENERATOR_VERSION
        ));
    }
    let devfile =
        Devfile::from_yaml(&workspace.processed_devfile).context("parsing processed devfile")?;
    if devfile.container_components().next().is_none() {
        return Err(anyhow!("processed devfile has no container components"));
    }

    let labels = merged_labels(workspace, config);
    let annotations = merged_annotations(workspace, config);

    let mut manifests = Vec::with_capacity(4);
    manifests.push(manifest(&inventory_config_map(workspace, &labels, &annotations))?);
    manifests.push(manifest(&deployment(workspace, config, &devfile, &labels, &annotations))?);
    manifests.push(manifest(&service(workspace, &devfile, &labels, &annotations))?);
    manifests.push(manifest(&network_policy(workspace, config, &labels, &annotations))?);
    Ok(manifests)
}

/// Batch-safe wrapper: one workspace's compilation failure is logged and
/// yields an empty set so it can never block the rest of a reconciliation
/// cycle.
pub fn compile_or_empty(workspace: &Workspace, config: &AgentConfig) -> Vec<Value> {
    let t0 = std::time::Instant::now();
    match compile(workspace, config) {
        Ok(manifests) => {
            histogram!("compile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("compile_ok", 1u64);
            manifests
        }
        Err(e) => {
            warn!(
                workspace = %workspace.name,
                namespace = %workspace.namespace,
                error = %format!("{:#}", e),
                "manifest compilation failed; emitting empty set"
            );
            counter!("compile_err", 1u64);
            Vec::new()
        }
    }
}

/// Canonical multi-document YAML rendering of a manifest set.
pub fn to_yaml_stream(manifests: &[Value]) -> Result<String> {
    let mut out = String::new();
    for doc in manifests {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc).context("serializing manifest YAML")?);
    }
    Ok(out)
}

/// Serialize a typed object and graft on apiVersion/kind, which k8s-openapi
/// keeps as associated consts rather than struct fields.
fn manifest<T: k8s_openapi::Resource + serde::Serialize>(obj: &T) -> Result<Value> {
    let mut v = serde_json::to_value(obj).context("serializing manifest")?;
    let map = v.as_object_mut().ok_or_else(|| anyhow!("manifest did not serialize to an object"))?;
    map.insert("apiVersion".to_string(), Value::String(T::API_VERSION.to_string()));
    map.insert("kind".to_string(), Value::String(T::KIND.to_string()));
    Ok(v)
}

fn merged_labels(workspace: &Workspace, config: &AgentConfig) -> BTreeMap<String, String> {
    let mut labels = config.labels.clone();
    labels.insert(LABEL_NAME.to_string(), workspace.name.clone());
    labels.insert(LABEL_AGENT.to_string(), workspace.agent_id.clone());
    labels
}

fn merged_annotations(workspace: &Workspace, config: &AgentConfig) -> BTreeMap<String, String> {
    let mut annotations = config.annotations.clone();
    annotations.insert(ANNOTATION_ID.to_string(), workspace.id.to_string());
    annotations.insert(
        ANNOTATION_HOST_TEMPLATE.to_string(),
        host_template(&workspace.name, &config.dns_zone),
    );
    annotations.insert(ANNOTATION_INVENTORY.to_string(), inventory_name(&workspace.name));
    annotations.insert(
        ANNOTATION_RESOURCES_HASH.to_string(),
        config.default_resources.content_hash(),
    );
    annotations.insert(
        ANNOTATION_GENERATOR_VERSION.to_string(),
        workspace.desired_config_generator_version.to_string(),
    );
    annotations
}

fn inventory_name(workspace_name: &str) -> String {
    format!("{}-workspace-inventory", workspace_name)
}

fn meta(
    name: String,
    workspace: &Workspace,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(workspace.namespace.clone()),
        labels: Some(labels.clone()),
        annotations: Some(annotations.clone()),
        ..Default::default()
    }
}

fn quantity_map(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut m = BTreeMap::new();
    m.insert("cpu".to_string(), Quantity(cpu.to_string()));
    m.insert("memory".to_string(), Quantity(memory.to_string()));
    m
}

/// Devfile-declared limits win; agent defaults fill the gaps.
fn resources(container: &ContainerComponent, config: &AgentConfig) -> corev1::ResourceRequirements {
    let d = &config.default_resources;
    corev1::ResourceRequirements {
        requests: Some(quantity_map(
            container.cpu_request.as_deref().unwrap_or(&d.cpu_request),
            container.memory_request.as_deref().unwrap_or(&d.memory_request),
        )),
        limits: Some(quantity_map(
            container.cpu_limit.as_deref().unwrap_or(&d.cpu_limit),
            container.memory_limit.as_deref().unwrap_or(&d.memory_limit),
        )),
        ..Default::default()
    }
}

fn security_context(config: &AgentConfig) -> corev1::SecurityContext {
    corev1::SecurityContext {
        allow_privilege_escalation: Some(config.allow_privilege_escalation),
        privileged: Some(false),
        ..Default::default()
    }
}

fn to_container(name: &str, cc: &ContainerComponent, config: &AgentConfig) -> corev1::Container {
    let env: Vec<corev1::EnvVar> = cc
        .env
        .iter()
        .map(|e| corev1::EnvVar {
            name: e.name.clone(),
            value: Some(e.value.clone()),
            ..Default::default()
        })
        .collect();
    let ports: Vec<corev1::ContainerPort> = cc
        .endpoints
        .iter()
        .map(|ep| corev1::ContainerPort {
            name: Some(ep.name.clone()),
            container_port: ep.target_port,
            ..Default::default()
        })
        .collect();
    let volume_mounts: Vec<corev1::VolumeMount> = cc
        .volume_mounts
        .iter()
        .map(|m| corev1::VolumeMount {
            name: m.name.clone(),
            mount_path: m.path.clone(),
            ..Default::default()
        })
        .collect();
    corev1::Container {
        name: name.to_string(),
        image: Some(cc.image.clone()),
        command: (!cc.command.is_empty()).then(|| cc.command.clone()),
        args: (!cc.args.is_empty()).then(|| cc.args.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        resources: Some(resources(cc, config)),
        security_context: Some(security_context(config)),
        ..Default::default()
    }
}

/// Split devfile containers into init containers (targets of preStart apply
/// commands, e.g. the project cloner) and regular containers, preserving
/// devfile order within each group.
fn build_containers(
    devfile: &Devfile,
    config: &AgentConfig,
) -> (Vec<corev1::Container>, Vec<corev1::Container>) {
    let init_names = devfile.pre_start_component_names();
    let mut containers = Vec::new();
    let mut init_containers = Vec::new();
    for component in devfile.components.iter() {
        let Some(cc) = &component.container else { continue };
        let built = to_container(&component.name, cc, config);
        if init_names.iter().any(|n| n == &component.name) {
            init_containers.push(built);
        } else {
            containers.push(built);
        }
    }
    (containers, init_containers)
}

fn build_volumes(devfile: &Devfile) -> Vec<corev1::Volume> {
    devfile
        .components
        .iter()
        .filter_map(|component| {
            let vol = component.volume.as_ref()?;
            Some(corev1::Volume {
                name: component.name.clone(),
                empty_dir: Some(corev1::EmptyDirVolumeSource {
                    size_limit: vol.size.as_ref().map(|s| Quantity(s.clone())),
                    ..Default::default()
                }),
                ..Default::default()
            })
        })
        .collect()
}

fn deployment(
    workspace: &Workspace,
    config: &AgentConfig,
    devfile: &Devfile,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> appsv1::Deployment {
    let (containers, init_containers) = build_containers(devfile, config);
    let volumes = build_volumes(devfile);
    let image_pull_secrets: Vec<corev1::LocalObjectReference> = config
        .image_pull_secrets
        .iter()
        .map(|name| corev1::LocalObjectReference { name: Some(name.clone()) })
        .collect();

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_NAME.to_string(), workspace.name.clone());

    let pod_spec = corev1::PodSpec {
        containers,
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        volumes: (!volumes.is_empty()).then_some(volumes),
        image_pull_secrets: (!image_pull_secrets.is_empty()).then_some(image_pull_secrets),
        runtime_class_name: config.runtime_class_name.clone(),
        // hostUsers=false puts the pod in its own user namespace
        host_users: config.use_kubernetes_user_namespaces.then_some(false),
        security_context: Some(corev1::PodSecurityContext {
            run_as_non_root: Some(!config.allow_privilege_escalation),
            ..Default::default()
        }),
        ..Default::default()
    };

    appsv1::Deployment {
        metadata: meta(workspace.name.clone(), workspace, labels, annotations),
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(workspace.desired_state.replicas()),
            selector: LabelSelector { match_labels: Some(selector.clone()), ..Default::default() },
            strategy: Some(appsv1::DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: corev1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: Some(annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(
    workspace: &Workspace,
    devfile: &Devfile,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> corev1::Service {
    let ports: Vec<corev1::ServicePort> = devfile
        .container_components()
        .flat_map(|component| component.container.iter())
        .flat_map(|cc| cc.endpoints.iter())
        .map(|ep| corev1::ServicePort {
            name: Some(ep.name.clone()),
            port: ep.target_port,
            target_port: Some(IntOrString::Int(ep.target_port)),
            ..Default::default()
        })
        .collect();

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_NAME.to_string(), workspace.name.clone());

    corev1::Service {
        metadata: meta(workspace.name.clone(), workspace, labels, annotations),
        spec: Some(corev1::ServiceSpec {
            selector: Some(selector),
            ports: (!ports.is_empty()).then_some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn network_policy(
    workspace: &Workspace,
    config: &AgentConfig,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> netv1::NetworkPolicy {
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_NAME.to_string(), workspace.name.clone());

    // same-namespace traffic only
    let ingress = vec![netv1::NetworkPolicyIngressRule {
        from: Some(vec![netv1::NetworkPolicyPeer {
            pod_selector: Some(LabelSelector::default()),
            ..Default::default()
        }]),
        ..Default::default()
    }];

    let mut kube_system = BTreeMap::new();
    kube_system.insert("kubernetes.io/metadata.name".to_string(), "kube-system".to_string());
    let mut egress = vec![netv1::NetworkPolicyEgressRule {
        to: Some(vec![netv1::NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(kube_system),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![
            netv1::NetworkPolicyPort {
                port: Some(IntOrString::Int(53)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            netv1::NetworkPolicyPort {
                port: Some(IntOrString::Int(53)),
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }];
    for rule in &config.network_egress {
        egress.push(netv1::NetworkPolicyEgressRule {
            to: Some(vec![netv1::NetworkPolicyPeer {
                ip_block: Some(netv1::IPBlock {
                    cidr: rule.allow.clone(),
                    except: (!rule.except.is_empty()).then(|| rule.except.clone()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    netv1::NetworkPolicy {
        metadata: meta(workspace.name.clone(), workspace, labels, annotations),
        spec: Some(netv1::NetworkPolicySpec {
            pod_selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(ingress),
            egress: Some(egress),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ownership marker consumed by the agent's inventory/diff logic.
fn inventory_config_map(
    workspace: &Workspace,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> corev1::ConfigMap {
    let mut labels = labels.clone();
    labels.insert("workspace.io/inventory-type".to_string(), "workspace".to_string());
    corev1::ConfigMap {
        metadata: ObjectMeta {
            name: Some(inventory_name(&workspace.name)),
            namespace: Some(workspace.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::{ActualState, DesiredState};

    const PROCESSED: &str = r#"
schemaVersion: 2.2.0
components:
  - name: dev
    container:
      image: quay.io/example/dev:latest
      env:
        - name: WORKSPACE_DATA_DIR
          value: /workspaces
      volumeMounts:
        - name: ws-workspace-data
          path: /workspaces
      endpoints:
        - name: http
          targetPort: 8080
  - name: ws-workspace-data
    volume: {}
"#;

    fn workspace(state: DesiredState) -> Workspace {
        Workspace {
            id: uuid::Uuid::nil(),
            name: "alpha".to_string(),
            namespace: "team-a".to_string(),
            agent_id: "agent-1".to_string(),
            desired_state: state,
            actual_state: ActualState::Creating,
            processed_devfile: PROCESSED.to_string(),
            deployment_resource_version: None,
            desired_config_generator_version: GENERATOR_VERSION,
            created_ts: 1_700_000_000,
        }
    }

    fn kind_of(doc: &Value) -> &str {
        doc.get("kind").and_then(|k| k.as_str()).unwrap_or("")
    }

    fn find<'a>(docs: &'a [Value], kind: &str) -> &'a Value {
        docs.iter().find(|d| kind_of(d) == kind).unwrap_or_else(|| panic!("no {kind} manifest"))
    }

    #[test]
    fn emits_one_deployment_and_one_service() {
        let docs = compile(&workspace(DesiredState::Running), &AgentConfig::default()).unwrap();
        assert_eq!(docs.iter().filter(|d| kind_of(d) == "Deployment").count(), 1);
        assert_eq!(docs.iter().filter(|d| kind_of(d) == "Service").count(), 1);
        let dep = find(&docs, "Deployment");
        assert_eq!(dep["spec"]["replicas"], 1);
        assert_eq!(dep["apiVersion"], "apps/v1");
        // agent defaults applied since the devfile declared no limits
        let limits = &dep["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"];
        assert_eq!(limits["cpu"], "500m");
        assert_eq!(limits["memory"], "1Gi");
    }

    #[test]
    fn stopped_and_terminated_scale_to_zero() {
        for state in [DesiredState::Stopped, DesiredState::Terminated] {
            let docs = compile(&workspace(state), &AgentConfig::default()).unwrap();
            assert_eq!(find(&docs, "Deployment")["spec"]["replicas"], 0);
        }
    }

    #[test]
    fn devfile_declared_limits_override_defaults() {
        let mut ws = workspace(DesiredState::Running);
        ws.processed_devfile = r#"
schemaVersion: 2.2.0
components:
  - name: dev
    container:
      image: x
      memoryLimit: 3Gi
      cpuLimit: 2000m
"#
        .to_string();
        let docs = compile(&ws, &AgentConfig::default()).unwrap();
        let limits =
            &find(&docs, "Deployment")["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"];
        assert_eq!(limits["memory"], "3Gi");
        assert_eq!(limits["cpu"], "2000m");
    }

    #[test]
    fn pre_start_components_become_init_containers() {
        let mut ws = workspace(DesiredState::Running);
        ws.processed_devfile = r#"
schemaVersion: 2.2.0
components:
  - name: dev
    container:
      image: x
  - name: cloner
    container:
      image: alpine/git
commands:
  - id: clone
    apply:
      component: cloner
events:
  preStart: [clone]
"#
        .to_string();
        let docs = compile(&ws, &AgentConfig::default()).unwrap();
        let spec = &find(&docs, "Deployment")["spec"]["template"]["spec"];
        assert_eq!(spec["initContainers"][0]["name"], "cloner");
        assert_eq!(spec["containers"][0]["name"], "dev");
        assert!(spec["containers"].as_array().unwrap().len() == 1);
    }

    #[test]
    fn agent_policy_lands_on_the_pod() {
        let cfg = AgentConfig {
            image_pull_secrets: vec!["registry-cred".to_string()],
            runtime_class_name: Some("gvisor".to_string()),
            use_kubernetes_user_namespaces: true,
            ..Default::default()
        };
        let docs = compile(&workspace(DesiredState::Running), &cfg).unwrap();
        let spec = &find(&docs, "Deployment")["spec"]["template"]["spec"];
        assert_eq!(spec["imagePullSecrets"][0]["name"], "registry-cred");
        assert_eq!(spec["runtimeClassName"], "gvisor");
        assert_eq!(spec["hostUsers"], false);
        let sc = &spec["containers"][0]["securityContext"];
        assert_eq!(sc["allowPrivilegeEscalation"], false);
        assert_eq!(sc["privileged"], false);
    }

    #[test]
    fn egress_rules_extend_the_network_policy() {
        let cfg = AgentConfig {
            network_egress: vec![devspace_core::config::EgressRule {
                allow: "0.0.0.0/0".to_string(),
                except: vec!["10.0.0.0/8".to_string()],
            }],
            ..Default::default()
        };
        let docs = compile(&workspace(DesiredState::Running), &cfg).unwrap();
        let np = find(&docs, "NetworkPolicy");
        let egress = np["spec"]["egress"].as_array().unwrap();
        // DNS rule plus one configured rule
        assert_eq!(egress.len(), 2);
        assert_eq!(egress[1]["to"][0]["ipBlock"]["cidr"], "0.0.0.0/0");
        assert_eq!(egress[1]["to"][0]["ipBlock"]["except"][0], "10.0.0.0/8");
    }

    #[test]
    fn annotations_carry_ownership_and_drift_hash() {
        let cfg = AgentConfig::default();
        let docs = compile(&workspace(DesiredState::Running), &cfg).unwrap();
        let dep = find(&docs, "Deployment");
        let annotations = &dep["metadata"]["annotations"];
        assert_eq!(annotations[ANNOTATION_INVENTORY], "alpha-workspace-inventory");
        assert_eq!(
            annotations[ANNOTATION_HOST_TEMPLATE],
            "${port}-alpha.workspaces.localdev.me"
        );
        assert_eq!(
            annotations[ANNOTATION_RESOURCES_HASH],
            Value::String(cfg.default_resources.content_hash())
        );
        let inv = find(&docs, "ConfigMap");
        assert_eq!(inv["metadata"]["name"], "alpha-workspace-inventory");
    }

    #[test]
    fn malformed_processed_devfile_yields_empty_set() {
        let mut ws = workspace(DesiredState::Running);
        ws.processed_devfile = "{:broken".to_string();
        assert!(compile(&ws, &AgentConfig::default()).is_err());
        assert!(compile_or_empty(&ws, &AgentConfig::default()).is_empty());
    }

    #[test]
    fn newer_generator_version_is_refused() {
        let mut ws = workspace(DesiredState::Running);
        ws.desired_config_generator_version = GENERATOR_VERSION + 1;
        let err = compile(&ws, &AgentConfig::default()).unwrap_err();
        assert!(err.to_string().contains("generator version"), "{err}");
        assert!(compile_or_empty(&ws, &AgentConfig::default()).is_empty());
    }
}
