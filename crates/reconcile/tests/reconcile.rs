#![forbid(unsafe_code)]

use std::sync::Arc;

use devspace_core::config::AgentConfig;
use devspace_core::{ActualState, DesiredState, Workspace, GENERATOR_VERSION};
use devspace_persist::{SqliteStore, WorkspaceStore};
use devspace_reconcile::{
    AgentConfigCell, AgentReport, Reconciler, WorkspaceReportEntry,
};

const PROCESSED: &str = r#"
schemaVersion: 2.2.0
components:
  - name: dev
    container:
      image: quay.io/example/dev:latest
      endpoints:
        - name: http
          targetPort: 8080
  - name: ws-workspace-data
    volume: {}
"#;

fn workspace(name: &str, devfile: &str) -> Workspace {
    Workspace {
        id: uuid::Uuid::new_v4(),
        name: name.to_string(),
        namespace: "team-a".to_string(),
        agent_id: "agent-1".to_string(),
        desired_state: DesiredState::Running,
        actual_state: ActualState::Creating,
        processed_devfile: devfile.to_string(),
        deployment_resource_version: None,
        desired_config_generator_version: GENERATOR_VERSION,
        created_ts: 1_700_000_000,
    }
}

fn reconciler_with(workspaces: &[Workspace]) -> (Arc<SqliteStore>, Reconciler) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for ws in workspaces {
        store.create(ws).unwrap();
    }
    let cell = Arc::new(AgentConfigCell::new(AgentConfig::default()));
    let reconciler = Reconciler::new(store.clone(), cell);
    (store, reconciler)
}

#[tokio::test]
async fn one_broken_devfile_does_not_block_the_batch() {
    let (_store, reconciler) = reconciler_with(&[
        workspace("alpha", PROCESSED),
        workspace("broken", "{:not yaml"),
        workspace("gamma", PROCESSED),
    ]);

    let resp = reconciler.poll("agent-1").await.unwrap();
    assert_eq!(resp.workspaces.len(), 3);
    for entry in &resp.workspaces {
        if entry.name == "broken" {
            assert!(entry.manifests_yaml.is_empty(), "broken workspace must yield an empty set");
        } else {
            assert!(entry.manifests_yaml.contains("kind: Deployment"), "{}", entry.name);
            assert!(entry.manifests_yaml.contains("kind: Service"), "{}", entry.name);
        }
    }
}

#[tokio::test]
async fn polling_twice_is_byte_identical() {
    let (_store, reconciler) = reconciler_with(&[
        workspace("alpha", PROCESSED),
        workspace("beta", PROCESSED),
    ]);
    let first = reconciler.poll("agent-1").await.unwrap();
    let second = reconciler.poll("agent-1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.workspaces.len(), 2);
}

#[tokio::test]
async fn poll_scopes_to_the_requesting_agent() {
    let mut other = workspace("other", PROCESSED);
    other.agent_id = "agent-2".to_string();
    let (_store, reconciler) = reconciler_with(&[workspace("alpha", PROCESSED), other]);

    let resp = reconciler.poll("agent-1").await.unwrap();
    assert_eq!(resp.agent_id, "agent-1");
    assert_eq!(resp.workspaces.len(), 1);
    assert_eq!(resp.workspaces[0].name, "alpha");
}

#[tokio::test]
async fn confirmed_terminated_rows_are_not_polled() {
    let mut done = workspace("done", PROCESSED);
    done.desired_state = DesiredState::Terminated;
    done.actual_state = ActualState::Terminated;
    let (_store, reconciler) = reconciler_with(&[workspace("alpha", PROCESSED), done]);

    let resp = reconciler.poll("agent-1").await.unwrap();
    assert_eq!(resp.workspaces.len(), 1);
    assert_eq!(resp.workspaces[0].name, "alpha");
}

#[tokio::test]
async fn stopped_workspace_compiles_to_zero_replicas() {
    let mut stopped = workspace("paused", PROCESSED);
    stopped.desired_state = DesiredState::Stopped;
    let (_store, reconciler) = reconciler_with(&[stopped]);

    let resp = reconciler.poll("agent-1").await.unwrap();
    assert!(resp.workspaces[0].manifests_yaml.contains("replicas: 0"));
}

#[tokio::test]
async fn config_replacement_shows_up_in_the_next_poll() {
    let (_store, reconciler) = reconciler_with(&[workspace("alpha", PROCESSED)]);

    let before = reconciler.poll("agent-1").await.unwrap();
    assert!(before.workspaces[0].manifests_yaml.contains("workspaces.localdev.me"));

    let swapped = AgentConfig { dns_zone: "ws.corp.example".to_string(), ..AgentConfig::default() };
    reconciler.config().replace(swapped);

    let after = reconciler.poll("agent-1").await.unwrap();
    assert!(after.workspaces[0].manifests_yaml.contains("ws.corp.example"));
    assert!(!after.workspaces[0].manifests_yaml.contains("workspaces.localdev.me"));
}

#[test]
fn report_updates_actual_state_and_version() {
    let (store, reconciler) = reconciler_with(&[workspace("alpha", PROCESSED)]);
    let outcome = reconciler
        .ingest_report(&AgentReport {
            agent_id: "agent-1".to_string(),
            workspaces: vec![WorkspaceReportEntry {
                namespace: "team-a".to_string(),
                name: "alpha".to_string(),
                actual_state: ActualState::Running,
                deployment_resource_version: Some("rv-7".to_string()),
            }],
        })
        .unwrap();
    assert_eq!(outcome.updated, 1);

    let ws = store.get("team-a", "alpha").unwrap().unwrap();
    assert_eq!(ws.actual_state, ActualState::Running);
    assert_eq!(ws.deployment_resource_version.as_deref(), Some("rv-7"));
}

#[test]
fn unknown_workspaces_in_a_report_are_skipped() {
    let (store, reconciler) = reconciler_with(&[workspace("alpha", PROCESSED)]);
    let outcome = reconciler
        .ingest_report(&AgentReport {
            agent_id: "agent-1".to_string(),
            workspaces: vec![
                WorkspaceReportEntry {
                    namespace: "team-a".to_string(),
                    name: "ghost".to_string(),
                    actual_state: ActualState::Running,
                    deployment_resource_version: None,
                },
                WorkspaceReportEntry {
                    namespace: "team-a".to_string(),
                    name: "alpha".to_string(),
                    actual_state: ActualState::Starting,
                    deployment_resource_version: None,
                },
            ],
        })
        .unwrap();
    assert_eq!(outcome.unknown, 1);
    assert_eq!(outcome.updated, 1);
    assert_eq!(store.get("team-a", "alpha").unwrap().unwrap().actual_state, ActualState::Starting);
}

#[test]
fn confirmed_termination_prunes_the_row() {
    let mut ws = workspace("alpha", PROCESSED);
    ws.desired_state = DesiredState::Terminated;
    let (store, reconciler) = reconciler_with(&[ws]);

    let outcome = reconciler
        .ingest_report(&AgentReport {
            agent_id: "agent-1".to_string(),
            workspaces: vec![WorkspaceReportEntry {
                namespace: "team-a".to_string(),
                name: "alpha".to_string(),
                actual_state: ActualState::Terminated,
                deployment_resource_version: None,
            }],
        })
        .unwrap();
    assert_eq!(outcome.pruned, 1);
    assert!(store.get("team-a", "alpha").unwrap().is_none());
}

#[test]
fn terminated_observation_without_terminated_desire_is_just_recorded() {
    // agent saw the pod gone while the user still wants it running; keep the
    // row so the next poll re-asserts desired state
    let (store, reconciler) = reconciler_with(&[workspace("alpha", PROCESSED)]);
    let outcome = reconciler
        .ingest_report(&AgentReport {
            agent_id: "agent-1".to_string(),
            workspaces: vec![WorkspaceReportEntry {
                namespace: "team-a".to_string(),
                name: "alpha".to_string(),
                actual_state: ActualState::Terminated,
                deployment_resource_version: None,
            }],
        })
        .unwrap();
    assert_eq!(outcome.pruned, 0);
    assert_eq!(outcome.updated, 1);
    let ws = store.get("team-a", "alpha").unwrap().unwrap();
    assert_eq!(ws.desired_state, DesiredState::Running);
    assert_eq!(ws.actual_state, ActualState::Terminated);
}
