//! Workspace persistence: minimal SQLite store for desired state.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use devspace_core::{ActualState, DesiredState, Workspace};

/// Storage boundary the Creator and the reconciliation loop depend on.
pub trait WorkspaceStore: Send + Sync {
    fn create(&self, workspace: &Workspace) -> Result<()>;
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Workspace>>;
    fn list_for_agent(&self, agent_id: &str) -> Result<Vec<Workspace>>;
    fn list_in_namespace(&self, namespace: &str) -> Result<Vec<Workspace>>;
    /// Workspaces counted against the namespace quota (everything not yet
    /// marked for termination).
    fn count_active_in_namespace(&self, namespace: &str) -> Result<usize>;
    /// Returns false when the workspace does not exist.
    fn set_desired_state(&self, namespace: &str, name: &str, state: DesiredState) -> Result<bool>;
    /// Apply an agent observation. Returns false when the workspace does not
    /// exist.
    fn record_actual_state(
        &self,
        namespace: &str,
        name: &str,
        actual: ActualState,
        deployment_resource_version: Option<&str>,
    ) -> Result<bool>;
    /// Drop the row once the agent has confirmed cluster cleanup. Returns
    /// false when the workspace does not exist.
    fn remove(&self, namespace: &str, name: &str) -> Result<bool>;
}

fn default_db_path() -> String {
    std::env::var("HOME")
        .map(|h| format!("{}/.devspace/workspaces.db", h))
        .unwrap_or_else(|_| "devspace.db".to_string())
}

/// SQLite-backed store. Simple, synchronous; the pipeline persists one row
/// per request and the reconcile loop reads in batches.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    desired_state TEXT NOT NULL,
    actual_state TEXT NOT NULL,
    processed_devfile TEXT NOT NULL,
    deployment_resource_version TEXT,
    generator_version INTEGER NOT NULL,
    created_ts INTEGER NOT NULL,
    UNIQUE(namespace, name)
)";

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("DEVSPACE_DB_PATH").unwrap_or_else(|_| default_db_path());
        if let Some(parent) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(&db)?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    /// Fresh private database; used by tests and demos.
    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(&db)?;
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn init(db: &rusqlite::Connection) -> Result<()> {
        db.execute(SCHEMA, []).context("creating workspaces table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_workspaces_agent ON workspaces(agent_id)",
            [],
        )
        .ok();
        Ok(())
    }
}

fn row_to_workspace(row: &rusqlite::Row<'_>) -> Result<Workspace> {
    let id: String = row.get(0)?;
    let desired: String = row.get(4)?;
    let actual: String = row.get(5)?;
    Ok(Workspace {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid workspace id '{}'", id))?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        agent_id: row.get(3)?,
        desired_state: DesiredState::parse(&desired)
            .ok_or_else(|| anyhow!("invalid desired_state '{}'", desired))?,
        actual_state: ActualState::parse(&actual)
            .ok_or_else(|| anyhow!("invalid actual_state '{}'", actual))?,
        processed_devfile: row.get(6)?,
        deployment_resource_version: row.get(7)?,
        desired_config_generator_version: row.get::<_, i64>(8)? as u32,
        created_ts: row.get(9)?,
    })
}

const SELECT_COLS: &str = "id, name, namespace, agent_id, desired_state, actual_state, \
     processed_devfile, deployment_resource_version, generator_version, created_ts";

impl WorkspaceStore for SqliteStore {
    fn create(&self, workspace: &Workspace) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO workspaces (id, name, namespace, agent_id, desired_state, actual_state, \
             processed_devfile, deployment_resource_version, generator_version, created_ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            (
                workspace.id.to_string(),
                &workspace.name,
                &workspace.namespace,
                &workspace.agent_id,
                workspace.desired_state.as_str(),
                workspace.actual_state.as_str(),
                &workspace.processed_devfile,
                &workspace.deployment_resource_version,
                workspace.desired_config_generator_version as i64,
                workspace.created_ts,
            ),
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                anyhow!(
                    "workspace '{}' already exists in namespace '{}'",
                    workspace.name,
                    workspace.namespace
                )
            }
            other => anyhow::Error::new(other).context("inserting workspace"),
        })?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<Workspace>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLS} FROM workspaces WHERE namespace = ?1 AND name = ?2"
        ))?;
        let row = stmt
            .query_row((namespace, name), |row| {
                Ok(row_to_workspace(row))
            })
            .optional()?;
        row.transpose()
    }

    fn list_for_agent(&self, agent_id: &str) -> Result<Vec<Workspace>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLS} FROM workspaces WHERE agent_id = ?1 ORDER BY namespace, name"
        ))?;
        let mut rows = stmt.query([agent_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_workspace(row)?);
        }
        Ok(out)
    }

    fn list_in_namespace(&self, namespace: &str) -> Result<Vec<Workspace>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLS} FROM workspaces WHERE namespace = ?1 ORDER BY name"
        ))?;
        let mut rows = stmt.query([namespace])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_workspace(row)?);
        }
        Ok(out)
    }

    fn count_active_in_namespace(&self, namespace: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM workspaces WHERE namespace = ?1 AND desired_state != 'terminated'",
            [namespace],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn set_desired_state(&self, namespace: &str, name: &str, state: DesiredState) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE workspaces SET desired_state = ?1 WHERE namespace = ?2 AND name = ?3",
            (state.as_str(), namespace, name),
        )?;
        counter!("persist_state_update_total", 1u64);
        Ok(n > 0)
    }

    fn record_actual_state(
        &self,
        namespace: &str,
        name: &str,
        actual: ActualState,
        deployment_resource_version: Option<&str>,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = match deployment_resource_version {
            Some(rv) => db.execute(
                "UPDATE workspaces SET actual_state = ?1, deployment_resource_version = ?2 \
                 WHERE namespace = ?3 AND name = ?4",
                (actual.as_str(), rv, namespace, name),
            )?,
            None => db.execute(
                "UPDATE workspaces SET actual_state = ?1 WHERE namespace = ?2 AND name = ?3",
                (actual.as_str(), namespace, name),
            )?,
        };
        Ok(n > 0)
    }

    fn remove(&self, namespace: &str, name: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM workspaces WHERE namespace = ?1 AND name = ?2",
            (namespace, name),
        )?;
        counter!("persist_remove_total", 1u64);
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devspace_core::GENERATOR_VERSION;

    fn workspace(name: &str, namespace: &str) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            agent_id: "agent-1".to_string(),
            desired_state: DesiredState::Running,
            actual_state: ActualState::Creating,
            processed_devfile: "schemaVersion: 2.2.0\n".to_string(),
            deployment_resource_version: None,
            desired_config_generator_version: GENERATOR_VERSION,
            created_ts: 1_700_000_000,
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ws = workspace("alpha", "team-a");
        store.create(&ws).unwrap();
        let got = store.get("team-a", "alpha").unwrap().unwrap();
        assert_eq!(got, ws);
        assert!(store.get("team-a", "missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_in_namespace_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&workspace("alpha", "team-a")).unwrap();
        let err = store.create(&workspace("alpha", "team-a")).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");
        // same name in another namespace is fine
        store.create(&workspace("alpha", "team-b")).unwrap();
    }

    #[test]
    fn termination_is_soft_and_leaves_the_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&workspace("alpha", "team-a")).unwrap();
        assert!(store.set_desired_state("team-a", "alpha", DesiredState::Terminated).unwrap());
        let got = store.get("team-a", "alpha").unwrap().unwrap();
        assert_eq!(got.desired_state, DesiredState::Terminated);
        assert_eq!(store.count_active_in_namespace("team-a").unwrap(), 0);
    }

    #[test]
    fn agent_reports_update_actual_state_and_version() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&workspace("alpha", "team-a")).unwrap();
        assert!(store
            .record_actual_state("team-a", "alpha", ActualState::Running, Some("rv-42"))
            .unwrap());
        let got = store.get("team-a", "alpha").unwrap().unwrap();
        assert_eq!(got.actual_state, ActualState::Running);
        assert_eq!(got.deployment_resource_version.as_deref(), Some("rv-42"));
        // unknown workspace reports are a no-op, not an error
        assert!(!store
            .record_actual_state("team-a", "ghost", ActualState::Running, None)
            .unwrap());
    }

    #[test]
    fn remove_drops_the_row_after_cleanup_confirmation() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&workspace("alpha", "team-a")).unwrap();
        assert!(store.remove("team-a", "alpha").unwrap());
        assert!(store.get("team-a", "alpha").unwrap().is_none());
        assert!(!store.remove("team-a", "alpha").unwrap());
    }

    #[test]
    fn listing_scopes_by_agent_and_namespace() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&workspace("a", "ns1")).unwrap();
        store.create(&workspace("b", "ns1")).unwrap();
        let mut other = workspace("c", "ns2");
        other.agent_id = "agent-2".to_string();
        store.create(&other).unwrap();
        assert_eq!(store.list_for_agent("agent-1").unwrap().len(), 2);
        assert_eq!(store.list_for_agent("agent-2").unwrap().len(), 1);
        assert_eq!(store.list_in_namespace("ns1").unwrap().len(), 2);
    }
}
