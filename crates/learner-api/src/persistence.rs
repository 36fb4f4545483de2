use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use contracts::{KindCatalog, LearnerConfig, ModelSummary};
use learner_core::{RuntimeGraph, RuntimeNode};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum PersistenceError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    ModelNotFound(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::ModelNotFound(model_id) => write!(f, "model not found: {model_id}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

/// SQLite store for trained interaction graphs: one row per model, one row
/// per node with the node payload as JSON.
#[derive(Debug)]
pub struct SqliteModelStore {
    conn: Connection,
}

impl SqliteModelStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    /// Persist a trained graph, replacing any prior contents for the id.
    pub fn save_model(
        &mut self,
        model_id: &str,
        graph: &RuntimeGraph,
    ) -> Result<(), PersistenceError> {
        let config_json = serde_json::to_string(&graph.config)?;
        let catalog_json = serde_json::to_string(&graph.catalog)?;
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO models (
                model_id,
                schema_version,
                config_json,
                catalog_json,
                node_count,
                trained_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(model_id) DO UPDATE SET
                schema_version = excluded.schema_version,
                config_json = excluded.config_json,
                catalog_json = excluded.catalog_json,
                node_count = excluded.node_count,
                trained_at = excluded.trained_at",
            params![
                model_id,
                graph.schema_version.as_str(),
                config_json,
                catalog_json,
                graph.nodes.len() as i64,
                train_stamp(graph.nodes.len()),
            ],
        )?;

        tx.execute("DELETE FROM nodes WHERE model_id = ?1", params![model_id])?;
        for (node_key, node) in &graph.nodes {
            let payload_json = serde_json::to_string(node)?;
            tx.execute(
                "INSERT INTO nodes (model_id, node_key, payload_json)
                 VALUES (?1, ?2, ?3)",
                params![model_id, node_key.as_str(), payload_json],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn load_model(&self, model_id: &str) -> Result<RuntimeGraph, PersistenceError> {
        let header: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT schema_version, config_json, catalog_json
                 FROM models WHERE model_id = ?1",
                params![model_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((schema_version, config_json, catalog_json)) = header else {
            return Err(PersistenceError::ModelNotFound(model_id.to_string()));
        };
        let config: LearnerConfig = serde_json::from_str(&config_json)?;
        let catalog: KindCatalog = serde_json::from_str(&catalog_json)?;

        let mut stmt = self.conn.prepare(
            "SELECT node_key, payload_json FROM nodes
             WHERE model_id = ?1 ORDER BY node_key ASC",
        )?;
        let rows = stmt.query_map(params![model_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut nodes = BTreeMap::new();
        for row in rows {
            let (node_key, payload) = row?;
            let node: RuntimeNode = serde_json::from_str(&payload)?;
            nodes.insert(node_key, node);
        }

        Ok(RuntimeGraph {
            schema_version,
            config,
            catalog,
            nodes,
        })
    }

    pub fn list_models(&self) -> Result<Vec<ModelSummary>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT model_id, schema_version, node_count, trained_at
             FROM models ORDER BY model_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ModelSummary {
                model_id: row.get(0)?,
                schema_version: row.get(1)?,
                node_count: row.get::<_, i64>(2)?.max(0) as usize,
                trained_at: row.get(3)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS models (
                model_id TEXT PRIMARY KEY,
                schema_version TEXT NOT NULL,
                config_json TEXT NOT NULL,
                catalog_json TEXT NOT NULL,
                node_count INTEGER NOT NULL,
                trained_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                model_id TEXT NOT NULL,
                node_key TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                PRIMARY KEY (model_id, node_key)
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_model ON nodes(model_id);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES(1, 'initial_v1', 'model-000000')",
            [],
        )?;

        Ok(())
    }
}

fn train_stamp(node_count: usize) -> String {
    format!("model-{node_count:06}")
}
