//! Durable storage for agents, tasks and memory fragments.
//!
//! [`RecordStore`] abstracts the operations the stores need so they can be
//! backed by any storage engine. [`Persistence`] is the DuckDB implementation.

use crate::capability::Agent;
use crate::memory::MemoryFragment;
use crate::queue::{Task, TaskStatus};
use crate::types::{lock, FragmentId, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Storage operations required by the capability store, task queue and
/// fragment store. Every method is atomic for the records it touches.
pub trait RecordStore: Send + Sync {
    // ========== Agents ==========

    fn upsert_agent(&self, agent: &Agent) -> Result<()>;

    fn load_agents(&self) -> Result<Vec<Agent>>;

    // ========== Tasks ==========

    fn upsert_task(&self, task: &Task) -> Result<()>;

    /// Write a batch of tasks in one transaction: all or none.
    fn insert_tasks(&self, tasks: &[Task]) -> Result<()>;

    fn load_tasks(&self) -> Result<Vec<Task>>;

    // ========== Memory fragments ==========

    fn upsert_fragment(&self, fragment: &MemoryFragment) -> Result<()>;

    fn delete_fragments(&self, ids: &[FragmentId]) -> Result<()>;

    fn load_fragments(&self) -> Result<Vec<MemoryFragment>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_registry (
    name TEXT PRIMARY KEY,
    "type" TEXT NOT NULL,
    capabilities TEXT NOT NULL,
    performance_score DOUBLE NOT NULL,
    success_rate DOUBLE NOT NULL,
    ruv_pattern_preference TEXT NOT NULL,
    cognitive_enhancement_score DOUBLE NOT NULL,
    simd_optimization_enabled BOOLEAN NOT NULL,
    last_active TEXT NOT NULL,
    total_tasks BIGINT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS task_queue (
    id BIGINT PRIMARY KEY,
    priority BIGINT NOT NULL,
    status TEXT NOT NULL,
    complexity TEXT NOT NULL,
    assigned_agents TEXT NOT NULL,
    task_description TEXT NOT NULL,
    requirements TEXT NOT NULL,
    dependencies TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    result TEXT,
    ruv_pattern_used TEXT,
    cognitive_insights TEXT NOT NULL,
    performance_metrics TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS memory_fragments (
    id BIGINT PRIMARY KEY,
    context_type TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    importance DOUBLE NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    access_count BIGINT NOT NULL,
    related_task BIGINT,
    compression_ratio DOUBLE NOT NULL,
    neural_enhanced BOOLEAN NOT NULL,
    pattern_correlation TEXT
);
"#;

/// DuckDB-backed [`RecordStore`].
pub struct Persistence {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence").finish_non_exhaustive()
    }
}

impl Persistence {
    /// Open (creating if needed) a database file.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    OrchestratorError::Storage(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(db_path)?;
        debug!("Opened database at {}", db_path.display());
        Self::with_connection(conn)
    }

    /// Ephemeral database, used by tests and one-shot runs.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrchestratorError::Storage(format!("invalid timestamp '{}': {}", text, e)))
}

fn parse_opt_time(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_time).transpose()
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(OrchestratorError::Storage(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

const INSERT_TASK: &str = "INSERT OR REPLACE INTO task_queue (
        id, priority, status, complexity, assigned_agents, task_description,
        requirements, dependencies, created_at, started_at, completed_at,
        result, ruv_pattern_used, cognitive_insights, performance_metrics, error
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn write_task(conn: &Connection, task: &Task) -> Result<()> {
    let result = task.result.as_ref().map(to_json).transpose()?;
    let metrics = task.metrics.as_ref().map(to_json).transpose()?;
    conn.execute(
        INSERT_TASK,
        params![
            task.id as i64,
            task.priority,
            task.status.as_str(),
            task.complexity.as_str(),
            to_json(&task.assigned_agents)?,
            &task.description,
            to_json(&task.requirements)?,
            to_json(&task.dependencies)?,
            task.created_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
            result,
            task.pattern_used.map(|p| p.as_str().to_string()),
            to_json(&task.insights)?,
            metrics,
            &task.error,
        ],
    )?;
    Ok(())
}

impl RecordStore for Persistence {
    fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT OR REPLACE INTO agent_registry (
                name, \"type\", capabilities, performance_score, success_rate,
                ruv_pattern_preference, cognitive_enhancement_score,
                simd_optimization_enabled, last_active, total_tasks, description
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                &agent.name,
                &agent.agent_type,
                to_json(&agent.capabilities)?,
                agent.performance_score,
                agent.success_rate,
                agent.preferred_pattern.as_str(),
                agent.enhancement_score,
                agent.simd_enabled,
                agent.last_active.to_rfc3339(),
                agent.total_tasks as i64,
                &agent.description,
            ],
        )?;
        Ok(())
    }

    fn load_agents(&self) -> Result<Vec<Agent>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT name, \"type\", capabilities, performance_score, success_rate,
                    ruv_pattern_preference, cognitive_enhancement_score,
                    simd_optimization_enabled, last_active, total_tasks, description
             FROM agent_registry ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut agents = Vec::new();
        for row in rows {
            let (
                name,
                agent_type,
                capabilities,
                performance_score,
                success_rate,
                pattern,
                enhancement_score,
                simd_enabled,
                last_active,
                total_tasks,
                description,
            ) = row?;
            agents.push(Agent {
                name,
                agent_type,
                capabilities: from_json(&capabilities)?,
                performance_score,
                success_rate,
                preferred_pattern: pattern.parse()?,
                enhancement_score,
                simd_enabled,
                last_active: parse_time(&last_active)?,
                total_tasks: total_tasks.max(0) as u64,
                description,
            });
        }
        Ok(agents)
    }

    fn upsert_task(&self, task: &Task) -> Result<()> {
        let conn = lock(&self.conn);
        write_task(&conn, task)
    }

    fn insert_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        for task in tasks {
            write_task(&tx, task)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<Task>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, priority, status, complexity, assigned_agents, task_description,
                    requirements, dependencies, created_at, started_at, completed_at,
                    result, ruv_pattern_used, cognitive_insights, performance_metrics, error
             FROM task_queue ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                (
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ),
                (
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, Option<String>>(14)?,
                    row.get::<_, Option<String>>(15)?,
                ),
            ))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (
                (id, priority, status, complexity, agents, description, requirements, dependencies),
                (created_at, started_at, completed_at, result, pattern, insights, metrics, error),
            ) = row?;
            tasks.push(Task {
                id: id as u64,
                priority,
                status: status.parse::<TaskStatus>()?,
                complexity: complexity
                    .parse()
                    .map_err(|e| OrchestratorError::Storage(format!("task {}: {}", id, e)))?,
                assigned_agents: from_json(&agents)?,
                description,
                requirements: from_json(&requirements)?,
                dependencies: from_json(&dependencies)?,
                created_at: parse_time(&created_at)?,
                started_at: parse_opt_time(started_at)?,
                completed_at: parse_opt_time(completed_at)?,
                result: result.as_deref().map(from_json).transpose()?,
                pattern_used: pattern.map(|p| p.parse()).transpose()?,
                insights: from_json(&insights)?,
                metrics: metrics.as_deref().map(from_json).transpose()?,
                error,
            });
        }
        Ok(tasks)
    }

    fn upsert_fragment(&self, fragment: &MemoryFragment) -> Result<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT OR REPLACE INTO memory_fragments (
                id, context_type, content, embedding, importance, created_at,
                last_accessed, access_count, related_task, compression_ratio,
                neural_enhanced, pattern_correlation
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                fragment.id as i64,
                &fragment.context_type,
                &fragment.content,
                fragment.embedding.as_deref().map(encode_embedding),
                fragment.importance,
                fragment.created_at.to_rfc3339(),
                fragment.last_accessed.to_rfc3339(),
                fragment.access_count as i64,
                fragment.related_task.map(|id| id as i64),
                fragment.compression_ratio,
                fragment.neural_enhanced,
                &fragment.pattern_correlation,
            ],
        )?;
        Ok(())
    }

    fn delete_fragments(&self, ids: &[FragmentId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM memory_fragments WHERE id = ?", params![*id as i64])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_fragments(&self) -> Result<Vec<MemoryFragment>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, context_type, content, embedding, importance, created_at,
                    last_accessed, access_count, related_task, compression_ratio,
                    neural_enhanced, pattern_correlation
             FROM memory_fragments ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<i64>>(8)?,
                row.get::<_, f64>(9)?,
                row.get::<_, bool>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        })?;

        let mut fragments = Vec::new();
        for row in rows {
            let (
                id,
                context_type,
                content,
                embedding,
                importance,
                created_at,
                last_accessed,
                access_count,
                related_task,
                compression_ratio,
                neural_enhanced,
                pattern_correlation,
            ) = row?;
            fragments.push(MemoryFragment {
                id: id as u64,
                context_type,
                content,
                embedding: embedding.as_deref().map(decode_embedding).transpose()?,
                importance,
                created_at: parse_time(&created_at)?,
                last_accessed: parse_time(&last_accessed)?,
                access_count: access_count.max(0) as u64,
                related_task: related_task.map(|id| id as u64),
                compression_ratio,
                neural_enhanced,
                pattern_correlation,
            });
        }
        Ok(fragments)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to an in-memory database, failing task or agent writes on demand.
    pub(crate) struct FlakyStore {
        inner: Persistence,
        pub(crate) fail_tasks: AtomicBool,
        pub(crate) fail_agents: AtomicBool,
    }

    impl FlakyStore {
        pub(crate) fn new() -> Self {
            Self {
                inner: Persistence::in_memory().unwrap(),
                fail_tasks: AtomicBool::new(false),
                fail_agents: AtomicBool::new(false),
            }
        }

        fn check(flag: &AtomicBool) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                Err(OrchestratorError::Storage("disk full".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl RecordStore for FlakyStore {
        fn upsert_agent(&self, agent: &Agent) -> Result<()> {
            Self::check(&self.fail_agents)?;
            self.inner.upsert_agent(agent)
        }
        fn load_agents(&self) -> Result<Vec<Agent>> {
            self.inner.load_agents()
        }
        fn upsert_task(&self, task: &Task) -> Result<()> {
            Self::check(&self.fail_tasks)?;
            self.inner.upsert_task(task)
        }
        fn insert_tasks(&self, tasks: &[Task]) -> Result<()> {
            Self::check(&self.fail_tasks)?;
            self.inner.insert_tasks(tasks)
        }
        fn load_tasks(&self) -> Result<Vec<Task>> {
            self.inner.load_tasks()
        }
        fn upsert_fragment(&self, fragment: &MemoryFragment) -> Result<()> {
            self.inner.upsert_fragment(fragment)
        }
        fn delete_fragments(&self, ids: &[FragmentId]) -> Result<()> {
            self.inner.delete_fragments(ids)
        }
        fn load_fragments(&self) -> Result<Vec<MemoryFragment>> {
            self.inner.load_fragments()
        }
    }
}
