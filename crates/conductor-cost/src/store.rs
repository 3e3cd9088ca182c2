use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use conductor_core::{ConductorError, Result, TokenUsage};

use crate::record::{CostAggregate, CostAmount, CostAccuracy, CostFilter, CostRecord};

/// Persistent cost store contract. Implementations must produce aggregates
/// identical to the in-memory fold over the same record set, and guarantee
/// read-your-writes within a single process.
#[async_trait]
pub trait CostStore: Send + Sync {
    async fn insert(&self, record: &CostRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<CostRecord>>;
    async fn query(&self, filter: &CostFilter) -> Result<Vec<CostRecord>>;
    async fn aggregate(&self, filter: &CostFilter) -> Result<CostAggregate>;
    async fn aggregate_by_provider(
        &self,
        filter: &CostFilter,
    ) -> Result<BTreeMap<String, CostAggregate>>;
    async fn aggregate_by_model(
        &self,
        filter: &CostFilter,
    ) -> Result<BTreeMap<String, CostAggregate>>;
    async fn aggregate_by_workflow(
        &self,
        filter: &CostFilter,
    ) -> Result<BTreeMap<String, CostAggregate>>;
    /// Delete records older than `age`; returns the count removed.
    async fn delete_older_than(&self, age: Duration) -> Result<u64>;
}

/// SQLite-backed cost store.
pub struct SqliteCostStore {
    db: Arc<Mutex<Connection>>,
}

fn store_err(e: impl std::fmt::Display) -> ConductorError {
    ConductorError::Store(e.to_string())
}

impl SqliteCostStore {
    /// Open or create the cost database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening cost store");
        let conn = Connection::open(path).map_err(store_err)?;

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cost_records (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                run_id TEXT,
                step_name TEXT,
                workflow_id TEXT,
                user_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                actual_provider TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cost_amount REAL,
                cost_currency TEXT,
                cost_accuracy TEXT,
                cost_source TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_cost_request ON cost_records(request_id);
            CREATE INDEX IF NOT EXISTS idx_cost_run ON cost_records(run_id);
            CREATE INDEX IF NOT EXISTS idx_cost_workflow ON cost_records(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_cost_user ON cost_records(user_id);
            CREATE INDEX IF NOT EXISTS idx_cost_provider ON cost_records(provider);
            CREATE INDEX IF NOT EXISTS idx_cost_model ON cost_records(model);
            CREATE INDEX IF NOT EXISTS idx_cost_timestamp ON cost_records(timestamp);
            ",
        )
        .map_err(store_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CostRecord> {
        let timestamp: String = row.get("timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let cost_amount: Option<f64> = row.get("cost_amount")?;
        let cost = match cost_amount {
            Some(amount) => {
                let accuracy: Option<String> = row.get("cost_accuracy")?;
                Some(CostAmount {
                    amount,
                    currency: row
                        .get::<_, Option<String>>("cost_currency")?
                        .unwrap_or_else(|| "USD".into()),
                    accuracy: accuracy
                        .as_deref()
                        .and_then(CostAccuracy::parse)
                        .unwrap_or(CostAccuracy::Unavailable),
                    source: row
                        .get::<_, Option<String>>("cost_source")?
                        .unwrap_or_default(),
                })
            }
            None => None,
        };

        Ok(CostRecord {
            id: row.get("id")?,
            request_id: row.get("request_id")?,
            run_id: row.get("run_id")?,
            step_name: row.get("step_name")?,
            workflow_id: row.get("workflow_id")?,
            user_id: row.get("user_id")?,
            provider: row.get("provider")?,
            model: row.get("model")?,
            actual_provider: row.get("actual_provider")?,
            timestamp,
            duration_ms: row.get::<_, i64>("duration_ms")? as u64,
            usage: TokenUsage {
                prompt_tokens: row.get::<_, i64>("prompt_tokens")? as u64,
                completion_tokens: row.get::<_, i64>("completion_tokens")? as u64,
                total_tokens: row.get::<_, i64>("total_tokens")? as u64,
                cache_creation_tokens: row.get::<_, i64>("cache_creation_tokens")? as u64,
                cache_read_tokens: row.get::<_, i64>("cache_read_tokens")? as u64,
            },
            cost,
        })
    }

    /// Build the WHERE clause and parameters for a filter.
    fn filter_clause(filter: &CostFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(start) = filter.start {
            clauses.push("timestamp >= ?".into());
            params.push(Box::new(start.to_rfc3339()));
        }
        if let Some(end) = filter.end {
            clauses.push("timestamp <= ?".into());
            params.push(Box::new(end.to_rfc3339()));
        }
        if let Some(ref provider) = filter.provider {
            clauses.push("provider = ?".into());
            params.push(Box::new(provider.clone()));
        }
        if let Some(ref model) = filter.model {
            clauses.push("model = ?".into());
            params.push(Box::new(model.clone()));
        }
        if let Some(ref workflow) = filter.workflow_id {
            clauses.push("workflow_id = ?".into());
            params.push(Box::new(workflow.clone()));
        }
        if let Some(ref user) = filter.user_id {
            clauses.push("user_id = ?".into());
            params.push(Box::new(user.clone()));
        }
        if let Some(ref run) = filter.run_id {
            clauses.push("run_id = ?".into());
            params.push(Box::new(run.clone()));
        }
        if let Some(ref request) = filter.request_id {
            clauses.push("request_id = ?".into());
            params.push(Box::new(request.clone()));
        }

        let clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (clause, params)
    }

    fn query_sync(&self, filter: &CostFilter) -> Result<Vec<CostRecord>> {
        let (clause, params) = Self::filter_clause(filter);
        let sql = format!("SELECT * FROM cost_records{clause} ORDER BY timestamp, id");

        let db = self.db.lock();
        let mut stmt = db.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                Self::row_to_record,
            )
            .map_err(store_err)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(store_err)?);
        }
        Ok(records)
    }

    /// Group the matching records by a key and fold each group. The fold is
    /// the same one the in-memory tracker uses, which keeps the two
    /// implementations' aggregates identical by construction.
    async fn grouped<F>(
        &self,
        filter: &CostFilter,
        key: F,
    ) -> Result<BTreeMap<String, CostAggregate>>
    where
        F: Fn(&CostRecord) -> String,
    {
        let records = self.query_sync(filter)?;
        let mut groups: BTreeMap<String, CostAggregate> = BTreeMap::new();
        for record in &records {
            groups.entry(key(record)).or_default().add(record);
        }
        Ok(groups)
    }
}

#[async_trait]
impl CostStore for SqliteCostStore {
    async fn insert(&self, record: &CostRecord) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO cost_records (
                id, request_id, run_id, step_name, workflow_id, user_id,
                provider, model, actual_provider, timestamp, duration_ms,
                prompt_tokens, completion_tokens, total_tokens,
                cache_creation_tokens, cache_read_tokens,
                cost_amount, cost_currency, cost_accuracy, cost_source
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            rusqlite::params![
                record.id,
                record.request_id,
                record.run_id,
                record.step_name,
                record.workflow_id,
                record.user_id,
                record.provider,
                record.model,
                record.actual_provider,
                record.timestamp.to_rfc3339(),
                record.duration_ms as i64,
                record.usage.prompt_tokens as i64,
                record.usage.completion_tokens as i64,
                record.usage.total_tokens as i64,
                record.usage.cache_creation_tokens as i64,
                record.usage.cache_read_tokens as i64,
                record.cost.as_ref().map(|c| c.amount),
                record.cost.as_ref().map(|c| c.currency.clone()),
                record.cost.as_ref().map(|c| c.accuracy.as_str()),
                record.cost.as_ref().map(|c| c.source.clone()),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CostRecord>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT * FROM cost_records WHERE id = ?1")
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map(rusqlite::params![id], Self::row_to_record)
            .map_err(store_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(store_err)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, filter: &CostFilter) -> Result<Vec<CostRecord>> {
        self.query_sync(filter)
    }

    async fn aggregate(&self, filter: &CostFilter) -> Result<CostAggregate> {
        let records = self.query_sync(filter)?;
        Ok(CostAggregate::from_records(&records))
    }

    async fn aggregate_by_provider(
        &self,
        filter: &CostFilter,
    ) -> Result<BTreeMap<String, CostAggregate>> {
        self.grouped(filter, |r| r.provider.clone()).await
    }

    async fn aggregate_by_model(
        &self,
        filter: &CostFilter,
    ) -> Result<BTreeMap<String, CostAggregate>> {
        self.grouped(filter, |r| r.model.clone()).await
    }

    async fn aggregate_by_workflow(
        &self,
        filter: &CostFilter,
    ) -> Result<BTreeMap<String, CostAggregate>> {
        self.grouped(filter, |r| {
            r.workflow_id.clone().unwrap_or_else(|| "(none)".into())
        })
        .await
    }

    async fn delete_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age)
                .map_err(|e| ConductorError::Store(e.to_string()))?;
        let db = self.db.lock();
        let removed = db
            .execute(
                "DELETE FROM cost_records WHERE timestamp < ?1",
                rusqlite::params![cutoff.to_rfc3339()],
            )
            .map_err(store_err)?;
        Ok(removed as u64)
    }
}
