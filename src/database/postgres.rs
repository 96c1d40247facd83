//! # PostgreSQL Lease Store
//!
//! [`LeaseStore`] over the `lease_work_items` and `lease_incidents` tables (see
//! `migrations/`). Lease writes are conditional `UPDATE`s on the revision and on both
//! lease columns with `IS NOT DISTINCT FROM`, so a stale node can never overwrite a
//! lease another node has taken. One acquisition cycle is one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::lease_store::{ExternalTaskQuery, LeaseClaim, LeaseStore};
use crate::config::DatabaseConfig;
use crate::error::{Result, SchedulerError};
use crate::models::{Incident, IncidentType, LeaseFields, WorkItem, WorkItemKind};

/// Schema migrations bundled with the crate
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const WORK_ITEM_COLUMNS: &str = r#"
    id, kind, topic_name, due_date, lock_owner, lock_expiration_time, retries_remaining,
    exclusive, process_instance_id, root_process_instance_id, priority, last_failure_reason,
    failed_attempts, suspended, revision, business_key, process_definition_key, tenant_id,
    variables, created_at
"#;

const LEASE_CONDITION: &str = r#"
    id = $1
    AND revision = $2
    AND lock_owner IS NOT DISTINCT FROM $3
    AND lock_expiration_time IS NOT DISTINCT FROM $4
"#;

#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the database section of the configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool)
            .acquire_timeout(Duration::from_millis(config.checkout_timeout_millis))
            .connect(&config.database_url())
            .await
            .map_err(|e| {
                error!("Failed to connect lease store: {}", e);
                SchedulerError::DatabaseError(format!("Connection failed: {e}"))
            })?;
        info!(max_connections = config.pool, "Lease store connected");
        Ok(Self { pool })
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Internal struct for SQL query results
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    kind: String,
    topic_name: Option<String>,
    due_date: DateTime<Utc>,
    lock_owner: Option<String>,
    lock_expiration_time: Option<DateTime<Utc>>,
    retries_remaining: i32,
    exclusive: bool,
    process_instance_id: Option<String>,
    root_process_instance_id: Option<String>,
    priority: i64,
    last_failure_reason: Option<String>,
    failed_attempts: i32,
    suspended: bool,
    revision: i32,
    business_key: Option<String>,
    process_definition_key: Option<String>,
    tenant_id: Option<String>,
    variables: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = SchedulerError;

    fn try_from(row: WorkItemRow) -> Result<Self> {
        let kind = WorkItemKind::parse(&row.kind).ok_or_else(|| {
            SchedulerError::DatabaseError(format!("Unknown work item kind '{}'", row.kind))
        })?;
        let variables = match row.variables {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(SchedulerError::DatabaseError(format!(
                    "Variables of {} are not an object: {other}",
                    row.id
                )))
            }
        };
        Ok(WorkItem {
            id: row.id,
            kind,
            topic_name: row.topic_name,
            due_date: row.due_date,
            lock_owner: row.lock_owner,
            lock_expiration_time: row.lock_expiration_time,
            retries_remaining: row.retries_remaining.max(0) as u32,
            exclusive: row.exclusive,
            process_instance_id: row.process_instance_id,
            root_process_instance_id: row.root_process_instance_id,
            priority: row.priority,
            last_failure_reason: row.last_failure_reason,
            failed_attempts: row.failed_attempts.max(0) as u32,
            suspended: row.suspended,
            revision: row.revision,
            business_key: row.business_key,
            process_definition_key: row.process_definition_key,
            tenant_id: row.tenant_id,
            variables,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IncidentRow {
    id: Uuid,
    incident_type: String,
    work_item_id: String,
    process_instance_id: Option<String>,
    message: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = SchedulerError;

    fn try_from(row: IncidentRow) -> Result<Self> {
        let incident_type = IncidentType::parse(&row.incident_type).ok_or_else(|| {
            SchedulerError::DatabaseError(format!(
                "Unknown incident type '{}'",
                row.incident_type
            ))
        })?;
        Ok(Incident {
            id: row.id,
            incident_type,
            work_item_id: row.work_item_id,
            process_instance_id: row.process_instance_id,
            message: row.message,
            created_at: row.created_at,
        })
    }
}

fn into_items(rows: Vec<WorkItemRow>) -> Result<Vec<WorkItem>> {
    rows.into_iter().map(WorkItem::try_from).collect()
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn insert(&self, item: WorkItem) -> Result<()> {
        let query = format!(
            "INSERT INTO lease_work_items ({WORK_ITEM_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        );
        sqlx::query(&query)
            .bind(&item.id)
            .bind(item.kind.as_str())
            .bind(&item.topic_name)
            .bind(item.due_date)
            .bind(&item.lock_owner)
            .bind(item.lock_expiration_time)
            .bind(item.retries_remaining as i32)
            .bind(item.exclusive)
            .bind(&item.process_instance_id)
            .bind(&item.root_process_instance_id)
            .bind(item.priority)
            .bind(&item.last_failure_reason)
            .bind(item.failed_attempts as i32)
            .bind(item.suspended)
            .bind(item.revision)
            .bind(&item.business_key)
            .bind(&item.process_definition_key)
            .bind(&item.tenant_id)
            .bind(serde_json::Value::Object(item.variables.clone()))
            .bind(item.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<WorkItem>> {
        let query = format!("SELECT {WORK_ITEM_COLUMNS} FROM lease_work_items WHERE id = $1");
        let row = sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkItem::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn select_acquirable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>> {
        let query = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS}
            FROM lease_work_items
            WHERE kind = 'job'
              AND due_date <= $1
              AND (lock_expiration_time IS NULL OR lock_expiration_time < $1)
              AND retries_remaining > 0
              AND NOT suspended
            ORDER BY priority DESC, due_date ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, WorkItemRow>(&query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to select acquirable jobs: {}", e);
                SchedulerError::DatabaseError(format!("Job selection failed: {e}"))
            })?;
        into_items(rows)
    }

    #[instrument(skip(self, query), fields(worker_id = %query.worker_id))]
    async fn select_external_tasks(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let sql = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS}
            FROM lease_work_items
            WHERE kind = 'external_task'
              AND topic_name = ANY($1)
              AND due_date <= $2
              AND (lock_expiration_time IS NULL OR lock_expiration_time < $2)
              AND retries_remaining > 0
              AND NOT suspended
            ORDER BY (CASE WHEN $3 THEN priority ELSE 0 END) DESC, created_at ASC, id ASC
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(query.topic_names())
            .bind(now)
            .bind(query.use_priority)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        // Per-topic filters and the tenant check are evaluated here
        let mut items: Vec<WorkItem> = into_items(rows)?
            .into_iter()
            .filter(|item| query.matches(item, now))
            .collect();
        items.sort_by(|a, b| query.compare(a, b));
        Ok(items)
    }

    #[instrument(skip(self, claims), fields(claims = claims.len()))]
    async fn acquire_leases(&self, claims: &[LeaseClaim]) -> Result<Vec<bool>> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "UPDATE lease_work_items \
             SET lock_owner = $5, lock_expiration_time = $6, revision = revision + 1 \
             WHERE {LEASE_CONDITION}"
        );

        let mut results = Vec::with_capacity(claims.len());
        for claim in claims {
            let outcome = sqlx::query(&query)
                .bind(&claim.work_item_id)
                .bind(claim.expected.revision)
                .bind(&claim.expected.lock_owner)
                .bind(claim.expected.lock_expiration_time)
                .bind(&claim.lock_owner)
                .bind(claim.lock_expiration_time)
                .execute(&mut *tx)
                .await?;
            let won = outcome.rows_affected() == 1;
            if !won {
                debug!(work_item_id = %claim.work_item_id, "Lease compare-and-set lost");
            }
            results.push(won);
        }

        tx.commit().await?;
        Ok(results)
    }

    async fn release_lease(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        let query = format!(
            "UPDATE lease_work_items \
             SET lock_owner = NULL, lock_expiration_time = NULL, revision = revision + 1 \
             WHERE {LEASE_CONDITION}"
        );
        let outcome = sqlx::query(&query)
            .bind(id)
            .bind(expected.revision)
            .bind(&expected.lock_owner)
            .bind(expected.lock_expiration_time)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn extend_lease(
        &self,
        id: &str,
        expected: &LeaseFields,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!(
            "UPDATE lease_work_items \
             SET lock_expiration_time = $5, revision = revision + 1 \
             WHERE {LEASE_CONDITION}"
        );
        let outcome = sqlx::query(&query)
            .bind(id)
            .bind(expected.revision)
            .bind(&expected.lock_owner)
            .bind(expected.lock_expiration_time)
            .bind(lock_expiration_time)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        expected: &LeaseFields,
        updated: &WorkItem,
        incident: Option<&Incident>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "UPDATE lease_work_items \
             SET retries_remaining = $5, due_date = $6, last_failure_reason = $7, \
                 failed_attempts = $8, lock_owner = NULL, lock_expiration_time = NULL, \
                 revision = revision + 1 \
             WHERE {LEASE_CONDITION}"
        );
        let outcome = sqlx::query(&query)
            .bind(&updated.id)
            .bind(expected.revision)
            .bind(&expected.lock_owner)
            .bind(expected.lock_expiration_time)
            .bind(updated.retries_remaining as i32)
            .bind(updated.due_date)
            .bind(&updated.last_failure_reason)
            .bind(updated.failed_attempts as i32)
            .execute(&mut *tx)
            .await?;

        if outcome.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(incident) = incident {
            sqlx::query(
                "INSERT INTO lease_incidents \
                 (id, incident_type, work_item_id, process_instance_id, message, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(incident.id)
            .bind(incident.incident_type.as_str())
            .bind(&incident.work_item_id)
            .bind(&incident.process_instance_id)
            .bind(&incident.message)
            .bind(incident.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn remove(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let query = format!("DELETE FROM lease_work_items WHERE {LEASE_CONDITION}");
        let outcome = sqlx::query(&query)
            .bind(id)
            .bind(expected.revision)
            .bind(&expected.lock_owner)
            .bind(expected.lock_expiration_time)
            .execute(&mut *tx)
            .await?;
        let removed = outcome.rows_affected() == 1;
        if removed {
            sqlx::query("DELETE FROM lease_incidents WHERE work_item_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn set_retries(&self, id: &str, retries: u32) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let outcome = sqlx::query(
            "UPDATE lease_work_items \
             SET retries_remaining = $2, revision = revision + 1 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(retries as i32)
        .execute(&mut *tx)
        .await?;
        let found = outcome.rows_affected() == 1;
        if found && retries > 0 {
            sqlx::query("DELETE FROM lease_incidents WHERE work_item_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(found)
    }

    async fn open_incidents(&self) -> Result<Vec<Incident>> {
        let rows = sqlx::query_as::<_, IncidentRow>(
            "SELECT id, incident_type, work_item_id, process_instance_id, message, created_at \
             FROM lease_incidents ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Incident::try_from).collect()
    }
}
