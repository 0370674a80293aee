//! Failed-operation registry.
//!
//! ```text
//! failed ──claim──> retrying ──ok──> resolved
//!   ^                  │
//!   └──── attempts ≤ max ┤
//!                      └── attempts > max ──> abandoned
//! ```
//!
//! Rows are never deleted; resolved and abandoned rows stay for audit.

use crate::entity::{self, ActiveModel, Column, Entity};
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{FailedOperation, OperationKind, OperationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbBackend, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Statement,
};
use std::sync::Mutex;
use uuid::Uuid;

/// Delay before the next attempt, indexed by failed attempts so far.
const RETRY_DELAYS_SECS: [i64; 5] = [60, 5 * 60, 30 * 60, 2 * 3600, 24 * 3600];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before a row is abandoned
    pub max_attempts: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn delay_after(&self, attempts: i32) -> Duration {
        let index = (attempts.max(1) as usize - 1).min(RETRY_DELAYS_SECS.len() - 1);
        Duration::seconds(RETRY_DELAYS_SECS[index])
    }

    /// Status and next eligible time after the `attempts`-th failure.
    pub fn after_failure(&self, attempts: i32, now: DateTime<Utc>) -> (OperationStatus, DateTime<Utc>) {
        if attempts > self.max_attempts {
            (OperationStatus::Abandoned, now)
        } else {
            (OperationStatus::Failed, now + self.delay_after(attempts))
        }
    }
}

/// Outcome of one coordinator attempt, applied by [`FailedOperationRepository::save_attempt`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptUpdate {
    pub attempts: i32,
    pub status: OperationStatus,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FailedOperationRepository: Send + Sync {
    /// Record a first failure for `target_id`. A row for the same target
    /// still waiting in `failed` absorbs the new failure instead.
    async fn record(
        &self,
        target_id: Uuid,
        operation: OperationKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> EmbeddingResult<FailedOperation>;

    /// Atomically move up to `limit` due rows from `failed` to `retrying`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u64) -> EmbeddingResult<Vec<FailedOperation>>;

    async fn save_attempt(
        &self,
        id: Uuid,
        update: AttemptUpdate,
        now: DateTime<Utc>,
    ) -> EmbeddingResult<FailedOperation>;

    async fn get(&self, id: Uuid) -> EmbeddingResult<Option<FailedOperation>>;

    /// Newest first.
    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: u64,
    ) -> EmbeddingResult<Vec<FailedOperation>>;

    /// Make an unresolved row due immediately. Also releases a row left in
    /// `retrying` by a coordinator that died mid-attempt.
    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> EmbeddingResult<FailedOperation>;
}

#[derive(Clone)]
pub struct PgFailedOperationRepository {
    db: DatabaseConnection,
    policy: RetryPolicy,
}

impl PgFailedOperationRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            policy: RetryPolicy::default(),
        }
    }

    /// Schedule first failures with `policy` instead of the default.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn find_model(&self, id: Uuid) -> EmbeddingResult<entity::Model> {
        Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
            .ok_or(EmbeddingError::NotFound(id))
    }
}

#[async_trait]
impl FailedOperationRepository for PgFailedOperationRepository {
    async fn record(
        &self,
        target_id: Uuid,
        operation: OperationKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> EmbeddingResult<FailedOperation> {
        let merge = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE failed_operations
            SET operation = $2, last_error = $3, updated_at = $4
            WHERE id = (
                SELECT id FROM failed_operations
                WHERE target_id = $1 AND status = 'failed'
                ORDER BY created_at
                LIMIT 1
            )
            RETURNING *
            "#,
            [
                target_id.into(),
                operation.to_string().into(),
                error.to_string().into(),
                now.into(),
            ],
        );

        if let Some(existing) = Entity::find()
            .from_raw_sql(merge)
            .one(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
        {
            return Ok(existing.into());
        }

        let (status, next_retry_at) = self.policy.after_failure(1, now);
        let model = ActiveModel {
            id: Set(Uuid::now_v7()),
            target_id: Set(target_id),
            operation: Set(operation),
            attempts: Set(1),
            status: Set(status),
            next_retry_at: Set(next_retry_at.into()),
            last_error: Set(Some(error.to_string())),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(&self.db)
        .await
        .map_err(|e| EmbeddingError::Database(e.to_string()))?;

        tracing::info!(
            operation_id = %model.id,
            target_id = %target_id,
            operation = %operation,
            "Recorded failed operation"
        );
        Ok(model.into())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u64) -> EmbeddingResult<Vec<FailedOperation>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE failed_operations
            SET status = 'retrying', updated_at = $1
            WHERE id IN (
                SELECT id FROM failed_operations
                WHERE status = 'failed' AND next_retry_at <= $1
                ORDER BY next_retry_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
            [now.into(), (limit as i64).into()],
        );

        let mut claimed: Vec<FailedOperation> = Entity::find()
            .from_raw_sql(stmt)
            .all(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
            .into_iter()
            .map(Into::into)
            .collect();
        claimed.sort_by_key(|op| op.next_retry_at);
        Ok(claimed)
    }

    async fn save_attempt(
        &self,
        id: Uuid,
        update: AttemptUpdate,
        now: DateTime<Utc>,
    ) -> EmbeddingResult<FailedOperation> {
        let mut active: ActiveModel = self.find_model(id).await?.into();
        active.attempts = Set(update.attempts);
        active.status = Set(update.status);
        active.next_retry_at = Set(update.next_retry_at.into());
        if update.last_error.is_some() {
            active.last_error = Set(update.last_error);
        }
        active.updated_at = Set(now.into());

        let model = active
            .update(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?;
        Ok(model.into())
    }

    async fn get(&self, id: Uuid) -> EmbeddingResult<Option<FailedOperation>> {
        Ok(Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
            .map(Into::into))
    }

    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: u64,
    ) -> EmbeddingResult<Vec<FailedOperation>> {
        let mut query = Entity::find();
        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status));
        }

        Ok(query
            .order_by_desc(Column::UpdatedAt)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> EmbeddingResult<FailedOperation> {
        let model = self.find_model(id).await?;
        if model.status == OperationStatus::Resolved {
            return Err(EmbeddingError::Validation(format!(
                "operation {} is already resolved",
                id
            )));
        }

        let mut active: ActiveModel = model.into();
        active.status = Set(OperationStatus::Failed);
        active.next_retry_at = Set(now.into());
        active.updated_at = Set(now.into());

        let model = active
            .update(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?;
        Ok(model.into())
    }
}

/// Process-local registry for tests and dry runs.
#[derive(Default)]
pub struct InMemoryFailedOperationRepository {
    rows: Mutex<Vec<FailedOperation>>,
    policy: RetryPolicy,
}

impl InMemoryFailedOperationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn with_rows<T>(&self, f: impl FnOnce(&mut Vec<FailedOperation>) -> T) -> EmbeddingResult<T> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| EmbeddingError::Internal("registry lock poisoned".to_string()))?;
        Ok(f(&mut rows))
    }
}

#[async_trait]
impl FailedOperationRepository for InMemoryFailedOperationRepository {
    async fn record(
        &self,
        target_id: Uuid,
        operation: OperationKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> EmbeddingResult<FailedOperation> {
        self.with_rows(|rows| {
            if let Some(existing) = rows
                .iter_mut()
                .find(|r| r.target_id == target_id && r.status == OperationStatus::Failed)
            {
                existing.operation = operation;
                existing.last_error = Some(error.to_string());
                existing.updated_at = now;
                return existing.clone();
            }

            let (status, next_retry_at) = self.policy.after_failure(1, now);
            let row = FailedOperation {
                id: Uuid::now_v7(),
                target_id,
                operation,
                attempts: 1,
                status,
                next_retry_at,
                last_error: Some(error.to_string()),
                created_at: now,
                updated_at: now,
            };
            rows.push(row.clone());
            row
        })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u64) -> EmbeddingResult<Vec<FailedOperation>> {
        self.with_rows(|rows| {
            let mut due: Vec<&mut FailedOperation> = rows
                .iter_mut()
                .filter(|r| r.status == OperationStatus::Failed && r.next_retry_at <= now)
                .collect();
            due.sort_by_key(|r| r.next_retry_at);

            due.into_iter()
                .take(limit as usize)
                .map(|r| {
                    r.status = OperationStatus::Retrying;
                    r.updated_at = now;
                    r.clone()
                })
                .collect()
        })
    }

    async fn save_attempt(
        &self,
        id: Uuid,
        update: AttemptUpdate,
        now: DateTime<Utc>,
    ) -> EmbeddingResult<FailedOperation> {
        self.with_rows(|rows| {
            let row = rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(EmbeddingError::NotFound(id))?;
            row.attempts = update.attempts;
            row.status = update.status;
            row.next_retry_at = update.next_retry_at;
            if update.last_error.is_some() {
                row.last_error = update.last_error;
            }
            row.updated_at = now;
            Ok(row.clone())
        })?
    }

    async fn get(&self, id: Uuid) -> EmbeddingResult<Option<FailedOperation>> {
        self.with_rows(|rows| rows.iter().find(|r| r.id == id).cloned())
    }

    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: u64,
    ) -> EmbeddingResult<Vec<FailedOperation>> {
        self.with_rows(|rows| {
            let mut matching: Vec<FailedOperation> = rows
                .iter()
                .filter(|r| status.is_none_or(|s| r.status == s))
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            matching.truncate(limit as usize);
            matching
        })
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> EmbeddingResult<FailedOperation> {
        self.with_rows(|rows| {
            let row = rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(EmbeddingError::NotFound(id))?;
            if row.status == OperationStatus::Resolved {
                return Err(EmbeddingError::Validation(format!(
                    "operation {} is already resolved",
                    id
                )));
            }
            row.status = OperationStatus::Failed;
            row.next_retry_at = now;
            row.updated_at = now;
            Ok(row.clone())
        })?
    }
}
