use super::{VectorStore, check_next_version};
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{EmbeddingVector, PutResult, Space};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement, Value};
use std::collections::HashMap;
use uuid::Uuid;

const COLUMNS: &str = "owner_id, vector, version, last_updated_at, created_at";

/// Vectors in `user_embeddings` / `entity_embeddings`, stored as jsonb arrays.
#[derive(Clone)]
pub struct PgVectorStore {
    db: DatabaseConnection,
}

impl PgVectorStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn fetch_one(&self, stmt: Statement) -> EmbeddingResult<Option<EmbeddingVector>> {
        VectorRow::find_by_statement(stmt)
            .one(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
            .map(EmbeddingVector::try_from)
            .transpose()
    }

    async fn fetch_all(&self, stmt: Statement) -> EmbeddingResult<Vec<EmbeddingVector>> {
        VectorRow::find_by_statement(stmt)
            .all(&self.db)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?
            .into_iter()
            .map(EmbeddingVector::try_from)
            .collect()
    }

    async fn current_version(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<Option<i64>> {
        Ok(self.get(space, owner_id).await?.map(|v| v.version))
    }
}

#[derive(Debug, FromQueryResult)]
struct VectorRow {
    owner_id: Uuid,
    vector: serde_json::Value,
    version: i64,
    last_updated_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<VectorRow> for EmbeddingVector {
    type Error = EmbeddingError;

    fn try_from(row: VectorRow) -> Result<Self, Self::Error> {
        let vector: Vec<f32> = serde_json::from_value(row.vector).map_err(|e| {
            EmbeddingError::Internal(format!("corrupt vector for {}: {}", row.owner_id, e))
        })?;
        Ok(Self {
            owner_id: row.owner_id,
            vector,
            version: row.version,
            last_updated_at: row.last_updated_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn get(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<Option<EmbeddingVector>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE owner_id = $1",
            COLUMNS,
            space.table_name()
        );
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [owner_id.into()]);
        self.fetch_one(stmt).await
    }

    async fn put(
        &self,
        space: Space,
        vector: EmbeddingVector,
        expected_version: Option<i64>,
    ) -> EmbeddingResult<PutResult> {
        check_next_version(&vector, expected_version)?;

        let values = serde_json::to_value(&vector.vector)?;
        let dimension = vector.vector.len() as i32;

        let stmt = match expected_version {
            None => Statement::from_sql_and_values(
                DbBackend::Postgres,
                format!(
                    r#"
                    INSERT INTO {} (owner_id, vector, dimension, version, last_updated_at, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (owner_id) DO NOTHING
                    RETURNING {}
                    "#,
                    space.table_name(),
                    COLUMNS
                ),
                [
                    vector.owner_id.into(),
                    values.into(),
                    dimension.into(),
                    vector.version.into(),
                    vector.last_updated_at.into(),
                    vector.created_at.into(),
                ],
            ),
            Some(expected) => Statement::from_sql_and_values(
                DbBackend::Postgres,
                format!(
                    r#"
                    UPDATE {}
                    SET vector = $2, dimension = $3, version = $4, last_updated_at = $5
                    WHERE owner_id = $1 AND version = $6
                    RETURNING {}
                    "#,
                    space.table_name(),
                    COLUMNS
                ),
                [
                    vector.owner_id.into(),
                    values.into(),
                    dimension.into(),
                    vector.version.into(),
                    vector.last_updated_at.into(),
                    expected.into(),
                ],
            ),
        };

        match self.fetch_one(stmt).await? {
            Some(stored) => {
                tracing::debug!(
                    space = %space,
                    owner_id = %stored.owner_id,
                    version = stored.version,
                    "Stored vector"
                );
                Ok(PutResult::Stored(stored))
            }
            None => Ok(PutResult::Conflict {
                current_version: self.current_version(space, vector.owner_id).await?,
            }),
        }
    }

    async fn batch_get(
        &self,
        space: Space,
        owner_ids: &[Uuid],
    ) -> EmbeddingResult<HashMap<Uuid, EmbeddingVector>> {
        if owner_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = (1..=owner_ids.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE owner_id IN ({})",
            COLUMNS,
            space.table_name(),
            placeholders
        );
        let values: Vec<Value> = owner_ids.iter().map(|id| (*id).into()).collect();
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);

        Ok(self
            .fetch_all(stmt)
            .await?
            .into_iter()
            .map(|v| (v.owner_id, v))
            .collect())
    }

    async fn delete(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!("DELETE FROM {} WHERE owner_id = $1", space.table_name()),
            [owner_id.into()],
        );
        let result = self
            .db
            .execute_raw(stmt)
            .await
            .map_err(|e| EmbeddingError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn scan(&self, space: Space) -> EmbeddingResult<Vec<EmbeddingVector>> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            format!("SELECT {} FROM {} ORDER BY seq", COLUMNS, space.table_name()),
        );
        self.fetch_all(stmt).await
    }
}
