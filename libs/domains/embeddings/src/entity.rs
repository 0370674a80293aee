use crate::models::{FailedOperation, OperationKind, OperationStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Sea-ORM Entity for the failed_operations table
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "failed_operations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub target_id: Uuid,
    pub operation: OperationKind,
    pub attempts: i32,
    pub status: OperationStatus,
    pub next_retry_at: DateTimeWithTimeZone,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for FailedOperation {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            target_id: model.target_id,
            operation: model.operation,
            attempts: model.attempts,
            status: model.status,
            next_retry_at: model.next_retry_at.into(),
            last_error: model.last_error,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
        }
    }
}
