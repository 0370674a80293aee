use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FailedOperations::Table)
                    .if_not_exists()
                    .col(pk_uuid(FailedOperations::Id))
                    .col(uuid(FailedOperations::TargetId))
                    // create | update | delete
                    .col(string(FailedOperations::Operation))
                    .col(integer(FailedOperations::Attempts).default(0))
                    // failed | retrying | resolved | abandoned
                    .col(string(FailedOperations::Status).default("failed"))
                    .col(timestamp_with_time_zone(FailedOperations::NextRetryAt))
                    .col(text_null(FailedOperations::LastError))
                    .col(
                        timestamp_with_time_zone(FailedOperations::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(FailedOperations::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Coordinator scan: status = 'failed' AND next_retry_at <= now()
        manager
            .create_index(
                Index::create()
                    .name("idx_failed_operations_status_next_retry")
                    .table(FailedOperations::Table)
                    .col(FailedOperations::Status)
                    .col(FailedOperations::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_failed_operations_target_id")
                    .table(FailedOperations::Table)
                    .col(FailedOperations::TargetId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FailedOperations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FailedOperations {
    Table,
    Id,
    TargetId,
    Operation,
    Attempts,
    Status,
    NextRetryAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
