use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserEmbeddings::Table)
                    .if_not_exists()
                    .col(pk_uuid(UserEmbeddings::OwnerId))
                    .col(
                        ColumnDef::new(UserEmbeddings::Seq)
                            .big_integer()
                            .not_null()
                            .auto_increment(),
                    )
                    .col(json_binary(UserEmbeddings::Vector))
                    .col(integer(UserEmbeddings::Dimension))
                    .col(big_integer(UserEmbeddings::Version).default(1))
                    .col(
                        timestamp_with_time_zone(UserEmbeddings::LastUpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(UserEmbeddings::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_embeddings_last_updated_at")
                    .table(UserEmbeddings::Table)
                    .col(UserEmbeddings::LastUpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserEmbeddings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserEmbeddings {
    Table,
    OwnerId,
    Seq,
    Vector,
    Dimension,
    Version,
    LastUpdatedAt,
    CreatedAt,
}
