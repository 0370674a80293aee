use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EntityEmbeddings::Table)
                    .if_not_exists()
                    .col(pk_uuid(EntityEmbeddings::OwnerId))
                    // Full scans return rows in insertion order
                    .col(
                        ColumnDef::new(EntityEmbeddings::Seq)
                            .big_integer()
                            .not_null()
                            .auto_increment(),
                    )
                    .col(json_binary(EntityEmbeddings::Vector))
                    .col(integer(EntityEmbeddings::Dimension))
                    .col(big_integer(EntityEmbeddings::Version).default(1))
                    .col(
                        timestamp_with_time_zone(EntityEmbeddings::LastUpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(EntityEmbeddings::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_entity_embeddings_seq")
                    .table(EntityEmbeddings::Table)
                    .col(EntityEmbeddings::Seq)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EntityEmbeddings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EntityEmbeddings {
    Table,
    OwnerId,
    Seq,
    Vector,
    Dimension,
    Version,
    LastUpdatedAt,
    CreatedAt,
}
