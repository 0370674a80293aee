pub use sea_orm_migration::prelude::*;

mod m20260301_000000_create_user_embeddings;
mod m20260301_000001_create_entity_embeddings;
mod m20260301_000002_create_failed_operations;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000000_create_user_embeddings::Migration),
            Box::new(m20260301_000001_create_entity_embeddings::Migration),
            Box::new(m20260301_000002_create_failed_operations::Migration),
        ]
    }
}
