//! `cargo run -p migration -- up` creates the embedding and failed-operation tables.

use migration::Migrator;
use sea_orm_migration::cli;

#[tokio::main]
async fn main() {
    cli::run_cli(Migrator).await;
}
