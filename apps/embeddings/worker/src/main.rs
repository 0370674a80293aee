//! Embeddings Worker - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    embeddings_worker::run().await
}
