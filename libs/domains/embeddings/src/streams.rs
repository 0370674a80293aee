//! Stream definitions for the embedding pipeline.

use stream_worker::StreamDef;

/// Interaction events feeding user interest vectors.
pub struct InteractionStream;

impl StreamDef for InteractionStream {
    const STREAM_NAME: &'static str = "embeddings:updates";
    const CONSUMER_GROUP: &'static str = "embedding_workers";
    const DLQ_STREAM: &'static str = "embeddings:updates:dlq";
    const BATCH_SIZE: usize = 20;
}

/// Catalog create/update/delete notifications feeding entity vectors.
///
/// Failed syncs are handed to the failed-operation registry, so entries
/// only need a couple of deliveries to cover broker hiccups.
pub struct CatalogStream;

impl StreamDef for CatalogStream {
    const STREAM_NAME: &'static str = "embeddings:catalog";
    const CONSUMER_GROUP: &'static str = "catalog_sync_workers";
    const DLQ_STREAM: &'static str = "embeddings:catalog:dlq";
    const MAX_DELIVERIES: u32 = 3;
}
