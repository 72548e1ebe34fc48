use std::sync::Arc;

use common::{
    storage::{
        db::SurrealDbClient,
        types::document::{Document, DocumentStatus},
    },
    utils::config::get_config,
};
use ingestion_pipeline::DocumentProcessor;
use knowledge_base::{poller, KnowledgeBaseService, RagClient};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let shutdown = CancellationToken::new();

    let rag_client = RagClient::new(&config.rag_api_base_url, &config.rag_api_key)?;
    let kb = Arc::new(KnowledgeBaseService::new(
        Arc::clone(&db),
        rag_client.clone(),
        shutdown.clone(),
    ));
    let processor = DocumentProcessor::new(Arc::clone(&db), &config, kb, shutdown.clone())?;

    // Re-attach pollers for parses that were in flight when the previous
    // process stopped.
    let resumed = poller::resume_pollers(&db, &rag_client, &shutdown, poller::POLL_INTERVAL).await?;
    info!(resumed, "Resumed knowledge-base parse pollers");

    // Documents that were ingested but never driven restart from the top.
    let stalled = Document::list_with_status(DocumentStatus::Uploading, &db).await?;
    info!(count = stalled.len(), "Re-enqueueing unprocessed documents");
    for document in stalled {
        processor.spawn_process(document.id);
    }

    info!("Worker started");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; stopping pollers and new phase starts");
    shutdown.cancel();

    Ok(())
}
