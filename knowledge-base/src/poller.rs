use std::sync::Arc;
use std::time::Duration;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{document::Document, project::Project},
    },
};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{RagClient, RagDocument};

/// Fixed cadence of the parse-completion poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Remote run states the KB reports for a failed parse.
const FAILED_RUN_STATES: [&str; 3] = ["FAILED", "ERROR", "CANCELLED"];

#[derive(Debug, Clone, PartialEq)]
enum ParseVerdict {
    Completed,
    Failed(String),
    Pending,
}

/// Decides what a single poll observation means for the document. A missing
/// handle keeps the poll alive: the KB list is eventually consistent right
/// after an upload.
fn evaluate_remote_status(docs: &[RagDocument], rag_document_id: &str) -> ParseVerdict {
    let Some(doc) = docs.iter().find(|doc| doc.id == rag_document_id) else {
        return ParseVerdict::Pending;
    };

    if doc.progress >= 1.0 && doc.run == "DONE" {
        return ParseVerdict::Completed;
    }

    if FAILED_RUN_STATES.contains(&doc.run.as_str()) {
        return ParseVerdict::Failed(format!(
            "knowledge base parse failed (run state {})",
            doc.run
        ));
    }

    ParseVerdict::Pending
}

/// Spawns the polling task for one document in `parsing_kb`. The task exits
/// on a terminal verdict, when the document row has moved on without it, or
/// when the shutdown token fires (leaving state as-is for the restart path).
pub fn spawn_parse_poller(
    db: Arc<SurrealDbClient>,
    client: RagClient,
    dataset_id: String,
    rag_document_id: String,
    document_id: String,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(%document_id, "Parse poller shutting down");
                    break;
                }
                _ = sleep(interval) => {}
            }

            let docs = match client.list_documents(&dataset_id).await {
                Ok(docs) => docs,
                Err(err) => {
                    // Transient transport problems never fail the document.
                    warn!(%document_id, error = %err, "Parse status poll failed; will retry");
                    continue;
                }
            };

            match evaluate_remote_status(&docs, &rag_document_id) {
                ParseVerdict::Pending => {}
                ParseVerdict::Completed => {
                    match Document::complete_parse(&document_id, &db).await {
                        Ok(Some(_)) => info!(%document_id, "Knowledge-base parse completed"),
                        Ok(None) => {
                            info!(%document_id, "Document left parsing state; poller exiting")
                        }
                        Err(err) => {
                            warn!(%document_id, error = %err, "Failed to record parse completion")
                        }
                    }
                    break;
                }
                ParseVerdict::Failed(message) => {
                    match Document::fail_parse(&document_id, &message, &db).await {
                        Ok(Some(_)) => warn!(%document_id, %message, "Knowledge-base parse failed"),
                        Ok(None) => {
                            info!(%document_id, "Document left parsing state; poller exiting")
                        }
                        Err(err) => {
                            warn!(%document_id, error = %err, "Failed to record parse failure")
                        }
                    }
                    break;
                }
            }
        }
    })
}

/// Re-spawns pollers for every document still in `parsing_kb`. This is the
/// restart recovery path: the state machine intentionally leaves in-flight
/// parses where they were.
pub async fn resume_pollers(
    db: &Arc<SurrealDbClient>,
    client: &RagClient,
    shutdown: &CancellationToken,
    interval: Duration,
) -> Result<usize, AppError> {
    let parsing = Document::list_parsing(db).await?;
    let mut resumed = 0;

    for document in parsing {
        let Some(rag_document_id) = document.rag_document_id.clone() else {
            warn!(document_id = %document.id, "Parsing document has no KB handle; skipping");
            continue;
        };

        let project = match Project::get_by_id(&document.project_id, db).await {
            Ok(project) => project,
            Err(err) => {
                warn!(document_id = %document.id, error = %err, "Cannot resume poller");
                continue;
            }
        };

        let Some(dataset_id) = project.dataset_id.clone() else {
            warn!(document_id = %document.id, "Project has no dataset; skipping poller");
            continue;
        };

        let _poller = spawn_parse_poller(
            Arc::clone(db),
            client.clone(),
            dataset_id,
            rag_document_id,
            document.id.clone(),
            shutdown.clone(),
            interval,
        );
        resumed += 1;
    }

    Ok(resumed)
}
