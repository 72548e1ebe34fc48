use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{document::Document, project::Project},
    },
    utils::files::file_stem,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::RagClient;
use crate::poller::{spawn_parse_poller, POLL_INTERVAL};

/// Hand-off seam for re-processing documents without a crate cycle: the
/// document processor implements this and rebuild pushes work through it.
/// Enqueued documents have already been reset to `processing` by the caller.
#[async_trait]
pub trait ProcessingQueue: Send + Sync {
    async fn enqueue(&self, document_id: String);
}

/// Per-project knowledge-base lifecycle: dataset creation, artifact upload,
/// parse triggering and the poller hand-off, cascade deletion, rebuild.
pub struct KnowledgeBaseService {
    db: Arc<SurrealDbClient>,
    client: RagClient,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl KnowledgeBaseService {
    pub fn new(db: Arc<SurrealDbClient>, client: RagClient, shutdown: CancellationToken) -> Self {
        Self {
            db,
            client,
            shutdown,
            poll_interval: POLL_INTERVAL,
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn client(&self) -> &RagClient {
        &self.client
    }

    /// Returns the project's dataset id, creating the remote dataset on first
    /// use. Idempotent, including under concurrent callers: the binding is a
    /// conditional update and the loser deletes its freshly created dataset
    /// and adopts the winner's.
    pub async fn ensure_dataset_for_project(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<String, AppError> {
        let project = Project::get_by_id(project_id, &self.db).await?;
        if let Some(dataset_id) = project.dataset_id {
            return Ok(dataset_id);
        }

        let knowledge_base_name = format!("{user_id}_{}_{}", project.name, Uuid::new_v4());
        let dataset_id = self
            .client
            .create_dataset(
                &knowledge_base_name,
                &format!("Knowledge base {knowledge_base_name}"),
            )
            .await?;

        match Project::bind_knowledge_base(project_id, &dataset_id, &knowledge_base_name, &self.db)
            .await?
        {
            Some(_) => {
                info!(%project_id, %dataset_id, "Created knowledge base for project");
                Ok(dataset_id)
            }
            None => {
                // Lost the race: another caller bound a dataset first. Remove
                // the orphan we created and return the winner's id.
                if let Err(err) = self.client.delete_dataset(&dataset_id).await {
                    warn!(%dataset_id, error = %err, "Failed to delete orphaned dataset");
                }

                let project = Project::get_by_id(project_id, &self.db).await?;
                project.dataset_id.ok_or_else(|| {
                    AppError::Internal("dataset binding disappeared during ensure".to_string())
                })
            }
        }
    }

    /// Uploads the processed artifact into the project's dataset, triggers the
    /// remote parse and launches the completion poller. Returns `true` once
    /// the poller is running; upstream failures flip the document to its
    /// terminal failure state and return `false`.
    pub async fn upload_document(
        &self,
        project_id: &str,
        document_id: &str,
    ) -> Result<bool, AppError> {
        let document = Document::get_by_id(document_id, &self.db).await?;
        let project = Project::get_by_id(project_id, &self.db).await?;

        let Some(dataset_id) = project.dataset_id else {
            return Err(AppError::Validation(
                "project has no knowledge-base dataset".to_string(),
            ));
        };
        let Some(processed_file_path) = document.processed_file_path.clone() else {
            return Err(AppError::Validation(
                "document has no processed artifact".to_string(),
            ));
        };

        let markdown = tokio::fs::read(&processed_file_path).await.map_err(|err| {
            AppError::Validation(format!(
                "processed artifact unreadable at {processed_file_path}: {err}"
            ))
        })?;

        if Document::begin_kb_upload(document_id, &self.db)
            .await?
            .is_none()
        {
            info!(%document_id, "Document not awaiting KB upload; skipping");
            return Ok(false);
        }
        Document::set_progress(document_id, 60, &self.db).await?;

        let upload_name = format!("{}.md", file_stem(&document.name));
        let rag_document_id = match self
            .client
            .upload_document(&dataset_id, &upload_name, markdown)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(%document_id, error = %err, "Knowledge-base upload failed");
                Document::mark_failed(
                    document_id,
                    &format!("knowledge base upload failed: {err}"),
                    &self.db,
                )
                .await?;
                return Ok(false);
            }
        };

        if Document::mark_parsing(document_id, &rag_document_id, &self.db)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        Document::set_progress(document_id, 80, &self.db).await?;

        if let Err(err) = self
            .client
            .trigger_parse(&dataset_id, std::slice::from_ref(&rag_document_id))
            .await
        {
            warn!(%document_id, error = %err, "Failed to trigger knowledge-base parse");
            Document::fail_parse(
                document_id,
                &format!("failed to trigger knowledge-base parse: {err}"),
                &self.db,
            )
            .await?;
            return Ok(false);
        }

        let _poller = spawn_parse_poller(
            Arc::clone(&self.db),
            self.client.clone(),
            dataset_id,
            rag_document_id,
            document_id.to_string(),
            self.shutdown.child_token(),
            self.poll_interval,
        );

        Ok(true)
    }

    /// Removes the remote registration of one document. Safe when the project
    /// has no dataset or the document never reached the KB.
    pub async fn delete_document_from_dataset(
        &self,
        project_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        let project = Project::get_by_id(project_id, &self.db).await?;
        let Some(dataset_id) = project.dataset_id else {
            return Ok(());
        };

        let document = Document::get_by_id(document_id, &self.db).await?;
        let Some(rag_document_id) = document.rag_document_id else {
            return Ok(());
        };

        self.client
            .delete_document(&dataset_id, &rag_document_id)
            .await?;
        Document::clear_rag_handle(document_id, &self.db).await?;

        Ok(())
    }

    /// Deletes the project's remote dataset. The binding is only cleared when
    /// the upstream delete succeeded, so a failure propagates and the caller
    /// can surface the warning.
    pub async fn delete_dataset(&self, project_id: &str) -> Result<(), AppError> {
        let project = Project::get_by_id(project_id, &self.db).await?;
        let Some(dataset_id) = project.dataset_id else {
            return Ok(());
        };

        self.client.delete_dataset(&dataset_id).await?;
        Project::clear_knowledge_base(project_id, &self.db).await?;
        info!(%project_id, %dataset_id, "Deleted knowledge base for project");

        Ok(())
    }

    /// Tears the project's knowledge base down and rebuilds it from scratch:
    /// delete dataset, reset every document (artifact file and columns),
    /// create a fresh dataset, re-enqueue every document.
    pub async fn rebuild_for_project(
        &self,
        project_id: &str,
        user_id: &str,
        queue: &dyn ProcessingQueue,
    ) -> Result<(), AppError> {
        info!(%project_id, "Rebuilding knowledge base");

        self.delete_dataset(project_id).await?;

        let documents = Document::list_by_project(project_id, &self.db).await?;
        for document in &documents {
            if let Some(previous) = Document::reset_for_rebuild(&document.id, &self.db).await? {
                if let Some(stale) = previous.processed_file_path {
                    if let Err(err) = tokio::fs::remove_file(&stale).await {
                        warn!(document_id = %document.id, error = %err, "Failed to remove stale artifact");
                    }
                }
            }
        }

        self.ensure_dataset_for_project(project_id, user_id).await?;

        for document in documents {
            queue.enqueue(document.id).await;
        }

        Ok(())
    }
}
