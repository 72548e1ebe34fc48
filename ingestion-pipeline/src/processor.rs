use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            document::{
                Document, DocumentKind, DocumentLabel, DocumentStatus, ALLOWED_EXTENSIONS,
            },
            project::Project,
        },
    },
    utils::{
        config::AppConfig,
        files::{
            artifact_file_name, file_extension, file_stem, guess_mime_type, stored_file_name,
            StoragePaths,
        },
    },
};
use knowledge_base::{KnowledgeBaseService, ProcessingQueue};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::convert::ConversionDispatcher;

/// Fixed rejection shown for Word uploads.
pub const UNSUPPORTED_WORD_FORMAT_MESSAGE: &str = "unsupported format; please upload as PDF";

/// Artifact text plus the name shown alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPreview {
    pub markdown: String,
    pub display_name: String,
}

/// Progress projection for the polling surface.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProcessingProgress {
    pub status: DocumentStatus,
    pub progress: u8,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Owns the per-document state machine: ingestion, the conversion drive, the
/// knowledge-base hand-off, retry, deletion, and preview. Cloning is cheap
/// and clones share the worker pool.
#[derive(Clone)]
pub struct DocumentProcessor {
    db: Arc<SurrealDbClient>,
    paths: StoragePaths,
    dispatcher: ConversionDispatcher,
    kb: Arc<KnowledgeBaseService>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl DocumentProcessor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: &AppConfig,
        kb: Arc<KnowledgeBaseService>,
        shutdown: CancellationToken,
    ) -> Result<Self, AppError> {
        Ok(Self {
            db,
            paths: StoragePaths::new(config.data_dir.clone()),
            dispatcher: ConversionDispatcher::new(config)?,
            kb,
            workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            shutdown,
        })
    }

    /// Validates and stores an upload, creating the document row in
    /// `uploading`. Nothing is written for rejected uploads.
    pub async fn ingest(
        &self,
        project_id: &str,
        raw_bytes: &[u8],
        original_name: &str,
        label: Option<DocumentLabel>,
        upload_by: &str,
    ) -> Result<String, AppError> {
        let Some(extension) = file_extension(original_name) else {
            return Err(AppError::Validation(format!(
                "unsupported file type: {original_name}"
            )));
        };

        if matches!(extension.as_str(), "doc" | "docx") {
            return Err(AppError::Validation(
                UNSUPPORTED_WORD_FORMAT_MESSAGE.to_string(),
            ));
        }

        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(AppError::Validation(format!(
                "unsupported file type: .{extension}"
            )));
        }

        let kind = DocumentKind::from_extension(&extension).ok_or_else(|| {
            AppError::Validation(format!("unsupported file type: .{extension}"))
        })?;

        let project = Project::get_by_id(project_id, &self.db).await?;

        let stored_name = stored_file_name(original_name);
        let uploads_dir = self.paths.uploads_dir(&project.folder_uuid);
        tokio::fs::create_dir_all(&uploads_dir).await?;
        let raw_path = uploads_dir.join(&stored_name);
        tokio::fs::write(&raw_path, raw_bytes).await?;

        let display_name = match label {
            Some(label) => label.apply_prefix(original_name),
            None => original_name.to_string(),
        };

        let document = Document::new(
            project.id.clone(),
            display_name,
            original_name.to_string(),
            raw_path.to_string_lossy().into_owned(),
            kind,
            raw_bytes.len() as u64,
            guess_mime_type(Path::new(original_name)),
            label,
            upload_by.to_string(),
        );
        let document_id = document.id.clone();
        self.db.save(document).await?;

        info!(%document_id, %original_name, "Ingested document");
        Ok(document_id)
    }

    /// Fire-and-forget entry point: runs `process` on the worker pool.
    pub fn spawn_process(&self, document_id: String) {
        let processor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = processor.process(&document_id).await {
                error!(%document_id, error = %err, "Document processing failed");
            }
        });
    }

    /// The state-machine driver. Claims the document with a conditional
    /// status update, so a concurrent invocation for the same document is a
    /// no-op; failed documents are reset exactly like a retry.
    pub async fn process(&self, document_id: &str) -> Result<(), AppError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| AppError::Internal("worker pool closed".to_string()))?;

        if self.shutdown.is_cancelled() {
            info!(%document_id, "Shutdown in progress; not starting processing");
            return Ok(());
        }

        let document = Document::get_by_id(document_id, &self.db).await?;
        let claimed = match document.status {
            DocumentStatus::Uploading => {
                Document::claim_for_processing(document_id, &self.db).await?
            }
            DocumentStatus::Failed | DocumentStatus::KbParseFailed => {
                match Document::reset_for_retry(document_id, &self.db).await? {
                    Some(previous) => {
                        self.remove_stale_artifact(&previous).await;
                        Some(Document::get_by_id(document_id, &self.db).await?)
                    }
                    None => None,
                }
            }
            _ => None,
        };

        let Some(document) = claimed else {
            info!(%document_id, status = ?document.status, "Document not claimable; skipping");
            return Ok(());
        };

        self.drive(document).await
    }

    /// Re-enters the machine from a terminal failure state: clears the error
    /// fields and stale artifact, then drives processing again.
    pub async fn retry(&self, document_id: &str) -> Result<(), AppError> {
        let previous = Document::reset_for_retry(document_id, &self.db)
            .await?
            .ok_or_else(|| {
                AppError::Validation(
                    "only documents in a failed state can be retried".to_string(),
                )
            })?;

        self.remove_stale_artifact(&previous).await;
        info!(%document_id, "Retrying document processing");
        self.spawn_claimed(document_id.to_string());

        Ok(())
    }

    /// Removes the KB registration, the artifact, the raw file, and the row,
    /// in that order. Partial failures are warnings; the row always goes.
    pub async fn delete(&self, document_id: &str) -> Result<(), AppError> {
        let document = Document::get_by_id(document_id, &self.db).await?;

        if let Err(err) = self
            .kb
            .delete_document_from_dataset(&document.project_id, &document.id)
            .await
        {
            warn!(%document_id, error = %err, "Failed to remove KB registration");
        }

        if let Some(artifact) = &document.processed_file_path {
            if let Err(err) = tokio::fs::remove_file(artifact).await {
                warn!(%document_id, error = %err, "Failed to remove processed artifact");
            }
        }

        if let Err(err) = tokio::fs::remove_file(&document.file_path).await {
            warn!(%document_id, error = %err, "Failed to remove raw file");
        }

        self.db.remove::<Document>(&document.id).await?;
        info!(%document_id, "Deleted document");

        Ok(())
    }

    /// Reads the processed artifact, trying UTF-8, then GBK, then Latin-1.
    pub async fn preview(&self, document_id: &str) -> Result<DocumentPreview, AppError> {
        let document = Document::get_by_id(document_id, &self.db).await?;

        let Some(artifact_path) = &document.processed_file_path else {
            return Err(AppError::NotFound(
                "processed artifact not available yet".to_string(),
            ));
        };

        let bytes = tokio::fs::read(artifact_path).await.map_err(|_| {
            AppError::NotFound("processed artifact missing from disk".to_string())
        })?;

        Ok(DocumentPreview {
            markdown: decode_artifact_text(&bytes),
            display_name: display_name_with_extension(&document),
        })
    }

    pub async fn processing_progress(
        &self,
        document_id: &str,
    ) -> Result<ProcessingProgress, AppError> {
        let document = Document::get_by_id(document_id, &self.db).await?;
        Ok(ProcessingProgress {
            status: document.status,
            progress: document.progress,
            processing_started_at: document.processing_started_at,
            processed_at: document.processed_at,
            error_message: document.error_message,
        })
    }

    /// Removes both of the project's file trees, aggregating warnings for the
    /// project-deletion surface.
    pub async fn delete_project_files(&self, project: &Project) -> Vec<String> {
        let mut warnings = Vec::new();

        for dir in [
            self.paths.uploads_dir(&project.folder_uuid),
            self.paths.processed_dir(&project.folder_uuid),
        ] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warnings.push(format!("failed to remove {}: {err}", dir.display())),
            }
        }

        warnings
    }

    /// Spawns the drive for a document already reset to `processing` (retry
    /// and rebuild paths own the claim before enqueueing).
    fn spawn_claimed(&self, document_id: String) {
        let processor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = processor.run_claimed(&document_id).await {
                error!(%document_id, error = %err, "Document processing failed");
            }
        });
    }

    async fn run_claimed(&self, document_id: &str) -> Result<(), AppError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| AppError::Internal("worker pool closed".to_string()))?;

        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let document = Document::get_by_id(document_id, &self.db).await?;
        if document.status != DocumentStatus::Processing {
            info!(%document_id, status = ?document.status, "Document no longer claimed; skipping");
            return Ok(());
        }

        self.drive(document).await
    }

    /// Conversion phase plus knowledge-base hand-off for a claimed document.
    async fn drive(&self, document: Document) -> Result<(), AppError> {
        let document_id = document.id.clone();
        let is_markdown = document.kind == DocumentKind::Markdown;

        let project = match Project::get_by_id(&document.project_id, &self.db).await {
            Ok(project) => project,
            Err(err) => {
                Document::mark_failed(&document_id, &err.to_string(), &self.db).await?;
                return Ok(());
            }
        };

        let raw_path = Path::new(&document.file_path).to_path_buf();
        if tokio::fs::metadata(&raw_path).await.is_err() {
            Document::mark_failed(&document_id, "source file missing", &self.db).await?;
            return Ok(());
        }

        let processed_dir = self.paths.processed_dir(&project.folder_uuid);
        if let Err(err) = tokio::fs::create_dir_all(&processed_dir).await {
            Document::mark_failed(
                &document_id,
                &format!("failed to prepare processed directory: {err}"),
                &self.db,
            )
            .await?;
            return Ok(());
        }

        let stored_raw_name = raw_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("document")
            .to_string();
        let artifact_path = processed_dir.join(artifact_file_name(&stored_raw_name));

        if !is_markdown {
            Document::set_progress(&document_id, 20, &self.db).await?;
        }
        Document::set_progress(&document_id, 30, &self.db).await?;

        if self.shutdown.is_cancelled() {
            info!(%document_id, "Shutdown in progress; leaving document mid-flight");
            return Ok(());
        }

        // The vision path heads scanned output with the user-visible stem.
        let heading_stem = file_stem(&document.original_filename).to_string();
        let artifact_bytes = match self
            .dispatcher
            .convert(document.kind, &raw_path, &heading_stem)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%document_id, error = %err, "Conversion failed");
                Document::mark_failed(&document_id, &err.to_string(), &self.db).await?;
                return Ok(());
            }
        };

        if !is_markdown {
            Document::set_progress(&document_id, 40, &self.db).await?;
        }

        if let Err(err) = tokio::fs::write(&artifact_path, &artifact_bytes).await {
            Document::mark_failed(
                &document_id,
                &format!("failed to write artifact: {err}"),
                &self.db,
            )
            .await?;
            return Ok(());
        }

        let artifact_path_str = artifact_path.to_string_lossy().into_owned();
        if Document::record_artifact(&document_id, &artifact_path_str, &self.db)
            .await?
            .is_none()
        {
            warn!(%document_id, "Document state moved during conversion; dropping result");
            return Ok(());
        }
        Document::set_progress(&document_id, if is_markdown { 70 } else { 50 }, &self.db).await?;
        info!(%document_id, artifact = %artifact_path_str, "Conversion finished");

        if self.shutdown.is_cancelled() {
            info!(%document_id, "Shutdown in progress; skipping KB hand-off");
            return Ok(());
        }

        // Knowledge-base hand-off: lazily provision the dataset, then upload.
        if let Err(err) = self
            .kb
            .ensure_dataset_for_project(&document.project_id, &document.upload_by)
            .await
        {
            warn!(%document_id, error = %err, "Knowledge-base provisioning failed");
            Document::mark_failed(
                &document_id,
                &format!("knowledge base provisioning failed: {err}"),
                &self.db,
            )
            .await?;
            return Ok(());
        }

        match self
            .kb
            .upload_document(&document.project_id, &document_id)
            .await
        {
            Ok(true) => info!(%document_id, "Knowledge-base parse poller launched"),
            Ok(false) => warn!(%document_id, "Knowledge-base upload did not complete"),
            Err(err) => {
                warn!(%document_id, error = %err, "Knowledge-base upload errored");
                Document::mark_failed(&document_id, &err.to_string(), &self.db).await?;
            }
        }

        Ok(())
    }

    async fn remove_stale_artifact(&self, previous: &Document) {
        if let Some(stale) = &previous.processed_file_path {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(document_id = %previous.id, error = %err, "Failed to remove stale artifact")
                }
            }
        }
    }
}

#[async_trait]
impl ProcessingQueue for DocumentProcessor {
    async fn enqueue(&self, document_id: String) {
        self.spawn_claimed(document_id);
    }
}

fn decode_artifact_text(bytes: &[u8]) -> String {
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => text,
        Err(_) => {
            let (decoded, _, had_errors) = encoding_rs::GBK.decode(bytes);
            if had_errors {
                // Latin-1 is total over bytes, so this never fails.
                bytes.iter().map(|&b| b as char).collect()
            } else {
                decoded.into_owned()
            }
        }
    }
}

fn display_name_with_extension(document: &Document) -> String {
    if Path::new(&document.name).extension().is_some() {
        document.name.clone()
    } else {
        format!("{}.{}", document.name, document.kind.default_extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use knowledge_base::RagClient;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestHarness {
        db: Arc<SurrealDbClient>,
        processor: DocumentProcessor,
        project: Project,
        _data_dir: tempfile::TempDir,
        data_root: std::path::PathBuf,
    }

    /// Builds a processor whose conversion and KB endpoints both point at the
    /// given mock server.
    async fn harness(server: &MockServer) -> TestHarness {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );

        let data_dir = tempfile::tempdir().expect("tempdir");
        let data_root = data_dir.path().to_path_buf();
        let config = AppConfig {
            data_dir: data_root.to_string_lossy().into_owned(),
            conversion_api_url: server.uri(),
            rag_api_base_url: server.uri(),
            rag_api_key: "test-key".into(),
            worker_pool_size: 2,
            ..AppConfig::default()
        };

        let rag_client = RagClient::new(&config.rag_api_base_url, &config.rag_api_key)
            .expect("rag client");
        let kb = Arc::new(
            KnowledgeBaseService::new(Arc::clone(&db), rag_client, CancellationToken::new())
                .with_poll_interval(Duration::from_millis(20)),
        );
        let processor =
            DocumentProcessor::new(Arc::clone(&db), &config, kb, CancellationToken::new())
                .expect("processor");

        let project = Project::create("Acme".into(), "user-1".into(), &db)
            .await
            .expect("project");

        TestHarness {
            db,
            processor,
            project,
            _data_dir: data_dir,
            data_root,
        }
    }

    async fn mount_kb_happy_path(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v1/datasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "data": { "id": "ds-1" }
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/datasets/ds-1/documents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "data": [ { "id": "rag-1" } ]
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/datasets/ds-1/chunks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "code": 0 })),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/datasets/ds-1/documents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "docs": [ { "id": "rag-1", "progress": 1.0, "run": "DONE" } ] }
            })))
            .mount(server)
            .await;
    }

    async fn wait_for_status(
        db: &SurrealDbClient,
        document_id: &str,
        expected: DocumentStatus,
    ) -> Document {
        for _ in 0..100 {
            let document = Document::get_by_id(document_id, db).await.expect("get");
            if document.status == expected {
                return document;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("document never reached {expected:?}");
    }

    #[tokio::test]
    async fn test_ingest_writes_raw_file_and_creates_row() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# hello", "notes.md", None, "user-1")
            .await
            .expect("ingest");

        let document = Document::get_by_id(&document_id, &h.db).await.expect("get");
        assert_eq!(document.status, DocumentStatus::Uploading);
        assert_eq!(document.progress, 0);
        assert_eq!(document.kind, DocumentKind::Markdown);
        assert_eq!(document.original_filename, "notes.md");
        assert_eq!(document.name, "notes.md");
        assert_eq!(document.file_size, 7);
        assert_eq!(document.mime_type, "text/markdown");

        let raw_path = Path::new(&document.file_path);
        assert!(raw_path.exists());
        assert!(raw_path.starts_with(
            h.data_root.join("uploads").join(&h.project.folder_uuid)
        ));
        let stored_name = raw_path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(stored_name.ends_with("_notes.md"));
    }

    #[tokio::test]
    async fn test_ingest_same_bytes_twice_yields_distinct_paths() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let first = h
            .processor
            .ingest(&h.project.id, b"same", "report.pdf", None, "user-1")
            .await
            .expect("first ingest");
        let second = h
            .processor
            .ingest(&h.project.id, b"same", "report.pdf", None, "user-1")
            .await
            .expect("second ingest");

        let first = Document::get_by_id(&first, &h.db).await.expect("get");
        let second = Document::get_by_id(&second, &h.db).await.expect("get");
        assert_ne!(first.file_path, second.file_path);
        assert!(Path::new(&first.file_path).exists());
        assert!(Path::new(&second.file_path).exists());
    }

    #[tokio::test]
    async fn test_ingest_rejects_word_documents_with_fixed_message() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let result = h
            .processor
            .ingest(&h.project.id, b"PK", "quarter.docx", None, "user-1")
            .await;

        match result {
            Err(AppError::Validation(message)) => {
                assert_eq!(message, UNSUPPORTED_WORD_FORMAT_MESSAGE);
            }
            other => panic!("Expected validation error, got {other:?}"),
        }

        // Nothing persisted: no rows, no raw tree.
        let documents = Document::list_by_project(&h.project.id, &h.db)
            .await
            .expect("list");
        assert!(documents.is_empty());
        assert!(!h.data_root.join("uploads").exists());
    }

    #[tokio::test]
    async fn test_ingest_rejects_unknown_extension_and_missing_project() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let bad_ext = h
            .processor
            .ingest(&h.project.id, b"bytes", "binary.exe", None, "user-1")
            .await;
        assert!(matches!(bad_ext, Err(AppError::Validation(_))));

        let missing_project = h
            .processor
            .ingest("nope", b"# hi", "notes.md", None, "user-1")
            .await;
        assert!(matches!(missing_project, Err(AppError::NotFound(_))));
        assert!(!h.data_root.join("uploads").exists());
    }

    #[tokio::test]
    async fn test_ingest_label_prefix_applied_once() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let labeled = h
            .processor
            .ingest(
                &h.project.id,
                b"x",
                "report.pdf",
                Some(DocumentLabel::AuditReport),
                "user-1",
            )
            .await
            .expect("ingest");
        let labeled = Document::get_by_id(&labeled, &h.db).await.expect("get");
        assert_eq!(labeled.name, "审计报告_report.pdf");

        // Already-prefixed names are left untouched.
        let prefixed = h
            .processor
            .ingest(
                &h.project.id,
                b"x",
                "审计报告_report.pdf",
                Some(DocumentLabel::AuditReport),
                "user-1",
            )
            .await
            .expect("ingest");
        let prefixed = Document::get_by_id(&prefixed, &h.db).await.expect("get");
        assert_eq!(prefixed.name, "审计报告_report.pdf");
    }

    #[tokio::test]
    async fn test_markdown_shortcut_end_to_end() {
        let server = MockServer::start().await;
        mount_kb_happy_path(&server).await;
        let h = harness(&server).await;

        let contents = "# Notes\n\nsome UTF-8 · content\n".repeat(40);
        let document_id = h
            .processor
            .ingest(&h.project.id, contents.as_bytes(), "notes.md", None, "user-1")
            .await
            .expect("ingest");

        h.processor.process(&document_id).await.expect("process");

        let document = wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;
        assert_eq!(document.progress, 100);
        assert_eq!(document.rag_document_id.as_deref(), Some("rag-1"));
        assert!(document.error_message.is_none());

        // Byte-identical copy under processed/<folder>/<raw-stem>.md.
        let artifact_path = document.processed_file_path.expect("artifact path");
        assert!(Path::new(&artifact_path).starts_with(
            h.data_root.join("processed").join(&h.project.folder_uuid)
        ));
        let artifact = tokio::fs::read(&artifact_path).await.expect("read artifact");
        assert_eq!(artifact, contents.as_bytes());

        let raw_stem = file_stem(
            Path::new(&document.file_path)
                .file_name()
                .and_then(|n| n.to_str())
                .expect("raw name"),
        )
        .to_string();
        let artifact_name = Path::new(&artifact_path)
            .file_name()
            .and_then(|n| n.to_str())
            .expect("artifact name");
        assert_eq!(artifact_name, format!("{raw_stem}.md"));

        // No conversion call was made for the markdown shortcut.
        let conversion_calls = server
            .received_requests()
            .await
            .expect("requests")
            .iter()
            .filter(|request| request.url.path() == "/api/process")
            .count();
        assert_eq!(conversion_calls, 0);
    }

    #[tokio::test]
    async fn test_html_conversion_strips_images_and_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "content": "# Page\n\n![chart](chart.png)\n\nBody text"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_kb_happy_path(&server).await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"<html>x</html>", "page.html", None, "user-1")
            .await
            .expect("ingest");

        h.processor.process(&document_id).await.expect("process");

        let document = wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;
        let artifact = tokio::fs::read_to_string(document.processed_file_path.expect("path"))
            .await
            .expect("read artifact");
        assert!(!artifact.contains("!["));
        assert!(artifact.contains("Body text"));
    }

    #[tokio::test]
    async fn test_concurrent_process_is_noop_for_second_caller() {
        let server = MockServer::start().await;
        mount_kb_happy_path(&server).await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# x", "notes.md", None, "user-1")
            .await
            .expect("ingest");

        let (first, second) = tokio::join!(
            h.processor.process(&document_id),
            h.processor.process(&document_id),
        );
        first.expect("first process");
        second.expect("second process");

        let document = wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;
        assert_eq!(document.progress, 100);
    }

    #[tokio::test]
    async fn test_conversion_failure_then_retry_recovers() {
        let server = MockServer::start().await;
        // First conversion call fails, the retry succeeds.
        Mock::given(method("POST"))
            .and(path("/api/process"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "content": "# Recovered"
            })))
            .mount(&server)
            .await;
        mount_kb_happy_path(&server).await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"<html>x</html>", "page.html", None, "user-1")
            .await
            .expect("ingest");

        h.processor.process(&document_id).await.expect("process");
        let failed = Document::get_by_id(&document_id, &h.db).await.expect("get");
        assert_eq!(failed.status, DocumentStatus::Failed);
        assert!(failed.error_message.is_some());
        assert!(failed.processed_file_path.is_none());

        h.processor.retry(&document_id).await.expect("retry");

        let document = wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;
        let artifact = tokio::fs::read_to_string(document.processed_file_path.expect("path"))
            .await
            .expect("read artifact");
        assert!(artifact.contains("Recovered"));
    }

    #[tokio::test]
    async fn test_retry_rejected_for_non_failed_document() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# x", "notes.md", None, "user-1")
            .await
            .expect("ingest");

        let result = h.processor.retry(&document_id).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_files_and_row() {
        let server = MockServer::start().await;
        mount_kb_happy_path(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/datasets/ds-1/documents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "code": 0 })))
            .mount(&server)
            .await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# x", "notes.md", None, "user-1")
            .await
            .expect("ingest");
        h.processor.process(&document_id).await.expect("process");
        let document = wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;
        let raw_path = document.file_path.clone();
        let artifact_path = document.processed_file_path.clone().expect("artifact");

        h.processor.delete(&document_id).await.expect("delete");

        assert!(!Path::new(&raw_path).exists());
        assert!(!Path::new(&artifact_path).exists());
        let gone = Document::get_by_id(&document_id, &h.db).await;
        assert!(matches!(gone, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_prevents_new_processing() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# x", "notes.md", None, "user-1")
            .await
            .expect("ingest");

        // Rebuild the processor with an already-cancelled token.
        let config = AppConfig {
            data_dir: h.data_root.to_string_lossy().into_owned(),
            conversion_api_url: server.uri(),
            rag_api_base_url: server.uri(),
            rag_api_key: "test-key".into(),
            ..AppConfig::default()
        };
        let rag_client = RagClient::new(&config.rag_api_base_url, &config.rag_api_key)
            .expect("rag client");
        let kb = Arc::new(KnowledgeBaseService::new(
            Arc::clone(&h.db),
            rag_client,
            CancellationToken::new(),
        ));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let stopped =
            DocumentProcessor::new(Arc::clone(&h.db), &config, kb, shutdown).expect("processor");

        stopped.process(&document_id).await.expect("process");

        let document = Document::get_by_id(&document_id, &h.db).await.expect("get");
        assert_eq!(document.status, DocumentStatus::Uploading);
    }

    #[tokio::test]
    async fn test_preview_decodes_utf8_gbk_and_latin1() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let dir = tempfile::tempdir().expect("tempdir");

        let cases: Vec<(&str, Vec<u8>, String)> = vec![
            ("utf8.md", "# 摘要\n正文".as_bytes().to_vec(), "# 摘要\n正文".to_string()),
            (
                "gbk.md",
                encoding_rs::GBK.encode("# 摘要\n中文内容").0.into_owned(),
                "# 摘要\n中文内容".to_string(),
            ),
            ("latin1.md", vec![0xFF, 0x20, 0x41], "ÿ A".to_string()),
        ];

        for (file_name, bytes, expected) in cases {
            let artifact = dir.path().join(file_name);
            tokio::fs::write(&artifact, &bytes).await.expect("write");

            let mut document = Document::new(
                h.project.id.clone(),
                "summary".into(),
                "summary.pdf".into(),
                "uploads/x/summary.pdf".into(),
                DocumentKind::Pdf,
                bytes.len() as u64,
                "application/pdf".into(),
                None,
                "user-1".into(),
            );
            document.processed_file_path = Some(artifact.to_string_lossy().into_owned());
            h.db.save(document.clone()).await.expect("store");

            let preview = h.processor.preview(&document.id).await.expect("preview");
            assert_eq!(preview.markdown, expected, "case {file_name}");
            // Display name gains a kind-derived extension when missing.
            assert_eq!(preview.display_name, "summary.pdf");
        }
    }

    #[tokio::test]
    async fn test_preview_without_artifact_is_not_found() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# x", "notes.md", None, "user-1")
            .await
            .expect("ingest");

        let result = h.processor.preview(&document_id).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rebuild_reprocesses_documents_through_queue() {
        let server = MockServer::start().await;
        mount_kb_happy_path(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/datasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "code": 0 })))
            .mount(&server)
            .await;
        let h = harness(&server).await;

        let document_id = h
            .processor
            .ingest(&h.project.id, b"# first pass", "notes.md", None, "user-1")
            .await
            .expect("ingest");
        h.processor.process(&document_id).await.expect("process");
        wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;

        // Rebuild tears the dataset down and pushes the document back through
        // the processor via the queue seam.
        let kb = Arc::new(
            KnowledgeBaseService::new(
                Arc::clone(&h.db),
                RagClient::new(&server.uri(), "test-key").expect("client"),
                CancellationToken::new(),
            )
            .with_poll_interval(Duration::from_millis(20)),
        );
        kb.rebuild_for_project(&h.project.id, "user-1", &h.processor)
            .await
            .expect("rebuild");

        let document = wait_for_status(&h.db, &document_id, DocumentStatus::Completed).await;
        assert_eq!(document.progress, 100);
        assert!(document.processed_file_path.is_some());
    }

    #[tokio::test]
    async fn test_delete_project_files_removes_both_trees() {
        let server = MockServer::start().await;
        let h = harness(&server).await;

        let uploads = h.data_root.join("uploads").join(&h.project.folder_uuid);
        let processed = h.data_root.join("processed").join(&h.project.folder_uuid);
        tokio::fs::create_dir_all(&uploads).await.expect("mkdir");
        tokio::fs::create_dir_all(&processed).await.expect("mkdir");
        tokio::fs::write(uploads.join("a.pdf"), b"x").await.expect("write");
        tokio::fs::write(processed.join("a.md"), b"x").await.expect("write");

        let warnings = h.processor.delete_project_files(&h.project).await;
        assert!(warnings.is_empty());
        assert!(!uploads.exists());
        assert!(!processed.exists());

        // Removing already-absent trees stays quiet.
        let warnings = h.processor.delete_project_files(&h.project).await;
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_decode_artifact_text_fallback_order() {
        assert_eq!(decode_artifact_text("plain".as_bytes()), "plain");

        let gbk = encoding_rs::GBK.encode("征信报告").0.into_owned();
        assert_eq!(decode_artifact_text(&gbk), "征信报告");

        assert_eq!(decode_artifact_text(&[0xFF, 0x41]), "ÿA");
    }
}
