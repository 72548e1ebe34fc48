use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::stored_object;
use crate::{error::AppError, storage::db::SurrealDbClient};

/// Detected file kind, derived from the upload's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Excel,
    Word,
    Image,
    Html,
    Markdown,
}

/// Extensions accepted at ingestion. `doc`/`docx` are rejected with a fixed
/// user-facing message instead of being listed here.
pub const ALLOWED_EXTENSIONS: [&str; 11] = [
    "pdf", "xls", "xlsx", "csv", "txt", "jpg", "jpeg", "png", "md", "html", "htm",
];

impl DocumentKind {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "xls" | "xlsx" | "csv" => Some(Self::Excel),
            "doc" | "docx" => Some(Self::Word),
            "jpg" | "jpeg" | "png" => Some(Self::Image),
            "html" | "htm" => Some(Self::Html),
            // Plain text is handled as Markdown: both are copied through.
            "md" | "txt" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Extension appended to extension-less display names in previews.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Excel => "xlsx",
            Self::Word => "docx",
            Self::Image => "jpg",
            Self::Html => "html",
            Self::Markdown => "md",
        }
    }
}

/// User-assigned document label. The localized display name is prefixed onto
/// the document's visible name and carried into the KB-uploaded filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentLabel {
    FinancialStatement,
    AuditReport,
    CreditReport,
    Other,
}

impl DocumentLabel {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::FinancialStatement => "财务报表",
            Self::AuditReport => "审计报告",
            Self::CreditReport => "征信报告",
            Self::Other => "其他",
        }
    }

    /// Accepts either the enum code or the localized display string.
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "financial_statement" | "财务报表" => Some(Self::FinancialStatement),
            "audit_report" | "审计报告" => Some(Self::AuditReport),
            "credit_report" | "征信报告" => Some(Self::CreditReport),
            "other" | "其他" => Some(Self::Other),
            _ => None,
        }
    }

    /// Prefixes the display name, never twice.
    pub fn apply_prefix(&self, name: &str) -> String {
        let prefix = format!("{}_", self.display_name());
        if name.starts_with(&prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    UploadingToKb,
    ParsingKb,
    Completed,
    Failed,
    KbParseFailed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::UploadingToKb => "uploading_to_kb",
            Self::ParsingKb => "parsing_kb",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::KbParseFailed => "kb_parse_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::KbParseFailed)
    }

    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Failed | Self::KbParseFailed)
    }
}

stored_object!(Document, "document", {
    project_id: String,
    name: String,
    original_filename: String,
    file_path: String,
    kind: DocumentKind,
    file_size: u64,
    mime_type: String,
    label: Option<DocumentLabel>,
    upload_by: String,
    status: DocumentStatus,
    progress: u8,
    processed_file_path: Option<String>,
    rag_document_id: Option<String>,
    error_message: Option<String>,
    #[serde(with = "crate::storage::types::surreal_opt_datetime", default)]
    processing_started_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::storage::types::surreal_opt_datetime", default)]
    processed_at: Option<DateTime<Utc>>
});

impl Document {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: String,
        name: String,
        original_filename: String,
        file_path: String,
        kind: DocumentKind,
        file_size: u64,
        mime_type: String,
        label: Option<DocumentLabel>,
        upload_by: String,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            project_id,
            name,
            original_filename,
            file_path,
            kind,
            file_size,
            mime_type,
            label,
            upload_by,
            status: DocumentStatus::Uploading,
            progress: 0,
            processed_file_path: None,
            rag_document_id: None,
            error_message: None,
            processing_started_at: None,
            processed_at: None,
        }
    }

    pub async fn get_by_id(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.load::<Self>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))
    }

    pub async fn list_by_project(
        project_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM document WHERE project_id = $project_id ORDER BY created_at ASC")
            .bind(("project_id", project_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn list_with_status(
        status: DocumentStatus,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM document WHERE status == $status")
            .bind(("status", status.as_str()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Documents whose KB parse is still in flight, used to re-spawn pollers
    /// after a restart.
    pub async fn list_parsing(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        Self::list_with_status(DocumentStatus::ParsingKb, db).await
    }

    /// Raises `progress`, never lowers it. A stale or out-of-order floor write
    /// is absorbed by the condition instead of regressing the value.
    pub async fn set_progress(id: &str, value: u8, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('document', $id)
             SET progress = $value, updated_at = time::now()
             WHERE progress < $value",
        )
        .bind(("id", id.to_owned()))
        .bind(("value", value))
        .await?
        .check()?;

        Ok(())
    }

    /// Claims a freshly ingested document for processing. Conditional on the
    /// `uploading` status so a concurrent claimant observes a no-op.
    pub async fn claim_for_processing(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'processing',
                     processing_started_at = time::now(),
                     progress = 10,
                     updated_at = time::now()
                 WHERE status == 'uploading'",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Resets a failed document so the machine can be re-entered. Only valid
    /// from the two failure states; returns the pre-reset row so the caller
    /// can remove the stale artifact file.
    pub async fn reset_for_retry(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'processing',
                     progress = 0,
                     error_message = NONE,
                     processed_file_path = NONE,
                     rag_document_id = NONE,
                     processing_started_at = time::now(),
                     updated_at = time::now()
                 WHERE status IN ['failed', 'kb_parse_failed']
                 RETURN BEFORE",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let previous: Vec<Self> = response.take(0)?;
        Ok(previous.into_iter().next())
    }

    /// Unconditional variant used by knowledge-base rebuild, which resets the
    /// whole project regardless of where each document currently stands.
    pub async fn reset_for_rebuild(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'processing',
                     progress = 0,
                     error_message = NONE,
                     processed_file_path = NONE,
                     rag_document_id = NONE,
                     processing_started_at = time::now(),
                     updated_at = time::now()
                 RETURN BEFORE",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let previous: Vec<Self> = response.take(0)?;
        Ok(previous.into_iter().next())
    }

    /// Records the written artifact while conversion is still the active
    /// phase.
    pub async fn record_artifact(
        id: &str,
        processed_file_path: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET processed_file_path = $path,
                     processed_at = time::now(),
                     updated_at = time::now()
                 WHERE status == 'processing'",
            )
            .bind(("id", id.to_owned()))
            .bind(("path", processed_file_path.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Conversion or KB-upload failure: flip to the terminal `failed` state.
    pub async fn mark_failed(
        id: &str,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'failed',
                     error_message = $message,
                     updated_at = time::now()
                 WHERE status IN ['processing', 'uploading_to_kb']",
            )
            .bind(("id", id.to_owned()))
            .bind(("message", message.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// `processing -> uploading_to_kb`, requires the artifact to be recorded.
    pub async fn begin_kb_upload(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'uploading_to_kb', updated_at = time::now()
                 WHERE status == 'processing'
                   AND processed_file_path != NONE
                   AND processed_file_path != NULL",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// `uploading_to_kb -> parsing_kb`, storing the handle the KB returned.
    pub async fn mark_parsing(
        id: &str,
        rag_document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'parsing_kb',
                     rag_document_id = $rag_document_id,
                     updated_at = time::now()
                 WHERE status == 'uploading_to_kb'",
            )
            .bind(("id", id.to_owned()))
            .bind(("rag_document_id", rag_document_id.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Poller observed a successful remote parse.
    pub async fn complete_parse(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'completed',
                     progress = 100,
                     error_message = NONE,
                     updated_at = time::now()
                 WHERE status == 'parsing_kb'",
            )
            .bind(("id", id.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Poller observed a failed remote parse.
    pub async fn fail_parse(
        id: &str,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = 'kb_parse_failed',
                     error_message = $message,
                     updated_at = time::now()
                 WHERE status == 'parsing_kb'",
            )
            .bind(("id", id.to_owned()))
            .bind(("message", message.to_owned()))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(updated.into_iter().next())
    }

    /// Clears the KB handle after remote de-registration.
    pub async fn clear_rag_handle(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('document', $id)
             SET rag_document_id = NONE, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .await?
        .check()?;

        Ok(())
    }
}
