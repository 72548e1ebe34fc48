#![allow(clippy::missing_docs_in_private_items)]

//! Report generation, gated on knowledge-base readiness: every document in
//! the project's dataset must have finished parsing before the workflow is
//! invoked.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::project::Project},
    utils::{
        config::AppConfig,
        files::{report_file_name, StoragePaths},
    },
};
use knowledge_base::RagClient;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Report authoring runs a long retrieval workflow on the remote side.
const WORKFLOW_TIMEOUT: Duration = Duration::from_secs(1200);

#[derive(Debug, Deserialize)]
struct WorkflowOutputs {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunData {
    status: String,
    #[serde(default)]
    outputs: Option<WorkflowOutputs>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunResponse {
    #[serde(default)]
    workflow_run_id: String,
    data: WorkflowRunData,
}

#[derive(Debug, Clone)]
pub struct GeneratedReport {
    pub markdown: String,
    pub workflow_run_id: String,
    pub report_path: String,
}

/// Invokes the external report workflow for a project and persists the
/// returned Markdown under `output/`.
pub struct ReportDispatcher {
    db: Arc<SurrealDbClient>,
    rag: RagClient,
    http: reqwest::Client,
    workflow_url: String,
    api_key: String,
    paths: StoragePaths,
}

impl ReportDispatcher {
    pub fn new(
        db: Arc<SurrealDbClient>,
        rag: RagClient,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            db,
            rag,
            http,
            workflow_url: config.report_api_url.clone(),
            api_key: config.report_api_key.clone(),
            paths: StoragePaths::new(config.data_dir.clone()),
        })
    }

    /// Generates the report for a project. Fails with `not_ready` while any
    /// dataset document is still parsing, without touching the workflow
    /// endpoint.
    pub async fn generate(
        &self,
        project_id: &str,
        company_name: &str,
        knowledge_name: Option<&str>,
    ) -> Result<GeneratedReport, AppError> {
        let project = Project::get_by_id(project_id, &self.db).await?;
        let Some(dataset_id) = project.dataset_id.clone() else {
            return Err(AppError::NotReady(
                "project has no knowledge base yet".to_string(),
            ));
        };

        let documents = self.rag.list_documents(&dataset_id).await?;
        if let Some(pending) = documents.iter().find(|doc| doc.progress < 1.0) {
            return Err(AppError::NotReady(format!(
                "knowledge-base document {} is still parsing",
                pending.id
            )));
        }

        let knowledge_name = knowledge_name.unwrap_or(company_name);
        info!(%project_id, %company_name, %knowledge_name, "Invoking report workflow");

        let response = self
            .http
            .post(&self.workflow_url)
            .bearer_auth(&self.api_key)
            .timeout(WORKFLOW_TIMEOUT)
            .json(&json!({
                "inputs": {
                    "company": company_name,
                    "knowledge_name": knowledge_name,
                },
                "response_mode": "blocking",
                "user": "root",
            }))
            .send()
            .await
            .map_err(|err| AppError::UpstreamUnavailable(format!("report workflow: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamRejected(format!(
                "report workflow returned HTTP {status}"
            )));
        }

        let run: WorkflowRunResponse = response.json().await.map_err(|err| {
            AppError::UpstreamRejected(format!("report workflow: malformed response: {err}"))
        })?;

        if run.data.status != "succeeded" {
            let error = run
                .data
                .error
                .unwrap_or_else(|| "no error detail".to_string());
            return Err(AppError::UpstreamRejected(format!(
                "report workflow ended with status {}: {error}",
                run.data.status
            )));
        }

        let markdown = run
            .data
            .outputs
            .map(|outputs| outputs.text)
            .ok_or_else(|| {
                AppError::UpstreamRejected("report workflow response missing outputs".to_string())
            })?;

        let output_dir = self.paths.output_dir();
        tokio::fs::create_dir_all(&output_dir).await?;
        let report_path = output_dir.join(report_file_name(company_name, Utc::now()));
        tokio::fs::write(&report_path, &markdown).await?;

        let report_path = report_path.to_string_lossy().into_owned();
        Project::record_report_artifact(project_id, &report_path, &self.db).await?;
        info!(%project_id, %report_path, "Report persisted");

        Ok(GeneratedReport {
            markdown,
            workflow_run_id: run.workflow_run_id,
            report_path,
        })
    }
}
