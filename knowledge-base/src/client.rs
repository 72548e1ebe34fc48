use std::time::Duration;

use common::error::AppError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const DATASET_OP_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote document row as reported by the KB's list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RagDocument {
    pub id: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub run: String,
}

/// Every KB response wraps its payload as `{ code, data }`; a non-zero code
/// is an upstream rejection.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct CreatedDataset {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadedDocument {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentPage {
    #[serde(default)]
    docs: Vec<RagDocument>,
}

/// Thin client for the knowledge-base REST API.
#[derive(Clone)]
pub struct RagClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RagClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub async fn create_dataset(&self, name: &str, description: &str) -> Result<String, AppError> {
        let url = format!("{}/api/v1/datasets", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(DATASET_OP_TIMEOUT)
            .json(&json!({ "name": name, "description": description }))
            .send()
            .await
            .map_err(|err| transport_error("create dataset", &err))?;

        let created: CreatedDataset = read_envelope(response, "create dataset").await?;
        debug!(dataset_id = %created.id, "Created knowledge-base dataset");
        Ok(created.id)
    }

    pub async fn delete_dataset(&self, dataset_id: &str) -> Result<(), AppError> {
        let url = format!("{}/api/v1/datasets", self.base_url);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_key)
            .timeout(DATASET_OP_TIMEOUT)
            .json(&json!({ "ids": [dataset_id] }))
            .send()
            .await
            .map_err(|err| transport_error("delete dataset", &err))?;

        read_ack(response, "delete dataset").await
    }

    pub async fn upload_document(
        &self,
        dataset_id: &str,
        file_name: &str,
        markdown: Vec<u8>,
    ) -> Result<String, AppError> {
        let url = format!("{}/api/v1/datasets/{}/documents", self.base_url, dataset_id);
        let part = reqwest::multipart::Part::bytes(markdown)
            .file_name(file_name.to_string())
            .mime_str("text/markdown")
            .map_err(|err| AppError::Internal(format!("invalid multipart payload: {err}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|err| transport_error("upload document", &err))?;

        let uploaded: Vec<UploadedDocument> = read_envelope(response, "upload document").await?;
        uploaded
            .into_iter()
            .next()
            .map(|doc| doc.id)
            .ok_or_else(|| {
                AppError::UpstreamRejected("upload document: empty document list".to_string())
            })
    }

    pub async fn delete_document(
        &self,
        dataset_id: &str,
        rag_document_id: &str,
    ) -> Result<(), AppError> {
        let url = format!("{}/api/v1/datasets/{}/documents", self.base_url, dataset_id);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_key)
            .timeout(DATASET_OP_TIMEOUT)
            .json(&json!({ "ids": [rag_document_id] }))
            .send()
            .await
            .map_err(|err| transport_error("delete document", &err))?;

        read_ack(response, "delete document").await
    }

    pub async fn trigger_parse(
        &self,
        dataset_id: &str,
        rag_document_ids: &[String],
    ) -> Result<(), AppError> {
        let url = format!("{}/api/v1/datasets/{}/chunks", self.base_url, dataset_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(DATASET_OP_TIMEOUT)
            .json(&json!({ "document_ids": rag_document_ids }))
            .send()
            .await
            .map_err(|err| transport_error("trigger parse", &err))?;

        read_ack(response, "trigger parse").await
    }

    pub async fn list_documents(&self, dataset_id: &str) -> Result<Vec<RagDocument>, AppError> {
        let url = format!("{}/api/v1/datasets/{}/documents", self.base_url, dataset_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(DATASET_OP_TIMEOUT)
            .query(&[("page_size", "100")])
            .send()
            .await
            .map_err(|err| transport_error("list documents", &err))?;

        let page: DocumentPage = read_envelope(response, "list documents").await?;
        Ok(page.docs)
    }
}

fn transport_error(op: &str, err: &reqwest::Error) -> AppError {
    AppError::UpstreamUnavailable(format!("{op}: {err}"))
}

/// Unwraps the `{ code, data }` envelope, mapping non-2xx responses and
/// non-zero codes to upstream rejections.
async fn read_envelope<T: DeserializeOwned + Default>(
    response: reqwest::Response,
    op: &str,
) -> Result<T, AppError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::UpstreamRejected(format!("{op}: HTTP {status}")));
    }

    let envelope: ApiEnvelope<T> = response
        .json()
        .await
        .map_err(|err| AppError::UpstreamRejected(format!("{op}: malformed response: {err}")))?;

    if envelope.code != 0 {
        let message = envelope.message.unwrap_or_else(|| "unknown error".into());
        return Err(AppError::UpstreamRejected(format!(
            "{op}: code {}: {message}",
            envelope.code
        )));
    }

    envelope
        .data
        .ok_or_else(|| AppError::UpstreamRejected(format!("{op}: empty payload")))
}

/// Like `read_envelope` for operations whose payload carries no data.
async fn read_ack(response: reqwest::Response, op: &str) -> Result<(), AppError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::UpstreamRejected(format!("{op}: HTTP {status}")));
    }

    let envelope: ApiEnvelope<serde_json::Value> = response
        .json()
        .await
        .map_err(|err| AppError::UpstreamRejected(format!("{op}: malformed response: {err}")))?;

    if envelope.code != 0 {
        let message = envelope.message.unwrap_or_else(|| "unknown error".into());
        return Err(AppError::UpstreamRejected(format!(
            "{op}: code {}: {message}",
            envelope.code
        )));
    }

    Ok(())
}
