use std::time::Duration;

use common::error::AppError;
use serde::Deserialize;
use tracing::debug;

/// The converter can spend minutes on a large spreadsheet or PDF.
const CONVERSION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ConversionMetadata {
    #[serde(default)]
    file_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    content: String,
    #[serde(default)]
    processing_time: f64,
    #[serde(default)]
    metadata: Option<ConversionMetadata>,
}

#[derive(Debug)]
pub struct ConvertedDocument {
    pub markdown: String,
    pub file_type: Option<String>,
    pub processing_time: f64,
}

/// Client for the external document-conversion service. One multipart POST
/// per document; the caller decides whether failures are retried.
#[derive(Clone)]
pub struct ConversionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ConversionClient {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/api/process", base_url.trim_end_matches('/')),
        })
    }

    pub async fn convert(
        &self,
        file_name: &str,
        raw_bytes: Vec<u8>,
    ) -> Result<ConvertedDocument, AppError> {
        let part = reqwest::multipart::Part::bytes(raw_bytes)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|err| AppError::Internal(format!("invalid multipart payload: {err}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(CONVERSION_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|err| AppError::UpstreamUnavailable(format!("conversion service: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "conversion service returned HTTP {status}"
            )));
        }

        let body: ConversionResponse = response.json().await.map_err(|err| {
            AppError::UpstreamRejected(format!("conversion service: malformed response: {err}"))
        })?;

        if !body.success {
            return Err(AppError::UpstreamRejected(
                "conversion service reported failure".to_string(),
            ));
        }

        if body.content.trim().is_empty() {
            return Err(AppError::Conversion(
                "conversion service returned empty content".to_string(),
            ));
        }

        let file_type = body.metadata.and_then(|metadata| metadata.file_type);
        debug!(
            %file_name,
            ?file_type,
            processing_time = body.processing_time,
            "External conversion finished"
        );

        Ok(ConvertedDocument {
            markdown: body.content,
            file_type,
            processing_time: body.processing_time,
        })
    }
}
