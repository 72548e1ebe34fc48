pub mod cleanup;
pub mod external;
pub mod pdf;
pub mod vision;

use std::path::Path;

use common::{
    error::AppError, storage::types::document::DocumentKind, utils::config::AppConfig,
};
use tracing::info;

use external::ConversionClient;
use vision::VisionClient;

/// Routes a raw file to the conversion strategy for its kind and returns the
/// Markdown artifact bytes.
///
/// | kind            | strategy                                   |
/// |-----------------|--------------------------------------------|
/// | markdown        | byte copy                                  |
/// | pdf (text)      | external service, image refs stripped      |
/// | pdf (scanned)   | per-page vision OCR, preserved verbatim    |
/// | html            | external service, image refs stripped      |
/// | excel/word/image| external service                           |
#[derive(Clone)]
pub struct ConversionDispatcher {
    external: ConversionClient,
    vision: VisionClient,
}

impl ConversionDispatcher {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        Ok(Self {
            external: ConversionClient::new(&config.conversion_api_url)?,
            vision: VisionClient::new(
                &config.vision_api_base_url,
                &config.vision_api_key,
                &config.vision_model,
            ),
        })
    }

    pub async fn convert(
        &self,
        kind: DocumentKind,
        raw_path: &Path,
        stem: &str,
    ) -> Result<Vec<u8>, AppError> {
        let file_name = raw_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("document");

        match kind {
            DocumentKind::Markdown => {
                // Byte copy: the artifact must be identical to the upload.
                Ok(tokio::fs::read(raw_path).await?)
            }
            DocumentKind::Pdf => {
                let raw_bytes = tokio::fs::read(raw_path).await?;
                if pdf::is_scanned_pdf(raw_bytes.clone()).await? {
                    info!(%file_name, "PDF classified as scanned; using vision OCR");
                    let markdown = pdf::scanned_pdf_markdown(raw_path, stem, &self.vision).await?;
                    Ok(markdown.into_bytes())
                } else {
                    let converted = self.external.convert(file_name, raw_bytes).await?;
                    Ok(cleanup::strip_image_references(&converted.markdown).into_bytes())
                }
            }
            DocumentKind::Html => {
                let raw_bytes = tokio::fs::read(raw_path).await?;
                let converted = self.external.convert(file_name, raw_bytes).await?;
                Ok(cleanup::strip_image_references(&converted.markdown).into_bytes())
            }
            DocumentKind::Excel | DocumentKind::Word | DocumentKind::Image => {
                let raw_bytes = tokio::fs::read(raw_path).await?;
                let converted = self.external.convert(file_name, raw_bytes).await?;
                Ok(converted.markdown.into_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher_for(server: &MockServer) -> ConversionDispatcher {
        let config = AppConfig {
            conversion_api_url: server.uri(),
            ..AppConfig::default()
        };
        ConversionDispatcher::new(&config).expect("dispatcher")
    }

    #[tokio::test]
    async fn test_markdown_is_byte_copied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("notes.md");
        let contents = "# Notes\n\nsome UTF-8 · content\n";
        tokio::fs::write(&raw, contents).await.expect("write");

        let server = MockServer::start().await;
        let dispatcher = dispatcher_for(&server);

        let converted = dispatcher
            .convert(DocumentKind::Markdown, &raw, "notes")
            .await
            .expect("convert");
        assert_eq!(converted, contents.as_bytes());
        // No external request is made for markdown.
        assert!(server.received_requests().await.expect("requests").is_empty());
    }

    #[tokio::test]
    async fn test_html_output_has_image_refs_stripped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("page.html");
        tokio::fs::write(&raw, "<html><body>x</body></html>")
            .await
            .expect("write");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "content": "# Page\n\n![logo](logo.png)\n\n<img src='x.png'>\n\nText"
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher_for(&server);
        let converted = dispatcher
            .convert(DocumentKind::Html, &raw, "page")
            .await
            .expect("convert");

        let markdown = String::from_utf8(converted).expect("utf8");
        assert!(!markdown.contains("!["));
        assert!(!markdown.contains("<img"));
        assert!(markdown.contains("Text"));
    }

    #[tokio::test]
    async fn test_excel_output_is_preserved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("sheet.xlsx");
        tokio::fs::write(&raw, b"PK\x03\x04").await.expect("write");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "content": "| a | b |\n| --- | --- |\n| 1 | 2 |"
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher_for(&server);
        let converted = dispatcher
            .convert(DocumentKind::Excel, &raw, "sheet")
            .await
            .expect("convert");
        assert_eq!(
            String::from_utf8(converted).expect("utf8"),
            "| a | b |\n| --- | --- |\n| 1 | 2 |"
        );
    }
}
