use async_openai::types::{
    ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::error::AppError;
use tracing::debug;

/// Instruction sent with every page image. Fixed wording: the downstream
/// artifact format depends on it.
const PAGE_MARKDOWN_PROMPT: &str = "Extract all textual content from this page as Markdown. \
Ignore watermarks and seals, and preserve the original formatting and table structure.";

/// Low temperature keeps transcription deterministic.
const PAGE_MARKDOWN_TEMPERATURE: f32 = 0.1;

/// Chat-completions client used to transcribe rasterized PDF pages.
#[derive(Clone)]
pub struct VisionClient {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
}

impl VisionClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        let client = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(base_url),
        );

        Self {
            client,
            model: model.to_string(),
        }
    }

    /// Transcribes one rendered page into Markdown.
    pub async fn page_markdown(&self, png_bytes: &[u8]) -> Result<String, AppError> {
        let encoded = STANDARD.encode(png_bytes);
        let image_url = format!("data:image/png;base64,{encoded}");

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .temperature(PAGE_MARKDOWN_TEMPERATURE)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(vec![
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(PAGE_MARKDOWN_PROMPT)
                        .build()?
                        .into(),
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(
                            ImageUrlArgs::default()
                                .url(image_url)
                                .detail(ImageDetail::High)
                                .build()?,
                        )
                        .build()?
                        .into(),
                ])
                .build()?
                .into()])
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                AppError::Conversion("vision model returned no usable content".to_string())
            })?;

        debug!(response_chars = content.len(), "Received page transcription");
        Ok(content)
    }
}
