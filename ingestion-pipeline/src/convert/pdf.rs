use std::{path::Path, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::error::AppError;
use headless_chrome::{
    protocol::cdp::{Emulation, Page, DOM},
    Browser,
};
use lopdf::Document as PdfDocument;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::vision::VisionClient;

/// Pages sampled by the scanned-document detector.
const DETECTOR_PAGE_LIMIT: usize = 3;
/// Total extracted text below this marks the PDF as scanned. The threshold
/// is load-bearing: lowering it reroutes borderline documents to the text
/// path, raising it sends them through vision OCR.
const SCANNED_TEXT_THRESHOLD: usize = 50;
/// Enough text to stop sampling further pages early.
const DETECTOR_EARLY_STOP: usize = 100;

const PAGE_RENDER_TIMEOUT: Duration = Duration::from_secs(60);
const PAGE_RENDER_SETTLE: Duration = Duration::from_millis(350);
const VIEWPORT_WIDTH: u32 = 1_248;
const VIEWPORT_HEIGHT: u32 = 1_800;

/// Classifies a PDF as scanned when its first few pages carry almost no
/// extractable text. An unparseable PDF is treated as scanned; the vision
/// path copes with it where text extraction cannot.
pub async fn is_scanned_pdf(pdf_bytes: Vec<u8>) -> Result<bool, AppError> {
    let verdict = tokio::task::spawn_blocking(move || {
        let document = match PdfDocument::load_mem(&pdf_bytes) {
            Ok(document) => document,
            Err(err) => {
                warn!(error = %err, "Failed to parse PDF; routing to the vision path");
                return true;
            }
        };

        let mut pages: Vec<u32> = document.get_pages().keys().copied().collect();
        pages.sort_unstable();

        let mut sample = String::new();
        for page in pages.into_iter().take(DETECTOR_PAGE_LIMIT) {
            if let Ok(text) = document.extract_text(&[page]) {
                sample.push_str(&text);
            }
            if sample.trim().len() > DETECTOR_EARLY_STOP {
                break;
            }
        }

        sample.trim().len() < SCANNED_TEXT_THRESHOLD
    })
    .await?;

    Ok(verdict)
}

/// Sorted page numbers of the PDF.
pub async fn page_numbers(pdf_bytes: Vec<u8>) -> Result<Vec<u32>, AppError> {
    let pages = tokio::task::spawn_blocking(move || -> Result<Vec<u32>, AppError> {
        let document = PdfDocument::load_mem(&pdf_bytes)
            .map_err(|err| AppError::Conversion(format!("failed to parse PDF: {err}")))?;
        let mut pages: Vec<u32> = document.get_pages().keys().copied().collect();
        pages.sort_unstable();
        Ok(pages)
    })
    .await??;

    Ok(pages)
}

/// Joins per-page transcriptions under a document heading. Page numbering is
/// 1-based and sequential regardless of the PDF's internal numbering.
pub fn paged_markdown(stem: &str, pages: &[String]) -> String {
    let mut sections = Vec::with_capacity(pages.len() * 2 + 1);
    sections.push(format!("# {stem}\n"));
    for (idx, page) in pages.iter().enumerate() {
        sections.push(format!("## Page {}\n", idx + 1));
        sections.push(format!("{}\n", page.trim()));
    }
    sections.join("\n")
}

/// Full vision path for a scanned PDF: rasterize every page, transcribe each
/// through the vision model, and assemble the paged Markdown.
pub async fn scanned_pdf_markdown(
    file_path: &Path,
    stem: &str,
    vision: &VisionClient,
) -> Result<String, AppError> {
    let pdf_bytes = tokio::fs::read(file_path).await?;
    let pages = page_numbers(pdf_bytes).await?;
    if pages.is_empty() {
        return Err(AppError::Conversion("PDF appears to have no pages".into()));
    }

    let rendered = render_pdf_pages(file_path, &pages).await?;

    let mut sections = Vec::with_capacity(rendered.len());
    for (idx, png) in rendered.iter().enumerate() {
        let markdown = vision.page_markdown(png).await.map_err(|err| {
            AppError::Conversion(format!(
                "vision extraction failed on page {}: {err}",
                idx + 1
            ))
        })?;
        sections.push(markdown);
    }

    Ok(paged_markdown(stem, &sections))
}

/// Rasterizes the requested pages to PNG with headless Chrome's built-in PDF
/// viewer.
async fn render_pdf_pages(file_path: &Path, pages: &[u32]) -> Result<Vec<Vec<u8>>, AppError> {
    let file_url = url::Url::from_file_path(file_path)
        .map_err(|_| AppError::Conversion("unable to construct PDF file URL".into()))?;

    let browser = Browser::default()
        .map_err(|err| AppError::Conversion(format!("failed to start Chrome: {err}")))?;
    let tab = browser
        .new_tab()
        .map_err(|err| AppError::Conversion(format!("failed to create Chrome tab: {err}")))?;

    tab.set_default_timeout(PAGE_RENDER_TIMEOUT);
    configure_tab(&tab)?;

    let mut captures = Vec::with_capacity(pages.len());

    for page in pages {
        let target = format!("{file_url}#page={page}&toolbar=0&statusbar=0&zoom=page-fit");
        tab.navigate_to(&target)
            .map_err(|err| AppError::Conversion(format!("failed to open PDF page: {err}")))?
            .wait_until_navigated()
            .map_err(|err| AppError::Conversion(format!("navigation to PDF page failed: {err}")))?;

        tab.wait_for_element("embed, canvas, body").map_err(|err| {
            AppError::Conversion(format!("timed out waiting for PDF viewer: {err}"))
        })?;

        // Let the viewer finish painting before the capture.
        sleep(PAGE_RENDER_SETTLE).await;

        let png = capture_page_png(&tab)?;
        debug!(page = *page, bytes = png.len(), "Captured PDF page");
        captures.push(png);
    }

    Ok(captures)
}

fn configure_tab(tab: &headless_chrome::Tab) -> Result<(), AppError> {
    tab.call_method(Emulation::SetDefaultBackgroundColorOverride {
        color: Some(DOM::RGBA {
            r: 255,
            g: 255,
            b: 255,
            a: Some(1.0),
        }),
    })
    .map_err(|err| AppError::Conversion(format!("failed to configure page background: {err}")))?;

    tab.call_method(Emulation::SetDeviceMetricsOverride {
        width: VIEWPORT_WIDTH,
        height: VIEWPORT_HEIGHT,
        device_scale_factor: 1.0,
        mobile: false,
        scale: None,
        screen_width: Some(VIEWPORT_WIDTH),
        screen_height: Some(VIEWPORT_HEIGHT),
        position_x: None,
        position_y: None,
        dont_set_visible_size: Some(false),
        screen_orientation: None,
        viewport: None,
        display_feature: None,
        device_posture: None,
    })
    .map_err(|err| AppError::Conversion(format!("failed to configure viewport: {err}")))?;

    Ok(())
}

fn capture_page_png(tab: &headless_chrome::Tab) -> Result<Vec<u8>, AppError> {
    let screenshot = tab
        .call_method(Page::CaptureScreenshot {
            format: Some(Page::CaptureScreenshotFormatOption::Png),
            quality: None,
            clip: None,
            from_surface: Some(true),
            capture_beyond_viewport: Some(true),
            optimize_for_speed: Some(false),
        })
        .map_err(|err| AppError::Conversion(format!("failed to capture PDF page: {err}")))?;

    STANDARD
        .decode(screenshot.data)
        .map_err(|err| AppError::Conversion(format!("failed to decode PDF screenshot: {err}")))
}
