use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use registry::Artifact;

mod cancel;
pub use cancel::{CancellationRegistry, CancellationToken};
mod shot;
pub use shot::{png_data_uri, BrowserShot};

pub const FALLBACK_TITLE: &str = "Untitled Webapp";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no headless browser found on PATH")]
    BrowserMissing,
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encode error: {0}")]
    Encode(#[from] image::ImageError),
}

/// Capture parameters for preview generation.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Canonical viewport the page is laid out in.
    pub width: u32,
    pub height: u32,
    /// Downscale applied to the captured surface.
    pub scale: f32,
    /// Extra delay between the content-loaded signal and the capture, so
    /// deferred layout/CSS/image loads have a chance to finish.
    pub settle: Duration,
    /// Length of the text preview used when capture is not possible.
    pub preview_chars: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            scale: 0.5,
            settle: Duration::from_secs(1),
            preview_chars: 200,
        }
    }
}

/// Abstract off-screen rendering capability: lay out the HTML at the
/// configured viewport and hand back an encoded image payload (data URI).
///
/// Implementations must honor the settle delay before capturing and tear
/// down any transient resources on every exit path.
#[async_trait]
pub trait HtmlRenderer: Send + Sync {
    /// Renderer name for diagnostics.
    fn name(&self) -> &str;

    async fn capture(&self, html: &str, config: &CaptureConfig) -> Result<String, RenderError>;
}

/// Renderer that never captures; every generation degrades to a text
/// preview. Used where no browser engine is available.
#[derive(Debug, Default)]
pub struct NullRenderer;

#[async_trait]
impl HtmlRenderer for NullRenderer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn capture(&self, _html: &str, _config: &CaptureConfig) -> Result<String, RenderError> {
        Err(RenderError::Capture("rendering disabled".to_string()))
    }
}

/// Derives a preview artifact from raw HTML. Failure paths all resolve to
/// `Artifact::Text`; callers never see an error.
pub struct ScreenshotGenerator {
    renderer: Arc<dyn HtmlRenderer>,
    config: CaptureConfig,
}

impl ScreenshotGenerator {
    pub fn new(renderer: Arc<dyn HtmlRenderer>) -> Self {
        Self::with_config(renderer, CaptureConfig::default())
    }

    pub fn with_config(renderer: Arc<dyn HtmlRenderer>, config: CaptureConfig) -> Self {
        Self { renderer, config }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub async fn generate(&self, html: &str) -> Artifact {
        let title = extract_title(html);
        match self.renderer.capture(html, &self.config).await {
            Ok(url) => Artifact::Image { url, title },
            Err(err) => {
                warn!(renderer = self.renderer.name(), %err, "capture failed, using text preview");
                Artifact::Text {
                    title,
                    preview: preview_excerpt(html, self.config.preview_chars),
                }
            }
        }
    }
}

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));

/// Text of the first `<title>` element, or a placeholder when absent.
pub fn extract_title(html: &str) -> String {
    let title = TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or("");
    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title.to_string()
    }
}

/// Bounded excerpt of the source with a truncation marker.
pub fn preview_excerpt(html: &str, chars: usize) -> String {
    let mut excerpt: String = html.chars().take(chars).collect();
    excerpt.push_str("...");
    excerpt
}
