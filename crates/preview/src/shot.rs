use async_trait::async_trait;
use base64::Engine;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::{CaptureConfig, HtmlRenderer, RenderError};

const BROWSERS: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
    "msedge",
];

/// Off-screen renderer backed by a headless browser binary. Each capture
/// writes the page into a private scratch directory, screenshots it at the
/// canonical viewport, and reduces the raster before encoding.
pub struct BrowserShot {
    browser: PathBuf,
    work_root: PathBuf,
}

impl BrowserShot {
    /// Locate a usable browser on PATH.
    pub fn detect() -> Result<Self, RenderError> {
        for name in BROWSERS {
            if let Ok(path) = which::which(name) {
                return Ok(Self::with_browser(path));
            }
        }
        Err(RenderError::BrowserMissing)
    }

    pub fn with_browser(browser: impl Into<PathBuf>) -> Self {
        Self {
            browser: browser.into(),
            work_root: registry::app_data_dir().join("capture"),
        }
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    async fn run_capture(
        &self,
        html: &str,
        config: &CaptureConfig,
        dir: &Path,
    ) -> Result<String, RenderError> {
        tokio::fs::create_dir_all(dir).await?;
        let page = dir.join("page.html");
        tokio::fs::write(&page, html).await?;
        let shot = dir.join("shot.png");

        // The virtual time budget stands in for the settle delay: after the
        // load signal the browser keeps running deferred work for that long
        // before the capture happens.
        let budget = config.settle.as_millis().max(1);
        let output = tokio::process::Command::new(&self.browser)
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg(format!("--window-size={},{}", config.width, config.height))
            .arg(format!("--virtual-time-budget={budget}"))
            .arg(format!("--screenshot={}", shot.display()))
            .arg(format!("file://{}", page.display()))
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Capture(format!(
                "{} exited with {}: {}",
                self.browser.display(),
                output.status,
                stderr.trim()
            )));
        }

        let bytes = tokio::fs::read(&shot).await?;
        debug!(bytes = bytes.len(), "captured page");
        scaled_data_uri(&bytes, config)
    }
}

#[async_trait]
impl HtmlRenderer for BrowserShot {
    fn name(&self) -> &str {
        "browser"
    }

    async fn capture(&self, html: &str, config: &CaptureConfig) -> Result<String, RenderError> {
        let dir = self.work_root.join(Uuid::new_v4().to_string());
        let result = self.run_capture(html, config, &dir).await;
        // Scratch directory goes away on success and failure alike.
        let _ = tokio::fs::remove_dir_all(&dir).await;
        result
    }
}

fn scaled_data_uri(png: &[u8], config: &CaptureConfig) -> Result<String, RenderError> {
    let full = image::load_from_memory(png)?;
    let w = ((config.width as f32) * config.scale).round().max(1.0) as u32;
    let h = ((config.height as f32) * config.scale).round().max(1.0) as u32;
    let reduced = full.resize_exact(w, h, image::imageops::FilterType::Triangle);
    let mut out = Vec::new();
    reduced.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(png_data_uri(&out))
}

/// Encode PNG bytes as a `data:` URI, the payload shape stored in
/// `Artifact::Image`.
pub fn png_data_uri(bytes: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
