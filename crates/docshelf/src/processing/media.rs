//! Image and PDF transforms used by the post-processing actions
//!
//! Raster work runs on the blocking pool through the `image` crate. PDF
//! pages are rasterised by `pdftoppm` (poppler-utils), the same local tool
//! family the ingestion side already shells out to.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};

/// Transform seam for the actions. Methods returning `None` mean the input
/// format has no decoder; callers record that as "not applied".
#[async_trait]
pub trait MediaTransform: Send + Sync {
    /// Re-encode an image into the canonical optimized form
    async fn optimize_image(&self, bytes: Vec<u8>, mime: &str) -> Result<Option<Vec<u8>>>;

    /// Bounded PNG thumbnail of an image
    async fn thumbnail(&self, bytes: Vec<u8>, mime: &str) -> Result<Option<Vec<u8>>>;

    /// First page of a PDF as PNG
    async fn rasterize_pdf(&self, bytes: Vec<u8>) -> Result<Vec<u8>>;

    /// Smaller JPEG for sending to the analysis provider
    async fn recompress_for_analysis(&self, bytes: Vec<u8>, mime: &str) -> Result<Option<Vec<u8>>>;
}

/// Limits applied by [`StandardMedia`]
#[derive(Debug, Clone)]
pub struct MediaLimits {
    pub optimize_max_height: u32,
    pub analysis_max_height: u32,
    pub thumbnail_size: u32,
    pub jpeg_quality: u8,
    pub pdftoppm: String,
    /// Transforms allowed to run at once
    pub max_concurrent: usize,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            optimize_max_height: 1920,
            analysis_max_height: 960,
            thumbnail_size: 240,
            jpeg_quality: 82,
            pdftoppm: "pdftoppm".to_string(),
            max_concurrent: 4,
        }
    }
}

impl From<&ProcessingConfig> for MediaLimits {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            optimize_max_height: config.optimize_max_height,
            analysis_max_height: config.analysis_max_height,
            thumbnail_size: config.thumbnail_size,
            jpeg_quality: config.jpeg_quality,
            pdftoppm: config.pdftoppm_path.clone(),
            max_concurrent: config.max_concurrent_transforms,
        }
    }
}

/// `image` crate + `pdftoppm` implementation. Only the transforms
/// themselves take a permit, so callers waiting on other work never hold one.
#[derive(Debug, Clone)]
pub struct StandardMedia {
    limits: MediaLimits,
    permits: Arc<Semaphore>,
}

impl Default for StandardMedia {
    fn default() -> Self {
        Self::new(MediaLimits::default())
    }
}

impl StandardMedia {
    pub fn new(limits: MediaLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        Self { limits, permits }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| Error::internal("media transforms are shut down"))
    }

    /// Check if pdftoppm is available
    pub fn has_pdftoppm(&self) -> bool {
        std::process::Command::new(&self.limits.pdftoppm)
            .arg("-v")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl MediaTransform for StandardMedia {
    async fn optimize_image(&self, bytes: Vec<u8>, mime: &str) -> Result<Option<Vec<u8>>> {
        let Some(format) = decodable_format(mime) else {
            return Ok(None);
        };
        let max_height = self.limits.optimize_max_height;
        let quality = self.limits.jpeg_quality;
        let _permit = self.permit().await?;
        blocking(move || {
            let img = image::load_from_memory_with_format(&bytes, format)?;
            encode_jpeg(&cap_height(img, max_height), quality).map(Some)
        })
        .await
    }

    async fn thumbnail(&self, bytes: Vec<u8>, mime: &str) -> Result<Option<Vec<u8>>> {
        let Some(format) = decodable_format(mime) else {
            return Ok(None);
        };
        let size = self.limits.thumbnail_size;
        let _permit = self.permit().await?;
        blocking(move || {
            let img = image::load_from_memory_with_format(&bytes, format)?;
            encode_png(&img.thumbnail(size, size)).map(Some)
        })
        .await
    }

    async fn rasterize_pdf(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        let _permit = self.permit().await?;
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.pdf");
        let output_prefix = workdir.path().join("page");
        tokio::fs::write(&input, &bytes).await?;

        let output = Command::new(&self.limits.pdftoppm)
            .arg("-png")
            .args(["-f", "1", "-l", "1", "-singlefile"])
            .arg(&input)
            .arg(&output_prefix)
            .output()
            .await
            .map_err(|e| Error::media(format!("pdftoppm failed to start: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::media(format!("pdftoppm error: {}", stderr.trim())));
        }

        Ok(tokio::fs::read(output_prefix.with_extension("png")).await?)
    }

    async fn recompress_for_analysis(&self, bytes: Vec<u8>, mime: &str) -> Result<Option<Vec<u8>>> {
        let Some(format) = decodable_format(mime) else {
            return Ok(None);
        };
        let max_height = self.limits.analysis_max_height;
        let quality = self.limits.jpeg_quality;
        let _permit = self.permit().await?;
        blocking(move || {
            let img = image::load_from_memory_with_format(&bytes, format)?;
            encode_jpeg(&cap_height(img, max_height), quality).map(Some)
        })
        .await
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::internal(format!("media task panicked: {}", e)))?
}

/// Format for a declared mime, if this build can decode it
fn decodable_format(mime: &str) -> Option<ImageFormat> {
    let format = ImageFormat::from_mime_type(mime)?;
    format.reading_enabled().then_some(format)
}

/// Shrink so the height is at most `max_height`, keeping the aspect ratio
fn cap_height(img: DynamicImage, max_height: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if height <= max_height {
        return img;
    }
    let new_width = ((width as u64 * max_height as u64) / height as u64).max(1) as u32;
    img.resize_exact(new_width, max_height, FilterType::Lanczos3)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&img.to_rgb8())?;
    Ok(out)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Render the leading text of a document as a small SVG card
pub fn render_text_preview(text: &[u8], size: u32) -> Vec<u8> {
    const MAX_LINES: usize = 24;
    const MAX_COLUMNS: usize = 64;

    let text = String::from_utf8_lossy(text);
    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 640 640"><rect width="100%" height="100%" fill="white"/><text x="20" y="20" font-family="monospace" font-size="22" fill="black">"#
    );
    for line in text.lines().take(MAX_LINES) {
        let line: String = line.chars().take(MAX_COLUMNS).collect();
        svg.push_str(r#"<tspan x="20" dy="1.2em" xml:space="preserve">"#);
        svg.push_str(&escape_xml(&line));
        svg.push_str("</tspan>");
    }
    svg.push_str("</text></svg>");
    svg.into_bytes()
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    #[tokio::test]
    async fn test_optimize_caps_height() {
        let media = StandardMedia::default();
        let out = media.optimize_image(png(100, 2400), "image/png").await.unwrap().unwrap();

        let decoded = image::load_from_memory_with_format(&out, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.height(), 1920);
        assert_eq!(decoded.width(), 80);
    }

    #[tokio::test]
    async fn test_small_images_keep_dimensions() {
        let media = StandardMedia::default();
        let out = media.optimize_image(png(64, 48), "image/png").await.unwrap().unwrap();

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[tokio::test]
    async fn test_thumbnail_fits_bounds() {
        let media = StandardMedia::default();
        let out = media.thumbnail(png(800, 400), "image/png").await.unwrap().unwrap();

        let decoded = image::load_from_memory_with_format(&out, ImageFormat::Png).unwrap();
        assert!(decoded.width() <= 240 && decoded.height() <= 240);
        assert_eq!(decoded.width(), 240);
    }

    #[tokio::test]
    async fn test_undecodable_formats_are_skipped() {
        let media = StandardMedia::default();
        assert!(media.thumbnail(vec![1, 2, 3], "image/heic").await.unwrap().is_none());
        assert!(media.optimize_image(vec![1, 2, 3], "image/x-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_image_is_an_error() {
        let media = StandardMedia::default();
        let err = media.thumbnail(b"not a png".to_vec(), "image/png").await.unwrap_err();
        assert!(matches!(err, Error::Media(_)));
    }

    #[tokio::test]
    async fn test_transforms_share_a_bounded_pool() {
        let media = StandardMedia::new(MediaLimits {
            max_concurrent: 1,
            ..MediaLimits::default()
        });

        let held = media.permit().await.unwrap();
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            media.thumbnail(png(8, 8), "image/png"),
        )
        .await;
        assert!(waiting.is_err());

        drop(held);
        assert!(media.thumbnail(png(8, 8), "image/png").await.unwrap().is_some());
    }

    #[test]
    fn test_text_preview_escapes_markup() {
        let svg = render_text_preview(b"<script>alert('x')</script>\nsecond & last", 240);
        let svg = String::from_utf8(svg).unwrap();

        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("&lt;script&gt;"));
        assert!(svg.contains("second &amp; last"));
        assert!(!svg.contains("<script>"));
    }
}
