//! Renderer for documents made of one image file per page (scans, exported
//! slides, comic pages).
//!
//! Previews are fitted inside the target box while preserving aspect ratio and
//! are kept as RGBA pixels ready for upload.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::debug;
use walkdir::WalkDir;

use super::{PageRenderer, RenderTarget};
use crate::error::{DisposeError, RenderError};
use crate::thumbnails::Dispose;
use crate::PageIndex;

/// Estimated bytes per pixel for RGBA previews.
const BYTES_PER_PIXEL: usize = 4;

/// A decoded RGBA preview.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_index: PageIndex,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Dispose for PageImage {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        self.pixels = Vec::new();
        Ok(())
    }

    fn memory_bytes(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Treats an ordered list of image files as the pages of a document.
pub struct ImagePageRenderer {
    pages: Vec<PathBuf>,
}

impl ImagePageRenderer {
    pub fn new(pages: Vec<PathBuf>) -> Self {
        Self { pages }
    }

    /// Collect every supported image below `dir`, sorted by path.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut pages = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to scan {:?}", dir))?;
            if entry.file_type().is_file() && Self::can_render(entry.path()) {
                pages.push(entry.into_path());
            }
        }
        pages.sort();
        debug!(?dir, pages = pages.len(), "Collected page images");
        Ok(Self::new(pages))
    }

    pub fn pages(&self) -> &[PathBuf] {
        &self.pages
    }

    /// Whether the file extension is one we can decode.
    pub fn can_render(path: &Path) -> bool {
        format_from_extension(path).is_some()
    }

    fn render_path(path: &Path, target: &RenderTarget) -> Result<(u32, u32, Vec<u8>)> {
        let img: DynamicImage =
            image::open(path).with_context(|| format!("Failed to load image: {:?}", path))?;
        let (src_width, src_height) = img.dimensions();
        let (width, height) = fit_within(src_width, src_height, target);

        // Triangle is plenty for previews this small.
        let preview = img.resize_exact(width, height, FilterType::Triangle);
        Ok((width, height, preview.to_rgba8().into_raw()))
    }
}

impl PageRenderer for ImagePageRenderer {
    type Image = PageImage;

    fn render_low_resolution_page(
        &self,
        page_index: PageIndex,
        target: &RenderTarget,
    ) -> Result<PageImage, RenderError> {
        let path = self
            .pages
            .get(page_index as usize)
            .ok_or_else(|| RenderError::backend(page_index, "page out of range"))?;

        let (width, height, pixels) = Self::render_path(path, target)
            .map_err(|e| RenderError::backend(page_index, format!("{:#}", e)))?;

        Ok(PageImage {
            page_index,
            width,
            height,
            pixels,
        })
    }

    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }
}

fn format_from_extension(path: &Path) -> Option<ImageFormat> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "webp" => Some(ImageFormat::WebP),
        "gif" => Some(ImageFormat::Gif),
        "bmp" => Some(ImageFormat::Bmp),
        "tiff" | "tif" => Some(ImageFormat::Tiff),
        _ => None,
    }
}

/// Scale a page to the render resolution, then shrink it into the target box.
///
/// Source images are treated as 72 dpi page sizes, so `zoom` maps them to the
/// requested resolution. Never upscales past the zoomed size.
fn fit_within(src_width: u32, src_height: u32, target: &RenderTarget) -> (u32, u32) {
    if src_width == 0 || src_height == 0 {
        return (target.max_width.max(1), target.max_height.max(1));
    }

    let zoomed_w = src_width as f64 * target.zoom as f64;
    let zoomed_h = src_height as f64 * target.zoom as f64;
    let scale = (target.max_width as f64 / zoomed_w)
        .min(target.max_height as f64 / zoomed_h)
        .min(1.0);

    let width = (zoomed_w * scale).round() as u32;
    let height = (zoomed_h * scale).round() as u32;
    (width.max(1), height.max(1))
}
