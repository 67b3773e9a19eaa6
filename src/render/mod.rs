//! Page renderer seam.
//!
//! The thumbnail pipeline never rasterizes pages itself; it calls a
//! `PageRenderer` bound to one open document.

pub mod image_pages;

pub use image_pages::{ImagePageRenderer, PageImage};

use crate::config::ThumbnailConfig;
use crate::error::RenderError;
use crate::thumbnails::Dispose;
use crate::PageIndex;

/// Output parameters for a low-resolution render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTarget {
    pub dpi: u32,
    pub zoom: f32,
    /// Bounding box the preview has to fit in.
    pub max_width: u32,
    pub max_height: u32,
}

impl RenderTarget {
    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self {
            dpi: config.target_dpi,
            zoom: config.target_zoom(),
            max_width: config.target_width,
            max_height: config.target_height,
        }
    }
}

/// Renders low-resolution page previews for one document.
///
/// Called from up to `max_concurrency` worker threads at once.
pub trait PageRenderer: Send + Sync + 'static {
    type Image: Dispose + Send + Sync + 'static;

    fn render_low_resolution_page(
        &self,
        page_index: PageIndex,
        target: &RenderTarget,
    ) -> Result<Self::Image, RenderError>;

    /// Number of pages in the document.
    fn page_count(&self) -> u32;
}
