mod raster;

use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ocr::PageRect;

pub use raster::RasterBackend;

/// One rasterized page and where its image sits on the page, in PDF points.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub index: usize,
    pub image: RgbImage,
    pub placement: PageRect,
    pub page_size: (f32, f32),
}

/// Translated text written as real PDF text over the page image.
#[derive(Debug, Clone, PartialEq)]
pub struct TextOverlay {
    pub rect: PageRect,
    pub lines: Vec<String>,
    pub font_size: f32,
    pub line_height: f32,
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub image: RgbImage,
    pub placement: PageRect,
    pub page_size: (f32, f32),
    pub overlays: Vec<TextOverlay>,
}

impl RenderedPage {
    pub fn unchanged(page: PageImage) -> Self {
        Self {
            image: page.image,
            placement: page.placement,
            page_size: page.page_size,
            overlays: Vec::new(),
        }
    }

    /// Writes the page image to `dir` as PNG and keeps only its metadata.
    pub fn spool(self, dir: &Path, index: usize) -> Result<SpooledPage> {
        let path = dir.join(format!("rendered-{:04}.png", index));
        self.image
            .save(&path)
            .with_context(|| format!("failed to spool page {}", path.display()))?;
        Ok(SpooledPage {
            path,
            placement: self.placement,
            page_size: self.page_size,
            overlays: self.overlays,
        })
    }
}

/// A rendered page whose pixels live on disk until assembly.
#[derive(Debug, Clone)]
pub struct SpooledPage {
    pub path: PathBuf,
    pub placement: PageRect,
    pub page_size: (f32, f32),
    pub overlays: Vec<TextOverlay>,
}

impl SpooledPage {
    pub fn load_image(&self) -> Result<RgbImage> {
        Ok(image::open(&self.path)
            .with_context(|| format!("failed to read spooled page {}", self.path.display()))?
            .to_rgb8())
    }
}

/// Pages of an opened document, decoded one at a time.
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;
    fn load_page(&self, index: usize) -> Result<PageImage>;
}

/// Opens a source document as a page source and assembles spooled pages
/// back into a PDF.
pub trait DocumentBackend: Send + Sync {
    fn open(&self, source: &Path) -> Result<Arc<dyn PageSource>>;
    fn assemble(&self, pages: &[SpooledPage]) -> Result<Vec<u8>>;
}
