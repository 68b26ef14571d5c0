mod layout;
mod renderer;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use image::RgbImage;
use image::imageops;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::ocr::{
    BBoxPx, ComposeMode, ComposerTuning, InpaintMethod, OcrEngine, TextBlock, TextStyle,
    clean_regions, draw_text_blocks, layout_text_block, normalize, render_bbox_png,
};
use crate::providers::TextTranslator;

pub use layout::{
    CommandDetector, FullPageDetector, LayoutBox, LayoutClass, LayoutDetector, filter_contained,
    select_text_boxes,
};
pub use renderer::{ImageRegionRenderer, PageContext, PageOutcome, PageRenderer, RenderFuture};

/// Tables are translated by re-running the pipeline on their crop, this deep at most.
pub const MAX_TABLE_DEPTH: usize = 2;

/// Per-job knobs for one page.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub compose_mode: ComposeMode,
    pub tuning: ComposerTuning,
    /// When true the translated text is returned as blocks instead of being drawn.
    pub defer_text: bool,
    pub debug: Option<DebugTarget>,
}

#[derive(Debug, Clone)]
pub struct DebugTarget {
    pub dir: PathBuf,
    pub label: String,
}

/// A text region and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub bbox: BBoxPx,
    pub source_text: String,
    pub translated_text: String,
}

impl Region {
    /// Only regions whose translation actually differs are repainted.
    pub fn needs_repaint(&self) -> bool {
        let translated = self.translated_text.trim();
        !translated.is_empty() && translated != self.source_text.trim()
    }
}

#[derive(Debug, Clone)]
pub struct PageTranslation {
    pub image: RgbImage,
    pub blocks: Vec<TextBlock>,
    pub regions: Vec<Region>,
    pub changed: bool,
}

impl PageTranslation {
    fn unchanged(image: RgbImage, regions: Vec<Region>) -> Self {
        Self {
            image,
            blocks: Vec::new(),
            regions,
            changed: false,
        }
    }

    pub fn regions_translated(&self) -> usize {
        self.regions.iter().filter(|r| r.needs_repaint()).count()
    }
}

type PageFuture<'a> = Pin<Box<dyn Future<Output = Result<PageTranslation>> + Send + 'a>>;

/// Detects text regions in a page image, translates them and paints the
/// translations back in place.
pub struct ImagePipeline {
    layout: Arc<dyn LayoutDetector>,
    ocr: Arc<dyn OcrEngine>,
    style: Arc<TextStyle>,
    inpaint: InpaintMethod,
    containment_tolerance: f32,
    region_concurrency: usize,
}

impl ImagePipeline {
    pub fn new(layout: Arc<dyn LayoutDetector>, ocr: Arc<dyn OcrEngine>, style: TextStyle) -> Self {
        Self {
            layout,
            ocr,
            style: Arc::new(style),
            inpaint: InpaintMethod::default(),
            containment_tolerance: 2.0,
            region_concurrency: num_cpus::get().clamp(1, 8),
        }
    }

    pub fn with_inpaint(mut self, method: InpaintMethod) -> Self {
        self.inpaint = method;
        self
    }

    pub fn with_containment_tolerance(mut self, tolerance: f32) -> Self {
        self.containment_tolerance = tolerance.max(0.0);
        self
    }

    pub fn with_region_concurrency(mut self, concurrency: usize) -> Self {
        self.region_concurrency = concurrency.max(1);
        self
    }

    pub fn style(&self) -> &TextStyle {
        &self.style
    }

    /// Returns the input image untouched when no region needs repainting.
    pub async fn translate_page_image(
        &self,
        image: RgbImage,
        translator: &dyn TextTranslator,
        config: &PipelineConfig,
    ) -> Result<PageTranslation> {
        self.translate_at_depth(image, translator, config, 0).await
    }

    fn translate_at_depth<'a>(
        &'a self,
        image: RgbImage,
        translator: &'a dyn TextTranslator,
        config: &'a PipelineConfig,
        depth: usize,
    ) -> PageFuture<'a> {
        Box::pin(async move {
            let image = Arc::new(image);
            let detector = self.layout.clone();
            let snapshot = image.clone();
            let detected = tokio::task::spawn_blocking(move || detector.predict(&snapshot))
                .await
                .context("layout detection panicked")?;
            let boxes = match detected {
                Ok(boxes) => select_text_boxes(boxes, self.containment_tolerance),
                Err(err) => {
                    tracing::warn!("layout detection failed, page left as is: {:#}", err);
                    Vec::new()
                }
            };
            let (width, height) = image.dimensions();

            let mut tables = Vec::new();
            let mut texts = Vec::new();
            for layout_box in &boxes {
                let Some(bbox) = layout_box.bbox.to_px(width, height) else {
                    continue;
                };
                if layout_box.class == LayoutClass::Table && depth < MAX_TABLE_DEPTH {
                    tables.push(bbox);
                } else {
                    texts.push(bbox);
                }
            }
            tracing::debug!(
                "depth {}: {} text regions, {} tables",
                depth,
                texts.len(),
                tables.len()
            );

            let regions: Vec<Region> = stream::iter(texts)
                .map(|bbox| self.translate_region(image.clone(), bbox, translator, config))
                .buffered(self.region_concurrency)
                .filter_map(|region| async move { region })
                .collect()
                .await;

            let mut nested = Vec::new();
            for bbox in tables {
                let crop = imageops::crop_imm(&*image, bbox.x, bbox.y, bbox.w, bbox.h).to_image();
                match self.translate_at_depth(crop, translator, config, depth + 1).await {
                    Ok(sub) if sub.changed => nested.push((bbox, sub)),
                    Ok(_) => {}
                    Err(err) => tracing::warn!("table at {:?} skipped: {:#}", bbox, err),
                }
            }

            if depth == 0
                && let Some(debug) = &config.debug
            {
                let all: Vec<BBoxPx> = boxes.iter().filter_map(|b| b.bbox.to_px(width, height)).collect();
                if let Err(err) = write_debug(debug, &image, &all, &regions) {
                    tracing::warn!("failed to write debug output: {:#}", err);
                }
            }

            let repaint: Vec<&Region> = regions.iter().filter(|r| r.needs_repaint()).collect();
            let image = Arc::try_unwrap(image).unwrap_or_else(|shared| (*shared).clone());
            if repaint.is_empty() && nested.is_empty() {
                return Ok(PageTranslation::unchanged(image, regions));
            }

            let mut blocks: Vec<TextBlock> = repaint
                .iter()
                .map(|region| layout_text_block(&region.translated_text, region.bbox, &self.style))
                .collect();
            let mask: Vec<BBoxPx> = repaint.iter().map(|region| region.bbox).collect();
            let mut all_regions = regions.clone();
            let tables: Vec<(BBoxPx, RgbImage)> = nested
                .into_iter()
                .map(|(bbox, sub)| {
                    blocks.extend(sub.blocks.iter().map(|block| block.offset(bbox.x, bbox.y)));
                    all_regions.extend(sub.regions.into_iter().map(|region| Region {
                        bbox: region.bbox.offset(bbox.x, bbox.y),
                        ..region
                    }));
                    (bbox, sub.image)
                })
                .collect();

            let style = self.style.clone();
            let method = self.inpaint;
            let defer_text = config.defer_text;
            let painted = tokio::task::spawn_blocking(move || -> Result<(RgbImage, Vec<TextBlock>)> {
                let mut page = image;
                for (bbox, sub) in &tables {
                    imageops::replace(&mut page, sub, bbox.x as i64, bbox.y as i64);
                }
                let page = clean_regions(&page, &mask, method);
                if defer_text {
                    return Ok((page, blocks));
                }
                let page = draw_text_blocks(&page, &blocks, &style)?;
                Ok((page, Vec::new()))
            })
            .await
            .context("region painting panicked")??;

            Ok(PageTranslation {
                image: painted.0,
                blocks: painted.1,
                regions: all_regions,
                changed: true,
            })
        })
    }

    async fn translate_region(
        &self,
        image: Arc<RgbImage>,
        bbox: BBoxPx,
        translator: &dyn TextTranslator,
        config: &PipelineConfig,
    ) -> Option<Region> {
        let ocr = self.ocr.clone();
        let recognized = tokio::task::spawn_blocking(move || {
            let crop = imageops::crop_imm(&*image, bbox.x, bbox.y, bbox.w, bbox.h).to_image();
            ocr.recognize(&crop)
        })
        .await;
        let raw = match recognized {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                tracing::warn!("OCR failed for region {:?}: {:#}", bbox, err);
                return None;
            }
            Err(err) => {
                tracing::warn!("OCR panicked for region {:?}: {}", bbox, err);
                return None;
            }
        };

        let source_text = normalize(&raw).source_text(config.compose_mode, &config.tuning);
        if source_text.trim().is_empty() {
            return None;
        }
        let translated_text = match translator.translate(&source_text).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("translation failed for region {:?}, keeping source: {:#}", bbox, err);
                source_text.clone()
            }
        };
        Some(Region {
            bbox,
            source_text,
            translated_text,
        })
    }
}

fn write_debug(target: &DebugTarget, image: &RgbImage, boxes: &[BBoxPx], regions: &[Region]) -> Result<()> {
    std::fs::create_dir_all(&target.dir)
        .with_context(|| format!("failed to create debug dir: {}", target.dir.display()))?;
    let png = render_bbox_png(image, boxes)?;
    let png_path = target.dir.join(format!("{}.layout.png", target.label));
    std::fs::write(&png_path, png)
        .with_context(|| format!("failed to write {}", png_path.display()))?;
    let json_path = target.dir.join(format!("{}.regions.json", target.label));
    std::fs::write(&json_path, serde_json::to_vec_pretty(regions)?)
        .with_context(|| format!("failed to write {}", json_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeLayout, FakeOcr, FakeTranslator, striped_page};

    fn pipeline(layout: FakeLayout, ocr: FakeOcr) -> ImagePipeline {
        ImagePipeline::new(Arc::new(layout), Arc::new(ocr), TextStyle::default())
            .with_region_concurrency(2)
    }

    #[tokio::test]
    async fn identical_translation_leaves_page_untouched() {
        let page = striped_page(120, 80);
        let pipeline = pipeline(
            FakeLayout::plain(&[[10.0, 10.0, 110.0, 40.0]]),
            FakeOcr::text("Hello"),
        );
        let translator = FakeTranslator::echo();
        let out = pipeline
            .translate_page_image(page.clone(), &translator, &PipelineConfig::default())
            .await
            .unwrap();
        assert!(!out.changed);
        assert_eq!(out.image, page);
        assert_eq!(out.regions.len(), 1);
        assert_eq!(out.regions_translated(), 0);
    }

    #[tokio::test]
    async fn translated_region_is_repainted_and_rest_preserved() {
        let page = striped_page(120, 80);
        let pipeline = pipeline(
            FakeLayout::plain(&[[10.0, 10.0, 110.0, 40.0]]),
            FakeOcr::text("Hello"),
        );
        let translator = FakeTranslator::upper();
        let config = PipelineConfig {
            defer_text: true,
            ..PipelineConfig::default()
        };
        let out = pipeline
            .translate_page_image(page.clone(), &translator, &config)
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(out.regions_translated(), 1);
        assert_eq!(out.blocks.len(), 1);
        assert_eq!(out.blocks[0].text, "HELLO");
        assert_eq!(out.image.get_pixel(5, 70), page.get_pixel(5, 70));
        assert_ne!(out.image.get_pixel(12, 12), page.get_pixel(12, 12));
    }

    #[tokio::test]
    async fn failing_translator_keeps_source_text() {
        let page = striped_page(60, 60);
        let pipeline = pipeline(
            FakeLayout::plain(&[[0.0, 0.0, 60.0, 30.0]]),
            FakeOcr::text("Bonjour"),
        );
        let out = pipeline
            .translate_page_image(page.clone(), &FakeTranslator::failing(), &PipelineConfig::default())
            .await
            .unwrap();
        assert!(!out.changed);
        assert_eq!(out.regions[0].translated_text, "Bonjour");
        assert_eq!(out.image, page);
    }

    #[tokio::test]
    async fn ocr_errors_skip_only_that_region() {
        let page = striped_page(100, 100);
        let pipeline = pipeline(
            FakeLayout::plain(&[[0.0, 0.0, 100.0, 40.0], [0.0, 45.0, 100.0, 95.0]]),
            FakeOcr::failing_taller_than(45),
        );
        let config = PipelineConfig {
            defer_text: true,
            ..PipelineConfig::default()
        };
        let out = pipeline
            .translate_page_image(page, &FakeTranslator::upper(), &config)
            .await
            .unwrap();
        assert_eq!(out.regions.len(), 1);
        assert_eq!(out.regions[0].bbox.y, 0);
    }

    #[tokio::test]
    async fn tables_recurse_and_offset_blocks() {
        let page = striped_page(200, 200);
        let pipeline = pipeline(
            FakeLayout::table_with_cell([50.0, 50.0, 150.0, 150.0], [10.0, 10.0, 90.0, 40.0]),
            FakeOcr::text("cell"),
        );
        let config = PipelineConfig {
            defer_text: true,
            ..PipelineConfig::default()
        };
        let out = pipeline
            .translate_page_image(page, &FakeTranslator::upper(), &config)
            .await
            .unwrap();
        assert!(out.changed);
        assert!(out.blocks.iter().any(|b| b.bbox.x == 60 && b.bbox.y == 60));
    }
}
