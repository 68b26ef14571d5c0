use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{ImagePipeline, PipelineConfig};
use crate::document::{PageImage, RenderedPage, TextOverlay};
use crate::jobs::RenderMode;
use crate::ocr::{CoordinateMapper, TextBlock};
use crate::providers::TextTranslator;

pub type RenderFuture<'a> = Pin<Box<dyn Future<Output = Result<PageOutcome>> + Send + 'a>>;

/// What a job hands to the renderer for each page.
pub struct PageContext {
    pub translator: Arc<dyn TextTranslator>,
    pub translate_images: bool,
    pub render_mode: RenderMode,
    pub pipeline: PipelineConfig,
}

pub struct PageOutcome {
    pub page: RenderedPage,
    pub regions_translated: usize,
}

/// Produces the translated content of one page. The job runner only talks to
/// this interface, so other page strategies can be swapped in.
pub trait PageRenderer: Send + Sync {
    fn render<'a>(&'a self, page: PageImage, ctx: &'a PageContext) -> RenderFuture<'a>;
}

/// Translates text regions found in the page image.
pub struct ImageRegionRenderer {
    pipeline: ImagePipeline,
}

impl ImageRegionRenderer {
    pub fn new(pipeline: ImagePipeline) -> Self {
        Self { pipeline }
    }
}

impl PageRenderer for ImageRegionRenderer {
    fn render<'a>(&'a self, page: PageImage, ctx: &'a PageContext) -> RenderFuture<'a> {
        Box::pin(async move {
            if !ctx.translate_images {
                return Ok(PageOutcome {
                    page: RenderedPage::unchanged(page),
                    regions_translated: 0,
                });
            }
            let mut config = ctx.pipeline.clone();
            config.defer_text = ctx.render_mode == RenderMode::Overlay;
            if let Some(debug) = config.debug.as_mut() {
                debug.label = format!("{}-page-{:03}", debug.label, page.index + 1);
            }

            let PageImage {
                index,
                image,
                placement,
                page_size,
            } = page;
            let (width, height) = image.dimensions();
            let translated = self
                .pipeline
                .translate_page_image(image, ctx.translator.as_ref(), &config)
                .await?;
            let regions_translated = translated.regions_translated();

            let overlays = if translated.blocks.is_empty() {
                Vec::new()
            } else {
                let mapper = CoordinateMapper::new(width, height, placement)?;
                translated
                    .blocks
                    .iter()
                    .map(|block| place_block(&mapper, block))
                    .collect()
            };
            tracing::debug!(
                "page {}: {} regions translated, {} overlays",
                index + 1,
                regions_translated,
                overlays.len()
            );

            Ok(PageOutcome {
                page: RenderedPage {
                    image: translated.image,
                    placement,
                    page_size,
                    overlays,
                },
                regions_translated,
            })
        })
    }
}

fn place_block(mapper: &CoordinateMapper, block: &TextBlock) -> TextOverlay {
    let placed = mapper.place(&block.bbox.to_bbox());
    TextOverlay {
        rect: placed.rect,
        lines: block.lines.clone(),
        font_size: block.font_size * mapper.scale_y(),
        line_height: block.line_height * mapper.scale_y(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{PageRect, TextStyle};
    use crate::test_util::{FakeLayout, FakeOcr, FakeTranslator, striped_page};

    fn page() -> PageImage {
        PageImage {
            index: 0,
            image: striped_page(200, 100),
            placement: PageRect {
                x0: 0.0,
                y0: 0.0,
                x1: 100.0,
                y1: 50.0,
            },
            page_size: (100.0, 50.0),
        }
    }

    fn renderer() -> ImageRegionRenderer {
        ImageRegionRenderer::new(ImagePipeline::new(
            Arc::new(FakeLayout::plain(&[[20.0, 10.0, 180.0, 50.0]])),
            Arc::new(FakeOcr::text("Hello")),
            TextStyle::default(),
        ))
    }

    #[tokio::test]
    async fn overlay_mode_maps_blocks_to_page_space() {
        let ctx = PageContext {
            translator: Arc::new(FakeTranslator::upper()),
            translate_images: true,
            render_mode: RenderMode::Overlay,
            pipeline: PipelineConfig::default(),
        };
        let outcome = renderer().render(page(), &ctx).await.unwrap();
        assert_eq!(outcome.regions_translated, 1);
        let overlay = &outcome.page.overlays[0];
        assert_eq!(
            overlay.rect,
            PageRect {
                x0: 10.0,
                y0: 25.0,
                x1: 90.0,
                y1: 45.0,
            }
        );
        assert_eq!(overlay.lines, ["HELLO"]);
    }

    #[tokio::test]
    async fn unchanged_page_has_no_overlays() {
        let ctx = PageContext {
            translator: Arc::new(FakeTranslator::echo()),
            translate_images: true,
            render_mode: RenderMode::Overlay,
            pipeline: PipelineConfig::default(),
        };
        let source = page();
        let outcome = renderer().render(source.clone(), &ctx).await.unwrap();
        assert_eq!(outcome.regions_translated, 0);
        assert!(outcome.page.overlays.is_empty());
        assert_eq!(outcome.page.image, source.image);
    }

    #[tokio::test]
    async fn image_translation_can_be_switched_off() {
        let ctx = PageContext {
            translator: Arc::new(FakeTranslator::upper()),
            translate_images: false,
            render_mode: RenderMode::Clean,
            pipeline: PipelineConfig::default(),
        };
        let source = page();
        let outcome = renderer().render(source.clone(), &ctx).await.unwrap();
        assert_eq!(outcome.regions_translated, 0);
        assert_eq!(outcome.page.image, source.image);
    }
}
