use anyhow::{Context, Result, anyhow};
use printpdf::{BuiltinFont, Image, ImageTransform, Mm, PdfDocument};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

use super::{DocumentBackend, PageImage, PageSource, SpooledPage};
use crate::ocr::PageRect;

const POINTS_PER_INCH: f32 = 72.0;

/// Rasterizes pages with `mutool` or `pdftoppm` and rebuilds an image-only PDF.
#[derive(Debug, Clone, Copy)]
pub struct RasterBackend {
    dpi: u32,
}

impl Default for RasterBackend {
    fn default() -> Self {
        Self { dpi: 200 }
    }
}

impl RasterBackend {
    pub fn new(dpi: u32) -> Self {
        Self { dpi: dpi.max(36) }
    }

    fn px_to_pt(&self, px: u32) -> f32 {
        px as f32 * POINTS_PER_INCH / self.dpi as f32
    }
}

impl DocumentBackend for RasterBackend {
    fn open(&self, source: &Path) -> Result<Arc<dyn PageSource>> {
        let dir = tempdir().with_context(|| "failed to create temp dir for pdf pages")?;
        let dpi = self.dpi.to_string();

        let output = if command_exists("mutool") {
            Command::new("mutool")
                .arg("draw")
                .arg("-r")
                .arg(&dpi)
                .arg("-o")
                .arg(dir.path().join("page-%04d.png"))
                .arg(source)
                .output()
                .with_context(|| "failed to run mutool")?
        } else if command_exists("pdftoppm") {
            Command::new("pdftoppm")
                .arg("-png")
                .arg("-r")
                .arg(&dpi)
                .arg(source)
                .arg(dir.path().join("page"))
                .output()
                .with_context(|| "failed to run pdftoppm")?
        } else {
            return Err(anyhow!(
                "pdf rendering requires mutool or pdftoppm (install mupdf or poppler)"
            ));
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("pdf rasterizer failed: {}", stderr.trim()));
        }

        let mut paths: Vec<_> = fs::read_dir(dir.path())
            .with_context(|| "failed to read rendered pages")?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
            })
            .collect();
        paths.sort();
        tracing::debug!("rasterized {} pages at {} dpi", paths.len(), self.dpi);
        Ok(Arc::new(RasterPages {
            _dir: dir,
            paths,
            backend: *self,
        }))
    }

    fn assemble(&self, pages: &[SpooledPage]) -> Result<Vec<u8>> {
        let first = pages.first().ok_or_else(|| anyhow!("no pages to assemble"))?;
        let (doc, first_page, first_layer) = PdfDocument::new(
            "translated",
            Mm(pt_to_mm(first.page_size.0)),
            Mm(pt_to_mm(first.page_size.1)),
            "Layer 1",
        );
        let needs_font = pages.iter().any(|page| !page.overlays.is_empty());
        let font = if needs_font {
            Some(
                doc.add_builtin_font(BuiltinFont::Helvetica)
                    .map_err(|err| anyhow!("failed to load builtin font: {:?}", err))?,
            )
        } else {
            None
        };

        for (idx, page) in pages.iter().enumerate() {
            let (page_ref, layer_ref) = if idx == 0 {
                (first_page, first_layer)
            } else {
                doc.add_page(
                    Mm(pt_to_mm(page.page_size.0)),
                    Mm(pt_to_mm(page.page_size.1)),
                    format!("Layer {}", idx + 1),
                )
            };
            let layer = doc.get_page(page_ref).get_layer(layer_ref);

            let pixels = page.load_image()?;
            let (width, height) = pixels.dimensions();
            let raw = printpdf::image_crate::RgbImage::from_raw(width, height, pixels.into_raw())
                .ok_or_else(|| anyhow!("page {} has an invalid pixel buffer", idx + 1))?;
            let image = Image::from_dynamic_image(&printpdf::image_crate::DynamicImage::ImageRgb8(raw));
            let dpi = width as f32 * POINTS_PER_INCH / page.placement.width().max(1.0);
            image.add_to_layer(
                layer.clone(),
                ImageTransform {
                    translate_x: Some(Mm(pt_to_mm(page.placement.x0))),
                    translate_y: Some(Mm(pt_to_mm(page.placement.y0))),
                    rotate: None,
                    scale_x: Some(1.0),
                    scale_y: Some(page.placement.height() * dpi / (height as f32 * POINTS_PER_INCH)),
                    dpi: Some(dpi),
                },
            );

            if let Some(font) = &font {
                for overlay in &page.overlays {
                    for (line_idx, line) in overlay.lines.iter().enumerate() {
                        let baseline = overlay.rect.y1
                            - overlay.font_size * 0.9
                            - line_idx as f32 * overlay.line_height;
                        layer.use_text(
                            line.clone(),
                            overlay.font_size,
                            Mm(pt_to_mm(overlay.rect.x0)),
                            Mm(pt_to_mm(baseline)),
                            font,
                        );
                    }
                }
            }
        }

        let mut buffer = Vec::new();
        {
            let mut writer = std::io::BufWriter::new(&mut buffer);
            doc.save(&mut writer).with_context(|| "failed to write pdf")?;
        }
        Ok(buffer)
    }
}

/// Page PNGs written by the rasterizer; removed with the temp dir.
struct RasterPages {
    _dir: TempDir,
    paths: Vec<PathBuf>,
    backend: RasterBackend,
}

impl PageSource for RasterPages {
    fn page_count(&self) -> usize {
        self.paths.len()
    }

    fn load_page(&self, index: usize) -> Result<PageImage> {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| anyhow!("page {} out of range ({} pages)", index + 1, self.paths.len()))?;
        let image = image::open(path)
            .with_context(|| format!("failed to decode rendered page {}", path.display()))?
            .to_rgb8();
        let page_size = (
            self.backend.px_to_pt(image.width()),
            self.backend.px_to_pt(image.height()),
        );
        Ok(PageImage {
            index,
            image,
            placement: PageRect {
                x0: 0.0,
                y0: 0.0,
                x1: page_size.0,
                y1: page_size.1,
            },
            page_size,
        })
    }
}

fn pt_to_mm(pt: f32) -> f32 {
    pt / POINTS_PER_INCH * 25.4
}

fn command_exists(cmd: &str) -> bool {
    let Some(path_var) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path_var).any(|dir| dir.join(cmd).is_file())
}
