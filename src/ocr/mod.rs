mod compose;
mod engine;
mod fit;
mod font;
mod inpaint;
mod normalize;
mod overlay;
mod render;
mod text;

use serde::{Deserialize, Serialize};

pub use compose::{ComposeMode, ComposerTuning, Line, compose, group_lines};
pub use engine::{OcrEngine, TesseractEngine, list_tesseract_languages};
pub use fit::{FontFit, WritingDirection, fit_font_size, wrap_to_width};
pub use font::{FontMetrics, ResolvedFont, load_font_metrics, resolve_render_font};
pub use inpaint::{
    ContentAwareInpainter, InpaintMethod, Inpainter, MeanFillInpainter, build_mask, clean_regions,
};
pub use normalize::{NormalizedOcr, OcrShape, normalize};
pub use overlay::{CoordinateMapper, MAX_ROUND_TRIP_ERROR_PX, PageRect, Placement};
pub use render::{TextBlock, TextStyle, draw_text_blocks, layout_text_block, render_bbox_png};

/// Axis-aligned box in image pixels, `(x0, y0)` top-left and `(x1, y1)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) * 0.5
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// True when `inner` lies inside `self`, allowing each edge to overshoot by `tolerance`.
    pub fn contains(&self, inner: &BBox, tolerance: f32) -> bool {
        inner.x0 >= self.x0 - tolerance
            && inner.y0 >= self.y0 - tolerance
            && inner.x1 <= self.x1 + tolerance
            && inner.y1 <= self.y1 + tolerance
    }

    pub fn translate(&self, dx: f32, dy: f32) -> BBox {
        BBox {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
        }
    }

    /// Integer pixel rect clamped to a `width` x `height` image. `None` when nothing is left.
    pub fn to_px(&self, width: u32, height: u32) -> Option<BBoxPx> {
        let x0 = self.x0.floor().clamp(0.0, width as f32) as u32;
        let y0 = self.y0.floor().clamp(0.0, height as f32) as u32;
        let x1 = self.x1.ceil().clamp(0.0, width as f32) as u32;
        let y1 = self.y1.ceil().clamp(0.0, height as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BBoxPx {
            x: x0,
            y: y0,
            w: x1 - x0,
            h: y1 - y0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBoxPx {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBoxPx {
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn offset(&self, dx: u32, dy: u32) -> BBoxPx {
        BBoxPx {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn to_bbox(&self) -> BBox {
        BBox {
            x0: self.x as f32,
            y0: self.y as f32,
            x1: (self.x + self.w) as f32,
            y1: (self.y + self.h) as f32,
        }
    }
}

/// One recognized token or line, in the coordinates of the image handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrItem {
    pub text: String,
    pub bbox: BBox,
    pub score: Option<f32>,
}
