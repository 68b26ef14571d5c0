use anyhow::{Result, bail};
use serde::Serialize;

use super::BBox;

/// Largest tolerated image-space drift after a page round trip.
pub const MAX_ROUND_TRIP_ERROR_PX: f32 = 2.0;

/// Rectangle in page space (PDF points, origin bottom-left, y up).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PageRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl PageRect {
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Placement {
    pub rect: PageRect,
    pub max_error_px: f32,
}

/// Maps image pixels (origin top-left, y down) onto where the image is drawn
/// on its page. The two axes scale independently.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateMapper {
    placement: PageRect,
    scale_x: f32,
    scale_y: f32,
}

impl CoordinateMapper {
    pub fn new(image_width: u32, image_height: u32, placement: PageRect) -> Result<Self> {
        if image_width == 0 || image_height == 0 {
            bail!("image has no pixels");
        }
        if placement.width() <= 0.0 || placement.height() <= 0.0 {
            bail!("image placement has no area: {:?}", placement);
        }
        Ok(Self {
            placement,
            scale_x: placement.width() / image_width as f32,
            scale_y: placement.height() / image_height as f32,
        })
    }

    pub fn scale_y(&self) -> f32 {
        self.scale_y
    }

    pub fn to_page(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.placement.x0 + x * self.scale_x,
            self.placement.y1 - y * self.scale_y,
        )
    }

    pub fn to_image(&self, px: f32, py: f32) -> (f32, f32) {
        (
            (px - self.placement.x0) / self.scale_x,
            (self.placement.y1 - py) / self.scale_y,
        )
    }

    /// Page rect for an image-space box, with the worst corner round-trip error.
    pub fn place(&self, bbox: &BBox) -> Placement {
        let (px0, py_top) = self.to_page(bbox.x0, bbox.y0);
        let (px1, py_bottom) = self.to_page(bbox.x1, bbox.y1);
        let rect = PageRect {
            x0: px0,
            y0: py_bottom,
            x1: px1,
            y1: py_top,
        };

        let corners = [
            ((bbox.x0, bbox.y0), (rect.x0, rect.y1)),
            ((bbox.x1, bbox.y0), (rect.x1, rect.y1)),
            ((bbox.x0, bbox.y1), (rect.x0, rect.y0)),
            ((bbox.x1, bbox.y1), (rect.x1, rect.y0)),
        ];
        let max_error_px = corners
            .iter()
            .map(|((ix, iy), (px, py))| {
                let (rx, ry) = self.to_image(*px, *py);
                (rx - ix).abs().max((ry - iy).abs())
            })
            .fold(0.0, f32::max);
        if max_error_px > MAX_ROUND_TRIP_ERROR_PX {
            tracing::warn!(
                "overlay placement drifted {:.2}px for box {:?}",
                max_error_px,
                bbox
            );
        }
        Placement { rect, max_error_px }
    }
}
