use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage};
use serde_json::{Value, json};

use crate::ocr::{BBox, OcrEngine};
use crate::pipeline::{LayoutBox, LayoutClass, LayoutDetector};
use crate::providers::{TextTranslator, TranslateFuture};

/// Horizontal 4px stripes, white and dark, so any repaint is visible.
pub(crate) fn striped_page(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |_, y| {
        if (y / 4) % 2 == 0 {
            Rgb([255, 255, 255])
        } else {
            Rgb([30, 30, 30])
        }
    })
}

fn layout_box(coords: [f32; 4], class: LayoutClass) -> LayoutBox {
    LayoutBox {
        bbox: BBox::new(coords[0], coords[1], coords[2], coords[3]),
        class,
    }
}

pub(crate) enum FakeLayout {
    Plain(Vec<[f32; 4]>),
    TableWithCell { table: [f32; 4], cell: [f32; 4] },
}

impl FakeLayout {
    pub(crate) fn plain(boxes: &[[f32; 4]]) -> Self {
        FakeLayout::Plain(boxes.to_vec())
    }

    /// A table on the full page; its crop (recognized by width) holds one cell.
    pub(crate) fn table_with_cell(table: [f32; 4], cell: [f32; 4]) -> Self {
        FakeLayout::TableWithCell { table, cell }
    }
}

impl LayoutDetector for FakeLayout {
    fn predict(&self, image: &RgbImage) -> Result<Vec<LayoutBox>> {
        match self {
            FakeLayout::Plain(boxes) => Ok(boxes
                .iter()
                .map(|coords| layout_box(*coords, LayoutClass::PlainText))
                .collect()),
            FakeLayout::TableWithCell { table, cell } => {
                if image.width() as f32 == table[2] - table[0] {
                    Ok(vec![layout_box(*cell, LayoutClass::PlainText)])
                } else {
                    Ok(vec![layout_box(*table, LayoutClass::Table)])
                }
            }
        }
    }
}

pub(crate) struct FakeOcr {
    text: String,
    fail_above_height: Option<u32>,
}

impl FakeOcr {
    /// Reads `text` as one word spanning the whole crop.
    pub(crate) fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail_above_height: None,
        }
    }

    pub(crate) fn failing_taller_than(height: u32) -> Self {
        Self {
            text: "Hello".to_string(),
            fail_above_height: Some(height),
        }
    }
}

impl OcrEngine for FakeOcr {
    fn recognize(&self, image: &RgbImage) -> Result<Value> {
        let (width, height) = image.dimensions();
        if self.fail_above_height.is_some_and(|limit| height > limit) {
            return Err(anyhow!("ocr crashed on a {}x{} crop", width, height));
        }
        Ok(json!({
            "words": [{"text": self.text, "bbox": [0, 0, width, height], "conf": 0.98}]
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FakeTranslator {
    Echo,
    Upper,
    Failing,
}

impl FakeTranslator {
    pub(crate) fn echo() -> Self {
        FakeTranslator::Echo
    }

    pub(crate) fn upper() -> Self {
        FakeTranslator::Upper
    }

    pub(crate) fn failing() -> Self {
        FakeTranslator::Failing
    }
}

impl TextTranslator for FakeTranslator {
    fn translate<'a>(&'a self, text: &'a str) -> TranslateFuture<'a> {
        Box::pin(async move {
            match self {
                FakeTranslator::Echo => Ok(text.to_string()),
                FakeTranslator::Upper => Ok(text.to_uppercase()),
                FakeTranslator::Failing => Err(anyhow!("translator unavailable")),
            }
        })
    }
}
