use anyhow::{Context, Result, anyhow};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::process::Command;

use crate::ocr::BBox;

/// Document-layout classes, numbered as the detector model emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutClass {
    Title,
    PlainText,
    Abandon,
    Figure,
    FigureCaption,
    Table,
    TableCaption,
    TableFootnote,
    IsolateFormula,
    FormulaCaption,
    Other,
}

impl LayoutClass {
    pub fn from_id(id: u64) -> Self {
        match id {
            0 => LayoutClass::Title,
            1 => LayoutClass::PlainText,
            2 => LayoutClass::Abandon,
            3 => LayoutClass::Figure,
            4 => LayoutClass::FigureCaption,
            5 => LayoutClass::Table,
            6 => LayoutClass::TableCaption,
            7 => LayoutClass::TableFootnote,
            8 => LayoutClass::IsolateFormula,
            9 => LayoutClass::FormulaCaption,
            _ => LayoutClass::Other,
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "title" => LayoutClass::Title,
            "plain_text" | "text" => LayoutClass::PlainText,
            "abandon" => LayoutClass::Abandon,
            "figure" => LayoutClass::Figure,
            "figure_caption" => LayoutClass::FigureCaption,
            "table" => LayoutClass::Table,
            "table_caption" => LayoutClass::TableCaption,
            "table_footnote" => LayoutClass::TableFootnote,
            "isolate_formula" => LayoutClass::IsolateFormula,
            "formula_caption" => LayoutClass::FormulaCaption,
            _ => LayoutClass::Other,
        }
    }

    pub fn is_text_bearing(&self) -> bool {
        matches!(
            self,
            LayoutClass::Title
                | LayoutClass::PlainText
                | LayoutClass::FigureCaption
                | LayoutClass::Table
                | LayoutClass::TableCaption
                | LayoutClass::TableFootnote
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayoutBox {
    pub bbox: BBox,
    pub class: LayoutClass,
}

pub trait LayoutDetector: Send + Sync {
    fn predict(&self, image: &RgbImage) -> Result<Vec<LayoutBox>>;
}

/// Treats the whole image as one block of plain text.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPageDetector;

impl LayoutDetector for FullPageDetector {
    fn predict(&self, image: &RgbImage) -> Result<Vec<LayoutBox>> {
        let (width, height) = image.dimensions();
        Ok(vec![LayoutBox {
            bbox: BBox::new(0.0, 0.0, width as f32, height as f32),
            class: LayoutClass::PlainText,
        }])
    }
}

/// Runs an external detector: `<program> <args..> <image.png>` printing
/// `[{"bbox": [x0, y0, x1, y1], "class": "title" | 0}, ...]` on stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("layout command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl LayoutDetector for CommandDetector {
    fn predict(&self, image: &RgbImage) -> Result<Vec<LayoutBox>> {
        let mut tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temp file for layout detection")?;
        image
            .write_to(&mut tmp, image::ImageFormat::Png)
            .with_context(|| "failed to write temp image for layout detection")?;
        tmp.flush().ok();

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(tmp.path())
            .output()
            .with_context(|| format!("failed to run layout detector {}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("layout detector failed: {}", stderr.trim()));
        }
        let value: Value = serde_json::from_slice(&output.stdout)
            .with_context(|| "layout detector printed invalid JSON")?;
        parse_layout_json(&value)
    }
}

pub(crate) fn parse_layout_json(value: &Value) -> Result<Vec<LayoutBox>> {
    let entries = value
        .as_array()
        .or_else(|| value.get("boxes").and_then(Value::as_array))
        .ok_or_else(|| anyhow!("layout result is not a list"))?;
    let mut boxes = Vec::with_capacity(entries.len());
    for entry in entries {
        let coords = entry
            .get("bbox")
            .and_then(Value::as_array)
            .filter(|coords| coords.len() == 4)
            .ok_or_else(|| anyhow!("layout entry without a 4-value bbox: {}", entry))?;
        let coords: Vec<f32> = coords
            .iter()
            .map(|v| v.as_f64().map(|v| v as f32))
            .collect::<Option<_>>()
            .ok_or_else(|| anyhow!("layout bbox is not numeric: {}", entry))?;
        let class = match entry.get("class").or_else(|| entry.get("cls")) {
            Some(Value::String(label)) => LayoutClass::from_label(label),
            Some(Value::Number(id)) => id.as_u64().map_or(LayoutClass::Other, LayoutClass::from_id),
            _ => LayoutClass::Other,
        };
        boxes.push(LayoutBox {
            bbox: BBox::new(coords[0], coords[1], coords[2], coords[3]),
            class,
        });
    }
    Ok(boxes)
}

/// Keeps text-bearing boxes, then drops every box that sits inside a larger
/// kept one (within `tolerance` pixels per edge).
pub fn select_text_boxes(boxes: Vec<LayoutBox>, tolerance: f32) -> Vec<LayoutBox> {
    filter_contained(
        boxes
            .into_iter()
            .filter(|b| b.class.is_text_bearing() && b.bbox.area() > 0.0)
            .collect(),
        tolerance,
    )
}

pub fn filter_contained(mut boxes: Vec<LayoutBox>, tolerance: f32) -> Vec<LayoutBox> {
    boxes.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));
    let mut kept: Vec<LayoutBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept
            .iter()
            .any(|outer| outer.bbox.contains(&candidate.bbox, tolerance))
        {
            continue;
        }
        kept.push(candidate);
    }
    kept
}
