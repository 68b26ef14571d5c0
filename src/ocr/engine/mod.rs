mod parse;
mod tesseract;

use anyhow::{Context, Result};
use image::RgbImage;
use serde_json::Value;
use std::io::Write;

pub use tesseract::list_tesseract_languages;

/// Recognizes text in one region crop. The result shape is engine specific and
/// goes through `normalize` before use.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &RgbImage) -> Result<Value>;
}

/// Runs the `tesseract` CLI and reports word-level boxes.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    command: String,
    languages: String,
    psm: u32,
}

impl TesseractEngine {
    pub fn new(command: &str, languages: &str) -> Result<Self> {
        let languages = tesseract::normalize_ocr_languages(command, languages)?;
        Ok(Self {
            command: command.to_string(),
            languages,
            psm: 6,
        })
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&self, image: &RgbImage) -> Result<Value> {
        let mut tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temp file for OCR")?;
        image
            .write_to(&mut tmp, image::ImageFormat::Png)
            .with_context(|| "failed to write temp image for OCR")?;
        tmp.flush().ok();

        let tsv = tesseract::run_tesseract_tsv(&self.command, tmp.path(), &self.languages, self.psm)?;
        Ok(parse::tsv_to_words(&tsv))
    }
}
