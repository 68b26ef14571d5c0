use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{ImageFormat, RgbImage};
use resvg::render;
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use super::fit::{FontFit, LINE_HEIGHT, WritingDirection, fit_font_size, wrap_to_width};
use super::font::{FontMetrics, measure_text_width_px};
use super::BBoxPx;

#[derive(Debug, Clone)]
pub struct TextStyle {
    pub text_color: String,
    pub font_family: Option<String>,
    pub font: Option<FontMetrics>,
    pub fit: FontFit,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            text_color: "#231816".to_string(),
            font_family: None,
            font: None,
            fit: FontFit::default(),
        }
    }
}

/// Translated text laid out inside its source region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextBlock {
    pub bbox: BBoxPx,
    pub text: String,
    pub lines: Vec<String>,
    pub font_size: f32,
    pub line_height: f32,
}

impl TextBlock {
    pub fn offset(&self, dx: u32, dy: u32) -> TextBlock {
        TextBlock {
            bbox: self.bbox.offset(dx, dy),
            ..self.clone()
        }
    }
}

pub fn layout_text_block(text: &str, bbox: BBoxPx, style: &TextStyle) -> TextBlock {
    let font_size = fit_font_size(
        text,
        bbox.w as f32,
        bbox.h as f32,
        WritingDirection::Horizontal,
        style.fit,
    ) as f32;
    let mut lines = wrap_to_width(text, bbox.w as f32, |line| {
        measure_text_width_px(line, font_size, style.font.as_ref())
    });
    if lines.is_empty() {
        lines.push(text.trim().to_string());
    }
    TextBlock {
        bbox,
        text: text.to_string(),
        lines,
        font_size,
        line_height: font_size * LINE_HEIGHT,
    }
}

/// Draws `blocks` onto a copy of `image`, each clipped to its own region.
pub fn draw_text_blocks(image: &RgbImage, blocks: &[TextBlock], style: &TextStyle) -> Result<RgbImage> {
    if blocks.is_empty() {
        return Ok(image.clone());
    }
    let (width, height) = image.dimensions();
    let mut svg = svg_with_background(image)?;
    let font_family = style
        .font_family
        .as_deref()
        .or_else(|| style.font.as_ref().and_then(|m| m.family()));

    for (idx, block) in blocks.iter().enumerate() {
        let BBoxPx { x, y, w, h } = block.bbox;
        let clip_id = format!("clip-{}", idx);
        svg.push_str(&format!(
            r#"<clipPath id="{id}"><rect x="{x}" y="{y}" width="{w}" height="{h}"/></clipPath>"#,
            id = clip_id,
            x = x,
            y = y,
            w = w,
            h = h.max(block.line_height.ceil() as u32),
        ));
        let family_attr = font_family
            .map(|family| format!(r#" font-family="{}""#, escape_xml(family)))
            .unwrap_or_default();
        svg.push_str(&format!(
            r#"<text x="{x}" y="{y}" font-size="{size}" fill="{color}"{family} clip-path="url(#{clip})">"#,
            x = x,
            y = y as f32 + block.font_size * 0.9,
            size = block.font_size,
            color = escape_xml(&style.text_color),
            family = family_attr,
            clip = clip_id
        ));
        for (line_idx, line) in block.lines.iter().enumerate() {
            let escaped = escape_xml(line);
            if line_idx == 0 {
                svg.push_str(&escaped);
            } else {
                svg.push_str(&format!(
                    r#"<tspan x="{x}" dy="{dy}">{text}</tspan>"#,
                    x = x,
                    dy = block.line_height,
                    text = escaped
                ));
            }
        }
        svg.push_str("</text>");
    }
    svg.push_str("</svg>");

    let font_data = style.font.as_ref().map(FontMetrics::data);
    let rgba = rasterize(&svg, font_data)?;
    if rgba.dimensions() != (width, height) {
        return Err(anyhow!(
            "rendered size {:?} differs from page size {:?}",
            rgba.dimensions(),
            (width, height)
        ));
    }
    Ok(image::DynamicImage::ImageRgba8(rgba).to_rgb8())
}

/// PNG of `image` with every box outlined, for debug output.
pub fn render_bbox_png(image: &RgbImage, boxes: &[BBoxPx]) -> Result<Vec<u8>> {
    let mut svg = svg_with_background(image)?;
    for BBoxPx { x, y, w, h } in boxes {
        svg.push_str(&format!(
            r##"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="none" stroke="#00c853" stroke-width="2"/>"##,
        ));
    }
    svg.push_str("</svg>");
    let rgba = rasterize(&svg, None)?;
    let mut bytes = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .with_context(|| "failed to encode debug overlay")?;
    Ok(bytes)
}

fn svg_with_background(image: &RgbImage) -> Result<String> {
    let (width, height) = image.dimensions();
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .with_context(|| "failed to encode page image")?;
    let data_uri = format!("data:image/png;base64,{}", BASE64.encode(&png));
    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    ));
    svg.push_str(&format!(
        r#"<image href="{uri}" xlink:href="{uri}" x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="none"/>"#,
        uri = data_uri,
        w = width,
        h = height
    ));
    Ok(svg)
}

fn rasterize(svg: &str, font_data: Option<&[u8]>) -> Result<image::RgbaImage> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    if let Some(data) = font_data {
        db.load_font_data(data.to_vec());
    }
    let options = Options {
        fontdb: Arc::new(db),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    let mut pixmap_mut = pixmap.as_mut();
    render(&tree, tiny_skia::Transform::identity(), &mut pixmap_mut);
    image::RgbaImage::from_raw(size.width(), size.height(), pixmap.take())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
