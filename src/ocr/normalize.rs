use serde_json::Value;

use super::compose::{ComposeMode, ComposerTuning, compose};
use super::{BBox, OcrItem};

/// Geometry-bearing result layouts produced by the OCR engines we accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrShape {
    /// `{"txts": [...], "boxes": [...], "scores": [...]}`
    Columnar,
    /// `[[[bbox, text, score], ...], elapsed]` or a bare list of entries.
    TupleList,
    /// `{"words": [{"text", "bbox", "conf"}]}` or a list of such objects.
    WordLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedOcr {
    Items { shape: OcrShape, items: Vec<OcrItem> },
    PlainText(String),
}

impl NormalizedOcr {
    pub fn items(&self) -> &[OcrItem] {
        match self {
            NormalizedOcr::Items { items, .. } => items,
            NormalizedOcr::PlainText(_) => &[],
        }
    }

    /// Source text for translation: composed from geometry, or the plain fallback as-is.
    pub fn source_text(&self, mode: ComposeMode, tuning: &ComposerTuning) -> String {
        match self {
            NormalizedOcr::Items { items, .. } => compose(items, mode, tuning),
            NormalizedOcr::PlainText(text) => text.trim().to_string(),
        }
    }
}

type ShapeParser = fn(&Value) -> Option<Vec<OcrItem>>;

const PARSERS: [(OcrShape, ShapeParser); 3] = [
    (OcrShape::Columnar, parse_columnar),
    (OcrShape::TupleList, parse_tuple_list),
    (OcrShape::WordLevel, parse_word_level),
];

/// Converts an engine result into positioned items, trying each known shape
/// in order and falling back to plain text when none match.
pub fn normalize(raw: &Value) -> NormalizedOcr {
    for (shape, parser) in PARSERS {
        if let Some(items) = parser(raw) {
            return NormalizedOcr::Items { shape, items };
        }
    }
    NormalizedOcr::PlainText(plain_text(raw))
}

fn parse_columnar(raw: &Value) -> Option<Vec<OcrItem>> {
    let txts = raw.get("txts")?.as_array()?;
    let boxes = raw.get("boxes")?.as_array()?;
    if txts.len() != boxes.len() {
        return None;
    }
    let scores = raw.get("scores").and_then(Value::as_array);
    let mut items = Vec::with_capacity(txts.len());
    for (idx, (text, bbox)) in txts.iter().zip(boxes).enumerate() {
        let bbox = parse_bbox(bbox)?;
        let score = scores
            .and_then(|scores| scores.get(idx))
            .and_then(Value::as_f64)
            .map(|score| score as f32);
        push_item(&mut items, text.as_str()?, bbox, score);
    }
    Some(items)
}

fn parse_tuple_list(raw: &Value) -> Option<Vec<OcrItem>> {
    let outer = raw.as_array()?;
    let entries = match outer.first() {
        Some(Value::Array(first)) if first.first().is_some_and(is_tuple_entry) => first,
        Some(first) if is_tuple_entry(first) => outer,
        Some(Value::Array(first)) if first.is_empty() => first,
        _ => return None,
    };
    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let parts = entry.as_array()?;
        let bbox = parse_bbox(parts.first()?)?;
        let text = parts.get(1)?.as_str()?;
        let score = parts.get(2).and_then(Value::as_f64).map(|s| s as f32);
        push_item(&mut items, text, bbox, score);
    }
    Some(items)
}

fn is_tuple_entry(value: &Value) -> bool {
    value.as_array().is_some_and(|parts| {
        parts.len() >= 2
            && parts[1].is_string()
            && parts.first().and_then(parse_bbox).is_some()
    })
}

fn parse_word_level(raw: &Value) -> Option<Vec<OcrItem>> {
    let words = match raw {
        Value::Object(map) => map.get("words")?.as_array()?,
        Value::Array(list) if list.first().is_some_and(Value::is_object) => list,
        _ => return None,
    };
    let mut items = Vec::with_capacity(words.len());
    for word in words {
        let text = word.get("text")?.as_str()?;
        let bbox = word.get("bbox").or_else(|| word.get("box"))?;
        let bbox = parse_bbox(bbox)?;
        let score = word
            .get("conf")
            .or_else(|| word.get("score"))
            .and_then(Value::as_f64)
            .map(|s| s as f32);
        push_item(&mut items, text, bbox, score);
    }
    Some(items)
}

fn push_item(items: &mut Vec<OcrItem>, text: &str, bbox: BBox, score: Option<f32>) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    items.push(OcrItem {
        text: text.to_string(),
        bbox,
        score,
    });
}

/// Accepts `[x0, y0, x1, y1]`, a list of corner points, or `{x0, y0, x1, y1}`.
fn parse_bbox(value: &Value) -> Option<BBox> {
    match value {
        Value::Array(parts) if parts.len() == 4 && parts.iter().all(Value::is_number) => {
            let coords: Vec<f32> = parts.iter().filter_map(as_f32).collect();
            (coords.len() == 4).then(|| BBox::new(coords[0], coords[1], coords[2], coords[3]))
        }
        Value::Array(points) if !points.is_empty() && points.iter().all(Value::is_array) => {
            let mut xs = Vec::with_capacity(points.len());
            let mut ys = Vec::with_capacity(points.len());
            for point in points {
                let pair = point.as_array()?;
                xs.push(as_f32(pair.first()?)?);
                ys.push(as_f32(pair.get(1)?)?);
            }
            let x0 = xs.iter().copied().fold(f32::INFINITY, f32::min);
            let y0 = ys.iter().copied().fold(f32::INFINITY, f32::min);
            let x1 = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let y1 = ys.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            Some(BBox::new(x0, y0, x1, y1))
        }
        Value::Object(map) => Some(BBox::new(
            as_f32(map.get("x0")?)?,
            as_f32(map.get("y0")?)?,
            as_f32(map.get("x1")?)?,
            as_f32(map.get("y1")?)?,
        )),
        _ => None,
    }
}

fn as_f32(value: &Value) -> Option<f32> {
    value.as_f64().map(|v| v as f32)
}

fn plain_text(raw: &Value) -> String {
    let mut parts = Vec::new();
    collect_strings(raw, &mut parts);
    parts.join(" ")
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if !text.is_empty() {
                out.push(text.to_string());
            }
        }
        Value::Array(list) => list.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => {
            for key in ["txts", "text", "texts", "words", "lines"] {
                if let Some(v) = map.get(key) {
                    collect_strings(v, out);
                }
            }
        }
        _ => {}
    }
}
