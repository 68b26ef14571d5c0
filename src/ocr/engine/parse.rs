use serde_json::{Value, json};

/// Turns tesseract TSV output into `{"words": [{"text", "bbox", "conf"}]}`.
///
/// Only word rows (level 5) with text and a non-negative confidence are kept.
pub(super) fn tsv_to_words(tsv: &str) -> Value {
    let mut words = Vec::new();
    for row in tsv.lines().skip(1) {
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            continue;
        }
        if cols[0].parse::<i32>().unwrap_or(0) != 5 {
            continue;
        }
        let left: f64 = cols[6].parse().unwrap_or(0.0);
        let top: f64 = cols[7].parse().unwrap_or(0.0);
        let width: f64 = cols[8].parse().unwrap_or(0.0);
        let height: f64 = cols[9].parse().unwrap_or(0.0);
        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        words.push(json!({
            "text": text,
            "bbox": [left, top, left + width, top + height],
            "conf": conf,
        }));
    }
    json!({ "words": words })
}
