use serde::{Deserialize, Serialize};

use super::text::{ends_sentence, join_segments, starts_with_bullet};
use super::{BBox, OcrItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeMode {
    #[default]
    Smart,
    Simple,
}

/// Ratios are relative to the median line (or row) height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerTuning {
    pub paragraph_gap: f32,
    pub indent: f32,
    pub word_gap: f32,
}

impl Default for ComposerTuning {
    fn default() -> Self {
        Self {
            paragraph_gap: 1.2,
            indent: 0.8,
            word_gap: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Line {
    pub items: Vec<OcrItem>,
    pub bbox: BBox,
    center_sum: f32,
}

impl Line {
    fn start(item: OcrItem) -> Self {
        Self {
            bbox: item.bbox,
            center_sum: item.bbox.center_y(),
            items: vec![item],
        }
    }

    fn push(&mut self, item: OcrItem) {
        self.bbox = self.bbox.union(&item.bbox);
        self.center_sum += item.bbox.center_y();
        self.items.push(item);
    }

    pub fn center_y(&self) -> f32 {
        self.center_sum / self.items.len().max(1) as f32
    }

    fn row_height(&self) -> f32 {
        median(self.items.iter().map(|item| item.bbox.height())).max(1.0)
    }

    fn text(&self, tuning: &ComposerTuning) -> String {
        let row_height = self.row_height();
        let mut out = String::new();
        let mut prev: Option<&BBox> = None;
        for item in &self.items {
            let token = item.text.trim();
            if token.is_empty() {
                continue;
            }
            out = match prev {
                None => token.to_string(),
                Some(prev) => {
                    let gap = (item.bbox.x0 - prev.x1).max(0.0) / row_height;
                    join_segments(&out, token, Some(gap), tuning.word_gap)
                }
            };
            prev = Some(&item.bbox);
        }
        out
    }

    fn simple_text(&self) -> String {
        self.items
            .iter()
            .map(|item| item.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Groups items into lines by vertical center, lines ordered top to bottom and
/// items within a line left to right.
pub fn group_lines(items: &[OcrItem]) -> Vec<Line> {
    let median_height = median(items.iter().map(|item| item.bbox.height()));
    let tolerance = (0.6 * median_height).max(4.0);

    let mut sorted: Vec<&OcrItem> = items.iter().collect();
    sorted.sort_by(|a, b| {
        a.bbox
            .center_y()
            .total_cmp(&b.bbox.center_y())
            .then(a.bbox.x0.total_cmp(&b.bbox.x0))
    });

    let mut lines: Vec<Line> = Vec::new();
    for item in sorted {
        let center = item.bbox.center_y();
        let nearest = lines
            .iter_mut()
            .map(|line| ((line.center_y() - center).abs(), line))
            .filter(|(distance, _)| *distance <= tolerance)
            .min_by(|a, b| a.0.total_cmp(&b.0));
        match nearest {
            Some((_, line)) => line.push(item.clone()),
            None => lines.push(Line::start(item.clone())),
        }
    }

    for line in &mut lines {
        line.items.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
    }
    lines.sort_by(|a, b| a.center_y().total_cmp(&b.center_y()));
    lines
}

/// Rebuilds readable text from positioned OCR items.
pub fn compose(items: &[OcrItem], mode: ComposeMode, tuning: &ComposerTuning) -> String {
    if items.is_empty() {
        return String::new();
    }
    let lines = group_lines(items);
    match mode {
        ComposeMode::Simple => lines
            .iter()
            .map(Line::simple_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        ComposeMode::Smart => compose_paragraphs(&lines, tuning),
    }
}

fn compose_paragraphs(lines: &[Line], tuning: &ComposerTuning) -> String {
    let line_height = median(lines.iter().map(|line| line.bbox.height())).max(1.0);
    let mut out = String::new();
    let mut prev: Option<(&Line, String)> = None;

    for line in lines {
        let text = line.text(tuning);
        if text.is_empty() {
            continue;
        }
        match &prev {
            None => out.push_str(&text),
            Some((prev_line, prev_text)) => {
                let gap = line.bbox.y0 - prev_line.bbox.y1;
                let indent = line.bbox.x0 - prev_line.bbox.x0;
                let paragraph_break = gap > tuning.paragraph_gap * line_height
                    || starts_with_bullet(&text)
                    || indent > tuning.indent * line_height
                    || ends_sentence(prev_text);
                if paragraph_break {
                    out.push('\n');
                    out.push_str(&text);
                } else {
                    out = join_segments(&out, &text, None, tuning.word_gap);
                }
            }
        }
        prev = Some((line, text));
    }
    out
}

fn median(values: impl Iterator<Item = f32>) -> f32 {
    let mut values: Vec<f32> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f32::total_cmp);
    values[values.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(text: &str, x0: f32, y0: f32, x1: f32, y1: f32) -> OcrItem {
        OcrItem {
            text: text.to_string(),
            bbox: BBox::new(x0, y0, x1, y1),
            score: Some(0.9),
        }
    }

    #[test]
    fn single_line_keeps_word_order() {
        let items = vec![
            item("Rust", 300.0, 10.0, 360.0, 30.0),
            item("Hello", 10.0, 10.0, 80.0, 30.0),
            item("from", 200.0, 11.0, 260.0, 31.0),
            item("world", 100.0, 9.0, 180.0, 29.0),
        ];
        let text = compose(&items, ComposeMode::Smart, &ComposerTuning::default());
        assert_eq!(text, "Hello world from Rust");
        let tokens: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(tokens, ["Hello", "world", "from", "Rust"]);
    }

    #[test]
    fn wrapped_lines_join_into_one_paragraph() {
        let items = vec![
            item("The quick brown", 10.0, 10.0, 200.0, 30.0),
            item("fox jumps", 10.0, 34.0, 140.0, 54.0),
        ];
        let text = compose(&items, ComposeMode::Smart, &ComposerTuning::default());
        assert_eq!(text, "The quick brown fox jumps");
    }

    #[test]
    fn large_gap_starts_new_paragraph() {
        let items = vec![
            item("First block", 10.0, 10.0, 150.0, 30.0),
            item("Second block", 10.0, 80.0, 160.0, 100.0),
        ];
        let text = compose(&items, ComposeMode::Smart, &ComposerTuning::default());
        assert_eq!(text, "First block\nSecond block");
    }

    #[test]
    fn sentence_end_bullet_and_indent_break_paragraphs() {
        let items = vec![
            item("Done.", 10.0, 10.0, 80.0, 30.0),
            item("Next line", 10.0, 34.0, 120.0, 54.0),
            item("• bullet", 10.0, 58.0, 100.0, 78.0),
            item("indented", 60.0, 82.0, 150.0, 102.0),
        ];
        let text = compose(&items, ComposeMode::Smart, &ComposerTuning::default());
        assert_eq!(text, "Done.\nNext line\n• bullet\nindented");
    }

    #[test]
    fn hyphen_across_lines_is_repaired() {
        let items = vec![
            item("an inter-", 10.0, 10.0, 120.0, 30.0),
            item("national event", 10.0, 34.0, 190.0, 54.0),
        ];
        let text = compose(&items, ComposeMode::Smart, &ComposerTuning::default());
        assert_eq!(text, "an international event");
    }

    #[test]
    fn simple_mode_keeps_line_breaks() {
        let items = vec![
            item("a", 10.0, 10.0, 20.0, 30.0),
            item("b", 30.0, 10.0, 40.0, 30.0),
            item("c", 10.0, 34.0, 20.0, 54.0),
        ];
        let text = compose(&items, ComposeMode::Simple, &ComposerTuning::default());
        assert_eq!(text, "a b\nc");
    }

    #[test]
    fn cjk_tokens_join_without_spaces() {
        let items = vec![
            item("日本語の", 10.0, 10.0, 90.0, 30.0),
            item("文章です", 92.0, 10.0, 170.0, 30.0),
        ];
        let text = compose(&items, ComposeMode::Smart, &ComposerTuning::default());
        assert_eq!(text, "日本語の文章です");
    }

    #[test]
    fn empty_input_composes_to_empty_text() {
        assert_eq!(
            compose(&[], ComposeMode::Smart, &ComposerTuning::default()),
            ""
        );
    }
}
