use super::text::is_cjk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritingDirection {
    #[default]
    Horizontal,
    Vertical,
}

/// Integer font-size search bounds, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontFit {
    pub min_size: u32,
    pub max_size: u32,
}

impl Default for FontFit {
    fn default() -> Self {
        Self {
            min_size: 12,
            max_size: 60,
        }
    }
}

const CHAR_WIDTH: f32 = 1.0;
pub(crate) const LINE_HEIGHT: f32 = 1.05;

/// Largest size in `fit` whose estimated wrapped block fits `width` x `height`.
///
/// Each glyph is treated as one em wide. When nothing fits (or the text is
/// empty) the minimum size is returned.
pub fn fit_font_size(
    text: &str,
    width: f32,
    height: f32,
    direction: WritingDirection,
    fit: FontFit,
) -> u32 {
    let min_size = fit.min_size.max(1);
    let max_size = fit.max_size.max(min_size);
    let glyphs = text.trim().chars().count();
    if glyphs == 0 {
        return min_size;
    }
    let (run, across) = match direction {
        WritingDirection::Horizontal => (width, height),
        WritingDirection::Vertical => (height, width),
    };

    let fits = |size: u32| {
        let size = size as f32;
        let per_line = ((run / (size * CHAR_WIDTH)).floor() as usize).max(1);
        let lines = glyphs.div_ceil(per_line);
        lines as f32 * size * LINE_HEIGHT <= across
    };

    let (mut lo, mut hi) = (min_size, max_size);
    let mut best = min_size;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        if fits(mid) {
            best = mid;
            lo = mid + 1;
        } else if mid == 0 {
            break;
        } else {
            hi = mid - 1;
        }
    }
    best
}

/// Greedy wrap using `measure` for the pixel width of a candidate line.
pub fn wrap_to_width(text: &str, max_width: f32, measure: impl Fn(&str) -> f32) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();

    for token in tokenize_text(text) {
        if token == "\n" {
            if !current.trim().is_empty() {
                result.push(current.trim_end().to_string());
            }
            current.clear();
            continue;
        }
        if token == " " {
            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            continue;
        }
        let candidate = format!("{}{}", current, token);
        if measure(candidate.trim_end()) > max_width && !current.trim().is_empty() {
            result.push(current.trim_end().to_string());
            current = token;
        } else {
            current = candidate;
        }
    }
    if !current.trim().is_empty() {
        result.push(current.trim_end().to_string());
    }
    result
}

fn tokenize_text(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch == '\n' || ch.is_whitespace() || is_cjk(ch) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            let token = if ch == '\n' {
                "\n".to_string()
            } else if ch.is_whitespace() {
                " ".to_string()
            } else {
                ch.to_string()
            };
            tokens.push(token);
            continue;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
