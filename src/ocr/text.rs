pub(crate) fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3000..=0x303F
            | 0x3040..=0x30FF
            | 0x31F0..=0x31FF
            | 0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xAC00..=0xD7AF
            | 0xF900..=0xFAFF
            | 0xFF00..=0xFFEF
    )
}

pub(crate) fn is_closing_punct(ch: char) -> bool {
    matches!(
        ch,
        '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']' | '}' | '%' | '\'' | '"' | '”' | '’' | '»'
    )
}

pub(crate) fn is_opening_bracket(ch: char) -> bool {
    matches!(ch, '(' | '[' | '{' | '“' | '‘' | '«')
}

pub(crate) fn is_sentence_end(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '。' | '！' | '？' | '…')
}

pub(crate) fn starts_with_bullet(text: &str) -> bool {
    let mut chars = text.trim_start().chars();
    match chars.next() {
        Some('•' | '●' | '○' | '◦' | '▪' | '■' | '□' | '‣' | '⁃' | '・') => true,
        Some('-' | '*' | '–' | '—') => chars.next().is_some_and(char::is_whitespace),
        _ => false,
    }
}

fn is_wordy(ch: char) -> bool {
    ch.is_alphanumeric() && !is_cjk(ch)
}

fn last_char(text: &str) -> Option<char> {
    text.chars().rev().find(|ch| !ch.is_whitespace())
}

fn first_char(text: &str) -> Option<char> {
    text.chars().find(|ch| !ch.is_whitespace())
}

/// Joins two text segments with the separator the scripts call for.
///
/// `gap` is the horizontal distance between the segments relative to the
/// row height; `None` for segments on different lines.
pub(crate) fn join_segments(left: &str, right: &str, gap: Option<f32>, word_gap: f32) -> String {
    let left_trimmed = left.trim_end();
    let right_trimmed = right.trim_start();
    let (Some(a), Some(b)) = (last_char(left_trimmed), first_char(right_trimmed)) else {
        return format!("{}{}", left_trimmed, right_trimmed);
    };

    if a == '-' && b.is_alphabetic() {
        let stem = &left_trimmed[..left_trimmed.len() - 1];
        if last_char(stem).is_some_and(char::is_alphabetic) {
            return format!("{}{}", stem, right_trimmed);
        }
    }
    if is_cjk(a) || is_cjk(b) || is_closing_punct(b) || is_opening_bracket(a) {
        return format!("{}{}", left_trimmed, right_trimmed);
    }
    if let Some(gap) = gap
        && is_wordy(a)
        && is_wordy(b)
        && gap < word_gap
    {
        return format!("{}{}", left_trimmed, right_trimmed);
    }
    format!("{} {}", left_trimmed, right_trimmed)
}

pub(crate) fn ends_sentence(text: &str) -> bool {
    last_char(text).is_some_and(is_sentence_end)
}
