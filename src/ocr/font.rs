use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::{Face, name_id};
use usvg::fontdb;

use super::text::is_cjk;

const FALLBACK_FAMILIES: &[&str] = &[
    "Noto Sans CJK JP",
    "Noto Sans",
    "DejaVu Sans",
    "Liberation Sans",
    "sans-serif",
];

/// Parsed face data used to measure and embed the drawing font.
#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    family: Option<String>,
    face_index: u32,
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("units_per_em", &self.units_per_em)
            .finish()
    }
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

pub struct ResolvedFont {
    pub metrics: FontMetrics,
    pub family: String,
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(data, None)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

/// Picks the font for repainted text: an explicit file, a named system family,
/// then the built-in fallback list.
pub fn resolve_render_font(font_path: Option<&Path>, font_family: Option<&str>) -> Result<ResolvedFont> {
    if let Some(path) = font_path {
        let metrics = load_font_metrics(path)?;
        let family = metrics
            .family()
            .or(font_family)
            .unwrap_or("sans-serif")
            .to_string();
        return Ok(ResolvedFont { metrics, family });
    }

    let mut db = fontdb::Database::new();
    db.load_system_fonts();

    if let Some(family) = font_family {
        return load_from_family(&db, family);
    }
    FALLBACK_FAMILIES
        .iter()
        .find_map(|family| load_from_family(&db, family).ok())
        .ok_or_else(|| anyhow!("no usable system font found"))
}

pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font
        && let Ok(face) = Face::parse(&font.data, font.face_index)
    {
        let advance: u32 = text
            .chars()
            .filter(|ch| *ch != '\n')
            .map(|ch| {
                face.glyph_index(ch)
                    .filter(|_| ch != ' ')
                    .and_then(|glyph| face.glyph_hor_advance(glyph))
                    .unwrap_or(font.space_advance) as u32
            })
            .sum();
        return advance as f32 * (font_size / font.units_per_em.max(1) as f32);
    }
    text.chars().map(estimate_char_units).sum::<f32>() * font_size
}

fn estimate_char_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if is_cjk(ch) {
        1.0
    } else {
        0.9
    }
}

fn load_font_metrics_from_data(data: Vec<u8>, preferred_family: Option<&str>) -> Result<FontMetrics> {
    let data = Arc::new(data);
    let mut fallback = None;
    let count = ttf_parser::fonts_in_collection(&data).unwrap_or(1);
    for index in 0..count {
        let Ok(face) = Face::parse(&data, index) else {
            continue;
        };
        let family = extract_family_name(&face);
        let units_per_em = face.units_per_em().max(1);
        let space_advance = face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 2);
        let matches_preferred = match (preferred_family, &family) {
            (Some(preferred), Some(found)) => found.eq_ignore_ascii_case(preferred),
            _ => false,
        };
        let metrics = FontMetrics {
            data: data.clone(),
            units_per_em,
            space_advance,
            family,
            face_index: index,
        };
        if matches_preferred {
            return Ok(metrics);
        }
        if fallback.is_none() {
            fallback = Some(metrics);
        }
    }
    fallback.ok_or_else(|| anyhow!("failed to parse font data"))
}

fn load_from_family(db: &fontdb::Database, family: &str) -> Result<ResolvedFont> {
    let families = if family.eq_ignore_ascii_case("sans-serif") {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let data = db
        .with_face_data(id, |data, _| data.to_vec())
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    let metrics = load_font_metrics_from_data(data, Some(family))?;
    let resolved = metrics.family().unwrap_or(family).to_string();
    Ok(ResolvedFont {
        metrics,
        family: resolved,
    })
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
