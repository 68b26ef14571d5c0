use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ocr::{ComposerTuning, InpaintMethod};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");
const MIN_MAINTENANCE_INTERVAL: u64 = 60;
const MAX_MAINTENANCE_INTERVAL: u64 = 86_400;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub max_concurrent: usize,
    pub maintenance_enabled: bool,
    pub maintenance_interval_seconds: u64,
    pub maintenance_delete_orphans: bool,
    pub uploads_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub composer: ComposerTuning,
    pub text_color: String,
    pub font_family: Option<String>,
    pub font_path: Option<String>,
    pub min_font_size: u32,
    pub max_font_size: u32,
    pub inpaint: InpaintMethod,
    pub layout_command: Option<String>,
    pub containment_tolerance: f32,
    pub ocr_command: String,
    pub ocr_languages: String,
    pub translator_base_url: Option<String>,
    pub translator_model: Option<String>,
    pub openai_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            maintenance_enabled: true,
            maintenance_interval_seconds: 3600,
            maintenance_delete_orphans: true,
            uploads_dir: PathBuf::from("data/uploads"),
            outputs_dir: PathBuf::from("data/outputs"),
            jobs_dir: PathBuf::from("data/jobs"),
            composer: ComposerTuning::default(),
            text_color: "#231816".to_string(),
            font_family: None,
            font_path: None,
            min_font_size: 12,
            max_font_size: 60,
            inpaint: InpaintMethod::default(),
            layout_command: None,
            containment_tolerance: 2.0,
            ocr_command: "tesseract".to_string(),
            ocr_languages: "eng".to_string(),
            translator_base_url: None,
            translator_model: None,
            openai_api_key: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    scheduler: Option<SchedulerSettings>,
    maintenance: Option<MaintenanceSettings>,
    paths: Option<PathSettings>,
    composer: Option<ComposerSettings>,
    render: Option<RenderSettings>,
    layout: Option<LayoutSettings>,
    ocr: Option<OcrSettings>,
    translator: Option<TranslatorSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerSettings {
    max_concurrent: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct MaintenanceSettings {
    enabled: Option<bool>,
    interval_seconds: Option<u64>,
    delete_orphans: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PathSettings {
    uploads: Option<String>,
    outputs: Option<String>,
    jobs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ComposerSettings {
    paragraph_gap: Option<f32>,
    indent: Option<f32>,
    word_gap: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct RenderSettings {
    text_color: Option<String>,
    font_family: Option<String>,
    font_path: Option<String>,
    min_font_size: Option<u32>,
    max_font_size: Option<u32>,
    inpaint: Option<InpaintMethod>,
}

#[derive(Debug, Default, Deserialize)]
struct LayoutSettings {
    command: Option<String>,
    containment_tolerance: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct OcrSettings {
    command: Option<String>,
    languages: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslatorSettings {
    base_url: Option<String>,
    model: Option<String>,
}

/// Loads settings from the working directory, the home settings directory and
/// `extra_path`, later files winning, then applies environment overrides.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let home = home_dir();
    if let Some(home) = home.as_deref() {
        ensure_home_settings_file(home)?;
    }
    let mut settings = load_settings_from(Path::new("."), home.as_deref(), extra_path)?;
    settings.apply_env(|name| std::env::var(name).ok());
    Ok(settings)
}

pub(crate) fn load_settings_from(
    cwd: &Path,
    home: Option<&Path>,
    extra_path: Option<&Path>,
) -> Result<Settings> {
    let mut settings = Settings::default();

    let mut ordered_paths = vec![cwd.join("settings.toml"), cwd.join("settings.local.toml")];
    if let Some(home) = home {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings.merge(parsed);
        }
    }

    Ok(settings)
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(scheduler) = incoming.scheduler {
            if let Some(cap) = scheduler.max_concurrent {
                if cap > 0 {
                    self.max_concurrent = cap;
                }
            }
        }
        if let Some(maintenance) = incoming.maintenance {
            if let Some(enabled) = maintenance.enabled {
                self.maintenance_enabled = enabled;
            }
            if let Some(interval) = maintenance.interval_seconds {
                self.maintenance_interval_seconds =
                    interval.clamp(MIN_MAINTENANCE_INTERVAL, MAX_MAINTENANCE_INTERVAL);
            }
            if let Some(delete) = maintenance.delete_orphans {
                self.maintenance_delete_orphans = delete;
            }
        }
        if let Some(paths) = incoming.paths {
            for (value, target) in [
                (paths.uploads, &mut self.uploads_dir),
                (paths.outputs, &mut self.outputs_dir),
                (paths.jobs, &mut self.jobs_dir),
            ] {
                if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                    *target = PathBuf::from(value);
                }
            }
        }
        if let Some(composer) = incoming.composer {
            for (value, target) in [
                (composer.paragraph_gap, &mut self.composer.paragraph_gap),
                (composer.indent, &mut self.composer.indent),
                (composer.word_gap, &mut self.composer.word_gap),
            ] {
                if let Some(value) = value.filter(|v| *v > 0.0) {
                    *target = value;
                }
            }
        }
        if let Some(render) = incoming.render {
            if let Some(color) = render.text_color {
                if !color.trim().is_empty() {
                    self.text_color = color;
                }
            }
            if let Some(family) = render.font_family {
                if !family.trim().is_empty() {
                    self.font_family = Some(family);
                }
            }
            if let Some(path) = render.font_path {
                if !path.trim().is_empty() {
                    self.font_path = Some(path);
                }
            }
            if let Some(size) = render.min_font_size.filter(|size| *size > 0) {
                self.min_font_size = size;
            }
            if let Some(size) = render.max_font_size.filter(|size| *size > 0) {
                self.max_font_size = size;
            }
            if self.max_font_size < self.min_font_size {
                self.max_font_size = self.min_font_size;
            }
            if let Some(method) = render.inpaint {
                self.inpaint = method;
            }
        }
        if let Some(layout) = incoming.layout {
            if let Some(command) = layout.command {
                self.layout_command = Some(command).filter(|c| !c.trim().is_empty());
            }
            if let Some(tolerance) = layout.containment_tolerance {
                if tolerance >= 0.0 {
                    self.containment_tolerance = tolerance;
                }
            }
        }
        if let Some(ocr) = incoming.ocr {
            if let Some(command) = ocr.command {
                if !command.trim().is_empty() {
                    self.ocr_command = command;
                }
            }
            if let Some(languages) = ocr.languages {
                if !languages.trim().is_empty() {
                    self.ocr_languages = languages;
                }
            }
        }
        if let Some(translator) = incoming.translator {
            if let Some(url) = translator.base_url {
                if !url.trim().is_empty() {
                    self.translator_base_url = Some(url);
                }
            }
            if let Some(model) = translator.model {
                if !model.trim().is_empty() {
                    self.translator_model = Some(model);
                }
            }
        }
    }

    /// Environment variables win over every settings file.
    pub(crate) fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(cap) = var("MAX_CONCURRENT_TRANSLATIONS").and_then(|v| v.parse::<usize>().ok()) {
            if cap > 0 {
                self.max_concurrent = cap;
            }
        }
        if let Some(enabled) = var("MAINTENANCE_ENABLED").and_then(|v| parse_bool(&v)) {
            self.maintenance_enabled = enabled;
        }
        if let Some(interval) = var("MAINTENANCE_INTERVAL_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            self.maintenance_interval_seconds =
                interval.clamp(MIN_MAINTENANCE_INTERVAL, MAX_MAINTENANCE_INTERVAL);
        }
        if let Some(delete) = var("MAINTENANCE_DELETE_ORPHANS").and_then(|v| parse_bool(&v)) {
            self.maintenance_delete_orphans = delete;
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.translator_base_url = Some(url);
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn ensure_home_settings_file(home: &Path) -> Result<()> {
    fs::create_dir_all(home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".pdf-translator-rust"))
        }
    })
}
