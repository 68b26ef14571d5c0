use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ocr::{ComposeMode, ComposerTuning};

pub const JOB_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
    Invalid,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Invalid => "invalid",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// How translated text reaches the output page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Erase the source text and draw the translation into the page image.
    #[default]
    Clean,
    /// Erase the source text and write the translation as PDF text on top.
    Overlay,
}

/// Everything a job needs to run, persisted with it so restarts resume the
/// same work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub version: u32,
    pub file_id: String,
    pub source_lang: String,
    pub target_lang: String,
    pub model: Option<String>,
    pub translate_images: bool,
    pub render_mode: RenderMode,
    pub compose_mode: ComposeMode,
    pub debug: bool,
    pub composer: Option<ComposerTuning>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            version: JOB_CONFIG_VERSION,
            file_id: String::new(),
            source_lang: "en".to_string(),
            target_lang: "zh".to_string(),
            model: None,
            translate_images: true,
            render_mode: RenderMode::default(),
            compose_mode: ComposeMode::default(),
            debug: false,
            composer: None,
        }
    }
}

impl JobConfig {
    pub fn new(file_id: &str, source_lang: &str, target_lang: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version > JOB_CONFIG_VERSION {
            bail!("unsupported job config version {}", self.version);
        }
        let file_id = self.file_id.trim();
        if file_id.is_empty() {
            bail!("file_id is required");
        }
        if file_id.contains(['/', '\\']) || file_id.starts_with('.') {
            bail!("invalid file_id: {}", self.file_id);
        }
        if self.target_lang.trim().is_empty() {
            bail!("target language is required");
        }
        for (name, lang) in [("source_lang", &self.source_lang), ("target_lang", &self.target_lang)] {
            if !is_language_code(lang) {
                bail!("invalid {}: {}", name, lang);
            }
        }
        Ok(())
    }

    pub fn source_file_name(&self) -> String {
        format!("{}.pdf", self.file_id)
    }

    pub fn output_file_name(&self) -> String {
        format!("{}.{}.mono.pdf", self.file_id, self.target_lang)
    }
}

/// Language codes end up in output file names.
fn is_language_code(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 32
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub mono_pdf_path: Option<String>,
    pub total_seconds: f64,
    pub pages: usize,
    pub regions_translated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub stage: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub config: JobConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub owner_token: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(id: String, config: JobConfig, created_at: OffsetDateTime, owner_token: String) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0.0,
            stage: "initializing".to_string(),
            message: None,
            error: None,
            config,
            created_at,
            start_time: None,
            end_time: None,
            owner_token,
            owner: None,
            result: None,
        }
    }

    pub fn is_owned_by(&self, token: Option<&str>) -> bool {
        self.owner_token.is_empty() || token.is_some_and(|token| token == self.owner_token)
    }
}
