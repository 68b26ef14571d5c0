use anyhow::{Context, Result, anyhow, bail};
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

pub mod document;
pub mod jobs;
pub mod logging;
pub mod ocr;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod settings;
#[cfg(test)]
mod test_util;

use document::RasterBackend;
use jobs::{
    Admission, EventHub, JobConfig, JobStatus, JsonFileStore, PdfJobRunner, RenderMode, Scheduler,
    SchedulerConfig,
};
use ocr::{ComposeMode, FontFit, TesseractEngine, TextStyle};
use pipeline::{CommandDetector, FullPageDetector, ImagePipeline, ImageRegionRenderer, LayoutDetector};
use providers::OpenAiTranslatorFactory;
use settings::Settings;

/// One command-line translation.
#[derive(Debug, Clone)]
pub struct Config {
    pub data: String,
    pub lang: String,
    pub source_lang: String,
    pub model: Option<String>,
    pub overlay: bool,
    pub simple_compose: bool,
    pub no_images: bool,
    pub debug: bool,
    pub settings_path: Option<String>,
}

/// Translates `config.data` through a local scheduler and returns the output path.
pub async fn run(config: Config) -> Result<String> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let settings = settings::load_settings(settings_path)?;

    let source = Path::new(config.data.trim());
    if !source.is_file() {
        bail!("input file not found: {}", source.display());
    }
    let lang = config.lang.trim();
    if lang.is_empty() {
        return Err(anyhow!("target language is empty"));
    }

    let file_id = uuid::Uuid::new_v4().simple().to_string();
    let mut job = JobConfig::new(&file_id, config.source_lang.trim(), lang);
    job.model = config.model.clone();
    job.translate_images = !config.no_images;
    job.debug = config.debug;
    if config.overlay {
        job.render_mode = RenderMode::Overlay;
    }
    if config.simple_compose {
        job.compose_mode = ComposeMode::Simple;
    }

    std::fs::create_dir_all(&settings.uploads_dir).with_context(|| {
        format!("failed to create upload dir: {}", settings.uploads_dir.display())
    })?;
    let upload = settings.uploads_dir.join(job.source_file_name());
    std::fs::copy(source, &upload)
        .with_context(|| format!("failed to copy {} to {}", source.display(), upload.display()))?;

    let scheduler = build_scheduler(&settings)?;
    let submission = scheduler.submit(job, OffsetDateTime::now_utc(), Some("cli".to_string()))?;
    if submission.status == Admission::Invalid {
        bail!("source file disappeared before the job started");
    }
    tracing::info!("job {} {:?}", submission.job_id, submission.status);

    let finished = scheduler.wait_for(&submission.job_id).await?;
    scheduler.flush_store();
    match finished.status {
        JobStatus::Completed => finished
            .result
            .and_then(|result| result.mono_pdf_path)
            .ok_or_else(|| anyhow!("job finished without an output file")),
        JobStatus::Error => Err(anyhow!(
            "translation failed: {}",
            finished.error.unwrap_or_default()
        )),
        other => Err(anyhow!("translation ended as {}", other.as_str())),
    }
}

/// Text style for repainted regions. Falls back to size estimates when no
/// usable font is found.
pub fn build_text_style(settings: &Settings) -> TextStyle {
    let fit = FontFit {
        min_size: settings.min_font_size,
        max_size: settings.max_font_size.max(settings.min_font_size),
    };
    let resolved = ocr::resolve_render_font(
        settings.font_path.as_deref().map(Path::new),
        settings.font_family.as_deref(),
    );
    match resolved {
        Ok(resolved) => TextStyle {
            text_color: settings.text_color.clone(),
            font_family: Some(resolved.family),
            font: Some(resolved.metrics),
            fit,
        },
        Err(err) => {
            tracing::warn!("no render font, text widths are estimated: {:#}", err);
            TextStyle {
                text_color: settings.text_color.clone(),
                font_family: settings.font_family.clone(),
                font: None,
                fit,
            }
        }
    }
}

pub fn build_pipeline(settings: &Settings) -> Result<ImagePipeline> {
    let layout: Arc<dyn LayoutDetector> = match settings.layout_command.as_deref() {
        Some(command) => Arc::new(CommandDetector::new(command)?),
        None => Arc::new(FullPageDetector),
    };
    let ocr = TesseractEngine::new(&settings.ocr_command, &settings.ocr_languages)?;
    Ok(ImagePipeline::new(layout, Arc::new(ocr), build_text_style(settings))
        .with_inpaint(settings.inpaint)
        .with_containment_tolerance(settings.containment_tolerance))
}

/// Wires the store, event hub and PDF runner into a scheduler.
pub fn build_scheduler(settings: &Settings) -> Result<Scheduler> {
    let store = JsonFileStore::open(&settings.jobs_dir)?;
    let translators = OpenAiTranslatorFactory::new(
        settings.openai_api_key.clone(),
        settings.translator_base_url.clone().unwrap_or_default(),
        settings.translator_model.clone().unwrap_or_default(),
    );
    let runner = PdfJobRunner::new(
        Arc::new(RasterBackend::default()),
        Arc::new(ImageRegionRenderer::new(build_pipeline(settings)?)),
        Arc::new(translators),
    )
    .with_composer_tuning(settings.composer);
    Ok(Scheduler::new(
        SchedulerConfig {
            max_concurrent: settings.max_concurrent,
            uploads_dir: settings.uploads_dir.clone(),
            outputs_dir: settings.outputs_dir.clone(),
        },
        Arc::new(store),
        Arc::new(EventHub::new()),
        Arc::new(runner),
    ))
}
