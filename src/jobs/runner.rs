use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use super::events::{EventSink, JobEvent};
use super::model::{JobConfig, JobResult};
use crate::document::DocumentBackend;
use crate::ocr::ComposerTuning;
use crate::pipeline::{DebugTarget, PageContext, PageRenderer, PipelineConfig};
use crate::providers::TranslatorFactory;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<JobResult>> + Send>>;

/// Does the actual work of one job. The scheduler owns admission, cancellation
/// and bookkeeping; the runner only produces a result or an error.
pub trait JobRunner: Send + Sync {
    fn run(&self, ctx: JobContext) -> JobFuture;
}

pub struct JobContext {
    pub job_id: String,
    pub config: JobConfig,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub progress: ProgressReporter,
}

#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    sink: Arc<dyn EventSink>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            job_id: job_id.into(),
            sink,
        }
    }

    pub fn report(&self, percent: f32, stage: impl Into<String>) {
        self.sink.publish(&self.job_id, JobEvent::progress(percent, stage));
    }
}

/// Rasterizes the source PDF, renders every page and writes the mono PDF.
#[derive(Clone)]
pub struct PdfJobRunner {
    backend: Arc<dyn DocumentBackend>,
    renderer: Arc<dyn PageRenderer>,
    translators: Arc<dyn TranslatorFactory>,
    tuning: ComposerTuning,
}

impl PdfJobRunner {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        renderer: Arc<dyn PageRenderer>,
        translators: Arc<dyn TranslatorFactory>,
    ) -> Self {
        Self {
            backend,
            renderer,
            translators,
            tuning: ComposerTuning::default(),
        }
    }

    /// Composer ratios used when a job does not override them.
    pub fn with_composer_tuning(mut self, tuning: ComposerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    async fn execute(self, ctx: JobContext) -> Result<JobResult> {
        let started = Instant::now();
        let JobContext {
            job_id,
            config,
            source_path,
            output_dir,
            progress,
        } = ctx;

        progress.report(0.0, "loading document");
        let backend = self.backend.clone();
        let source = source_path.clone();
        let pages = tokio::task::spawn_blocking(move || backend.open(&source))
            .await
            .context("page rasterization panicked")?
            .with_context(|| format!("failed to load {}", source_path.display()))?;

        let translator = self.translators.for_job(&config)?;
        let page_ctx = PageContext {
            translator,
            translate_images: config.translate_images,
            render_mode: config.render_mode,
            pipeline: PipelineConfig {
                compose_mode: config.compose_mode,
                tuning: config.composer.unwrap_or(self.tuning),
                defer_text: false,
                debug: config.debug.then(|| DebugTarget {
                    dir: output_dir.join("debug"),
                    label: config.file_id.clone(),
                }),
            },
        };

        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("failed to create output dir: {}", output_dir.display()))?;
        let spool = tempfile::Builder::new()
            .prefix(".pages-")
            .tempdir_in(&output_dir)
            .with_context(|| format!("failed to create page spool in {}", output_dir.display()))?;

        let total = pages.page_count();
        let mut spooled = Vec::with_capacity(total);
        let mut regions_translated = 0;
        for i in 0..total {
            progress.report(
                100.0 * i as f32 / total as f32,
                format!("translating page {}/{}", i + 1, total),
            );
            let source = pages.clone();
            let page = tokio::task::spawn_blocking(move || source.load_page(i))
                .await
                .context("page decoding panicked")??;
            let outcome = self
                .renderer
                .render(page, &page_ctx)
                .await
                .with_context(|| format!("failed to render page {}", i + 1))?;
            regions_translated += outcome.regions_translated;
            let dir = spool.path().to_path_buf();
            let page = outcome.page;
            spooled.push(
                tokio::task::spawn_blocking(move || page.spool(&dir, i))
                    .await
                    .context("page spooling panicked")??,
            );
        }
        drop(pages);

        progress.report(99.0, "assembling output");
        let backend = self.backend.clone();
        let bytes = tokio::task::spawn_blocking(move || backend.assemble(&spooled))
            .await
            .context("PDF assembly panicked")??;
        drop(spool);

        let output_path = output_dir.join(config.output_file_name());
        tokio::fs::write(&output_path, bytes)
            .await
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        tracing::info!(
            "job {} wrote {} ({} pages, {} regions)",
            job_id,
            output_path.display(),
            total,
            regions_translated
        );

        Ok(JobResult {
            mono_pdf_path: Some(output_path.to_string_lossy().into_owned()),
            total_seconds: started.elapsed().as_secs_f64(),
            pages: total,
            regions_translated,
        })
    }
}

impl JobRunner for PdfJobRunner {
    fn run(&self, ctx: JobContext) -> JobFuture {
        Box::pin(self.clone().execute(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{PageImage, PageSource, RenderedPage, SpooledPage};
    use crate::jobs::EventHub;
    use crate::ocr::PageRect;
    use crate::pipeline::{PageOutcome, RenderFuture};
    use crate::providers::TextTranslator;
    use crate::test_util::{FakeTranslator, striped_page};
    use std::path::Path;
    use std::sync::Mutex;

    /// Counts page decodes.
    struct FakePages {
        pages: usize,
        decoded: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl PageSource for FakePages {
        fn page_count(&self) -> usize {
            self.pages
        }

        fn load_page(&self, index: usize) -> Result<PageImage> {
            self.decoded.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(PageImage {
                index,
                image: striped_page(20, 20),
                placement: PageRect {
                    x0: 0.0,
                    y0: 0.0,
                    x1: 10.0,
                    y1: 10.0,
                },
                page_size: (10.0, 10.0),
            })
        }
    }

    struct FakeBackend {
        pages: usize,
        decoded: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl FakeBackend {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                decoded: Arc::default(),
            }
        }
    }

    impl DocumentBackend for FakeBackend {
        fn open(&self, _source: &Path) -> Result<Arc<dyn PageSource>> {
            Ok(Arc::new(FakePages {
                pages: self.pages,
                decoded: self.decoded.clone(),
            }))
        }

        fn assemble(&self, pages: &[SpooledPage]) -> Result<Vec<u8>> {
            for page in pages {
                assert!(page.path.is_file(), "spooled page missing: {}", page.path.display());
                assert_eq!(page.load_image()?.dimensions(), (20, 20));
            }
            Ok(format!("%PDF {} pages", pages.len()).into_bytes())
        }
    }

    struct CountingRenderer;

    impl PageRenderer for CountingRenderer {
        fn render<'a>(&'a self, page: PageImage, _ctx: &'a PageContext) -> RenderFuture<'a> {
            Box::pin(async move {
                Ok(PageOutcome {
                    page: RenderedPage::unchanged(page),
                    regions_translated: 2,
                })
            })
        }
    }

    struct Fakes;

    impl TranslatorFactory for Fakes {
        fn for_job(&self, _config: &JobConfig) -> Result<Arc<dyn TextTranslator>> {
            Ok(Arc::new(FakeTranslator::upper()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<JobEvent>>);

    impl EventSink for Recorder {
        fn publish(&self, _job_id: &str, event: JobEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn writes_output_and_reports_per_page_progress() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let backend = Arc::new(FakeBackend::new(4));
        let runner = PdfJobRunner::new(
            backend.clone(),
            Arc::new(CountingRenderer),
            Arc::new(Fakes),
        );
        let ctx = JobContext {
            job_id: "job1".into(),
            config: JobConfig::new("paper", "en", "ja"),
            source_path: dir.path().join("paper.pdf"),
            output_dir: dir.path().join("out").join("job1"),
            progress: ProgressReporter::new("job1", recorder.clone()),
        };
        let result = runner.run(ctx).await.unwrap();

        assert_eq!(result.pages, 4);
        assert_eq!(result.regions_translated, 8);
        let path = result.mono_pdf_path.unwrap();
        assert!(path.ends_with("paper.ja.mono.pdf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF 4 pages");
        assert_eq!(backend.decoded.load(std::sync::atomic::Ordering::SeqCst), 4);
        // The page spool is gone once the output is written.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("out").join("job1"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".pages-"))
            .collect();
        assert!(leftovers.is_empty());

        let events = recorder.0.lock().unwrap();
        assert!(events.contains(&JobEvent::progress(50.0, "translating page 3/4")));
        assert_eq!(events.last(), Some(&JobEvent::progress(99.0, "assembling output")));
    }

    #[tokio::test]
    async fn load_failure_is_a_job_error() {
        struct Broken;
        impl DocumentBackend for Broken {
            fn open(&self, _source: &Path) -> Result<Arc<dyn PageSource>> {
                anyhow::bail!("not a pdf")
            }
            fn assemble(&self, _pages: &[SpooledPage]) -> Result<Vec<u8>> {
                unreachable!()
            }
        }
        let runner = PdfJobRunner::new(Arc::new(Broken), Arc::new(CountingRenderer), Arc::new(Fakes));
        let ctx = JobContext {
            job_id: "j".into(),
            config: JobConfig::new("f", "en", "de"),
            source_path: PathBuf::from("/nowhere/f.pdf"),
            output_dir: PathBuf::from("/nowhere/out"),
            progress: ProgressReporter::new("j", Arc::new(EventHub::new())),
        };
        let err = runner.run(ctx).await.unwrap_err();
        assert!(format!("{:#}", err).contains("not a pdf"));
    }
}
