use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::jobs::JobConfig;

mod openai;
mod retry;

pub use openai::{OpenAiTranslator, OpenAiTranslatorFactory, translation_messages};

pub type TranslateFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Translates one block of source text into the job's target language.
pub trait TextTranslator: Send + Sync {
    fn translate<'a>(&'a self, text: &'a str) -> TranslateFuture<'a>;
}

/// Builds the translator for a job from its languages and model.
pub trait TranslatorFactory: Send + Sync {
    fn for_job(&self, config: &JobConfig) -> Result<Arc<dyn TextTranslator>>;
}
