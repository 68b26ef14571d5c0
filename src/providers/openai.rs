use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::retry::{RetryPolicy, retry_after};
use super::{TextTranslator, TranslateFuture, TranslatorFactory};
use crate::jobs::JobConfig;

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat-completions translator for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiTranslator {
    client: reqwest::Client,
    key: String,
    base_url: String,
    model: String,
    target_lang: String,
    retry: RetryPolicy,
}

impl OpenAiTranslator {
    pub fn new(key: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            key: key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            target_lang: target_lang.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    async fn complete(&self, text: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": translation_messages(&self.target_lang, text),
            "temperature": 0,
        });

        let mut attempt = 0usize;
        let mut delay = self.retry.base_delay;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.key)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("failed to reach {}", url))?;

            let status = response.status();
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            if status.is_success() {
                return extract_chat_text(&text);
            }
            if self.retry.should_retry(attempt, status, &text) {
                delay = self.retry.wait(attempt, delay, retry_after).await;
                continue;
            }
            return Err(anyhow!(
                "translation API error ({}): {}",
                status,
                extract_openai_error(&text).unwrap_or(text)
            ));
        }
    }
}

impl TextTranslator for OpenAiTranslator {
    fn translate<'a>(&'a self, text: &'a str) -> TranslateFuture<'a> {
        Box::pin(async move {
            if text.trim().is_empty() {
                return Ok(String::new());
            }
            self.complete(text).await
        })
    }
}

/// Chat messages asking for a bare translation of `text` into `target_lang`.
pub fn translation_messages(target_lang: &str, text: &str) -> Value {
    json!([
        {
            "role": "system",
            "content": "You are a professional, authentic machine translation engine.",
        },
        {
            "role": "user",
            "content": format!(
                ";; Treat next line as plain text input and translate it into {}, output translation ONLY. \
                 If translation is unnecessary (e.g. proper nouns, codes, {{{{1}}}}, etc.), return the original text. \
                 NO explanations. NO notes. When a line break splits a single word, join the broken word. \
                 Keep line breaks only where the target language has a natural semantic division. Input:\n\n{}",
                target_lang, text
            ),
        }
    ])
}

fn extract_chat_text(body: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct ChatResponse {
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: ChatMessage,
    }

    #[derive(Deserialize)]
    struct ChatMessage {
        content: Option<String>,
    }

    let payload: ChatResponse =
        serde_json::from_str(body).with_context(|| "failed to parse translation response JSON")?;
    payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| anyhow!("no translation returned"))
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ApiError>,
    }

    #[derive(Deserialize)]
    struct ApiError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let error = serde_json::from_str::<ErrorBody>(body).ok()?.error?;
    let detail = [error.kind, error.code]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    match (error.message, detail.is_empty()) {
        (Some(message), true) => Some(message),
        (Some(message), false) => Some(format!("{} ({})", message, detail)),
        (None, false) => Some(detail),
        (None, true) => None,
    }
}

/// Creates one translator per job, keyed by the job's target language and model.
#[derive(Debug, Clone)]
pub struct OpenAiTranslatorFactory {
    key: Option<String>,
    base_url: String,
    default_model: String,
}

impl OpenAiTranslatorFactory {
    pub fn new(key: Option<String>, base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            key: key.filter(|key| !key.trim().is_empty()),
            base_url: base_url.into(),
            default_model: default_model.into(),
        }
    }
}

impl TranslatorFactory for OpenAiTranslatorFactory {
    fn for_job(&self, config: &JobConfig) -> Result<Arc<dyn TextTranslator>> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
        let model = config
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let translator = OpenAiTranslator::new(key, config.target_lang.clone())
            .with_base_url(self.base_url.clone())
            .with_model(model);
        Ok(Arc::new(translator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_json_snapshot;

    #[test]
    fn extracts_first_choice_content() {
        let body = r#"{"model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":" Bonjour \n"}}]}"#;
        assert_eq!(extract_chat_text(body).unwrap(), "Bonjour");
        assert!(extract_chat_text(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn formats_api_errors() {
        let body = r#"{"error":{"message":"Invalid key","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(
            extract_openai_error(body).as_deref(),
            Some("Invalid key (invalid_request_error, invalid_api_key)")
        );
        assert_eq!(extract_openai_error("not json"), None);
    }

    #[test]
    fn prompt_messages_snapshot() {
        let messages = translation_messages("ja", "Hello");
        assert_json_snapshot!(messages[0], @r#"
        {
          "content": "You are a professional, authentic machine translation engine.",
          "role": "system"
        }
        "#);
        let user = messages[1]["content"].as_str().unwrap_or_default();
        assert!(user.contains("translate it into ja"));
        assert!(user.contains("{{1}}"));
        assert!(user.ends_with("Input:\n\nHello"));
    }

    #[tokio::test]
    async fn blank_input_skips_the_network() {
        let translator = OpenAiTranslator::new("key", "fr").with_base_url("http://127.0.0.1:9");
        assert_eq!(translator.translate("  \n").await.unwrap(), "");
    }

    #[test]
    fn factory_requires_a_key() {
        let factory = OpenAiTranslatorFactory::new(None, DEFAULT_BASE_URL, DEFAULT_MODEL);
        let config = JobConfig::new("file", "en", "fr");
        assert!(factory.for_job(&config).is_err());
    }
}
