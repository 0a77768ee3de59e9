//! Machine translation provider.
//!
//! The engine talks to an Argos Translate HTTP service. Any failure here is
//! soft: the naming service falls back to transliteration.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What kind of identifier is being named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameContext {
    /// A form, naming its table.
    Form,
    /// A field, naming its column.
    Field,
    /// A sub-form or other action target.
    Action,
}

impl NameContext {
    /// Prefix used when a name would otherwise start with a digit or be empty.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::Field => "field",
            Self::Action => "action",
        }
    }
}

/// A translated title with a quality estimate in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    /// Translated text.
    pub text: String,
    /// Estimated quality.
    pub quality: f64,
}

/// Translation failures.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// The service asked us to slow down.
    #[error("translator rate limited")]
    RateLimited,

    /// The service answered with an error status.
    #[error("translator returned HTTP {0}")]
    Status(u16),

    /// Transport failure.
    #[error("translator request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A source of machine translations.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translates `text` for use as an identifier of the given kind.
    async fn translate(
        &self,
        text: &str,
        context: NameContext,
    ) -> Result<Translation, TranslateError>;
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    from_lang: &'a str,
    to_lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(default)]
    translated: String,
    #[serde(default)]
    success: bool,
}

/// Client for an Argos Translate service exposing `POST /translate`.
#[derive(Debug, Clone)]
pub struct ArgosTranslator {
    client: reqwest::Client,
    base_url: String,
    from_lang: String,
    to_lang: String,
}

impl ArgosTranslator {
    /// Creates a client for the service at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        from_lang: impl Into<String>,
        to_lang: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TranslateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            from_lang: from_lang.into(),
            to_lang: to_lang.into(),
        })
    }
}

#[async_trait]
impl Translator for ArgosTranslator {
    async fn translate(
        &self,
        text: &str,
        context: NameContext,
    ) -> Result<Translation, TranslateError> {
        let url = format!("{}/translate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&TranslateRequest {
                text,
                from_lang: &self.from_lang,
                to_lang: &self.to_lang,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TranslateError::RateLimited);
        }
        if !status.is_success() {
            return Err(TranslateError::Status(status.as_u16()));
        }

        let body: TranslateResponse = response.json().await?;
        let quality = estimate_quality(text, &body.translated, body.success);
        debug!(
            context = ?context,
            translated = %body.translated,
            quality,
            "Translation received"
        );
        Ok(Translation {
            text: body.translated,
            quality,
        })
    }
}

/// Scores a translation.
///
/// Zero when the service reported failure, returned nothing, or echoed the
/// input. Otherwise the share of ASCII letters, digits and spaces in the
/// output, since anything else is lost when the text becomes an identifier.
#[must_use]
pub fn estimate_quality(original: &str, translated: &str, success: bool) -> f64 {
    let translated = translated.trim();
    if !success || translated.is_empty() || translated == original.trim() {
        return 0.0;
    }
    let total = translated.chars().count();
    let usable = translated
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = usable as f64 / total as f64;
    ratio
}
