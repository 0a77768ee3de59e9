//! Identifier naming.
//!
//! Turns human titles (often Thai) into SQL identifiers through three tiers:
//!
//! 1. ASCII titles and the offline dictionary.
//! 2. A machine translator, bounded by a timeout and a quality threshold.
//! 3. Transliteration plus a content-hash suffix, which always succeeds.
//!
//! Every result matches `^[a-z_][a-z0-9_]*$`, is at most
//! [`MAX_IDENTIFIER_LEN`] bytes, avoids reserved names, and is absent from
//! the caller's set of names already in use.

mod dictionary;
mod transliterate;
mod translator;

pub use dictionary::Dictionary;
pub use translator::{
    estimate_quality, ArgosTranslator, NameContext, TranslateError, Translation, Translator,
};
pub use transliterate::transliterate;

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::NamingConfig;
use crate::dialect::MAX_IDENTIFIER_LEN;
use crate::error::{MigrateError, Result};

/// Columns every dynamic table carries.
pub const RESERVED_COLUMNS: [&str; 4] = ["id", "parent_id", "created_at", "updated_at"];

/// Prefix of the engine's own scratch columns.
const INTERNAL_PREFIX: &str = "__formsync_";

/// Scratch column used while converting a column's type.
pub(crate) const RETYPE_COLUMN: &str = "__formsync_retype";

const SQL_KEYWORDS: &[&str] = &[
    "all", "alter", "and", "as", "asc", "between", "by", "case", "check", "column",
    "constraint", "create", "cross", "current_date", "current_time", "current_timestamp",
    "default", "delete", "desc", "distinct", "drop", "else", "end", "except", "exists",
    "foreign", "from", "full", "group", "having", "in", "index", "inner", "insert",
    "intersect", "into", "is", "join", "key", "left", "like", "limit", "not", "null",
    "offset", "on", "or", "order", "outer", "primary", "references", "right", "rowid",
    "select", "set", "table", "then", "to", "union", "unique", "update", "user", "using",
    "values", "when", "where", "with",
];

const HASH_SUFFIX_LEN: usize = 6;

static NON_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9]+").expect("valid identifier pattern"));

/// Returns true for names no dynamic identifier may take.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
        || SQL_KEYWORDS.contains(&name)
        || name.starts_with(INTERNAL_PREFIX)
}

/// Returns true if `name` can be used verbatim as a dynamic column or table
/// name.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    !is_reserved(name)
        && name.len() <= MAX_IDENTIFIER_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Which tier produced a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    /// ASCII passthrough or dictionary.
    Dictionary,
    /// Machine translation.
    Translator,
    /// Transliteration fallback.
    Transliteration,
}

/// A resolved identifier and how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    /// The identifier.
    pub identifier: String,
    /// Tier that produced it.
    pub source: NameSource,
}

/// Resolves titles into SQL identifiers.
#[derive(Clone)]
pub struct IdentifierNamer {
    dictionary: Dictionary,
    translator: Option<Arc<dyn Translator>>,
    timeout: Duration,
    min_quality: f64,
}

impl std::fmt::Debug for IdentifierNamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifierNamer")
            .field("dictionary_entries", &self.dictionary.len())
            .field("translator", &self.translator.is_some())
            .field("timeout", &self.timeout)
            .field("min_quality", &self.min_quality)
            .finish()
    }
}

impl Default for IdentifierNamer {
    fn default() -> Self {
        Self::new(Dictionary::builtin())
    }
}

impl IdentifierNamer {
    /// Creates a namer without a translator.
    #[must_use]
    pub fn new(dictionary: Dictionary) -> Self {
        let defaults = NamingConfig::default();
        Self {
            dictionary,
            translator: None,
            timeout: defaults.timeout(),
            min_quality: defaults.min_quality,
        }
    }

    /// Builds a namer from configuration, wiring the Argos client when a
    /// translator URL is set.
    pub fn from_config(config: &NamingConfig) -> Result<Self> {
        let mut namer = Self::new(Dictionary::builtin().with_entries(&config.dictionary));
        namer.timeout = config.timeout();
        namer.min_quality = config.min_quality;
        if let Some(url) = &config.translator_url {
            let client = ArgosTranslator::new(
                url.clone(),
                config.source_lang.clone(),
                config.target_lang.clone(),
                config.timeout(),
            )
            .map_err(|e| MigrateError::Config(e.to_string()))?;
            namer.translator = Some(Arc::new(client));
        }
        Ok(namer)
    }

    /// Sets the translator used by tier 2.
    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Sets the translation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the minimum accepted translation quality.
    #[must_use]
    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    /// Resolves `title` into an identifier not present in `used`.
    pub async fn resolve(&self, title: &str, context: NameContext, used: &HashSet<String>) -> String {
        self.resolve_detailed(title, context, used).await.identifier
    }

    /// Resolves `title` and reports which tier produced the name.
    pub async fn resolve_detailed(
        &self,
        title: &str,
        context: NameContext,
        used: &HashSet<String>,
    ) -> ResolvedName {
        if let Some(name) = self.from_dictionary(title, context) {
            return self.finish(name, NameSource::Dictionary, title, context, used);
        }
        if let Some(name) = self.from_translator(title, context).await {
            return self.finish(name, NameSource::Translator, title, context, used);
        }

        let base = sanitize(&transliterate(title), context)
            .unwrap_or_else(|| context.prefix().to_string());
        let identifier = unique_with_suffix(&base, title, context, used);
        debug!(title, identifier = %identifier, "Named by transliteration");
        ResolvedName {
            identifier,
            source: NameSource::Transliteration,
        }
    }

    fn from_dictionary(&self, title: &str, context: NameContext) -> Option<String> {
        if title.is_ascii() {
            return sanitize(title, context);
        }
        self.dictionary
            .lookup(title)
            .filter(|name| name.is_ascii())
            .and_then(|name| sanitize(&name, context))
    }

    async fn from_translator(&self, title: &str, context: NameContext) -> Option<String> {
        let translator = self.translator.as_ref()?;
        match tokio::time::timeout(self.timeout, translator.translate(title, context)).await {
            Ok(Ok(translation)) if translation.quality >= self.min_quality => {
                sanitize(&translation.text, context)
            }
            Ok(Ok(translation)) => {
                debug!(
                    title,
                    quality = translation.quality,
                    min_quality = self.min_quality,
                    "Translation rejected"
                );
                None
            }
            Ok(Err(e)) => {
                warn!(title, error = %e, "Translator failed, falling back");
                None
            }
            Err(_) => {
                warn!(title, timeout_ms = self.timeout.as_millis(), "Translator timed out, falling back");
                None
            }
        }
    }

    fn finish(
        &self,
        name: String,
        source: NameSource,
        title: &str,
        context: NameContext,
        used: &HashSet<String>,
    ) -> ResolvedName {
        let identifier = if is_available(&name, used) {
            name
        } else {
            unique_with_suffix(&name, title, context, used)
        };
        debug!(title, identifier = %identifier, source = ?source, "Named");
        ResolvedName { identifier, source }
    }
}

fn is_available(name: &str, used: &HashSet<String>) -> bool {
    !is_reserved(name) && !used.contains(name)
}

/// Appends a content-hash suffix, re-deriving with a counter until the name
/// is free.
fn unique_with_suffix(
    base: &str,
    title: &str,
    context: NameContext,
    used: &HashSet<String>,
) -> String {
    let mut salt = 0_u32;
    loop {
        let seed = if salt == 0 {
            title.to_string()
        } else {
            format!("{title}#{salt}")
        };
        let candidate = with_suffix(base, &hash_suffix(&seed), context);
        if is_available(&candidate, used) {
            return candidate;
        }
        salt += 1;
    }
}

fn hash_suffix(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut suffix = hex::encode(digest);
    suffix.truncate(HASH_SUFFIX_LEN);
    suffix
}

fn with_suffix(base: &str, suffix: &str, context: NameContext) -> String {
    let room = MAX_IDENTIFIER_LEN - suffix.len() - 1;
    let mut head = truncate(base, room).trim_end_matches('_').to_string();
    if head.is_empty() {
        head = context.prefix().to_string();
    }
    format!("{head}_{suffix}")
}

/// Lowercases and reduces `raw` to `[a-z0-9_]`, prefixing names that start
/// with a digit and truncating to the identifier limit.
///
/// Returns `None` when nothing usable is left.
#[must_use]
pub fn sanitize(raw: &str, context: NameContext) -> Option<String> {
    let lowered = raw.to_lowercase();
    let replaced = NON_IDENTIFIER.replace_all(&lowered, "_");
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        return None;
    }

    let prefixed = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("{}_{trimmed}", context.prefix())
    } else {
        trimmed.to_string()
    };
    let name = truncate(&prefixed, MAX_IDENTIFIER_LEN).trim_end_matches('_').to_string();
    Some(name)
}

// Identifiers are ASCII by the time they are truncated.
fn truncate(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
