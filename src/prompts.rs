use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Placeholder replaced by the captured selection.
pub const TEXT_MARKER: &str = "{text}";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template '{name}' must contain the {{text}} placeholder")]
    MissingMarker { name: String },
    #[error("template '{name}' contains {{text}} {count} times; exactly one is allowed")]
    RepeatedMarker { name: String, count: usize },
    #[error("template name must not be empty")]
    EmptyName,
}

/// A validated prompt template. Only the registry constructs these.
#[derive(Debug, PartialEq, Eq)]
pub struct PromptTemplate {
    name: String,
    body: String,
}

/// Shared handle returned by [`PromptRegistry::resolve`].
pub type TemplateRef = Arc<PromptTemplate>;

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Result<Self, TemplateError> {
        let name = name.into();
        let body = body.into();
        if name.trim().is_empty() {
            return Err(TemplateError::EmptyName);
        }
        validate_body(&name, &body)?;
        Ok(Self { name, body })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Substitutes `text` at the marker position.
    ///
    /// The marker was checked when the template was authored, but the check
    /// is repeated here so a malformed template can never reach the model.
    pub fn render(&self, text: &str) -> Result<String, TemplateError> {
        validate_body(&self.name, &self.body)?;
        let Some(at) = self.body.find(TEXT_MARKER) else {
            return Err(TemplateError::MissingMarker {
                name: self.name.clone(),
            });
        };

        let mut prompt = String::with_capacity(self.body.len() + text.len());
        prompt.push_str(&self.body[..at]);
        prompt.push_str(text);
        prompt.push_str(&self.body[at + TEXT_MARKER.len()..]);
        Ok(prompt)
    }
}

fn validate_body(name: &str, body: &str) -> Result<(), TemplateError> {
    match body.matches(TEXT_MARKER).count() {
        0 => Err(TemplateError::MissingMarker {
            name: name.to_string(),
        }),
        1 => Ok(()),
        count => Err(TemplateError::RepeatedMarker {
            name: name.to_string(),
            count,
        }),
    }
}

struct RegistryInner {
    templates: Vec<TemplateRef>,
}

impl RegistryInner {
    fn position(&self, name: &str) -> Option<usize> {
        self.templates
            .iter()
            .position(|template| template.name.eq_ignore_ascii_case(name))
    }

    fn names(&self) -> Vec<String> {
        self.templates
            .iter()
            .map(|template| template.name.clone())
            .collect()
    }
}

/// Read-mostly lookup from action name to prompt template.
///
/// Cloning yields another handle onto the same registry. Listeners get the
/// current list of names through [`PromptRegistry::subscribe`] whenever the
/// set of templates changes.
#[derive(Clone)]
pub struct PromptRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    changes: watch::Sender<Vec<String>>,
}

impl PromptRegistry {
    pub fn empty() -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                templates: Vec::new(),
            })),
            changes,
        }
    }

    /// Registry seeded with the built-in actions, in menu order.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        for (name, body) in DEFAULT_PROMPTS {
            if let Err(err) = registry.insert(*name, *body) {
                warn!("Skipping built-in prompt: {}", err);
            }
        }
        registry
    }

    /// Built-ins plus user templates from the config, user entries winning on
    /// name clashes. Invalid user templates are skipped with a warning.
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let registry = Self::with_defaults();
        registry.apply_overrides(overrides);
        registry
    }

    pub fn resolve(&self, name: &str) -> Option<TemplateRef> {
        let inner = self.inner.read().ok()?;
        inner
            .position(name)
            .map(|index| Arc::clone(&inner.templates[index]))
    }

    /// Adds or replaces a template. This is the authoring-time validation point.
    pub fn insert(
        &self,
        name: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), TemplateError> {
        let template = Arc::new(PromptTemplate::new(name, body)?);
        let names = {
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match inner.position(&template.name) {
                Some(index) => inner.templates[index] = template,
                None => inner.templates.push(template),
            }
            inner.names()
        };
        self.changes.send_replace(names);
        Ok(())
    }

    /// Replaces user templates after a config reload; built-ins are kept.
    pub fn apply_overrides(&self, overrides: &BTreeMap<String, String>) {
        let mut applied = 0usize;
        for (name, body) in overrides {
            match self.insert(name.as_str(), body.as_str()) {
                Ok(()) => applied += 1,
                Err(err) => warn!("Ignoring prompt from config: {}", err),
            }
        }
        if applied > 0 {
            info!("📚 Loaded {} custom prompt(s)", applied);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.names())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.templates.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        let rx = self.changes.subscribe();
        debug!(listeners = self.changes.receiver_count(), "Prompt registry subscriber added");
        rx
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub const DEFAULT_PROMPT: &str = "Fix spelling and grammar";

const DEFAULT_PROMPTS: &[(&str, &str)] = &[
    (
        "Fix spelling and grammar",
        "Act as a professional editor. Review and correct any spelling mistakes, grammatical errors, and typos in the text below. Maintain the original meaning, tone, and style:

Text to correct:
{text}

Provide the corrected version only.",
    ),
    (
        "Improve writing quality",
        "Act as an expert writing coach. Enhance the following text to be more professional, concise, and impactful. Focus on:
- Improving clarity and flow
- Removing redundancy
- Strengthening word choice
- Maintaining the original message

Original text:
{text}

Provide the improved version only.",
    ),
    (
        "Make text more polite and friendly",
        "Act as a communication expert. Rewrite the following text to be more approachable and courteous while maintaining professionalism. The tone should be warm but not overly casual:

Original text:
{text}

Provide the polite version only.",
    ),
    (
        "Simplify text",
        "Act as a plain language expert. Rewrite the following text to be easily understood by a general audience. Use:
- Simple words and short sentences
- Clear structure
- Active voice
- Everyday language

Original text:
{text}

Provide the simplified version only.",
    ),
    (
        "Summarize",
        "Act as a professional summarizer. Create a clear, concise summary of the key points from the following text. The summary should be roughly 25% of the original length:

Text to summarize:
{text}

Provide the summary only.",
    ),
    (
        "Analyze and respond",
        "Act as an expert analyst. For the following text:
1. Identify the main points and underlying themes
2. Analyze the context and implications
3. Generate a relevant, thoughtful response

Text to analyze:
{text}

Provide your analysis and response in a clear, structured format.",
    ),
    (
        "Translate to Chinese",
        "Act as a professional translator. Translate the following text into Simplified Chinese (简体中文). Maintain the original meaning and tone while ensuring the translation is natural and culturally appropriate:

Text to translate:
{text}

Provide the Chinese translation only.",
    ),
    (
        "Translate to English",
        "Act as an expert linguist and professional translator. Translate the following text into clear, natural-sounding English. Preserve the original meaning, intent, tone, and paragraph structure. Keep technical terminology accurate.

Source text:
{text}

Provide the English translation only, without explanations or notes.",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_places_text_at_marker_and_keeps_the_rest() {
        let template = PromptTemplate::new("t", "Before {text} after.").unwrap();
        assert_eq!(
            template.render("captured words").unwrap(),
            "Before captured words after."
        );
    }

    #[test]
    fn render_does_not_expand_markers_inside_captured_text() {
        let template = PromptTemplate::new("t", "<{text}>").unwrap();
        assert_eq!(template.render("literal {text}").unwrap(), "<literal {text}>");
    }

    #[test]
    fn rejects_template_without_marker() {
        let err = PromptTemplate::new("broken", "No placeholder here").unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingMarker {
                name: "broken".to_string()
            }
        );
    }

    #[test]
    fn rejects_template_with_two_markers() {
        let err = PromptTemplate::new("twice", "{text} and {text}").unwrap_err();
        assert!(matches!(err, TemplateError::RepeatedMarker { count: 2, .. }));
    }

    #[test]
    fn defaults_are_valid_and_ordered() {
        let registry = PromptRegistry::with_defaults();
        assert_eq!(registry.len(), DEFAULT_PROMPTS.len());
        assert_eq!(registry.names().first().map(String::as_str), Some(DEFAULT_PROMPT));
        assert!(registry.resolve("summarize").is_some());
    }

    #[test]
    fn insert_replaces_existing_name_and_notifies() {
        let registry = PromptRegistry::with_defaults();
        let mut rx = registry.subscribe();
        registry.insert("Summarize", "Short summary: {text}").unwrap();

        assert!(rx.has_changed().unwrap());
        let names = rx.borrow_and_update().clone();
        assert_eq!(names.len(), DEFAULT_PROMPTS.len());
        assert_eq!(
            registry.resolve("Summarize").unwrap().body(),
            "Short summary: {text}"
        );
    }

    #[test]
    fn invalid_overrides_are_skipped() {
        let overrides = BTreeMap::from([
            ("Pirate".to_string(), "Say it like a pirate: {text}".to_string()),
            ("Broken".to_string(), "missing marker".to_string()),
        ]);
        let registry = PromptRegistry::from_overrides(&overrides);
        assert!(registry.resolve("Pirate").is_some());
        assert!(registry.resolve("Broken").is_none());
    }
}
