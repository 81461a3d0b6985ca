use regex::Regex;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

static THINK_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think block regex"));

#[derive(Debug, Error)]
pub enum GenError {
    #[error("could not reach the generation service: {0}")]
    Connection(String),
    #[error("generation service answered with HTTP {0}")]
    Status(u16),
    #[error("generation service returned an unexpected payload: {0}")]
    MalformedResponse(String),
    #[error("generation request timed out after {0:?}")]
    Timeout(Duration),
}

/// Text generation seam used by the controller.
///
/// One call is one attempt; implementations do not retry.
pub trait GenerationClient: Send + Sync + 'static {
    fn generate(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, GenError>> + Send;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    generate_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| anyhow::anyhow!("Failed to build HTTP client: {err}"))?;
        Ok(Self {
            http,
            generate_url: generate_url(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.generate_url
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> GenError {
        if err.is_timeout() {
            GenError::Timeout(timeout)
        } else if err.is_decode() {
            GenError::MalformedResponse(err.to_string())
        } else {
            GenError::Connection(err.to_string())
        }
    }
}

impl GenerationClient for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<String, GenError> {
        let started = Instant::now();
        debug!(
            endpoint = self.generate_url.as_str(),
            model,
            prompt_chars = prompt.len(),
            "Sending generation request"
        );

        let response = self
            .http
            .post(&self.generate_url)
            .timeout(timeout)
            .json(&GenerateRequest {
                model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|err| Self::classify(err, timeout))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(GenError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|err| Self::classify(err, timeout))?;
        let text = extract_response_text(&body)?;

        info!(
            model,
            chars = text.len(),
            "🤖 Generation finished in {:.0} ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(text)
    }
}

fn generate_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/api/generate") {
        trimmed.to_string()
    } else if let Some(root) = trimmed.strip_suffix("/api") {
        format!("{root}/api/generate")
    } else {
        format!("{trimmed}/api/generate")
    }
}

fn extract_response_text(body: &str) -> Result<String, GenError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| GenError::MalformedResponse(format!("invalid JSON: {err}")))?;
    value
        .get("response")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GenError::MalformedResponse("missing `response` field".to_string()))
}

/// Strips reasoning blocks and surrounding whitespace from model output.
pub fn clean_generated_text(raw: &str) -> String {
    THINK_BLOCK_REGEX.replace_all(raw, "").trim().to_string()
}
