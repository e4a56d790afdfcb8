//! Two-stage LLM classification over an OpenAI-compatible
//! chat-completion endpoint.
//!
//! All calls pass through a process-wide counting semaphore (default
//! capacity 5) for back-pressure; the current queue depth is exposed
//! for observability. Every response threads its token usage and the
//! server-reported cost back to the caller.

pub mod prompts;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::api::AiSettings;
use crate::models::batch::CreditsProvider;
use crate::models::Confidence;

/// Default cap on concurrent LLM calls.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 5;

const MAX_RETRIES: u32 = 3;
const RETRY_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];
const RETRY_BACKOFF_SECS: f64 = 1.5;

/// Characters of document text handed to the models.
const MAX_CONTENT_CHARS: usize = 6000;
const SPREADSHEET_CONTENT_CHARS: usize = 2500;

const SPARTEN: [&str; 5] = ["courtage", "sach", "leben", "kranken", "sonstige"];

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base, e.g. `https://openrouter.ai/api/v1`.
    pub endpoint: String,
    pub api_key: String,
    pub triage_model: String,
    pub detail_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_concurrent_calls: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            api_key: String::new(),
            triage_model: "openai/gpt-4o-mini".to_string(),
            detail_model: "openai/gpt-4o".to_string(),
            temperature: 0.1,
            max_tokens: 500,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

impl LlmConfig {
    pub fn provider(&self) -> CreditsProvider {
        if self.endpoint.contains("openai.com") {
            CreditsProvider::OpenAi
        } else {
            CreditsProvider::OpenRouter
        }
    }
}

/// Token usage and server-side cost of one or more calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub server_cost_usd: f64,
}

impl Usage {
    fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.server_cost_usd += other.server_cost_usd;
    }
}

/// Constrained output of the Sparte classifiers.
#[derive(Debug, Clone, Deserialize)]
pub struct SparteResult {
    pub sparte: String,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub document_date_iso: Option<String>,
    #[serde(default)]
    pub vu_name: Option<String>,
    #[serde(default)]
    pub document_name: Option<String>,
}

impl SparteResult {
    pub fn confidence(&self) -> Confidence {
        self.confidence
            .as_deref()
            .and_then(Confidence::from_str)
            .unwrap_or(Confidence::Medium)
    }
}

/// Output of the courtage-minimal prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct CourtageResult {
    #[serde(default)]
    pub insurer: Option<String>,
    #[serde(default)]
    pub document_date_iso: Option<String>,
}

/// A classification plus everything the AI-data upsert needs.
#[derive(Debug, Clone)]
pub struct LlmOutcome<T> {
    pub result: T,
    pub usage: Usage,
    pub model: String,
    pub stage: &'static str,
    pub prompt_text: String,
    pub raw_response: String,
}

/// Provider balance snapshot for cost tracking.
#[derive(Debug, Clone)]
pub struct CreditsInfo {
    pub provider: CreditsProvider,
    /// Remaining balance (OpenRouter).
    pub balance: Option<f64>,
    /// Accumulated usage (OpenAI billing, when available).
    pub total_usage: Option<f64>,
}

/// LLM client; clone-cheap, shares semaphore and HTTP pool.
#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    queue_depth: Arc<AtomicUsize>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
        info!(
            "KI-Semaphore initialisiert: max {} parallele Aufrufe",
            config.max_concurrent_calls.max(1)
        );
        Self {
            config,
            client,
            semaphore,
            queue_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Number of calls currently waiting for a semaphore slot.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    fn truncate(text: &str, max_chars: usize) -> &str {
        if text.len() <= max_chars {
            return text;
        }
        let mut end = max_chars;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }

    /// Two-stage Sparte classification: cheap triage, then the detail
    /// model when the configured trigger fires.
    pub async fn classify_sparte_with_date(
        &self,
        text: &str,
        settings: &AiSettings,
    ) -> Result<LlmOutcome<SparteResult>, LlmError> {
        let content = Self::truncate(text, MAX_CONTENT_CHARS);

        let stage1_template = settings
            .stage1_prompt
            .as_deref()
            .unwrap_or(prompts::STAGE1_TRIAGE);
        let stage1_model = settings
            .stage1_model
            .clone()
            .unwrap_or_else(|| self.config.triage_model.clone());
        let stage1_max = settings.stage1_max_tokens.unwrap_or(self.config.max_tokens);

        let prompt = prompts::render(stage1_template, content);
        let (raw, usage) = self.chat(&stage1_model, &prompt, stage1_max).await?;
        let triage = parse_sparte(&raw)?;

        if !settings.stage2_triggers(triage.confidence(), &triage.sparte) {
            debug!("Stufe 1 ausreichend: {} ({:?})", triage.sparte, triage.confidence);
            return Ok(LlmOutcome {
                result: triage,
                usage,
                model: stage1_model,
                stage: "stage1",
                prompt_text: prompt,
                raw_response: raw,
            });
        }

        let stage2_template = settings
            .stage2_prompt
            .as_deref()
            .unwrap_or(prompts::STAGE2_DETAIL);
        let stage2_model = settings
            .stage2_model
            .clone()
            .unwrap_or_else(|| self.config.detail_model.clone());
        let stage2_max = settings.stage2_max_tokens.unwrap_or(self.config.max_tokens);

        let prompt2 = prompts::render(stage2_template, content);
        match self.chat(&stage2_model, &prompt2, stage2_max).await {
            Ok((raw2, usage2)) => {
                let detail = parse_sparte(&raw2)?;
                let mut total = usage;
                total.add(&usage2);
                info!(
                    "Zweistufige Klassifikation: {} -> {}",
                    triage.sparte, detail.sparte
                );
                Ok(LlmOutcome {
                    result: detail,
                    usage: total,
                    model: stage2_model,
                    stage: "stage2",
                    prompt_text: format!("{}\n---\n{}", prompt, prompt2),
                    raw_response: format!("{}\n---\n{}", raw, raw2),
                })
            }
            Err(e) => {
                // Stage 2 is best effort; the triage result stands.
                warn!("Stufe 2 fehlgeschlagen, verwende Triage-Ergebnis: {}", e);
                Ok(LlmOutcome {
                    result: triage,
                    usage,
                    model: stage1_model,
                    stage: "stage1",
                    prompt_text: prompt,
                    raw_response: raw,
                })
            }
        }
    }

    /// Compact insurer+date extraction for documents already known to
    /// be Courtage.
    pub async fn classify_courtage_minimal(
        &self,
        text: &str,
    ) -> Result<LlmOutcome<CourtageResult>, LlmError> {
        let content = Self::truncate(text, MAX_CONTENT_CHARS);
        let prompt = prompts::render(prompts::COURTAGE_MINIMAL, content);
        let model = self.config.triage_model.clone();
        let (raw, usage) = self.chat(&model, &prompt, 200).await?;
        let result: CourtageResult = parse_json(&raw)?;
        Ok(LlmOutcome {
            result,
            usage,
            model,
            stage: "courtage_minimal",
            prompt_text: prompt,
            raw_response: raw,
        })
    }

    /// Sparte classification of tabular content (first rows as text).
    pub async fn classify_spreadsheet(
        &self,
        text: &str,
    ) -> Result<LlmOutcome<SparteResult>, LlmError> {
        let content = Self::truncate(text, SPREADSHEET_CONTENT_CHARS);
        let prompt = prompts::render(prompts::SPREADSHEET, content);
        let model = self.config.triage_model.clone();
        let (raw, usage) = self.chat(&model, &prompt, 200).await?;
        let result = parse_sparte(&raw)?;
        Ok(LlmOutcome {
            result,
            usage,
            model,
            stage: "spreadsheet",
            prompt_text: prompt,
            raw_response: raw,
        })
    }

    /// Provider balance for cost tracking; `None` fields when the
    /// provider does not expose them.
    pub async fn get_credits(&self) -> Result<CreditsInfo, LlmError> {
        let provider = self.config.provider();
        if provider == CreditsProvider::OpenAi {
            // The billing API is unavailable for service accounts.
            return Ok(CreditsInfo { provider, balance: None, total_usage: None });
        }

        let url = format!("{}/credits", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Api(format!("HTTP {}", response.status())));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let total_credits = body["data"]["total_credits"].as_f64();
        let total_usage = body["data"]["total_usage"].as_f64();
        let balance = match (total_credits, total_usage) {
            (Some(credits), Some(used)) => Some(credits - used),
            _ => None,
        };
        Ok(CreditsInfo { provider, balance, total_usage })
    }

    /// One chat completion, gated by the semaphore, with retries on
    /// transient provider errors.
    async fn chat(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<(String, Usage), LlmError> {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        let permit = self.semaphore.acquire().await;
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let _permit = permit.map_err(|_| LlmError::Connection("Semaphore geschlossen".into()))?;

        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let request = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.config.temperature,
            "max_tokens": max_tokens,
            "response_format": { "type": "json_object" },
            "usage": { "include": true },
        });

        let mut attempt = 0;
        let body: Value = loop {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if RETRY_STATUS_CODES.contains(&status) && attempt + 1 < MAX_RETRIES {
                        attempt += 1;
                        let wait = RETRY_BACKOFF_SECS * 2f64.powi(attempt as i32 - 1);
                        warn!("LLM HTTP {}, Retry {}/{}", status, attempt, MAX_RETRIES);
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        continue;
                    }
                    if status >= 400 {
                        let text = response.text().await.unwrap_or_default();
                        return Err(LlmError::Api(format!("HTTP {}: {}", status, text)));
                    }
                    break response
                        .json()
                        .await
                        .map_err(|e| LlmError::Parse(e.to_string()))?;
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    let wait = RETRY_BACKOFF_SECS * 2f64.powi(attempt as i32 - 1);
                    warn!("LLM Verbindungsfehler, Retry {}/{}: {}", attempt, MAX_RETRIES, e);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(e) => return Err(LlmError::Connection(e.to_string())),
            }
        };

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::Parse("Antwort ohne content".into()))?
            .to_string();

        let usage = Usage {
            prompt_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
            server_cost_usd: body["usage"]["cost"].as_f64().unwrap_or(0.0),
        };

        Ok((content, usage))
    }
}

/// Extract the JSON object from a model response that may carry code
/// fences or prose around it.
fn extract_json(raw: &str) -> Result<&str, LlmError> {
    let start = raw
        .find('{')
        .ok_or_else(|| LlmError::Parse("kein JSON in Antwort".into()))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| LlmError::Parse("unvollstaendiges JSON in Antwort".into()))?;
    if end < start {
        return Err(LlmError::Parse("unvollstaendiges JSON in Antwort".into()));
    }
    Ok(&raw[start..=end])
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    serde_json::from_str(extract_json(raw)?).map_err(|e| LlmError::Parse(e.to_string()))
}

/// Parse and normalize a Sparte result; unknown Sparten collapse to
/// `sonstige`.
fn parse_sparte(raw: &str) -> Result<SparteResult, LlmError> {
    let mut result: SparteResult = parse_json(raw)?;
    result.sparte = result.sparte.trim().to_lowercase();
    if !SPARTEN.contains(&result.sparte.as_str()) {
        debug!("Unbekannte Sparte '{}', verwende sonstige", result.sparte);
        result.sparte = "sonstige".to_string();
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_with_fences() {
        let raw = "```json\n{\"sparte\": \"sach\", \"confidence\": \"high\"}\n```";
        let result = parse_sparte(raw).unwrap();
        assert_eq!(result.sparte, "sach");
        assert_eq!(result.confidence(), Confidence::High);
    }

    #[test]
    fn test_parse_sparte_normalizes_unknown() {
        let result = parse_sparte("{\"sparte\": \"Hausverwaltung\"}").unwrap();
        assert_eq!(result.sparte, "sonstige");
        assert_eq!(result.confidence(), Confidence::Medium);
    }

    #[test]
    fn test_parse_sparte_rejects_garbage() {
        assert!(parse_sparte("keine antwort").is_err());
        assert!(parse_sparte("{").is_err());
    }

    #[test]
    fn test_courtage_result_optional_fields() {
        let result: CourtageResult =
            parse_json("{\"insurer\": \"Hanse Merkur\", \"document_date_iso\": null}").unwrap();
        assert_eq!(result.insurer.as_deref(), Some("Hanse Merkur"));
        assert!(result.document_date_iso.is_none());
    }

    #[test]
    fn test_usage_accumulation() {
        let mut total = Usage::default();
        total.add(&Usage { prompt_tokens: 100, completion_tokens: 20, total_tokens: 120, server_cost_usd: 0.001 });
        total.add(&Usage { prompt_tokens: 300, completion_tokens: 50, total_tokens: 350, server_cost_usd: 0.004 });
        assert_eq!(total.total_tokens, 470);
        assert!((total.server_cost_usd - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ä".repeat(4000);
        let truncated = LlmClient::truncate(&text, 5);
        assert!(truncated.len() <= 5);
        assert!(text.starts_with(truncated));
    }

    #[tokio::test]
    async fn test_queue_depth_starts_empty() {
        let client = LlmClient::new(LlmConfig::default());
        assert_eq!(client.queue_depth(), 0);
    }
}
