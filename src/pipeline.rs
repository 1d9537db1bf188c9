use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::budget::BudgetLedger;
use crate::chat::ChatClient;
use crate::error::GenerationError;
use crate::images::{resolve_keywords, ImageSearcher};
use crate::models::{
    BudgetSnapshot, GenerationRequest, GenerationResult, HistoryEntry, RequestedViews,
};
use crate::schema;

/// Pipeline stage, preserved in errors for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    BudgetCheck,
    Calling,
    Validating,
    Enriching,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::BudgetCheck => f.write_str("budget_check"),
            Stage::Calling => f.write_str("calling"),
            Stage::Validating => f.write_str("validating"),
            Stage::Enriching => f.write_str("enriching"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Conservative fixed estimate for the pre-flight gate; real cost is
    /// unknown before the call.
    pub estimated_call_cost: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry_backoff: Duration,
    pub image_concurrency: usize,
    pub image_stage_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            estimated_call_cost: cfg.llm.estimated_call_cost,
            max_tokens: cfg.llm.max_tokens,
            temperature: cfg.llm.temperature,
            retry_backoff: Duration::from_millis(cfg.llm.retry_backoff_ms),
            image_concurrency: cfg.images.max_concurrent,
            image_stage_timeout: Duration::from_secs(cfg.images.stage_timeout_secs),
        }
    }
}

/// Everything one completed generation hands back to the caller.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub result: GenerationResult,
    /// Audit skeleton; the renderer fills in file metadata.
    pub history: HistoryEntry,
    pub budget: BudgetSnapshot,
    /// Whether the lenient repair pass was needed.
    pub repaired: bool,
}

/// Orchestrates: budget gate → chat call → validate/repair → image
/// enrichment → charge + history skeleton.
pub struct GenerationPipeline {
    chat: Arc<dyn ChatClient>,
    images: Arc<dyn ImageSearcher>,
    ledger: Arc<BudgetLedger>,
    settings: PipelineSettings,
}

impl GenerationPipeline {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        images: Arc<dyn ImageSearcher>,
        ledger: Arc<BudgetLedger>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            chat,
            images,
            ledger,
            settings,
        }
    }

    /// Run one generation to completion with no external cancellation.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.generate_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Main entry point. Cooperative cancellation applies at the two
    /// suspension points (chat call, image fan-out); a completion that
    /// arrived before the cancel was observed is still charged.
    #[instrument(skip(self, request, cancel), fields(
        topic = %request.topic,
        language = %request.target_language,
    ))]
    pub async fn generate_with_cancel(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        validate_request(request)?;
        let views = request.requested_views();

        // Budget gate, then call; the retry re-enters the gate because a
        // retried call is logically a new call.
        let raw = self.call_with_retry(request, views, &cancel).await?;

        // Charge-on-receipt: the provider metered these tokens whether or
        // not the payload validates.
        let budget = self.ledger.consume(raw.usage.total_tokens).await;
        info!(
            total_tokens = raw.usage.total_tokens,
            remaining = budget.remaining,
            "Chat completion received and charged"
        );

        let parsed = schema::parse(&raw.content, views, &request.target_language)?;
        if parsed.repaired {
            warn!("Model output needed the lenient repair pass");
        }

        let enriched = self.enrich(&parsed.result, &cancel).await?;

        let history = HistoryEntry::skeleton(&request.topic, &request.target_language);
        info!(
            sections = enriched.document.sections.len(),
            slides = enriched.slides.len(),
            rows = enriched.table.rows.len(),
            history_id = %history.id,
            "Generation completed"
        );

        Ok(GenerationOutcome {
            result: enriched,
            history,
            budget: self.ledger.snapshot().await,
            repaired: parsed.repaired,
        })
    }

    /// One attempt plus at most one retry on rate-limit or timeout, with
    /// exponential backoff and a fresh budget check per attempt.
    async fn call_with_retry(
        &self,
        request: &GenerationRequest,
        views: RequestedViews,
        cancel: &CancellationToken,
    ) -> Result<crate::chat::RawCompletion, GenerationError> {
        let system_prompt = build_system_prompt();
        let user_prompt = build_user_prompt(request, views);

        let mut attempt: u32 = 0;
        loop {
            // Don't dispatch a new call for a caller that already left.
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled { stage: Stage::Calling });
            }

            if !self.ledger.check_budget(self.settings.estimated_call_cost).await {
                return Err(GenerationError::BudgetExceeded {
                    remaining: self.ledger.remaining().await,
                });
            }

            let outcome = tokio::select! {
                biased;
                res = self.chat.complete(
                    &system_prompt,
                    &user_prompt,
                    self.settings.max_tokens,
                    self.settings.temperature,
                ) => res,
                _ = cancel.cancelled() => {
                    return Err(GenerationError::Cancelled { stage: Stage::Calling });
                }
            };

            match outcome {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_retryable() && attempt == 0 => {
                    let backoff = self.settings.retry_backoff * (1u32 << attempt);
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Chat call failed, retrying once");
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            return Err(GenerationError::Cancelled { stage: Stage::Calling });
                        }
                    }
                }
                Err(e) => return Err(GenerationError::Transport(e)),
            }
        }
    }

    /// Resolve unique keywords and merge URLs back by keyword. Bounded by
    /// its own stage timeout; degradation here is logged, never fatal.
    async fn enrich(
        &self,
        result: &GenerationResult,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled { stage: Stage::Enriching });
        }

        let keywords = result.image_keywords();
        if keywords.is_empty() {
            return Ok(result.clone());
        }

        let lookups = resolve_keywords(
            self.images.as_ref(),
            keywords,
            self.settings.image_concurrency,
        );

        let urls: HashMap<String, String> = tokio::select! {
            biased;
            resolved = tokio::time::timeout(self.settings.image_stage_timeout, lookups) => {
                match resolved {
                    Ok(urls) => urls,
                    Err(_) => {
                        warn!("Image enrichment stage timed out, continuing without images");
                        HashMap::new()
                    }
                }
            }
            _ = cancel.cancelled() => {
                return Err(GenerationError::Cancelled { stage: Stage::Enriching });
            }
        };

        Ok(result.with_images(&urls))
    }
}

fn validate_request(request: &GenerationRequest) -> Result<(), GenerationError> {
    if request.topic.trim().is_empty() {
        return Err(GenerationError::InvalidRequest("topic is empty".into()));
    }
    if request.target_language.trim().is_empty() {
        return Err(GenerationError::InvalidRequest(
            "target language is empty".into(),
        ));
    }
    if request.requested_formats.is_empty() {
        return Err(GenerationError::InvalidRequest(
            "no output formats requested".into(),
        ));
    }
    Ok(())
}

// ============================================================
// Prompt contract
// ============================================================

fn build_system_prompt() -> String {
    r#"You are a professional document writer. Respond with exactly one JSON object and no other text, no code fences, no commentary.

The object must have this exact shape:
{
  "document": {
    "title": "string",
    "author": "string",
    "language": "string (ISO code)",
    "sections": [
      {"heading": "string", "paragraph": "string", "bullets": ["string"], "imageKeyword": "one or two stock-photo search words"}
    ]
  },
  "slides": [
    {"title": "string", "bullets": ["string"], "imageKeyword": "string"}
  ],
  "table": {
    "headers": ["Section", "Key Points", "Image Keyword"],
    "rows": [["section name", "comma-separated key points", "image keyword"]]
  }
}

Rules:
- Every key above is required. Use [] for missing bullets, never null.
- "sections" must contain at least 3 entries with non-empty headings.
- Each table row has exactly 3 cells matching the headers.
- "imageKeyword" is a short concrete noun phrase suitable for stock photo search."#
        .to_string()
}

fn build_user_prompt(request: &GenerationRequest, views: RequestedViews) -> String {
    let mut required = vec!["the full document view"];
    if views.slides {
        required.push("a slide deck of 4 to 8 slides");
    }
    if views.table {
        required.push("the 3-column summary table");
    }

    format!(
        "Write about the topic: {topic}\n\
         Language: {language}\n\
         Required output: {required}.\n\
         Fill every view of the JSON schema; views not listed as required may be brief but must be present.",
        topic = request.topic.trim(),
        language = request.target_language,
        required = required.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentFormat;

    #[test]
    fn test_user_prompt_names_topic_language_and_views() {
        let request = GenerationRequest::new(
            "Renewable Energy",
            "en",
            [DocumentFormat::Pdf, DocumentFormat::Pptx],
        );
        let prompt = build_user_prompt(&request, request.requested_views());

        assert!(prompt.contains("Renewable Energy"));
        assert!(prompt.contains("Language: en"));
        assert!(prompt.contains("slide deck"));
        assert!(!prompt.contains("summary table"));
    }

    #[test]
    fn test_system_prompt_pins_the_json_contract() {
        let prompt = build_system_prompt();
        assert!(prompt.contains("exactly one JSON object"));
        assert!(prompt.contains("\"document\""));
        assert!(prompt.contains("\"slides\""));
        assert!(prompt.contains("\"imageKeyword\""));
        assert!(prompt.contains("Section"));
    }

    #[test]
    fn test_validate_request_rejects_blank_input() {
        let blank_topic = GenerationRequest::new("  ", "en", [DocumentFormat::Pdf]);
        assert!(matches!(
            validate_request(&blank_topic),
            Err(GenerationError::InvalidRequest(_))
        ));

        let no_formats = GenerationRequest::new("Topic", "en", []);
        assert!(matches!(
            validate_request(&no_formats),
            Err(GenerationError::InvalidRequest(_))
        ));
    }
}
