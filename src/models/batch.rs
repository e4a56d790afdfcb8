//! Result types for single-document and batch processing runs.

use serde::{Deserialize, Serialize};

use super::document::BoxType;

/// Outcome of classifying one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub document_id: i64,
    pub original_filename: String,
    pub success: bool,
    pub target_box: BoxType,
    pub category: Option<String>,
    pub new_filename: Option<String>,
    pub error: Option<String>,
    /// Server-reported AI cost attributed to this document.
    pub cost_usd: f64,
}

impl ProcessingResult {
    pub fn failed(document_id: i64, original_filename: String, error: String) -> Self {
        Self {
            document_id,
            original_filename,
            success: false,
            target_box: BoxType::Sonstige,
            category: None,
            new_filename: None,
            error: Some(error),
            cost_usd: 0.0,
        }
    }
}

/// AI cost provider the batch ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditsProvider {
    OpenRouter,
    OpenAi,
}

impl CreditsProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::OpenAi => "openai",
        }
    }
}

impl Default for CreditsProvider {
    fn default() -> Self {
        Self::OpenRouter
    }
}

/// Immutable snapshot of a completed batch run with cost tracking.
///
/// `credits_after` stays `None` at batch end; the balance is fetched
/// by the delayed cost reconciliation because the provider updates it
/// with a lag of one to three minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProcessingResult {
    pub results: Vec<ProcessingResult>,
    pub total_documents: usize,
    pub successful_documents: usize,
    pub failed_documents: usize,
    pub duration_seconds: f64,
    pub credits_before: Option<f64>,
    pub credits_after: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub cost_per_document_usd: Option<f64>,
    pub provider: CreditsProvider,
}

impl BatchProcessingResult {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            total_documents: 0,
            successful_documents: 0,
            failed_documents: 0,
            duration_seconds: 0.0,
            credits_before: None,
            credits_after: None,
            total_cost_usd: None,
            cost_per_document_usd: None,
            provider: CreditsProvider::default(),
        }
    }

    /// Success rate in percent.
    pub fn success_rate(&self) -> f64 {
        if self.total_documents == 0 {
            return 0.0;
        }
        self.successful_documents as f64 / self.total_documents as f64 * 100.0
    }

    /// One-line cost summary for the batch completion notice.
    pub fn cost_summary(&self) -> String {
        match self.total_cost_usd {
            None => "Kosten nicht verfuegbar".to_string(),
            Some(total) => {
                let mut line = format!("Gesamtkosten: ${:.4} USD", total);
                if let Some(per_doc) = self.cost_per_document_usd {
                    if self.successful_documents > 0 {
                        line.push_str(&format!(" | Pro Dokument: ${:.6} USD", per_doc));
                    }
                }
                line
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut batch = BatchProcessingResult::empty();
        assert_eq!(batch.success_rate(), 0.0);

        batch.total_documents = 4;
        batch.successful_documents = 3;
        assert_eq!(batch.success_rate(), 75.0);
    }

    #[test]
    fn test_cost_summary() {
        let mut batch = BatchProcessingResult::empty();
        assert_eq!(batch.cost_summary(), "Kosten nicht verfuegbar");

        batch.total_documents = 2;
        batch.successful_documents = 2;
        batch.total_cost_usd = Some(0.0123);
        batch.cost_per_document_usd = Some(0.00615);
        let line = batch.cost_summary();
        assert!(line.contains("$0.0123"));
        assert!(line.contains("Pro Dokument"));
    }
}
