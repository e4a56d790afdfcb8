//! Inbox batch orchestration.
//!
//! Pulls every pending document from the inbox, classifies them with a
//! bounded worker pool and records batch history with delayed cost
//! reconciliation: the provider balance updates with a lag, so the
//! final cost entry is written minutes after the batch completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::api::{
    ApiResult, DocumentsApi, HistoryEntry, ProcessingHistoryApi, ProcessingSettingsApi,
};
use crate::cache::DocumentCache;
use crate::classify::{ClassificationCache, ClassifierEngine};
use crate::llm::LlmClient;
use crate::models::{
    BatchProcessingResult, BoxType, CreditsProvider, Document, ProcessingResult,
    ProcessingStatus,
};
use crate::pdf::PdfService;
use crate::rules::RulesPostProcessor;

/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Reconciliation delay when the accumulated server cost is already
/// known.
const COST_CHECK_DELAY_FAST: Duration = Duration::from_secs(5);
/// Delay when only the provider balance diff is available; the
/// balance updates with a one-to-three minute lag.
const COST_CHECK_DELAY_SLOW: Duration = Duration::from_secs(90);

/// Thread-safe progress callback `(completed, total, message)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Orchestrates one inbox batch at a time.
pub struct BatchOrchestrator {
    docs: DocumentsApi,
    history: ProcessingHistoryApi,
    settings_api: ProcessingSettingsApi,
    llm: LlmClient,
    pdf: PdfService,
    classification_cache: Arc<ClassificationCache>,
    auto_refresh: Option<Arc<DocumentCache>>,
    raw_xml_patterns: Vec<String>,
    cancel: Arc<AtomicBool>,
}

impl BatchOrchestrator {
    pub fn new(
        docs: DocumentsApi,
        history: ProcessingHistoryApi,
        settings_api: ProcessingSettingsApi,
        llm: LlmClient,
        pdf: PdfService,
        raw_xml_patterns: Vec<String>,
    ) -> Self {
        Self {
            docs,
            history,
            settings_api,
            llm,
            pdf,
            classification_cache: Arc::new(ClassificationCache::new()),
            auto_refresh: None,
            raw_xml_patterns,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach the auto-refresh cache; it is paused for the duration of
    /// a batch.
    pub fn with_auto_refresh(mut self, cache: Arc<DocumentCache>) -> Self {
        self.auto_refresh = Some(cache);
        self
    }

    /// Cooperative cancellation: workers finish the current document,
    /// no aborted writes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    async fn build_engine(&self) -> ClassifierEngine {
        let settings = self.settings_api.ai_settings().await;
        let rules = self
            .settings_api
            .document_rules()
            .await
            .map(|rules| RulesPostProcessor::new(self.docs.clone(), self.pdf.clone(), rules));

        ClassifierEngine::new(
            self.docs.clone(),
            self.history.clone(),
            self.llm.clone(),
            self.pdf.clone(),
            self.classification_cache.clone(),
            settings,
            rules,
            self.raw_xml_patterns.clone(),
        )
    }

    /// Process every pending inbox document in parallel.
    pub async fn process_inbox(
        &self,
        progress: Option<ProgressCallback>,
        max_workers: usize,
    ) -> ApiResult<BatchProcessingResult> {
        let start = Instant::now();
        self.cancel.store(false, Ordering::SeqCst);

        // Settings and rules load once per run, never per document.
        let engine = Arc::new(self.build_engine().await);

        let mut inbox = self.docs.list_by_box(BoxType::Eingang).await?;
        let before = inbox.len();
        inbox.retain(|d| d.processing_status != ProcessingStatus::ManualExcluded);
        if before > inbox.len() {
            info!(
                "{} Dokument(e) uebersprungen (manuell bearbeitet)",
                before - inbox.len()
            );
        }

        let total = inbox.len();
        if total == 0 {
            info!("Keine Dokumente in der Eingangsbox");
            return Ok(BatchProcessingResult::empty());
        }

        // Balance BEFORE the run; the after-value is fetched by the
        // delayed reconciliation.
        let mut provider = CreditsProvider::default();
        let mut credits_before = None;
        match self.llm.get_credits().await {
            Ok(credits) => {
                provider = credits.provider;
                match provider {
                    CreditsProvider::OpenAi => {
                        credits_before = credits.total_usage;
                    }
                    CreditsProvider::OpenRouter => {
                        credits_before = credits.balance;
                        if let Some(balance) = credits_before {
                            info!("OpenRouter-Guthaben vor Verarbeitung: ${:.6} USD", balance);
                        }
                    }
                }
            }
            Err(e) => warn!("Konnte Guthaben nicht abrufen: {}", e),
        }

        info!(
            "Verarbeite {} Dokument(e) aus der Eingangsbox (parallel, {} Worker)",
            total, max_workers
        );

        if let Some(cache) = &self.auto_refresh {
            cache.pause();
        }

        let queue: Arc<Mutex<VecDeque<Document>>> = Arc::new(Mutex::new(inbox.into()));
        let completed = Arc::new(AtomicUsize::new(0));
        let results: Arc<Mutex<Vec<ProcessingResult>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(max_workers);
        for _worker_id in 0..max_workers.max(1) {
            let queue = queue.clone();
            let completed = completed.clone();
            let results = results.clone();
            let engine = engine.clone();
            let cancel = self.cancel.clone();
            let progress = progress.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    // Cancellation is checked between documents only.
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let doc = queue.lock().unwrap().pop_front();
                    let Some(doc) = doc else { break };

                    let result = engine.process_document(&doc).await;

                    let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(progress) = &progress {
                        let status = if result.success {
                            "OK"
                        } else if result.error.is_some() {
                            "FEHLER"
                        } else {
                            "SONSTIGE"
                        };
                        progress(current, total, &format!("{}: {}", status, doc.original_filename));
                    }

                    if result.success {
                        info!(
                            "Dokument {} -> {}: {}",
                            doc.id,
                            result.target_box,
                            result.new_filename.as_deref().unwrap_or(&doc.original_filename)
                        );
                    } else if let Some(err) = &result.error {
                        error!("Dokument {} Fehler: {}", doc.id, err);
                    } else {
                        info!(
                            "Dokument {} -> {}: nicht zugeordnet ({})",
                            doc.id,
                            result.target_box,
                            result.category.as_deref().unwrap_or("unbekannt")
                        );
                    }

                    results.lock().unwrap().push(result);
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        if let Some(cache) = &self.auto_refresh {
            cache.resume();
        }

        let results = Arc::try_unwrap(results)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();

        let duration = start.elapsed().as_secs_f64();
        let successful = results.iter().filter(|r| r.success).count();
        let accumulated_cost: f64 = results.iter().map(|r| r.cost_usd).sum();
        let processed = results.len();
        let cost_per_doc = if processed > 0 {
            accumulated_cost / processed as f64
        } else {
            0.0
        };

        info!(
            "Verarbeitung abgeschlossen: {}/{} erfolgreich in {:.1}s",
            successful, total, duration
        );
        info!(
            "Akkumulierte KI-Kosten: ${:.6} USD (${:.6}/Dok)",
            accumulated_cost, cost_per_doc
        );

        let batch = BatchProcessingResult {
            total_documents: total,
            successful_documents: successful,
            failed_documents: total - successful,
            duration_seconds: duration,
            credits_before,
            credits_after: None,
            total_cost_usd: Some(accumulated_cost),
            cost_per_document_usd: Some(cost_per_doc),
            provider,
            results,
        };

        // Record completion now; the cost entry follows once the
        // provider balance caught up.
        if let Some(entry_id) = self.log_batch_complete(&batch).await {
            self.schedule_cost_reconciliation(entry_id, &batch);
        }

        Ok(batch)
    }

    /// Run the classifier for one document (manual trigger).
    pub async fn process_single_document(&self, doc_id: i64) -> ApiResult<ProcessingResult> {
        let Some(doc) = self.docs.get(doc_id).await? else {
            return Ok(ProcessingResult::failed(
                doc_id,
                String::new(),
                "Dokument nicht gefunden".to_string(),
            ));
        };
        let engine = self.build_engine().await;
        Ok(engine.process_document(&doc).await)
    }

    /// Batch completion entry with `cost_pending = true`.
    async fn log_batch_complete(&self, batch: &BatchProcessingResult) -> Option<i64> {
        let mut details = serde_json::json!({
            "batch_type": "inbox_processing",
            "total_documents": batch.total_documents,
            "successful_documents": batch.successful_documents,
            "failed_documents": batch.failed_documents,
            "duration_seconds": (batch.duration_seconds * 100.0).round() / 100.0,
            "provider": batch.provider.as_str(),
            "cost_pending": true,
        });
        if let Some(credits) = batch.credits_before {
            details["credits_before_usd"] = serde_json::json!(credits);
        }
        if let Some(cost) = batch.total_cost_usd.filter(|c| *c > 0.0) {
            details["accumulated_cost_usd"] = serde_json::json!(cost);
            details["cost_per_document_usd"] =
                serde_json::json!(batch.cost_per_document_usd.unwrap_or(0.0));
        }

        let entry_id = self
            .history
            .create(&HistoryEntry {
                previous_status: Some("processing".to_string()),
                success: batch.failed_documents == 0,
                classification_source: Some("batch_processor".to_string()),
                classification_result: Some(format!(
                    "{}/{} OK",
                    batch.successful_documents, batch.total_documents
                )),
                action_details: Some(details),
                duration_ms: Some((batch.duration_seconds * 1000.0) as u64),
                ..HistoryEntry::action("batch_complete", "completed")
            })
            .await;

        if entry_id.is_none() {
            warn!("Batch-Abschluss-Logging fehlgeschlagen");
        }
        entry_id
    }

    /// Schedule the delayed cost entry referencing the completion row.
    fn schedule_cost_reconciliation(&self, entry_id: i64, batch: &BatchProcessingResult) {
        let delay = match batch.total_cost_usd {
            Some(cost) if cost > 0.0 => COST_CHECK_DELAY_FAST,
            _ => COST_CHECK_DELAY_SLOW,
        };

        let llm = self.llm.clone();
        let history = self.history.clone();
        let batch = batch.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let credits_after = match llm.get_credits().await {
                Ok(credits) => match batch.provider {
                    CreditsProvider::OpenAi => credits.total_usage,
                    CreditsProvider::OpenRouter => credits.balance,
                },
                Err(e) => {
                    warn!("Guthaben nach Verarbeitung nicht abrufbar: {}", e);
                    None
                }
            };

            log_delayed_costs(&history, entry_id, &batch, credits_after).await;
        });
    }
}

/// Write the `batch_cost_update` entry. Cost source priority:
/// accumulated server cost, then provider balance diff.
async fn log_delayed_costs(
    history: &ProcessingHistoryApi,
    reference_entry_id: i64,
    batch: &BatchProcessingResult,
    credits_after: Option<f64>,
) {
    let accumulated = batch.total_cost_usd.unwrap_or(0.0);

    let (total_cost, cost_source) = if accumulated > 0.0 {
        (accumulated, "accumulated")
    } else if batch.provider == CreditsProvider::OpenRouter {
        match (batch.credits_before, credits_after) {
            (Some(before), Some(after)) => (before - after, "balance_diff"),
            _ => (accumulated, "accumulated_fallback"),
        }
    } else {
        (accumulated, "accumulated_fallback")
    };

    let reference_count = if batch.successful_documents > 0 {
        batch.successful_documents
    } else {
        batch.total_documents
    };
    let cost_per_doc = if reference_count > 0 {
        total_cost / reference_count as f64
    } else {
        0.0
    };

    info!(
        "=== KOSTEN-ZUSAMMENFASSUNG ({}, {}) ===",
        batch.provider.as_str().to_uppercase(),
        cost_source
    );
    info!("Gesamtkosten: ${:.6} USD", total_cost);
    if cost_per_doc > 0.0 {
        info!(
            "Kosten/Dokument: ${:.8} USD ({} Dokumente)",
            cost_per_doc, batch.total_documents
        );
    }

    let details = serde_json::json!({
        "batch_type": "cost_update",
        "reference_entry_id": reference_entry_id,
        "provider": batch.provider.as_str(),
        "cost_source": cost_source,
        "accumulated_cost_usd": accumulated,
        "credits_before_usd": batch.credits_before.unwrap_or(0.0),
        "credits_after_usd": credits_after.unwrap_or(0.0),
        "total_cost_usd": total_cost,
        "cost_per_document_usd": cost_per_doc,
        "total_documents": batch.total_documents,
        "successful_documents": batch.successful_documents,
        "failed_documents": batch.failed_documents,
        "cost_pending": false,
    });

    history
        .create(&HistoryEntry {
            previous_status: Some("completed".to_string()),
            classification_source: Some("cost_tracker".to_string()),
            classification_result: Some(format!(
                "${:.4} USD ({} Dok.)",
                total_cost, batch.successful_documents
            )),
            action_details: Some(details),
            duration_ms: Some(0),
            ..HistoryEntry::action("batch_cost_update", "completed")
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(successful: usize, total: usize, cost: Option<f64>) -> BatchProcessingResult {
        BatchProcessingResult {
            results: Vec::new(),
            total_documents: total,
            successful_documents: successful,
            failed_documents: total - successful,
            duration_seconds: 1.5,
            credits_before: Some(10.0),
            credits_after: None,
            total_cost_usd: cost,
            cost_per_document_usd: None,
            provider: CreditsProvider::OpenRouter,
        }
    }

    #[test]
    fn test_cost_delay_selection() {
        // Accumulated cost known: fast check.
        let fast = batch(2, 2, Some(0.01));
        let delay = match fast.total_cost_usd {
            Some(cost) if cost > 0.0 => COST_CHECK_DELAY_FAST,
            _ => COST_CHECK_DELAY_SLOW,
        };
        assert_eq!(delay, Duration::from_secs(5));

        // Balance diff only: wait for the provider to catch up.
        let slow = batch(2, 2, Some(0.0));
        let delay = match slow.total_cost_usd {
            Some(cost) if cost > 0.0 => COST_CHECK_DELAY_FAST,
            _ => COST_CHECK_DELAY_SLOW,
        };
        assert_eq!(delay, Duration::from_secs(90));
    }

    #[test]
    fn test_cancel_flag() {
        let cancel = Arc::new(AtomicBool::new(false));
        assert!(!cancel.load(Ordering::SeqCst));
        cancel.store(true, Ordering::SeqCst);
        assert!(cancel.load(Ordering::SeqCst));
    }
}
