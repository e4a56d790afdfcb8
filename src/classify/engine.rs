//! The classification engine: one document in, one
//! `ProcessingResult` out.
//!
//! The decision ladder is strictly ordered; the first rule that fires
//! owns the outcome. Every branch sets a full audit tuple (source,
//! confidence, reason). `process_document` never propagates an error:
//! failures become a `ProcessingResult` with `success = false` and
//! the document parked in `sonstige` with status `error`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{
    AiData, AiSettings, ApiError, DocumentUpdate, DocumentsApi, HistoryEntry,
    ProcessingHistoryApi,
};
use crate::llm::{LlmClient, LlmError, Usage};
use crate::models::{
    BoxType, ClassificationSource, Confidence, Document, ProcessingResult, ProcessingStatus,
};
use crate::pdf::{PdfError, PdfService};
use crate::probe::{self, DetectedType, GdvHeader};
use crate::rules::RulesPostProcessor;

use super::cache::{CachedClassification, ClassificationCache};
use super::slug::{capitalize, slugify};
use super::spreadsheet;

/// BiPRO category prefix marking GDV inventory deliveries.
const BIPRO_GDV_PREFIX: &str = "999";
/// BiPRO category prefix marking commission statements.
const BIPRO_COURTAGE_PREFIX: &str = "300";

/// Fixed rename targets for unreadable PDFs.
const CORRUPT_FILENAME: &str = "Beschaedigte_Datei.pdf";
const CORRUPT_COURTAGE_FILENAME: &str = "Beschaedigte_Datei_Courtage.pdf";

/// Filename patterns that mark raw XML deliveries.
pub const DEFAULT_RAW_XML_PATTERNS: [&str; 3] =
    ["*_index.xml", "Lieferung_*.xml", "BiPRO_Rohdaten_*"];

const PROMPT_VERSION: &str = "v2.0.2";

#[derive(Debug, Error)]
enum EngineError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Pdf(#[from] PdfError),
    #[error("{0}")]
    Llm(#[from] LlmError),
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM call capture for the AI-data upsert.
#[derive(Debug, Clone)]
struct AiMeta {
    model: String,
    stage: String,
    prompt_text: String,
    raw_response: String,
    usage: Usage,
}

/// Outcome of one ladder run.
#[derive(Debug, Clone)]
struct Outcome {
    target_box: BoxType,
    category: Option<String>,
    new_filename: Option<String>,
    source: ClassificationSource,
    confidence: Confidence,
    reason: String,
    cost_usd: f64,
    ai_text: Option<(String, u32)>,
    ai_meta: Option<AiMeta>,
}

impl Outcome {
    fn new(
        target_box: BoxType,
        category: &str,
        source: ClassificationSource,
        confidence: Confidence,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target_box,
            category: Some(category.to_string()),
            new_filename: None,
            source,
            confidence,
            reason: reason.into(),
            cost_usd: 0.0,
            ai_text: None,
            ai_meta: None,
        }
    }

    /// Corrupt and errored PDFs are never cached: a later retry might
    /// succeed (repair, new passwords).
    fn is_cacheable(&self) -> bool {
        if self.source == ClassificationSource::CacheDedup {
            return false;
        }
        !matches!(
            self.category.as_deref(),
            Some("pdf_corrupt") | Some("pdf_corrupt_bipro") | Some("pdf_error") | None
        )
    }
}

/// Simple wildcard match supporting a single `*`.
fn wildcard_match(pattern: &str, filename: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        return filename.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return filename.starts_with(prefix);
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return filename.starts_with(prefix) && filename.ends_with(suffix);
    }
    filename == pattern
}

/// Filename for a GDV file from its preamble:
/// `<sender>_<date>_VU<vu>.gdv`, components omitted when missing.
fn gdv_filename(header: &GdvHeader) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let has_vu = !header.vu_number.is_empty() && header.vu_number != probe::GDV_FALLBACK_VU;

    if let Some(sender) = &header.sender {
        parts.push(slugify(sender));
    } else if has_vu {
        parts.push(header.vu_number.clone());
    }
    if header.date_iso != probe::GDV_FALLBACK_DATE {
        parts.push(header.date_iso.clone());
    }
    if header.sender.is_some() && has_vu {
        parts.push(format!("VU{}", header.vu_number));
    }

    if parts.is_empty() {
        None
    } else {
        Some(format!("{}.gdv", parts.join("_")))
    }
}

/// Filename after a Sparte classification:
/// `<vu>_<sparte-or-docname>[_<date>].pdf`, date only for courtage.
fn sparte_filename(
    ki_vu_name: Option<&str>,
    doc_vu_name: Option<&str>,
    sparte: &str,
    doc_name: Option<&str>,
    date_iso: Option<&str>,
) -> Option<String> {
    let vu_slug = ki_vu_name
        .or(doc_vu_name)
        .map(slugify)
        .unwrap_or_else(|| "Unbekannt".to_string());

    match sparte {
        "courtage" => match date_iso {
            Some(date) => Some(format!("{}_Courtage_{}.pdf", vu_slug, date)),
            None => Some(format!("{}_Courtage.pdf", vu_slug)),
        },
        "sonstige" => doc_name.map(|name| format!("{}_{}.pdf", vu_slug, slugify(name))),
        "sach" | "leben" | "kranken" => {
            Some(format!("{}_{}.pdf", vu_slug, capitalize(sparte)))
        }
        other => date_iso.map(|date| format!("{}_{}_{}.pdf", vu_slug, capitalize(other), date)),
    }
}

fn is_bipro_gdv(doc: &Document) -> bool {
    doc.bipro_category
        .as_deref()
        .is_some_and(|c| c.starts_with(BIPRO_GDV_PREFIX))
}

fn is_bipro_courtage(doc: &Document) -> bool {
    doc.bipro_category
        .as_deref()
        .is_some_and(|c| c.starts_with(BIPRO_COURTAGE_PREFIX))
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Per-document classifier. One instance serves a whole batch; all
/// shared state (cache, semaphore) is internally synchronized.
pub struct ClassifierEngine {
    docs: DocumentsApi,
    history: ProcessingHistoryApi,
    llm: LlmClient,
    pdf: PdfService,
    cache: Arc<ClassificationCache>,
    settings: AiSettings,
    rules: Option<RulesPostProcessor>,
    raw_xml_patterns: Vec<String>,
}

impl ClassifierEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docs: DocumentsApi,
        history: ProcessingHistoryApi,
        llm: LlmClient,
        pdf: PdfService,
        cache: Arc<ClassificationCache>,
        settings: AiSettings,
        rules: Option<RulesPostProcessor>,
        raw_xml_patterns: Vec<String>,
    ) -> Self {
        Self { docs, history, llm, pdf, cache, settings, rules, raw_xml_patterns }
    }

    /// Classify one document end to end. Never panics out of the
    /// worker and never returns an error; failures are reported in the
    /// result and persisted on the document.
    pub async fn process_document(&self, doc: &Document) -> ProcessingResult {
        let started = Instant::now();
        match self.process_inner(doc, started).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Fehler bei Verarbeitung von Dokument {}: {}", doc.id, e);
                self.persist_failure(doc, &e.to_string(), started).await;
                ProcessingResult::failed(doc.id, doc.original_filename.clone(), e.to_string())
            }
        }
    }

    async fn process_inner(
        &self,
        stale_doc: &Document,
        started: Instant,
    ) -> Result<ProcessingResult, EngineError> {
        // Refetch: list results may be cached server-side, and manual
        // exclusion can have happened since.
        let doc = self
            .docs
            .get(stale_doc.id)
            .await?
            .unwrap_or_else(|| stale_doc.clone());

        if doc.processing_status == ProcessingStatus::ManualExcluded {
            info!(
                "Dokument {} ({}): Uebersprungen (manuell ausgeschlossen)",
                doc.id, doc.original_filename
            );
            return Ok(ProcessingResult {
                document_id: doc.id,
                original_filename: doc.original_filename.clone(),
                success: true,
                target_box: doc.box_type,
                category: Some("manual_excluded".to_string()),
                new_filename: None,
                error: None,
                cost_usd: 0.0,
            });
        }

        let previous_status = doc.processing_status;

        self.docs
            .update(
                doc.id,
                &DocumentUpdate {
                    box_type: Some(BoxType::Verarbeitung),
                    processing_status: Some(ProcessingStatus::Processing),
                    ..Default::default()
                },
            )
            .await?;
        debug!("Dokument {}: Status -> processing", doc.id);

        self.log_history(HistoryEntry {
            document_id: Some(doc.id),
            previous_status: Some(previous_status.as_str().to_string()),
            action_details: Some(serde_json::json!({ "source_box": doc.box_type.as_str() })),
            ..HistoryEntry::action("start_processing", "processing")
        })
        .await;

        let outcome = self.run_ladder(&doc).await;

        if outcome.is_cacheable() {
            self.cache.put(
                doc.content_hash.as_deref(),
                CachedClassification {
                    target_box: outcome.target_box,
                    category: outcome.category.clone(),
                    new_filename: outcome.new_filename.clone(),
                    confidence: outcome.confidence,
                },
            );
        }

        // processing -> classified, with the full audit tuple.
        self.docs
            .update(
                doc.id,
                &DocumentUpdate {
                    box_type: Some(outcome.target_box),
                    processing_status: Some(ProcessingStatus::Classified),
                    document_category: outcome.category.clone(),
                    classification_source: Some(outcome.source.as_str().to_string()),
                    classification_confidence: Some(outcome.confidence.as_str().to_string()),
                    classification_reason: Some(clip(&outcome.reason, 500)),
                    classification_timestamp: Some(
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                    ),
                    ..Default::default()
                },
            )
            .await?;

        if outcome.target_box == BoxType::Sonstige {
            info!("Dokument {}: Nicht zugeordnet -> {:?}", doc.id, outcome.category);
        } else {
            debug!("Dokument {}: Status -> classified", doc.id);
        }

        self.log_history(HistoryEntry {
            document_id: Some(doc.id),
            previous_status: Some("processing".to_string()),
            classification_source: Some(outcome.source.as_str().to_string()),
            classification_result: Some(format!(
                "{} -> {}",
                outcome.category.as_deref().unwrap_or("-"),
                outcome.target_box
            )),
            action_details: Some(serde_json::json!({
                "category": outcome.category,
                "target_box": outcome.target_box.as_str(),
                "confidence": outcome.confidence.as_str(),
                "reason": clip(&outcome.reason, 200),
            })),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            ..HistoryEntry::action("classify", "classified")
        })
        .await;

        // classified -> renamed, when the ladder produced a name.
        let mut current_status = "classified";
        if let Some(new_filename) = &outcome.new_filename {
            self.docs
                .update(
                    doc.id,
                    &DocumentUpdate {
                        original_filename: Some(new_filename.clone()),
                        ai_renamed: Some(true),
                        processing_status: Some(ProcessingStatus::Renamed),
                        ..Default::default()
                    },
                )
                .await?;
            debug!("Dokument {}: Status -> renamed ({})", doc.id, new_filename);
            self.log_history(HistoryEntry {
                document_id: Some(doc.id),
                previous_status: Some("classified".to_string()),
                action_details: Some(serde_json::json!({ "new_filename": new_filename })),
                ..HistoryEntry::action("rename", "renamed")
            })
            .await;
            current_status = "renamed";
        }

        // -> archived in the target box.
        self.docs
            .update(
                doc.id,
                &DocumentUpdate {
                    processing_status: Some(ProcessingStatus::Archived),
                    ..Default::default()
                },
            )
            .await?;
        debug!("Dokument {}: Status -> archived (in {})", doc.id, outcome.target_box);
        self.log_history(HistoryEntry {
            document_id: Some(doc.id),
            previous_status: Some(current_status.to_string()),
            action_details: Some(serde_json::json!({
                "final_box": outcome.target_box.as_str(),
                "new_filename": outcome.new_filename,
            })),
            ..HistoryEntry::action("archive", "archived")
        })
        .await;

        // Full text + AI response; failures here never abort.
        if outcome.ai_text.is_some() || outcome.ai_meta.is_some() {
            if let Err(e) = self.persist_ai_data(&doc, &outcome).await {
                warn!("AI-Daten-Persistierung fehlgeschlagen fuer Dokument {}: {}", doc.id, e);
            }
        }

        // Document rules (duplicates, empty pages) run last; the
        // content-duplicate relation only exists after the upsert.
        if let Some(rules) = &self.rules {
            rules.apply(doc.id).await;
        }

        let is_success = outcome.target_box != BoxType::Sonstige;
        Ok(ProcessingResult {
            document_id: doc.id,
            original_filename: doc.original_filename.clone(),
            success: is_success,
            target_box: outcome.target_box,
            category: outcome.category,
            new_filename: outcome.new_filename,
            error: None,
            cost_usd: outcome.cost_usd,
        })
    }

    async fn persist_failure(&self, doc: &Document, message: &str, started: Instant) {
        let result = self
            .docs
            .update(
                doc.id,
                &DocumentUpdate {
                    box_type: Some(BoxType::Sonstige),
                    processing_status: Some(ProcessingStatus::Error),
                    ai_processing_error: Some(clip(message, 500)),
                    ..Default::default()
                },
            )
            .await;
        if result.is_ok() {
            debug!("Dokument {}: Status -> error", doc.id);
        }

        self.log_history(HistoryEntry {
            document_id: Some(doc.id),
            previous_status: Some("processing".to_string()),
            success: false,
            error_message: Some(clip(message, 500)),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            ..HistoryEntry::action("error", "error")
        })
        .await;
    }

    // ----------------------------------------------------------------
    // The decision ladder
    // ----------------------------------------------------------------

    async fn run_ladder(&self, doc: &Document) -> Outcome {
        // 1. Content-hash dedup: identical bytes classify identically.
        if let Some(cached) = self.cache.get(doc.content_hash.as_deref()) {
            let hash = doc.content_hash.as_deref().unwrap_or("?");
            info!(
                "Dokument {} ({}): Duplikat erkannt -> {} (aus Cache)",
                doc.id, doc.original_filename, cached.target_box
            );
            let mut outcome = Outcome::new(
                cached.target_box,
                cached.category.as_deref().unwrap_or("unknown"),
                ClassificationSource::CacheDedup,
                Confidence::High,
                format!(
                    "Deduplizierung: identischer Inhalt bereits klassifiziert (Hash {}...)",
                    &hash[..hash.len().min(12)]
                ),
            );
            outcome.category = cached.category;
            outcome.new_filename = cached.new_filename;
            return outcome;
        }

        // 2. Raw XML deliveries go to the raw archive, no AI.
        if self.is_xml_raw(doc) {
            info!("XML-Rohdatei erkannt: {} -> roh", doc.original_filename);
            return Outcome::new(
                BoxType::Roh,
                "xml_raw",
                ClassificationSource::RulePattern,
                Confidence::High,
                "XML-Rohdatei erkannt (Dateiname-Pattern)",
            );
        }

        // 3. GDV via BiPRO code, verified against the content.
        if is_bipro_gdv(doc) {
            return self.branch_bipro_gdv(doc).await;
        }

        // 4. GDV via extension or content probe.
        if self.is_gdv_file(doc).await {
            return self.branch_gdv(doc).await;
        }

        // 5. PDFs with a BiPRO category.
        if doc.is_pdf() && doc.bipro_category.is_some() {
            if is_bipro_courtage(doc) {
                info!(
                    "Courtage per BiPRO-Code erkannt: {} -> courtage",
                    doc.original_filename
                );
                let base = Outcome::new(
                    BoxType::Courtage,
                    "courtage_bipro",
                    ClassificationSource::RuleBipro,
                    Confidence::High,
                    format!(
                        "BiPRO-Code {} identifiziert Courtage-Dokument",
                        doc.bipro_category.as_deref().unwrap_or("?")
                    ),
                );
                return self
                    .branch_courtage(doc, base, ClassificationSource::KiCourtageMinimal)
                    .await;
            }
            return self.branch_sparte_pdf(doc, "KI-Sparten-Klassifikation").await;
        }

        // 6. Filename rule: Vermittlerabrechnung is always Courtage.
        if doc.is_pdf()
            && doc
                .original_filename
                .to_lowercase()
                .contains("vermittlerabrechnung")
        {
            info!(
                "Courtage per Dateiname erkannt: {} -> courtage",
                doc.original_filename
            );
            let base = Outcome::new(
                BoxType::Courtage,
                "courtage_filename",
                ClassificationSource::RuleFilename,
                Confidence::High,
                "Dateiname enthaelt \"Vermittlerabrechnung\" -> Courtage",
            );
            return self
                .branch_courtage(doc, base, ClassificationSource::RuleFilenameKi)
                .await;
        }

        // 7. Plain PDFs get the two-stage Sparte classification.
        if doc.is_pdf() {
            return self
                .branch_sparte_pdf(doc, "KI-Sparten-Klassifikation ohne BiPRO")
                .await;
        }

        // 8. Tabular files are classified from their first rows.
        if doc.is_spreadsheet() {
            return self.branch_spreadsheet(doc).await;
        }

        // 9. Everything else is unassignable.
        debug!("Unbekannter Dateityp: {} -> sonstige", doc.original_filename);
        Outcome::new(
            BoxType::Sonstige,
            "unknown",
            ClassificationSource::Fallback,
            Confidence::Low,
            "Unbekannter Dateityp, keine Klassifikation moeglich",
        )
    }

    fn is_xml_raw(&self, doc: &Document) -> bool {
        let filename = &doc.original_filename;
        for pattern in &self.raw_xml_patterns {
            if wildcard_match(pattern, filename) {
                return true;
            }
        }
        doc.is_xml() && filename.to_lowercase().contains("roh")
    }

    /// GDV by extension, marker or content. The content check only
    /// runs for ambiguous extensions and rules out PDFs first.
    async fn is_gdv_file(&self, doc: &Document) -> bool {
        if doc.is_gdv {
            return true;
        }
        match doc.file_extension().as_str() {
            ".gdv" => true,
            ".txt" | "" => self.probe_content(doc).await == Some(DetectedType::Gdv),
            _ => false,
        }
    }

    /// Magic-byte probe on the first 256 bytes of the stored file.
    async fn probe_content(&self, doc: &Document) -> Option<DetectedType> {
        let tmpdir = tempfile::tempdir().ok()?;
        let path = self
            .docs
            .download(doc.id, tmpdir.path(), Some(&doc.original_filename))
            .await
            .ok()?;
        let bytes = std::fs::read(&path).ok()?;
        probe::detect_type(&bytes)
    }

    async fn download_to(&self, doc: &Document, dir: &Path) -> Result<PathBuf, EngineError> {
        Ok(self
            .docs
            .download(doc.id, dir, Some(&doc.original_filename))
            .await?)
    }

    /// Branch 3: a 999xxx code claims GDV, but carriers sometimes ship
    /// real PDFs under these codes. Verify the content before trusting
    /// the code.
    async fn branch_bipro_gdv(&self, doc: &Document) -> Outcome {
        let code = doc.bipro_category.clone().unwrap_or_default();

        let tmpdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return Outcome::new(
                    BoxType::Sonstige,
                    "unknown_bipro",
                    ClassificationSource::Fallback,
                    Confidence::Low,
                    format!("BiPRO-Code {} aber Content nicht verifizierbar: {}", code, e),
                )
            }
        };

        let local_path = match self.download_to(doc, tmpdir.path()).await {
            Ok(path) => path,
            Err(e) => {
                warn!("GDV-Verifikation fehlgeschlagen (BiPRO): {}", e);
                return Outcome::new(
                    BoxType::Sonstige,
                    "unknown_bipro",
                    ClassificationSource::Fallback,
                    Confidence::Low,
                    format!("BiPRO-Code {} aber Content nicht verifizierbar", code),
                );
            }
        };

        let header = probe::extract_gdv_header(&local_path);
        if header.is_verified() {
            info!(
                "GDV per BiPRO-Code verifiziert: {} (Code: {}) -> gdv",
                doc.original_filename, code
            );
            let mut outcome = Outcome::new(
                BoxType::Gdv,
                "gdv_bipro",
                ClassificationSource::RuleBipro,
                Confidence::High,
                format!("BiPRO-Code {} + GDV-Content verifiziert", code),
            );
            outcome.new_filename = gdv_filename(&header);
            return outcome;
        }

        // Not GDV. A real PDF under a 999 code is a mislabelled VU
        // document and goes through PDF validation plus the Sparte AI.
        let is_actually_pdf = doc.is_pdf()
            || std::fs::read(&local_path)
                .ok()
                .and_then(|bytes| probe::detect_type(&bytes))
                == Some(DetectedType::Pdf);

        if !is_actually_pdf {
            warn!(
                "BiPRO-Code {} behauptet GDV, aber Content-Verifikation fehlgeschlagen: {}",
                code, doc.original_filename
            );
            return Outcome::new(
                BoxType::Sonstige,
                "unknown_bipro",
                ClassificationSource::Fallback,
                Confidence::Low,
                format!("BiPRO-Code {} aber Content nicht verifizierbar", code),
            );
        }

        info!(
            "BiPRO-Code {} ist kein GDV: {} -> Pruefe PDF und starte KI-Klassifikation",
            code, doc.original_filename
        );
        match self
            .validate_and_classify(doc, &local_path, &format!("KI-Klassifikation (BiPRO {} nicht-GDV PDF)", code))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("999xxx-Fallback KI-Klassifikation fehlgeschlagen: {}", e);
                let mut outcome = Outcome::new(
                    BoxType::Sonstige,
                    "pdf_error",
                    ClassificationSource::Fallback,
                    Confidence::Low,
                    format!("BiPRO 999xxx Fallback KI fehlgeschlagen: {}", clip(&e.to_string(), 100)),
                );
                outcome.new_filename = Some(CORRUPT_FILENAME.to_string());
                outcome
            }
        }
    }

    /// Branch 4: GDV by extension or content; metadata comes from the
    /// preamble, no AI involved.
    async fn branch_gdv(&self, doc: &Document) -> Outcome {
        let mut outcome = Outcome::new(
            BoxType::Gdv,
            "gdv",
            ClassificationSource::RuleExtension,
            Confidence::High,
            "GDV-Datei erkannt (Dateiendung/Content)",
        );

        match tempfile::tempdir() {
            Ok(tmpdir) => match self.download_to(doc, tmpdir.path()).await {
                Ok(local_path) => {
                    let header = probe::extract_gdv_header(&local_path);
                    outcome.new_filename = gdv_filename(&header);
                    if outcome.new_filename.is_some() {
                        info!(
                            "GDV-Metadaten: Absender={:?}, VU={}, Datum={}",
                            header.sender, header.vu_number, header.date_iso
                        );
                    }
                }
                Err(e) => warn!("GDV-Metadaten-Extraktion fehlgeschlagen: {}", e),
            },
            Err(e) => warn!("GDV-Metadaten-Extraktion fehlgeschlagen: {}", e),
        }

        outcome
    }

    /// Branches 5a and 6: the box is already Courtage; the AI only
    /// extracts insurer and date for the filename.
    async fn branch_courtage(
        &self,
        doc: &Document,
        mut base: Outcome,
        ki_source: ClassificationSource,
    ) -> Outcome {
        let fallback = base.clone();
        let result: Result<Outcome, EngineError> = async {
            let tmpdir = tempfile::tempdir()?;
            let local_path = self.download_to(doc, tmpdir.path()).await?;

            let pdf_path = match self.pdf.validate(&local_path).await {
                Ok(repaired) => repaired.unwrap_or(local_path),
                Err(PdfError::NoPasswordFits) => {
                    warn!("Courtage-PDF verschluesselt, kein Passwort: {}", doc.original_filename);
                    base.category = Some("pdf_encrypted".to_string());
                    base.source = ClassificationSource::RuleValidation;
                    base.reason = format!("{} + PDF verschluesselt (kein Passwort)", base.reason);
                    return Ok(base);
                }
                Err(e) => {
                    warn!(
                        "Courtage-PDF korrupt, ueberspringe KI: {} ({})",
                        doc.original_filename, e
                    );
                    base.new_filename = Some(CORRUPT_COURTAGE_FILENAME.to_string());
                    return Ok(base);
                }
            };

            self.check_and_log_empty_pages(doc, &pdf_path).await;
            let (text, pages) = self.pdf.extract_text(&pdf_path);

            let llm_outcome = self.llm.classify_courtage_minimal(&text).await?;
            let insurer = llm_outcome.result.insurer.as_deref().unwrap_or("Unbekannt");
            let date_iso = llm_outcome.result.document_date_iso.as_deref().unwrap_or("");

            let insurer_slug = slugify(insurer);
            base.new_filename = Some(if date_iso.is_empty() {
                format!("{}_Courtage.pdf", insurer_slug)
            } else {
                format!("{}_Courtage_{}.pdf", insurer_slug, date_iso)
            });
            base.source = ki_source;
            base.reason = format!("Courtage + KI-Extraktion: {}, {}", insurer, date_iso);
            base.cost_usd += llm_outcome.usage.server_cost_usd;
            base.ai_text = Some((text, pages));
            base.ai_meta = Some(AiMeta {
                model: llm_outcome.model,
                stage: llm_outcome.stage.to_string(),
                prompt_text: llm_outcome.prompt_text,
                raw_response: llm_outcome.raw_response,
                usage: llm_outcome.usage,
            });

            info!("Courtage klassifiziert: {}, {}", insurer, date_iso);
            Ok(base)
        }
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                // The rule already fixed the box; the AI naming is best
                // effort.
                warn!("Courtage-KI fehlgeschlagen: {}", e);
                let mut outcome = fallback;
                outcome.reason = format!(
                    "{}, KI-Benennung fehlgeschlagen: {}",
                    outcome.reason,
                    clip(&e.to_string(), 100)
                );
                outcome
            }
        }
    }

    /// Branches 5b and 7: validation, then the two-stage Sparte AI
    /// decides the box.
    async fn branch_sparte_pdf(&self, doc: &Document, reason_prefix: &str) -> Outcome {
        let result: Result<Outcome, EngineError> = async {
            let tmpdir = tempfile::tempdir()?;
            let local_path = self.download_to(doc, tmpdir.path()).await?;
            self.validate_and_classify(doc, &local_path, reason_prefix).await
        }
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Sparten-KI fehlgeschlagen: {}", e);
                Outcome::new(
                    BoxType::Sonstige,
                    "pdf_error",
                    ClassificationSource::Fallback,
                    Confidence::Low,
                    format!("KI-Klassifikation fehlgeschlagen: {}", clip(&e.to_string(), 100)),
                )
            }
        }
    }

    /// PDF validation with the three outcomes (encrypted, corrupt,
    /// valid), then the two-stage Sparte classification.
    async fn validate_and_classify(
        &self,
        doc: &Document,
        local_path: &Path,
        reason_prefix: &str,
    ) -> Result<Outcome, EngineError> {
        let pdf_path = match self.pdf.validate(local_path).await {
            Ok(repaired) => repaired.unwrap_or_else(|| local_path.to_path_buf()),
            Err(PdfError::NoPasswordFits) => {
                warn!("PDF verschluesselt, kein Passwort: {}", doc.original_filename);
                return Ok(Outcome::new(
                    BoxType::Sonstige,
                    "pdf_encrypted",
                    ClassificationSource::RuleValidation,
                    Confidence::High,
                    "PDF verschluesselt (kein Passwort), KI uebersprungen",
                ));
            }
            Err(e) => {
                warn!("PDF korrupt, ueberspringe KI: {} ({})", doc.original_filename, e);
                let mut outcome = Outcome::new(
                    BoxType::Sonstige,
                    "pdf_corrupt",
                    ClassificationSource::RuleValidation,
                    Confidence::High,
                    "PDF korrupt/nicht lesbar, KI uebersprungen",
                );
                outcome.new_filename = Some(CORRUPT_FILENAME.to_string());
                return Ok(outcome);
            }
        };

        self.check_and_log_empty_pages(doc, &pdf_path).await;
        let (text, pages) = self.pdf.extract_text(&pdf_path);

        let llm_outcome = self.llm.classify_sparte_with_date(&text, &self.settings).await?;
        let sparte = llm_outcome.result.sparte.clone();
        let confidence = llm_outcome.result.confidence();
        let target_box = BoxType::from_str(&sparte).unwrap_or(BoxType::Sonstige);

        let source = if confidence == Confidence::High {
            ClassificationSource::KiGpt4oMini
        } else {
            ClassificationSource::KiGpt4oZweistufig
        };

        info!("Sparte klassifiziert: {} (confidence: {})", sparte, confidence.as_str());

        let mut outcome = Outcome::new(
            target_box,
            &format!("sparte_{}", sparte),
            source,
            confidence,
            format!("{}: {} ({})", reason_prefix, sparte, confidence.as_str()),
        );
        outcome.new_filename = sparte_filename(
            llm_outcome.result.vu_name.as_deref(),
            doc.vu_name.as_deref(),
            &sparte,
            llm_outcome.result.document_name.as_deref(),
            llm_outcome.result.document_date_iso.as_deref(),
        );
        outcome.cost_usd = llm_outcome.usage.server_cost_usd;
        outcome.ai_text = Some((text, pages));
        outcome.ai_meta = Some(AiMeta {
            model: llm_outcome.model,
            stage: llm_outcome.stage.to_string(),
            prompt_text: llm_outcome.prompt_text,
            raw_response: llm_outcome.raw_response,
            usage: llm_outcome.usage,
        });

        if let Some(name) = &outcome.new_filename {
            info!("Dokument benannt: {}", name);
        }
        Ok(outcome)
    }

    /// Branch 8: tabular files, classified from their first rows.
    async fn branch_spreadsheet(&self, doc: &Document) -> Outcome {
        debug!("Tabellendatei erkannt: {}", doc.original_filename);
        let result: Result<Outcome, EngineError> = async {
            let tmpdir = tempfile::tempdir()?;
            let local_path = self.download_to(doc, tmpdir.path()).await?;

            let text = spreadsheet::extract_text(&local_path, spreadsheet::MAX_LINES);
            if text.trim().is_empty() {
                return Ok(Outcome::new(
                    BoxType::Sonstige,
                    "spreadsheet_empty",
                    ClassificationSource::RulePattern,
                    Confidence::Low,
                    "Tabellendatei ohne lesbaren Text",
                ));
            }

            let llm_outcome = self.llm.classify_spreadsheet(&text).await?;
            let sparte = llm_outcome.result.sparte.clone();
            let confidence = llm_outcome.result.confidence();
            let target_box = BoxType::from_str(&sparte).unwrap_or(BoxType::Sonstige);

            info!(
                "Tabelle klassifiziert: {} -> {} ({})",
                doc.original_filename,
                sparte,
                confidence.as_str()
            );

            let mut outcome = Outcome::new(
                target_box,
                &format!("spreadsheet_{}", sparte),
                ClassificationSource::KiSpreadsheet,
                confidence,
                format!("Tabellendatei KI-klassifiziert: {} ({})", sparte, confidence.as_str()),
            );
            outcome.cost_usd = llm_outcome.usage.server_cost_usd;
            outcome.ai_text = Some((text, 1));
            outcome.ai_meta = Some(AiMeta {
                model: llm_outcome.model,
                stage: llm_outcome.stage.to_string(),
                prompt_text: llm_outcome.prompt_text,
                raw_response: llm_outcome.raw_response,
                usage: llm_outcome.usage,
            });
            Ok(outcome)
        }
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Tabellen-Klassifikation fehlgeschlagen: {}", e);
                Outcome::new(
                    BoxType::Sonstige,
                    "spreadsheet_error",
                    ClassificationSource::Fallback,
                    Confidence::Low,
                    format!("Tabellen-Klassifikation fehlgeschlagen: {}", clip(&e.to_string(), 100)),
                )
            }
        }
    }

    /// Persist empty-page counters as soon as a valid PDF is
    /// inspected; purely informational, never blocks the pipeline.
    async fn check_and_log_empty_pages(&self, doc: &Document, pdf_path: &Path) {
        let (empty_pages, total) = self.pdf.detect_empty_pages(pdf_path);
        if total == 0 {
            return;
        }
        let empty_count = empty_pages.len() as u32;

        if let Err(e) = self.docs.set_page_counts(doc.id, empty_count, total).await {
            warn!(
                "Leere-Seiten-Werte konnten nicht gespeichert werden fuer Dokument {}: {}",
                doc.id, e
            );
        }

        if empty_count > 0 {
            let detail = if empty_count == total {
                format!("PDF komplett leer ({} Seiten)", total)
            } else {
                format!(
                    "Leere Seiten erkannt: {} von {} (Seiten: {:?})",
                    empty_count, total, empty_pages
                )
            };
            info!("[Leere Seiten] {}: {}", doc.original_filename, detail);
            self.log_history(HistoryEntry {
                document_id: Some(doc.id),
                action_details: Some(serde_json::json!({
                    "empty_page_count": empty_count,
                    "total_page_count": total,
                    "empty_page_numbers": empty_pages,
                    "detail": detail,
                })),
                ..HistoryEntry::action("empty_pages_detected", "processing")
            })
            .await;
        }
    }

    async fn persist_ai_data(&self, doc: &Document, outcome: &Outcome) -> Result<(), ApiError> {
        let (text, pages) = outcome
            .ai_text
            .clone()
            .unwrap_or((String::new(), 0));
        let has_text = !text.trim().is_empty();

        let meta = outcome.ai_meta.as_ref();
        let data = AiData {
            extracted_text: has_text.then(|| text.clone()),
            extracted_text_sha256: has_text.then(|| probe::sha256_bytes(text.as_bytes())),
            extraction_method: if has_text { "text" } else { "none" }.to_string(),
            extracted_page_count: pages,
            ai_full_response: meta.map(|m| m.raw_response.clone()),
            ai_prompt_text: meta.map(|m| m.prompt_text.clone()),
            ai_model: meta.map(|m| m.model.clone()),
            ai_prompt_version: PROMPT_VERSION.to_string(),
            ai_stage: meta.map(|m| m.stage.clone()),
            text_char_count: (!text.is_empty()).then(|| text.len() as u64),
            ai_response_char_count: meta
                .map(|m| m.raw_response.len() as u64)
                .filter(|&n| n > 0),
            prompt_tokens: meta.map(|m| m.usage.prompt_tokens),
            completion_tokens: meta.map(|m| m.usage.completion_tokens),
            total_tokens: meta.map(|m| m.usage.total_tokens),
        };

        self.docs.save_ai_data(doc.id, &data).await?;
        debug!(
            "AI-Daten gespeichert fuer Dokument {} ({}): method={}, pages={}, tokens={:?}",
            doc.id,
            doc.original_filename,
            data.extraction_method,
            pages,
            data.total_tokens
        );
        Ok(())
    }

    async fn log_history(&self, entry: HistoryEntry) {
        self.history.create(&entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(vu: &str, sender: Option<&str>, date: &str) -> GdvHeader {
        GdvHeader {
            vu_number: vu.to_string(),
            sender: sender.map(str::to_string),
            date_iso: date.to_string(),
        }
    }

    #[test]
    fn test_gdv_filename_full_header() {
        let name = gdv_filename(&header("12345", Some("Hanse Versicherung"), "2025-04-30"));
        assert_eq!(name.as_deref(), Some("Hanse_Versicherung_2025-04-30_VU12345.gdv"));
    }

    #[test]
    fn test_gdv_filename_omits_missing_components() {
        // No sender: the VU number leads, no VU suffix.
        let name = gdv_filename(&header("12345", None, "2025-04-30"));
        assert_eq!(name.as_deref(), Some("12345_2025-04-30.gdv"));

        // Fallback date is omitted.
        let name = gdv_filename(&header("12345", Some("Concordia"), probe::GDV_FALLBACK_DATE));
        assert_eq!(name.as_deref(), Some("Concordia_VU12345.gdv"));

        // Only fallbacks: nothing usable.
        let name = gdv_filename(&header(probe::GDV_FALLBACK_VU, None, probe::GDV_FALLBACK_DATE));
        assert_eq!(name, None);
    }

    #[test]
    fn test_sparte_filename_courtage() {
        assert_eq!(
            sparte_filename(Some("Hanse Merkur"), None, "courtage", None, Some("2025-03-01")),
            Some("Hanse_Merkur_Courtage_2025-03-01.pdf".to_string())
        );
        assert_eq!(
            sparte_filename(None, None, "courtage", None, None),
            Some("Unbekannt_Courtage.pdf".to_string())
        );
    }

    #[test]
    fn test_sparte_filename_sparten_and_docname() {
        assert_eq!(
            sparte_filename(Some("Allianz"), None, "sach", None, Some("2025-01-01")),
            Some("Allianz_Sach.pdf".to_string()),
            "date only for courtage"
        );
        assert_eq!(
            sparte_filename(Some("AXA"), None, "sonstige", Some("Beitragsrechnung"), None),
            Some("AXA_Beitragsrechnung.pdf".to_string())
        );
        assert_eq!(
            sparte_filename(None, None, "sonstige", None, None),
            None,
            "sonstige without a name keeps the original filename"
        );
        // Document metadata VU is the fallback when the model found none.
        assert_eq!(
            sparte_filename(None, Some("Degenia"), "leben", None, None),
            Some("Degenia_Leben.pdf".to_string())
        );
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*_index.xml", "Lieferung_4711_index.xml"));
        assert!(wildcard_match("Lieferung_*.xml", "Lieferung_1.xml"));
        assert!(wildcard_match("a*b.xml", "a_middle_b.xml"));
        assert!(wildcard_match("exact.xml", "exact.xml"));
        assert!(!wildcard_match("*_index.xml", "index_was_first.xml"));
        assert!(!wildcard_match("Lieferung_*.xml", "lieferung_1.xml"));
    }

    #[test]
    fn test_bipro_code_prefixes() {
        let mut doc: Document =
            serde_json::from_value(serde_json::json!({"id": 1, "filename": "x.pdf"})).unwrap();
        assert!(!is_bipro_gdv(&doc));

        doc.bipro_category = Some("999005000".into());
        assert!(is_bipro_gdv(&doc));
        assert!(!is_bipro_courtage(&doc));

        doc.bipro_category = Some("300001000".into());
        assert!(is_bipro_courtage(&doc));
        assert!(!is_bipro_gdv(&doc));
    }

    #[test]
    fn test_cache_exclusions() {
        let mut outcome = Outcome::new(
            BoxType::Sach,
            "sparte_sach",
            ClassificationSource::KiGpt4oMini,
            Confidence::High,
            "ok",
        );
        assert!(outcome.is_cacheable());

        outcome.source = ClassificationSource::CacheDedup;
        assert!(!outcome.is_cacheable(), "cache hits are not re-cached");

        outcome.source = ClassificationSource::RuleValidation;
        outcome.category = Some("pdf_corrupt".to_string());
        assert!(!outcome.is_cacheable(), "corrupt PDFs may heal on retry");

        outcome.category = Some("pdf_error".to_string());
        assert!(!outcome.is_cacheable());

        outcome.category = Some("pdf_encrypted".to_string());
        assert!(outcome.is_cacheable(), "encryption outcome is deterministic");
    }

    #[test]
    fn test_clip_limits_chars() {
        let long = "ä".repeat(600);
        assert_eq!(clip(&long, 500).chars().count(), 500);
        assert_eq!(clip("kurz", 500), "kurz");
    }
}
