//! Post-classification document rules: duplicate handling and
//! empty-page policies.
//!
//! Runs after the AI-data upsert because content-duplicate relations
//! are only set server-side once the extracted text is stored. Rule
//! failures are logged and never fail the batch.

use tracing::{info, warn};

use crate::api::{
    DocumentRules, DocumentsApi, DuplicateAction, FullEmptyAction, PartialEmptyAction,
};
use crate::models::Document;
use crate::pdf::PdfService;

/// Applies the configured document rules to one finished document.
#[derive(Clone)]
pub struct RulesPostProcessor {
    docs: DocumentsApi,
    pdf: PdfService,
    rules: DocumentRules,
}

impl RulesPostProcessor {
    pub fn new(docs: DocumentsApi, pdf: PdfService, rules: DocumentRules) -> Self {
        Self { docs, pdf, rules }
    }

    pub fn rules(&self) -> &DocumentRules {
        &self.rules
    }

    /// Apply all matching rules; returns the actions taken.
    pub async fn apply(&self, doc_id: i64) -> Vec<&'static str> {
        let mut actions = Vec::new();
        if !self.rules.has_any_rule() {
            return actions;
        }

        // Refetch: content-duplicate relations and page counters are
        // only current server-side.
        let doc = match self.docs.get(doc_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return actions,
            Err(e) => {
                warn!("Dokumenten-Regeln: Refetch fuer {} fehlgeschlagen: {}", doc_id, e);
                return actions;
            }
        };

        if doc.is_completely_empty() {
            match self.rules.full_empty_action {
                FullEmptyAction::Delete => {
                    info!("Dokumenten-Regel: Komplett leere Datei {} wird geloescht", doc.id);
                    self.docs.delete_documents(&[doc.id]).await;
                    actions.push("full_empty_delete");
                    return actions;
                }
                FullEmptyAction::ColorFile => {
                    if let Some(color) = self.rules.full_empty_color {
                        info!(
                            "Dokumenten-Regel: Komplett leere Datei {} wird markiert ({})",
                            doc.id,
                            color.as_str()
                        );
                        let _ = self.docs.set_document_color(doc.id, Some(color.as_str())).await;
                        actions.push("full_empty_color");
                    }
                }
                FullEmptyAction::None => {}
            }
        } else if doc.has_empty_pages() {
            match self.rules.partial_empty_action {
                PartialEmptyAction::RemovePages => {
                    info!("Dokumenten-Regel: Leere Seiten entfernen bei Dokument {}", doc.id);
                    self.remove_empty_pages(&doc).await;
                    actions.push("partial_empty_remove");
                }
                PartialEmptyAction::ColorFile => {
                    if let Some(color) = self.rules.partial_empty_color {
                        info!(
                            "Dokumenten-Regel: Datei {} mit leeren Seiten markiert ({})",
                            doc.id,
                            color.as_str()
                        );
                        let _ = self.docs.set_document_color(doc.id, Some(color.as_str())).await;
                        actions.push("partial_empty_color");
                    }
                }
                PartialEmptyAction::None => {}
            }
        }

        // File duplicate: same raw-bytes hash as an earlier upload.
        if doc.is_duplicate() {
            if let Some(original_id) = doc.previous_version_id {
                if self
                    .apply_duplicate_rule(
                        &doc,
                        self.rules.file_dup_action,
                        self.rules.file_dup_color.map(|c| c.as_str()),
                        original_id,
                        "Datei-Duplikat",
                    )
                    .await
                {
                    actions.push("file_dup");
                }
            }
        }

        // Content duplicate: same extracted-text hash.
        if let Some(original_id) = doc.content_duplicate_of_id {
            if self
                .apply_duplicate_rule(
                    &doc,
                    self.rules.content_dup_action,
                    self.rules.content_dup_color.map(|c| c.as_str()),
                    original_id,
                    "Inhaltsduplikat",
                )
                .await
            {
                actions.push("content_dup");
            }
        }

        actions
    }

    async fn apply_duplicate_rule(
        &self,
        doc: &Document,
        action: DuplicateAction,
        color: Option<&str>,
        original_id: i64,
        rule_type: &str,
    ) -> bool {
        match action {
            DuplicateAction::None => false,
            DuplicateAction::ColorBoth => {
                let Some(color) = color else { return false };
                info!(
                    "Dokumenten-Regel: {} - Beide markieren ({}): {} + {}",
                    rule_type, color, doc.id, original_id
                );
                self.docs
                    .set_documents_color(&[doc.id, original_id], Some(color))
                    .await;
                true
            }
            DuplicateAction::ColorNew => {
                let Some(color) = color else { return false };
                info!(
                    "Dokumenten-Regel: {} - Neue Datei markieren ({}): {}",
                    rule_type, color, doc.id
                );
                let _ = self.docs.set_document_color(doc.id, Some(color)).await;
                true
            }
            DuplicateAction::DeleteNew => {
                info!("Dokumenten-Regel: {} - Neue Datei loeschen: {}", rule_type, doc.id);
                self.docs.delete_documents(&[doc.id]).await;
                true
            }
            DuplicateAction::DeleteOld => {
                info!("Dokumenten-Regel: {} - Alte Datei loeschen: {}", rule_type, original_id);
                self.docs.delete_documents(&[original_id]).await;
                true
            }
        }
    }

    async fn remove_empty_pages(&self, doc: &Document) {
        let tmpdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Temp-Verzeichnis nicht erstellbar: {}", e);
                return;
            }
        };

        let local_path = match self.docs.download(doc.id, tmpdir.path(), None).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Dokument {} konnte nicht heruntergeladen werden: {}", doc.id, e);
                return;
            }
        };

        if let Err(e) = self.pdf.remove_empty_pages(&local_path, doc.id, &self.docs).await {
            warn!("Leere-Seiten-Entfernung fehlgeschlagen fuer Dokument {}: {}", doc.id, e);
        }
    }
}
