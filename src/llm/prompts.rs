//! Prompt templates for the classification stages.
//!
//! Server-side settings may override stage 1 and stage 2 completely;
//! these are the built-in defaults. `{content}` is replaced with the
//! extracted document text.

/// Stage 1: cheap triage into a Sparte with confidence.
pub const STAGE1_TRIAGE: &str = r#"Du bist ein Klassifikator fuer Dokumente deutscher Versicherungsmakler.
Ordne das Dokument genau einer Sparte zu:
- courtage: Provisions- oder Courtageabrechnung, Vermittlerabrechnung
- sach: Sachversicherung (Haftpflicht, Hausrat, Wohngebaeude, Kfz, Unfall, Rechtsschutz, Gewerbe)
- leben: Lebensversicherung, Rente, Altersvorsorge, Berufsunfaehigkeit
- kranken: Krankenversicherung, Pflege, Zusatzversicherung
- sonstige: alles andere oder nicht eindeutig

Antworte NUR mit JSON:
{"sparte": "...", "confidence": "high|medium|low", "document_date_iso": "YYYY-MM-DD oder null", "vu_name": "Name des Versicherers oder null"}

Dokument:
{content}"#;

/// Stage 2: detail pass, also names the document type.
pub const STAGE2_DETAIL: &str = r#"Du bist ein Experte fuer Dokumente deutscher Versicherungsmakler.
Analysiere das Dokument gruendlich und bestimme Sparte, Versicherer, Datum
und einen kurzen praegnanten Dokumentnamen (z.B. "Beitragsrechnung", "Nachtrag", "Kuendigung").

Sparten: courtage, sach, leben, kranken, sonstige.

Antworte NUR mit JSON:
{"sparte": "...", "confidence": "high|medium|low", "document_date_iso": "YYYY-MM-DD oder null", "vu_name": "... oder null", "document_name": "... oder null"}

Dokument:
{content}"#;

/// Compact prompt when the document is already known to be Courtage;
/// only insurer and date are needed.
pub const COURTAGE_MINIMAL: &str = r#"Das Dokument ist eine Courtage-/Provisionsabrechnung.
Extrahiere NUR den Namen des Versicherers und das Abrechnungsdatum.

Antworte NUR mit JSON:
{"insurer": "... oder null", "document_date_iso": "YYYY-MM-DD oder null"}

Dokument:
{content}"#;

/// Classification of tabular files from their first rows.
pub const SPREADSHEET: &str = r#"Du bist ein Klassifikator fuer Dokumente deutscher Versicherungsmakler.
Die folgenden Zeilen stammen aus einer Tabellendatei (CSV oder Excel).
Ordne sie einer Sparte zu: courtage, sach, leben, kranken, sonstige.

Antworte NUR mit JSON:
{"sparte": "...", "confidence": "high|medium|low", "vu_name": "... oder null"}

Tabelleninhalt:
{content}"#;

/// Fill a template with document content.
pub fn render(template: &str, content: &str) -> String {
    template.replace("{content}", content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_content() {
        let prompt = render(STAGE1_TRIAGE, "Beitragsrechnung 2025");
        assert!(prompt.contains("Beitragsrechnung 2025"));
        assert!(!prompt.contains("{content}"));
    }
}
