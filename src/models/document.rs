//! Document model for the archive box system.
//!
//! Documents live in exactly one box at a time and walk a linear
//! processing state machine while the classifier works on them. The
//! server-side JSON is deliberately lax: absent keys fall back to
//! defaults and unknown keys are ignored.

use serde::{Deserialize, Serialize};

/// Box types in display order. `falsch` is admin-only.
pub const BOX_TYPES: [BoxType; 10] = [
    BoxType::Eingang,
    BoxType::Verarbeitung,
    BoxType::Gdv,
    BoxType::Courtage,
    BoxType::Sach,
    BoxType::Leben,
    BoxType::Kranken,
    BoxType::Sonstige,
    BoxType::Roh,
    BoxType::Falsch,
];

/// A named bucket on the server; each document belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxType {
    Eingang,
    Verarbeitung,
    Gdv,
    Courtage,
    Sach,
    Leben,
    Kranken,
    Sonstige,
    Roh,
    Falsch,
}

impl BoxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eingang => "eingang",
            Self::Verarbeitung => "verarbeitung",
            Self::Gdv => "gdv",
            Self::Courtage => "courtage",
            Self::Sach => "sach",
            Self::Leben => "leben",
            Self::Kranken => "kranken",
            Self::Sonstige => "sonstige",
            Self::Roh => "roh",
            Self::Falsch => "falsch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "eingang" => Some(Self::Eingang),
            "verarbeitung" => Some(Self::Verarbeitung),
            "gdv" => Some(Self::Gdv),
            "courtage" => Some(Self::Courtage),
            "sach" => Some(Self::Sach),
            "leben" => Some(Self::Leben),
            "kranken" => Some(Self::Kranken),
            "sonstige" => Some(Self::Sonstige),
            "roh" => Some(Self::Roh),
            "falsch" => Some(Self::Falsch),
            _ => None,
        }
    }

    /// Only the six target boxes may carry archived documents.
    pub fn is_archivable(&self) -> bool {
        matches!(
            self,
            Self::Gdv | Self::Courtage | Self::Sach | Self::Leben | Self::Kranken | Self::Sonstige
        )
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state machine per document.
///
/// Transitions persist in order: pending -> processing -> classified
/// -> (renamed) -> archived. `manual_excluded` is a sink; only a human
/// action returns the document to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Classified,
    Renamed,
    Archived,
    Completed,
    Error,
    ManualExcluded,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Classified => "classified",
            Self::Renamed => "renamed",
            Self::Archived => "archived",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::ManualExcluded => "manual_excluded",
        }
    }
}

/// How the document entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    BiproAuto,
    ManualUpload,
    SelfCreated,
    Scan,
    #[serde(other)]
    Unknown,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BiproAuto => "bipro_auto",
            Self::ManualUpload => "manual_upload",
            Self::SelfCreated => "self_created",
            Self::Scan => "scan",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for SourceType {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Audit tag recording which branch of the decision ladder fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    CacheDedup,
    RulePattern,
    RuleBipro,
    RuleExtension,
    RuleValidation,
    RuleFilename,
    RuleFilenameKi,
    KiCourtageMinimal,
    KiGpt4oMini,
    KiGpt4oZweistufig,
    KiSpreadsheet,
    Fallback,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheDedup => "cache_dedup",
            Self::RulePattern => "rule_pattern",
            Self::RuleBipro => "rule_bipro",
            Self::RuleExtension => "rule_extension",
            Self::RuleValidation => "rule_validation",
            Self::RuleFilename => "rule_filename",
            Self::RuleFilenameKi => "rule_filename_ki",
            Self::KiCourtageMinimal => "ki_courtage_minimal",
            Self::KiGpt4oMini => "ki_gpt4o_mini",
            Self::KiGpt4oZweistufig => "ki_gpt4o_zweistufig",
            Self::KiSpreadsheet => "ki_spreadsheet",
            Self::Fallback => "fallback",
        }
    }
}

/// Classifier confidence attached to each audit tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// User colour marks persisted across all operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayColor {
    Green,
    Red,
    Blue,
    Orange,
    Purple,
    Pink,
    Cyan,
    Yellow,
}

impl DisplayColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Orange => "orange",
            Self::Purple => "purple",
            Self::Pink => "pink",
            Self::Cyan => "cyan",
            Self::Yellow => "yellow",
        }
    }
}

/// Audit metadata tolerates values newer clients may write; anything
/// unknown reads as absent instead of failing the whole document.
fn lenient_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn default_version() -> u32 {
    1
}

fn default_processing_status() -> ProcessingStatus {
    ProcessingStatus::Completed
}

fn default_box_type() -> BoxType {
    BoxType::Sonstige
}

/// A document in the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Server-assigned identity.
    pub id: i64,
    /// Server-stored filename.
    pub filename: String,
    /// Display filename; falls back to `filename` when absent.
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub is_gdv: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub uploaded_by_name: Option<String>,
    #[serde(default)]
    pub vu_name: Option<String>,
    #[serde(default)]
    pub shipment_id: Option<i64>,
    #[serde(default)]
    pub external_shipment_id: Option<String>,
    #[serde(default)]
    pub source_xml_index_id: Option<i64>,
    #[serde(default)]
    pub bipro_document_id: Option<String>,
    #[serde(default)]
    pub ai_renamed: bool,
    #[serde(default)]
    pub ai_processing_error: Option<String>,
    #[serde(default = "default_box_type")]
    pub box_type: BoxType,
    #[serde(default = "default_processing_status")]
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub document_category: Option<String>,
    /// 9-digit BiPRO category code (e.g. "300001000" for commission).
    #[serde(default)]
    pub bipro_category: Option<String>,
    /// Technical PDF validation outcome (OK, PDF_CORRUPT, PDF_ENCRYPTED, ...).
    #[serde(default)]
    pub validation_status: Option<String>,
    /// SHA-256 hex of the raw bytes, set server-side on upload.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub previous_version_id: Option<i64>,
    /// Counterpart with identical extracted-text hash, set server-side
    /// after the AI-data upsert.
    #[serde(default)]
    pub content_duplicate_of_id: Option<i64>,
    #[serde(default)]
    pub duplicate_of_filename: Option<String>,
    #[serde(default)]
    pub empty_page_count: Option<u32>,
    #[serde(default)]
    pub total_page_count: Option<u32>,
    #[serde(default, deserialize_with = "lenient_opt")]
    pub classification_source: Option<ClassificationSource>,
    #[serde(default, deserialize_with = "lenient_opt")]
    pub classification_confidence: Option<Confidence>,
    #[serde(default)]
    pub classification_reason: Option<String>,
    #[serde(default)]
    pub classification_timestamp: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub display_color: Option<String>,
}

impl Document {
    /// Display name, preferring `original_filename`.
    pub fn display_name(&self) -> &str {
        if self.original_filename.is_empty() {
            &self.filename
        } else {
            &self.original_filename
        }
    }

    /// File extension of the display name, lowercase, with dot.
    pub fn file_extension(&self) -> String {
        match self.display_name().rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => format!(".{}", ext.to_lowercase()),
            _ => String::new(),
        }
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type.as_deref() == Some("application/pdf")
            || self.display_name().to_lowercase().ends_with(".pdf")
    }

    pub fn is_xml(&self) -> bool {
        matches!(
            self.mime_type.as_deref(),
            Some("application/xml") | Some("text/xml")
        ) || self.display_name().to_lowercase().ends_with(".xml")
    }

    pub fn is_spreadsheet(&self) -> bool {
        matches!(
            self.file_extension().as_str(),
            ".csv" | ".tsv" | ".xlsx" | ".xls"
        )
    }

    /// File duplicate: upload matched the raw-bytes hash of an earlier document.
    pub fn is_duplicate(&self) -> bool {
        self.version > 1
    }

    /// Content duplicate: extracted-text hash matched another document.
    pub fn is_content_duplicate(&self) -> bool {
        self.content_duplicate_of_id.is_some()
    }

    pub fn has_empty_pages(&self) -> bool {
        self.empty_page_count.unwrap_or(0) > 0
    }

    pub fn is_completely_empty(&self) -> bool {
        let total = self.total_page_count.unwrap_or(0);
        total > 0 && self.empty_page_count.unwrap_or(0) == total
    }
}

/// Counts per box plus archived companions for the target boxes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoxStats {
    #[serde(default)]
    pub eingang: u64,
    #[serde(default)]
    pub verarbeitung: u64,
    #[serde(default)]
    pub gdv: u64,
    #[serde(default)]
    pub courtage: u64,
    #[serde(default)]
    pub sach: u64,
    #[serde(default)]
    pub leben: u64,
    #[serde(default)]
    pub kranken: u64,
    #[serde(default)]
    pub sonstige: u64,
    #[serde(default)]
    pub roh: u64,
    #[serde(default)]
    pub falsch: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub gdv_archived: u64,
    #[serde(default)]
    pub courtage_archived: u64,
    #[serde(default)]
    pub sach_archived: u64,
    #[serde(default)]
    pub leben_archived: u64,
    #[serde(default)]
    pub kranken_archived: u64,
    #[serde(default)]
    pub sonstige_archived: u64,
    #[serde(default)]
    pub falsch_archived: u64,
}

impl BoxStats {
    pub fn count(&self, box_type: BoxType) -> u64 {
        match box_type {
            BoxType::Eingang => self.eingang,
            BoxType::Verarbeitung => self.verarbeitung,
            BoxType::Gdv => self.gdv,
            BoxType::Courtage => self.courtage,
            BoxType::Sach => self.sach,
            BoxType::Leben => self.leben,
            BoxType::Kranken => self.kranken,
            BoxType::Sonstige => self.sonstige,
            BoxType::Roh => self.roh,
            BoxType::Falsch => self.falsch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_from(json: serde_json::Value) -> Document {
        serde_json::from_value(json).expect("document should deserialize")
    }

    #[test]
    fn test_lax_deserialization_defaults() {
        // Only id + filename present; unknown keys must be ignored.
        let doc = doc_from(serde_json::json!({
            "id": 7,
            "filename": "a.pdf",
            "some_future_field": {"nested": true}
        }));
        assert_eq!(doc.version, 1);
        assert_eq!(doc.box_type, BoxType::Sonstige);
        assert_eq!(doc.processing_status, ProcessingStatus::Completed);
        assert_eq!(doc.display_name(), "a.pdf");
        assert!(!doc.is_duplicate());
    }

    #[test]
    fn test_file_extension() {
        let mut doc = doc_from(serde_json::json!({"id": 1, "filename": "x"}));
        doc.original_filename = "Rechnung.PDF".into();
        assert_eq!(doc.file_extension(), ".pdf");
        assert!(doc.is_pdf());

        doc.original_filename = "noext".into();
        assert_eq!(doc.file_extension(), "");
    }

    #[test]
    fn test_empty_page_derivations() {
        let mut doc = doc_from(serde_json::json!({"id": 1, "filename": "x.pdf"}));
        assert!(!doc.has_empty_pages());
        assert!(!doc.is_completely_empty());

        doc.empty_page_count = Some(2);
        doc.total_page_count = Some(5);
        assert!(doc.has_empty_pages());
        assert!(!doc.is_completely_empty());

        doc.empty_page_count = Some(5);
        assert!(doc.is_completely_empty());
    }

    #[test]
    fn test_box_type_roundtrip() {
        for bt in BOX_TYPES {
            assert_eq!(BoxType::from_str(bt.as_str()), Some(bt));
        }
        assert!(BoxType::from_str("attic").is_none());
        assert!(BoxType::Gdv.is_archivable());
        assert!(!BoxType::Eingang.is_archivable());
        assert!(!BoxType::Roh.is_archivable());
    }

    #[test]
    fn test_unknown_audit_values_read_as_absent() {
        let doc = doc_from(serde_json::json!({
            "id": 1,
            "filename": "x.pdf",
            "classification_source": "rule_from_the_future",
            "classification_confidence": "very_high"
        }));
        assert_eq!(doc.classification_source, None);
        assert_eq!(doc.classification_confidence, None);

        let doc = doc_from(serde_json::json!({
            "id": 1,
            "filename": "x.pdf",
            "classification_source": "rule_bipro",
            "classification_confidence": "high"
        }));
        assert_eq!(doc.classification_source, Some(ClassificationSource::RuleBipro));
        assert_eq!(doc.classification_confidence, Some(Confidence::High));
    }

    #[test]
    fn test_source_type_unknown_tolerated() {
        let doc = doc_from(serde_json::json!({
            "id": 1,
            "filename": "x",
            "source_type": "carrier_pigeon"
        }));
        assert_eq!(doc.source_type, SourceType::Unknown);
    }
}
