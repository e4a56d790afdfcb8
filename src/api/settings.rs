//! Server-side AI processing settings (two-stage classification) and
//! document rules, loaded once per batch run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::models::{Confidence, DisplayColor};

use super::client::ApiClient;

/// Two-stage classification settings from `GET /admin/processing-settings`.
///
/// Every field is optional on the wire; absent fields fall back to the
/// built-in defaults so a failing settings API never aborts a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default)]
    pub stage1_prompt: Option<String>,
    #[serde(default)]
    pub stage1_model: Option<String>,
    #[serde(default)]
    pub stage1_max_tokens: Option<u32>,
    #[serde(default = "default_stage2_enabled")]
    pub stage2_enabled: bool,
    #[serde(default)]
    pub stage2_prompt: Option<String>,
    #[serde(default)]
    pub stage2_model: Option<String>,
    #[serde(default)]
    pub stage2_max_tokens: Option<u32>,
    #[serde(default)]
    pub stage2_trigger: Option<String>,
}

fn default_stage2_enabled() -> bool {
    true
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            stage1_prompt: None,
            stage1_model: None,
            stage1_max_tokens: None,
            stage2_enabled: true,
            stage2_prompt: None,
            stage2_model: None,
            stage2_max_tokens: None,
            stage2_trigger: None,
        }
    }
}

impl AiSettings {
    /// Whether the detail stage should run for a triage outcome.
    ///
    /// Default trigger: confidence below high, or triage parked the
    /// document in `sonstige`.
    pub fn stage2_triggers(&self, confidence: Confidence, sparte: &str) -> bool {
        if !self.stage2_enabled {
            return false;
        }
        match self.stage2_trigger.as_deref() {
            Some("always") => true,
            Some("sonstige_only") => sparte == "sonstige",
            Some("low_confidence") => confidence != Confidence::High,
            _ => confidence != Confidence::High || sparte == "sonstige",
        }
    }
}

/// Action on duplicate documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAction {
    None,
    ColorBoth,
    ColorNew,
    DeleteNew,
    DeleteOld,
}

impl Default for DuplicateAction {
    fn default() -> Self {
        Self::None
    }
}

/// Action when every page of a PDF is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullEmptyAction {
    None,
    Delete,
    ColorFile,
}

impl Default for FullEmptyAction {
    fn default() -> Self {
        Self::None
    }
}

/// Action when some but not all pages are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialEmptyAction {
    None,
    RemovePages,
    ColorFile,
}

impl Default for PartialEmptyAction {
    fn default() -> Self {
        Self::None
    }
}

/// Duplicate and empty-page policies from `GET /admin/document-rules`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentRules {
    #[serde(default)]
    pub file_dup_action: DuplicateAction,
    #[serde(default)]
    pub file_dup_color: Option<DisplayColor>,
    #[serde(default)]
    pub content_dup_action: DuplicateAction,
    #[serde(default)]
    pub content_dup_color: Option<DisplayColor>,
    #[serde(default)]
    pub full_empty_action: FullEmptyAction,
    #[serde(default)]
    pub full_empty_color: Option<DisplayColor>,
    #[serde(default)]
    pub partial_empty_action: PartialEmptyAction,
    #[serde(default)]
    pub partial_empty_color: Option<DisplayColor>,
}

impl DocumentRules {
    pub fn has_any_rule(&self) -> bool {
        self.file_dup_action != DuplicateAction::None
            || self.content_dup_action != DuplicateAction::None
            || self.full_empty_action != FullEmptyAction::None
            || self.partial_empty_action != PartialEmptyAction::None
    }
}

/// Settings API; failures degrade to defaults.
#[derive(Clone)]
pub struct ProcessingSettingsApi {
    client: ApiClient,
}

impl ProcessingSettingsApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Load the AI settings; defaults when the API is unreachable.
    pub async fn ai_settings(&self) -> AiSettings {
        match self.client.get("/admin/processing-settings", &[]).await {
            Ok(response) if response.get("success").and_then(Value::as_bool) == Some(true) => {
                match serde_json::from_value::<AiSettings>(response["data"].clone()) {
                    Ok(settings) => {
                        info!(
                            "KI-Settings geladen: S1={:?}, S2={}",
                            settings.stage1_model,
                            if settings.stage2_enabled { "aktiv" } else { "deaktiviert" }
                        );
                        settings
                    }
                    Err(e) => {
                        warn!("KI-Settings nicht lesbar, verwende Defaults: {}", e);
                        AiSettings::default()
                    }
                }
            }
            Ok(_) => {
                warn!("KI-Settings leer, verwende Defaults");
                AiSettings::default()
            }
            Err(e) => {
                warn!("KI-Settings konnten nicht geladen werden, verwende Defaults: {}", e);
                AiSettings::default()
            }
        }
    }

    /// Load the document rules; `None` when unavailable.
    pub async fn document_rules(&self) -> Option<DocumentRules> {
        match self.client.get("/admin/document-rules", &[]).await {
            Ok(response) if response.get("success").and_then(Value::as_bool) == Some(true) => {
                match serde_json::from_value::<DocumentRules>(response["data"].clone()) {
                    Ok(rules) => {
                        if rules.has_any_rule() {
                            info!(
                                "Dokumenten-Regeln geladen: Datei-Dup={:?}, Content-Dup={:?}, Partial-Empty={:?}, Full-Empty={:?}",
                                rules.file_dup_action,
                                rules.content_dup_action,
                                rules.partial_empty_action,
                                rules.full_empty_action
                            );
                        }
                        Some(rules)
                    }
                    Err(e) => {
                        warn!("Dokumenten-Regeln nicht lesbar: {}", e);
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Dokumenten-Regeln konnten nicht geladen werden: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage2_default_trigger() {
        let settings = AiSettings::default();
        assert!(!settings.stage2_triggers(Confidence::High, "sach"));
        assert!(settings.stage2_triggers(Confidence::Medium, "sach"));
        assert!(settings.stage2_triggers(Confidence::High, "sonstige"));
    }

    #[test]
    fn test_stage2_disabled_never_triggers() {
        let settings = AiSettings { stage2_enabled: false, ..Default::default() };
        assert!(!settings.stage2_triggers(Confidence::Low, "sonstige"));
    }

    #[test]
    fn test_stage2_named_triggers() {
        let always = AiSettings {
            stage2_trigger: Some("always".into()),
            ..Default::default()
        };
        assert!(always.stage2_triggers(Confidence::High, "sach"));

        let sonstige = AiSettings {
            stage2_trigger: Some("sonstige_only".into()),
            ..Default::default()
        };
        assert!(!sonstige.stage2_triggers(Confidence::Low, "sach"));
        assert!(sonstige.stage2_triggers(Confidence::High, "sonstige"));
    }

    #[test]
    fn test_rules_deserialization_lax() {
        let rules: DocumentRules = serde_json::from_value(serde_json::json!({
            "content_dup_action": "color_both",
            "content_dup_color": "blue"
        }))
        .unwrap();
        assert_eq!(rules.content_dup_action, DuplicateAction::ColorBoth);
        assert_eq!(rules.content_dup_color, Some(DisplayColor::Blue));
        assert_eq!(rules.file_dup_action, DuplicateAction::None);
        assert!(rules.has_any_rule());

        let empty: DocumentRules = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!empty.has_any_rule());
    }
}
