//! Typed document operations over the HTTP core: listing, upload,
//! download, metadata patches, bulk moves and the AI-data upsert.
//!
//! Every bulk endpoint falls back to per-item calls when the server
//! rejects the request (API-version mismatch); callers always get the
//! summed success count.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::{BoxStats, BoxType, Document, ProcessingStatus, SourceType};

use super::client::ApiClient;
use super::error::{ApiError, ApiResult};

/// Filter for `GET /documents`.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub box_type: Option<BoxType>,
    pub is_archived: Option<bool>,
    pub source: Option<SourceType>,
    pub vu_id: Option<i64>,
    pub is_gdv: Option<bool>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub processing_status: Option<ProcessingStatus>,
}

impl DocumentFilter {
    pub fn by_box(box_type: BoxType) -> Self {
        Self { box_type: Some(box_type), ..Default::default() }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(b) = self.box_type {
            params.push(("box", b.as_str().to_string()));
        }
        if let Some(v) = self.vu_id {
            params.push(("vu", v.to_string()));
        }
        if let Some(s) = self.source {
            params.push(("source", s.as_str().to_string()));
        }
        if let Some(g) = self.is_gdv {
            params.push(("is_gdv", if g { "1" } else { "0" }.to_string()));
        }
        if let Some(f) = &self.from_date {
            params.push(("from", f.clone()));
        }
        if let Some(t) = &self.to_date {
            params.push(("to", t.clone()));
        }
        if let Some(p) = self.processing_status {
            params.push(("processing_status", p.as_str().to_string()));
        }
        if let Some(a) = self.is_archived {
            params.push(("is_archived", if a { "1" } else { "0" }.to_string()));
        }
        params
    }
}

/// Partial metadata update for `PUT /documents/{id}`; only set fields
/// are serialized.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_renamed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_processing_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_type: Option<BoxType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_status: Option<ProcessingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_confidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bipro_document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_xml_index_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
    /// Empty string removes the mark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_page_count: Option<u32>,
}

impl DocumentUpdate {
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| v.as_object().map(|o| o.is_empty()).unwrap_or(true))
            .unwrap_or(true)
    }
}

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub source_type: SourceType,
    pub box_type: Option<BoxType>,
    pub shipment_id: Option<String>,
    pub vu_name: Option<String>,
    pub bipro_category: Option<String>,
    pub validation_status: Option<String>,
}

/// AI-data upsert payload for `POST /documents/{id}/ai-data`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AiData {
    pub extracted_text: Option<String>,
    pub extracted_text_sha256: Option<String>,
    pub extraction_method: String,
    pub extracted_page_count: u32,
    pub ai_full_response: Option<String>,
    pub ai_prompt_text: Option<String>,
    pub ai_model: Option<String>,
    pub ai_prompt_version: String,
    pub ai_stage: Option<String>,
    pub text_char_count: Option<u64>,
    pub ai_response_char_count: Option<u64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Resolve a name collision inside `dir` by appending `_1`, `_2`, ...
pub(crate) fn resolve_collision_path(dir: &Path, filename: &str) -> PathBuf {
    let mut target = dir.join(filename);
    if !target.exists() {
        return target;
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{}", e)),
        _ => (filename.to_string(), String::new()),
    };
    let mut counter = 1;
    while target.exists() {
        target = dir.join(format!("{}_{}{}", stem, counter, ext));
        counter += 1;
    }
    target
}

fn success(response: &Value) -> bool {
    response.get("success").and_then(Value::as_bool) == Some(true)
}

fn normalize(mut doc: Document) -> Document {
    if doc.original_filename.is_empty() {
        doc.original_filename = doc.filename.clone();
    }
    doc
}

/// Document API with the box system.
#[derive(Clone)]
pub struct DocumentsApi {
    client: ApiClient,
}

impl DocumentsApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// List documents matching the filter.
    pub async fn list(&self, filter: &DocumentFilter) -> ApiResult<Vec<Document>> {
        let response = self.client.get("/documents", &filter.query()).await?;
        if !success(&response) {
            return Ok(Vec::new());
        }
        let docs = response["data"]["documents"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Document>(v).ok())
            .map(normalize)
            .collect();
        Ok(docs)
    }

    pub async fn list_by_box(&self, box_type: BoxType) -> ApiResult<Vec<Document>> {
        self.list(&DocumentFilter::by_box(box_type)).await
    }

    /// Full-text search constrained by an optional filter.
    pub async fn search(&self, query: &str, filter: &DocumentFilter) -> ApiResult<Vec<Document>> {
        let mut params = filter.query();
        params.push(("q", query.to_string()));
        let response = self.client.get("/documents", &params).await?;
        if !success(&response) {
            return Ok(Vec::new());
        }
        Ok(response["data"]["documents"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Document>(v).ok())
            .map(normalize)
            .collect())
    }

    /// Fetch a single document.
    pub async fn get(&self, doc_id: i64) -> ApiResult<Option<Document>> {
        let response = match self.client.get(&format!("/documents/{}", doc_id), &[]).await {
            Ok(r) => r,
            Err(ApiError::Api { status_code: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !success(&response) {
            return Ok(None);
        }
        let data = &response["data"];
        let raw = data.get("document").cloned().unwrap_or_else(|| data.clone());
        Ok(serde_json::from_value::<Document>(raw).ok().map(normalize))
    }

    /// Box statistics including archived companions.
    pub async fn stats(&self) -> ApiResult<BoxStats> {
        let response = self.client.get("/documents/stats", &[]).await?;
        if !success(&response) {
            return Ok(BoxStats::default());
        }
        Ok(serde_json::from_value(response["data"].clone()).unwrap_or_default())
    }

    /// Change history of a document from the activity log.
    pub async fn history(&self, doc_id: i64) -> ApiResult<Vec<Value>> {
        let response = self
            .client
            .get(&format!("/documents/{}/history", doc_id), &[])
            .await?;
        if !success(&response) {
            return Ok(Vec::new());
        }
        Ok(response["data"]["history"].as_array().cloned().unwrap_or_default())
    }

    /// Upload a file; returns the minimal document the server reports,
    /// including duplicate/version information.
    pub async fn upload(&self, file_path: &Path, options: &UploadOptions) -> ApiResult<Document> {
        let mut fields = vec![(
            "source_type".to_string(),
            options.source_type.as_str().to_string(),
        )];
        fields.push((
            "box_type".to_string(),
            options.box_type.unwrap_or(BoxType::Eingang).as_str().to_string(),
        ));
        if let Some(sid) = &options.shipment_id {
            fields.push(("shipment_id".to_string(), sid.clone()));
        }
        if let Some(vu) = &options.vu_name {
            fields.push(("vu_name".to_string(), vu.clone()));
        }
        if let Some(cat) = &options.bipro_category {
            fields.push(("bipro_category".to_string(), cat.clone()));
        }
        if let Some(vs) = &options.validation_status {
            fields.push(("validation_status".to_string(), vs.clone()));
        }

        let response = self.client.upload_file("/documents", file_path, &fields).await?;
        if !success(&response) {
            return Err(ApiError::api(500, "Upload ohne Erfolgs-Envelope"));
        }

        let doc: Document = serde_json::from_value(response["data"].clone())
            .map_err(|e| ApiError::api(500, format!("Upload-Antwort nicht lesbar: {}", e)))?;
        let doc = normalize(doc);

        if doc.is_duplicate() {
            info!(
                "Dokument hochgeladen: {} [DUPLIKAT v{}]",
                doc.original_filename, doc.version
            );
        } else {
            info!("Dokument hochgeladen: {}", doc.original_filename);
        }
        Ok(doc)
    }

    /// Download a document into `target_dir`.
    ///
    /// Resolves the filename (one extra API call when no override is
    /// given), creates the directory, dodges name collisions with
    /// `_1`, `_2`, ... suffixes and verifies the file exists after the
    /// write.
    pub async fn download(
        &self,
        doc_id: i64,
        target_dir: &Path,
        filename_override: Option<&str>,
    ) -> ApiResult<PathBuf> {
        let filename = match filename_override {
            Some(name) => name.to_string(),
            None => {
                let doc = self
                    .get(doc_id)
                    .await?
                    .ok_or_else(|| ApiError::api(404, format!("Dokument {} nicht gefunden", doc_id)))?;
                doc.original_filename
            }
        };

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| ApiError::Network(format!("Zielverzeichnis nicht erstellbar: {}", e)))?;

        let target_path = resolve_collision_path(target_dir, &filename);

        let result = self
            .client
            .download_file(&format!("/documents/{}", doc_id), &target_path)
            .await;

        match result {
            Ok(path) => {
                if !path.exists() {
                    return Err(ApiError::Network(format!(
                        "Download unvollstaendig: {} fehlt",
                        path.display()
                    )));
                }
                Ok(path)
            }
            Err(e) => {
                // download_file removes partial output itself; be safe anyway.
                let _ = std::fs::remove_file(&target_path);
                Err(e)
            }
        }
    }

    /// Replace a document's bytes while keeping its metadata; the
    /// server recomputes content hash and size.
    pub async fn replace_file(&self, doc_id: i64, file_path: &Path) -> ApiResult<()> {
        let response = self
            .client
            .upload_file(&format!("/documents/{}/replace", doc_id), file_path, &[])
            .await?;
        if !success(&response) {
            return Err(ApiError::api(500, "Datei-Ersetzung fehlgeschlagen"));
        }
        info!("Dokument {} Datei ersetzt: {}", doc_id, file_path.display());
        Ok(())
    }

    /// Patch document metadata.
    pub async fn update(&self, doc_id: i64, patch: &DocumentUpdate) -> ApiResult<()> {
        if patch.is_empty() {
            warn!("Keine Aenderungen angegeben");
            return Ok(());
        }
        let body = serde_json::to_value(patch)
            .map_err(|e| ApiError::api(500, format!("Update nicht serialisierbar: {}", e)))?;
        let response = self.client.put(&format!("/documents/{}", doc_id), &body).await?;
        if !success(&response) {
            return Err(ApiError::api(500, format!("Update fuer {} abgelehnt", doc_id)));
        }
        Ok(())
    }

    pub async fn rename(&self, doc_id: i64, new_filename: &str) -> ApiResult<()> {
        self.update(
            doc_id,
            &DocumentUpdate {
                original_filename: Some(new_filename.to_string()),
                ai_renamed: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Persist empty-page counters.
    pub async fn set_page_counts(&self, doc_id: i64, empty: u32, total: u32) -> ApiResult<()> {
        self.update(
            doc_id,
            &DocumentUpdate {
                empty_page_count: Some(empty),
                total_page_count: Some(total),
                ..Default::default()
            },
        )
        .await
    }

    // ----------------------------------------------------------------
    // Bulk operations (1 request each, per-item fallback)
    // ----------------------------------------------------------------

    /// Move documents into another box. Returns the moved count.
    pub async fn move_documents(
        &self,
        doc_ids: &[i64],
        target_box: BoxType,
        processing_status: Option<ProcessingStatus>,
    ) -> usize {
        if doc_ids.is_empty() {
            return 0;
        }
        let mut payload = serde_json::json!({
            "document_ids": doc_ids,
            "target_box": target_box.as_str(),
        });
        if let Some(status) = processing_status {
            payload["processing_status"] = Value::String(status.as_str().to_string());
        }

        match self.client.post("/documents/move", &payload).await {
            Ok(response) if success(&response) => {
                let moved = response["data"]["moved_count"].as_u64().unwrap_or(0) as usize;
                info!("{} Dokument(e) nach '{}' verschoben", moved, target_box);
                moved
            }
            Ok(_) => 0,
            Err(e) => {
                warn!("Bulk-Verschieben fehlgeschlagen, Einzel-Fallback: {}", e);
                let mut count = 0;
                for &id in doc_ids {
                    let patch = DocumentUpdate {
                        box_type: Some(target_box),
                        processing_status,
                        ..Default::default()
                    };
                    if self.update(id, &patch).await.is_ok() {
                        count += 1;
                    }
                }
                count
            }
        }
    }

    /// Delete documents. Returns the deleted count.
    pub async fn delete_documents(&self, doc_ids: &[i64]) -> usize {
        if doc_ids.is_empty() {
            return 0;
        }
        let payload = serde_json::json!({ "ids": doc_ids });
        match self.client.post("/documents/delete", &payload).await {
            Ok(response) if success(&response) => {
                let count = response["data"]["deleted_count"].as_u64().unwrap_or(0) as usize;
                info!("{} Dokument(e) geloescht (Bulk)", count);
                count
            }
            Ok(_) => 0,
            Err(e) => {
                warn!("Bulk-Loeschen fehlgeschlagen, Einzel-Fallback: {}", e);
                let mut count = 0;
                for &id in doc_ids {
                    match self.client.delete(&format!("/documents/{}", id)).await {
                        Ok(response) if success(&response) => count += 1,
                        _ => {}
                    }
                }
                count
            }
        }
    }

    /// Archive documents (hidden from normal box views).
    pub async fn archive_documents(&self, doc_ids: &[i64]) -> usize {
        self.bulk_archive_flag("/documents/archive", "archived_count", doc_ids, true).await
    }

    /// Undo archiving.
    pub async fn unarchive_documents(&self, doc_ids: &[i64]) -> usize {
        self.bulk_archive_flag("/documents/unarchive", "unarchived_count", doc_ids, false).await
    }

    async fn bulk_archive_flag(
        &self,
        endpoint: &str,
        count_key: &str,
        doc_ids: &[i64],
        archived: bool,
    ) -> usize {
        if doc_ids.is_empty() {
            return 0;
        }
        let payload = serde_json::json!({ "ids": doc_ids });
        match self.client.post(endpoint, &payload).await {
            Ok(response) if success(&response) => {
                response["data"][count_key].as_u64().unwrap_or(0) as usize
            }
            Ok(_) => 0,
            Err(e) => {
                warn!("Bulk-Archivierung fehlgeschlagen, Einzel-Fallback: {}", e);
                let mut count = 0;
                for &id in doc_ids {
                    let patch = DocumentUpdate { is_archived: Some(archived), ..Default::default() };
                    if self.update(id, &patch).await.is_ok() {
                        count += 1;
                    }
                }
                count
            }
        }
    }

    /// Set or clear the colour mark for several documents.
    pub async fn set_documents_color(&self, doc_ids: &[i64], color: Option<&str>) -> usize {
        if doc_ids.is_empty() {
            return 0;
        }
        let payload = serde_json::json!({ "ids": doc_ids, "color": color });
        match self.client.post("/documents/colors", &payload).await {
            Ok(response) if success(&response) => {
                let count = response["data"]["updated_count"].as_u64().unwrap_or(0) as usize;
                info!("Farbmarkierung fuer {} Dokument(e) gesetzt: {:?}", count, color);
                count
            }
            Ok(_) => 0,
            Err(e) => {
                warn!("Bulk-Farbmarkierung fehlgeschlagen, Einzel-Fallback: {}", e);
                let mut count = 0;
                for &id in doc_ids {
                    if self.set_document_color(id, color).await.is_ok() {
                        count += 1;
                    }
                }
                count
            }
        }
    }

    /// Set or clear the colour mark for one document.
    pub async fn set_document_color(&self, doc_id: i64, color: Option<&str>) -> ApiResult<()> {
        self.update(
            doc_id,
            &DocumentUpdate {
                display_color: Some(color.unwrap_or("").to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Upsert extracted text and AI metadata for a document.
    pub async fn save_ai_data(&self, doc_id: i64, data: &AiData) -> ApiResult<Value> {
        let body = serde_json::to_value(data)
            .map_err(|e| ApiError::api(500, format!("AI-Daten nicht serialisierbar: {}", e)))?;
        let response = self
            .client
            .post(&format!("/documents/{}/ai-data", doc_id), &body)
            .await?;
        if !success(&response) {
            return Err(ApiError::api(500, format!("AI-Daten fuer {} abgelehnt", doc_id)));
        }
        debug!("AI-Daten gespeichert fuer Dokument {}", doc_id);
        Ok(response["data"].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_query_params() {
        let filter = DocumentFilter {
            box_type: Some(BoxType::Eingang),
            is_gdv: Some(true),
            is_archived: Some(false),
            from_date: Some("2025-01-01".into()),
            ..Default::default()
        };
        let params = filter.query();
        assert!(params.contains(&("box", "eingang".to_string())));
        assert!(params.contains(&("is_gdv", "1".to_string())));
        assert!(params.contains(&("is_archived", "0".to_string())));
        assert!(params.contains(&("from", "2025-01-01".to_string())));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let patch = DocumentUpdate {
            box_type: Some(BoxType::Verarbeitung),
            processing_status: Some(ProcessingStatus::Processing),
            ..Default::default()
        };
        let value = serde_json::to_value(&patch).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["box_type"], "verarbeitung");
        assert_eq!(obj["processing_status"], "processing");

        assert!(DocumentUpdate::default().is_empty());
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_resolve_collision_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = resolve_collision_path(dir.path(), "report.pdf");
        assert_eq!(first, dir.path().join("report.pdf"));

        std::fs::write(dir.path().join("report.pdf"), b"x").unwrap();
        let second = resolve_collision_path(dir.path(), "report.pdf");
        assert_eq!(second, dir.path().join("report_1.pdf"));

        std::fs::write(&second, b"x").unwrap();
        let third = resolve_collision_path(dir.path(), "report.pdf");
        assert_eq!(third, dir.path().join("report_2.pdf"));

        // Extension-less names get plain numeric suffixes.
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        let readme = resolve_collision_path(dir.path(), "README");
        assert_eq!(readme, dir.path().join("README_1"));
    }
}
