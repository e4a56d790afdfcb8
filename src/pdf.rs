//! PDF operations: validation with repair, unlocking via the server's
//! password table, full-text extraction, empty-page detection and
//! removal.
//!
//! Validation runs before every AI call so corrupt files never burn
//! tokens. Encrypted files that no known password opens are a distinct
//! outcome from truly corrupt ones.

use std::path::{Path, PathBuf};

use lopdf::{Document as PdfDocument, Object, ObjectId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, PasswordType, PasswordsApi};

/// Pages whose trimmed text is shorter than this and which carry no
/// image XObject count as empty.
const EMPTY_PAGE_TEXT_THRESHOLD: usize = 10;

/// Directory of cached previews, keyed `<doc_id>_<name>`.
pub const PREVIEW_CACHE_DIR: &str = "bipro_preview_cache";

#[derive(Debug, Error)]
pub enum PdfError {
    /// Encrypted and none of the known passwords fits.
    #[error("PDF verschluesselt, kein bekanntes Passwort passt")]
    NoPasswordFits,

    /// Unreadable even after the repair pass.
    #[error("PDF korrupt: {0}")]
    Corrupt(String),

    /// Structurally fine but has no pages.
    #[error("PDF hat 0 Seiten")]
    ZeroPages,

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// PDF service; the password API is optional so offline paths (tests,
/// container expansion without a session) still validate.
#[derive(Clone)]
pub struct PdfService {
    passwords: Option<PasswordsApi>,
}

impl PdfService {
    pub fn new(passwords: Option<PasswordsApi>) -> Self {
        Self { passwords }
    }

    /// Validate a PDF.
    ///
    /// Returns `Ok(None)` when the original opens with at least one
    /// page, `Ok(Some(path))` when a repair pass produced a usable
    /// copy at `<path>.repaired.pdf`. Encrypted files are unlocked in
    /// place when a known password fits; otherwise
    /// `PdfError::NoPasswordFits` distinguishes them from corrupt
    /// files.
    pub async fn validate(&self, path: &Path) -> Result<Option<PathBuf>, PdfError> {
        match inspect(path) {
            Ok(Inspection::Ok) => Ok(None),
            Ok(Inspection::ZeroPages) => {
                warn!("PDF hat 0 Seiten: {}", path.display());
                Err(PdfError::ZeroPages)
            }
            Ok(Inspection::Encrypted) => {
                info!("PDF ist verschluesselt, versuche Entsperrung: {}", path.display());
                self.unlock(path).await?;
                Ok(None)
            }
            Err(open_error) => {
                warn!("PDF defekt ({}), versuche Reparatur: {}", open_error, path.display());
                repair(path)
            }
        }
    }

    /// Try every known password until one opens the file; the
    /// decrypted bytes replace the file in place.
    pub async fn unlock(&self, path: &Path) -> Result<(), PdfError> {
        let passwords = match &self.passwords {
            Some(api) => api.get_passwords(PasswordType::Pdf).await?,
            None => Vec::new(),
        };

        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || unlock_with_passwords(&path, &passwords))
            .await
            .map_err(|e| PdfError::Corrupt(e.to_string()))?
    }

    /// Concatenated text of all pages plus the count of pages that
    /// actually carried text.
    pub fn extract_text(&self, path: &Path) -> (String, u32) {
        extract_full_text(path)
    }

    /// Empty-page detection; pure, no repository side effects.
    ///
    /// Returns 1-based page numbers of empty pages and the total page
    /// count. Errors degrade to `([], 0)`.
    pub fn detect_empty_pages(&self, path: &Path) -> (Vec<u32>, u32) {
        detect_empty_pages(path)
    }

    /// Remove the empty pages of a partially empty PDF, replace the
    /// server-side bytes and reset the counters.
    ///
    /// No-op when no page or every page is empty.
    pub async fn remove_empty_pages(
        &self,
        path: &Path,
        doc_id: i64,
        repo: &crate::api::DocumentsApi,
    ) -> Result<bool, PdfError> {
        let (empty_pages, total) = detect_empty_pages(path);
        if empty_pages.is_empty() || empty_pages.len() as u32 >= total {
            return Ok(false);
        }

        let tmpdir = tempfile::tempdir()?;
        let cleaned_path = tmpdir.path().join("cleaned.pdf");

        let mut doc = PdfDocument::load(path).map_err(|e| PdfError::Corrupt(e.to_string()))?;
        doc.delete_pages(&empty_pages);
        doc.save(&cleaned_path).map_err(|e| PdfError::Corrupt(e.to_string()))?;

        repo.replace_file(doc_id, &cleaned_path).await?;

        let new_total = total - empty_pages.len() as u32;
        if let Err(e) = repo.set_page_counts(doc_id, 0, new_total).await {
            debug!("Leere-Seiten-Zaehler Update fehlgeschlagen fuer {}: {}", doc_id, e);
        }

        invalidate_preview_cache(doc_id);

        info!(
            "Dokument {}: {} leere Seiten entfernt ({} -> {} Seiten)",
            doc_id,
            empty_pages.len(),
            total,
            new_total
        );
        Ok(true)
    }
}

enum Inspection {
    Ok,
    Encrypted,
    ZeroPages,
}

fn inspect(path: &Path) -> Result<Inspection, String> {
    let doc = PdfDocument::load(path).map_err(|e| e.to_string())?;
    if doc.is_encrypted() {
        return Ok(Inspection::Encrypted);
    }
    if doc.get_pages().is_empty() {
        return Ok(Inspection::ZeroPages);
    }
    Ok(Inspection::Ok)
}

/// Repair pass: strip junk before the `%PDF` header and after the last
/// `%%EOF`, re-parse and re-serialize to `<path>.repaired.pdf`.
fn repair(path: &Path) -> Result<Option<PathBuf>, PdfError> {
    let bytes = std::fs::read(path)?;

    let start = find_subsequence(&bytes, b"%PDF").ok_or_else(|| {
        PdfError::Corrupt("kein PDF-Header gefunden".to_string())
    })?;
    let end = rfind_subsequence(&bytes, b"%%EOF")
        .map(|pos| (pos + 5).min(bytes.len()))
        .unwrap_or(bytes.len());
    if start >= end {
        return Err(PdfError::Corrupt("PDF-Header hinter EOF-Marke".to_string()));
    }

    let mut doc = PdfDocument::load_mem(&bytes[start..end])
        .map_err(|e| PdfError::Corrupt(format!("Reparatur fehlgeschlagen: {}", e)))?;

    let repaired_path = PathBuf::from(format!("{}.repaired.pdf", path.display()));
    doc.save(&repaired_path)
        .map_err(|e| PdfError::Corrupt(format!("Reparatur nicht speicherbar: {}", e)))?;

    // Verify the repaired copy actually opens with content.
    match inspect(&repaired_path) {
        Ok(Inspection::Ok) => {
            info!("PDF erfolgreich repariert: {}", repaired_path.display());
            Ok(Some(repaired_path))
        }
        other => {
            let _ = std::fs::remove_file(&repaired_path);
            match other {
                Ok(Inspection::ZeroPages) => Err(PdfError::ZeroPages),
                Ok(Inspection::Encrypted) => Err(PdfError::NoPasswordFits),
                _ => Err(PdfError::Corrupt("repariertes PDF nicht lesbar".to_string())),
            }
        }
    }
}

/// True when the file opens as a PDF and is password protected.
pub fn is_encrypted_pdf(path: &Path) -> bool {
    PdfDocument::load(path)
        .map(|doc| doc.is_encrypted())
        .unwrap_or(false)
}

fn unlock_with_passwords(path: &Path, passwords: &[String]) -> Result<(), PdfError> {
    match PdfDocument::load(path) {
        Ok(doc) if !doc.is_encrypted() => return Ok(()),
        Ok(_) => {}
        Err(e) => return Err(PdfError::Corrupt(e.to_string())),
    }

    for password in passwords {
        let mut doc = match PdfDocument::load(path) {
            Ok(d) => d,
            Err(e) => return Err(PdfError::Corrupt(e.to_string())),
        };
        if doc.decrypt(password).is_ok() {
            doc.save(path).map_err(|e| PdfError::Corrupt(e.to_string()))?;
            info!("PDF erfolgreich entsperrt: {}", path.display());
            return Ok(());
        }
    }
    Err(PdfError::NoPasswordFits)
}

fn extract_full_text(path: &Path) -> (String, u32) {
    let doc = match PdfDocument::load(path) {
        Ok(d) => d,
        Err(e) => {
            warn!("Volltext-Extraktion fehlgeschlagen: {}", e);
            return (String::new(), 0);
        }
    };

    let mut text = String::new();
    let mut pages_with_text = 0u32;
    for (page_no, _) in doc.get_pages() {
        if let Ok(page_text) = doc.extract_text(&[page_no]) {
            if !page_text.trim().is_empty() {
                text.push_str(&page_text);
                text.push('\n');
                pages_with_text += 1;
            }
        }
    }
    (text, pages_with_text)
}

fn detect_empty_pages(path: &Path) -> (Vec<u32>, u32) {
    let doc = match PdfDocument::load(path) {
        Ok(d) => d,
        Err(e) => {
            warn!("Leere-Seiten-Erkennung fehlgeschlagen: {}", e);
            return (Vec::new(), 0);
        }
    };

    let pages = doc.get_pages();
    let total = pages.len() as u32;
    let mut empty = Vec::new();

    for (page_no, page_id) in pages {
        let text_len = doc
            .extract_text(&[page_no])
            .map(|t| t.trim().len())
            .unwrap_or(0);
        if text_len >= EMPTY_PAGE_TEXT_THRESHOLD {
            continue;
        }
        if page_has_images(&doc, page_id) {
            continue;
        }
        empty.push(page_no);
    }

    (empty, total)
}

fn resolve_dict<'a>(doc: &'a PdfDocument, object: &'a Object) -> Option<&'a lopdf::Dictionary> {
    match object {
        Object::Dictionary(d) => Some(d),
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        _ => None,
    }
}

/// Image-area check: a page with an image XObject is never empty even
/// when it has no extractable text (scans).
fn page_has_images(doc: &PdfDocument, page_id: ObjectId) -> bool {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return false;
    };
    let Ok(resources) = page.get(b"Resources") else {
        return false;
    };
    let Some(resources) = resolve_dict(doc, resources) else {
        return false;
    };
    let Ok(xobjects) = resources.get(b"XObject") else {
        return false;
    };
    let Some(xobjects) = resolve_dict(doc, xobjects) else {
        return false;
    };

    for (_, entry) in xobjects.iter() {
        let stream = match entry {
            Object::Stream(s) => Some(s),
            Object::Reference(id) => doc
                .get_object(*id)
                .ok()
                .and_then(|o| o.as_stream().ok()),
            _ => None,
        };
        if let Some(stream) = stream {
            if let Ok(subtype) = stream.dict.get(b"Subtype") {
                if subtype.as_name().map(|n| n == b"Image").unwrap_or(false) {
                    return true;
                }
            }
        }
    }
    false
}

/// Drop all cached previews of a document after its bytes changed.
pub fn invalidate_preview_cache(doc_id: i64) {
    let cache_dir = std::env::temp_dir().join(PREVIEW_CACHE_DIR);
    let prefix = format!("{}_", doc_id);
    let Ok(entries) = std::fs::read_dir(&cache_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(&prefix)
        {
            if std::fs::remove_file(entry.path()).is_ok() {
                debug!("Vorschau-Cache invalidiert: {}", entry.path().display());
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
pub(crate) mod test_support {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document as PdfDocument, Object, Stream};

    /// Build an in-memory PDF with one page per entry in `page_texts`;
    /// empty entries produce pages without text.
    pub fn build_pdf(page_texts: &[&str]) -> Vec<u8> {
        let mut doc = PdfDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in page_texts {
            let operations = if text.is_empty() {
                vec![]
            } else {
                vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ]
            };
            let content = Content { operations };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_pdf;
    use super::*;

    fn write_pdf(dir: &Path, name: &str, page_texts: &[&str]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, build_pdf(page_texts)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_validate_ok_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pdf(dir.path(), "ok.pdf", &["Beitragsrechnung fuer Vertrag 12345"]);

        let service = PdfService::new(None);
        let repaired = service.validate(&path).await.unwrap();
        assert!(repaired.is_none());
    }

    #[tokio::test]
    async fn test_validate_zero_byte_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pdf");
        std::fs::write(&path, b"").unwrap();

        let service = PdfService::new(None);
        let err = service.validate(&path).await.unwrap_err();
        assert!(matches!(err, PdfError::Corrupt(_)));
        assert!(!matches!(err, PdfError::NoPasswordFits));
    }

    #[tokio::test]
    async fn test_validate_repairs_leading_junk() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b"SMTP-GARBAGE-PREFIX\r\n".to_vec();
        bytes.extend_from_slice(&build_pdf(&["Seite eins"]));
        let path = dir.path().join("junk.pdf");
        std::fs::write(&path, &bytes).unwrap();

        let service = PdfService::new(None);
        let repaired = service.validate(&path).await.unwrap();
        let repaired = repaired.expect("repair pass should produce a copy");
        assert!(repaired.to_string_lossy().ends_with(".repaired.pdf"));
        assert!(repaired.exists());

        let (text, pages) = service.extract_text(&repaired);
        assert_eq!(pages, 1);
        assert!(text.contains("Seite eins"));
    }

    #[test]
    fn test_extract_text_counts_only_pages_with_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pdf(dir.path(), "mixed.pdf", &["Erste Seite Inhalt", "", "Dritte Seite"]);

        let (text, pages) = extract_full_text(&path);
        assert_eq!(pages, 2);
        assert!(text.contains("Erste Seite Inhalt"));
        assert!(text.contains("Dritte Seite"));
    }

    #[test]
    fn test_detect_empty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pdf(
            dir.path(),
            "holes.pdf",
            &["Deckblatt mit Inhalt", "", "", "Schlussseite mit Inhalt"],
        );

        let (empty, total) = detect_empty_pages(&path);
        assert_eq!(total, 4);
        assert_eq!(empty, vec![2, 3]);
    }

    #[test]
    fn test_detect_empty_pages_all_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pdf(dir.path(), "blank.pdf", &["", ""]);

        let (empty, total) = detect_empty_pages(&path);
        assert_eq!(total, 2);
        assert_eq!(empty.len(), 2);
    }

    #[test]
    fn test_invalidate_preview_cache() {
        let cache_dir = std::env::temp_dir().join(PREVIEW_CACHE_DIR);
        std::fs::create_dir_all(&cache_dir).unwrap();
        let victim = cache_dir.join("4242_preview.png");
        let survivor = cache_dir.join("9999_preview.png");
        std::fs::write(&victim, b"x").unwrap();
        std::fs::write(&survivor, b"x").unwrap();

        invalidate_preview_cache(4242);

        assert!(!victim.exists());
        assert!(survivor.exists());
        let _ = std::fs::remove_file(survivor);
    }
}
