//! Drop-target expansion: ZIP and MSG containers are unpacked
//! recursively, images become single-page PDFs, and every produced
//! file is queued as an upload job for either the inbox or the raw
//! archive.

pub mod msg;

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document as PdfDocument, Object, Stream};
use mail_parser::MimeHeaders;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::BoxType;
use crate::pdf::PdfService;

/// Containers nested deeper than this are not unpacked further.
const MAX_DEPTH: u32 = 5;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP-Fehler: {0}")]
    Zip(String),
    #[error("MSG-Fehler: {0}")]
    Msg(String),
    #[error("Bildkonvertierung fehlgeschlagen: {0}")]
    Image(String),
}

/// A file ready for upload with its target placement.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub path: PathBuf,
    pub placement: BoxType,
}

/// Expands user-supplied paths into a flat list of upload jobs.
///
/// The expander owns every temporary directory it creates; dropping it
/// after the batch upload (success or failure) removes them.
pub struct ContainerExpander {
    pdf: PdfService,
    zip_passwords: Vec<String>,
    temp_dirs: Vec<TempDir>,
}

impl ContainerExpander {
    pub fn new(pdf: PdfService, zip_passwords: Vec<String>) -> Self {
        Self { pdf, zip_passwords, temp_dirs: Vec::new() }
    }

    /// Expand all paths into upload jobs.
    pub async fn expand(&mut self, paths: &[PathBuf]) -> Result<Vec<UploadJob>, ContainerError> {
        let mut jobs = Vec::new();
        for path in paths {
            self.expand_one(path, 0, &mut jobs).await?;
        }
        Ok(jobs)
    }

    fn expand_inner<'a>(
        &'a mut self,
        path: &'a Path,
        depth: u32,
        jobs: &'a mut Vec<UploadJob>,
    ) -> futures::future::BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(self.expand_one(path, depth, jobs))
    }

    async fn expand_one(
        &mut self,
        path: &Path,
        depth: u32,
        jobs: &mut Vec<UploadJob>,
    ) -> Result<(), ContainerError> {
        if !path.exists() {
            warn!("Pfad existiert nicht: {}", path.display());
            return Ok(());
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if depth >= MAX_DEPTH {
            warn!("Maximale Verschachtelungstiefe erreicht: {}", path.display());
            jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Eingang });
            return Ok(());
        }

        if ext == "zip" || is_zip_file(path) {
            // The archive itself goes to the raw archive, its entries recurse.
            jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Roh });
            let extracted = self.extract_zip(path)?;
            for entry in extracted {
                self.expand_inner(&entry, depth + 1, jobs).await?;
            }
            return Ok(());
        }

        if ext == "msg" && msg::is_msg_file(path) {
            jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Roh });
            let extracted = self.extract_msg(path)?;
            for entry in extracted {
                self.expand_inner(&entry, depth + 1, jobs).await?;
            }
            return Ok(());
        }

        if ext == "eml" {
            jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Roh });
            let extracted = self.extract_eml(path)?;
            for entry in extracted {
                self.expand_inner(&entry, depth + 1, jobs).await?;
            }
            return Ok(());
        }

        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            // Converted PDF goes to the inbox, the original image stays
            // archived in the raw box.
            match self.convert_image_to_pdf(path) {
                Ok(pdf_path) => {
                    jobs.push(UploadJob { path: pdf_path, placement: BoxType::Eingang });
                    jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Roh });
                }
                Err(e) => {
                    warn!("Bildkonvertierung fehlgeschlagen fuer {}: {}", path.display(), e);
                    jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Eingang });
                }
            }
            return Ok(());
        }

        if ext == "pdf" && crate::pdf::is_encrypted_pdf(path) {
            // Password-protected PDFs from containers are unlocked in
            // place when a known password fits; failures are left to
            // the classifier's validation step.
            if let Err(e) = self.pdf.unlock(path).await {
                debug!("PDF-Entsperrung uebersprungen fuer {}: {}", path.display(), e);
            }
        }

        jobs.push(UploadJob { path: path.to_path_buf(), placement: BoxType::Eingang });
        Ok(())
    }

    fn new_temp_dir(&mut self) -> Result<PathBuf, ContainerError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_path_buf();
        self.temp_dirs.push(dir);
        Ok(path)
    }

    fn extract_zip(&mut self, path: &Path) -> Result<Vec<PathBuf>, ContainerError> {
        let out_dir = self.new_temp_dir()?;
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| ContainerError::Zip(e.to_string()))?;

        let mut extracted = Vec::new();
        let mut seen = HashSet::new();

        for index in 0..archive.len() {
            let Some((name, content)) = read_zip_entry(&mut archive, index, &self.zip_passwords)
            else {
                continue;
            };
            let target = unique_name(&out_dir, &name, &mut seen);
            std::fs::write(&target, &content)?;
            extracted.push(target);
        }

        info!("ZIP entpackt: {} ({} Dateien)", path.display(), extracted.len());
        Ok(extracted)
    }

    fn extract_msg(&mut self, path: &Path) -> Result<Vec<PathBuf>, ContainerError> {
        let out_dir = self.new_temp_dir()?;
        let attachments = msg::extract_attachments(path)?;

        let mut extracted = Vec::new();
        let mut seen = HashSet::new();
        for attachment in attachments {
            let target = unique_name(&out_dir, &attachment.filename, &mut seen);
            std::fs::write(&target, &attachment.content)?;
            extracted.push(target);
        }
        info!("MSG entpackt: {} ({} Anhaenge)", path.display(), extracted.len());
        Ok(extracted)
    }

    fn extract_eml(&mut self, path: &Path) -> Result<Vec<PathBuf>, ContainerError> {
        let out_dir = self.new_temp_dir()?;
        let raw = std::fs::read(path)?;
        let message = mail_parser::MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| ContainerError::Msg("E-Mail nicht parsebar".to_string()))?;

        let mut extracted = Vec::new();
        let mut seen = HashSet::new();
        for attachment in message.attachments() {
            let Some(name) = attachment.attachment_name() else {
                continue;
            };
            let target = unique_name(&out_dir, name, &mut seen);
            std::fs::write(&target, attachment.contents())?;
            extracted.push(target);
        }
        info!("EML entpackt: {} ({} Anhaenge)", path.display(), extracted.len());
        Ok(extracted)
    }

    /// Convert an image to a single-page PDF carrying the re-encoded
    /// JPEG as a DCTDecode stream.
    fn convert_image_to_pdf(&mut self, path: &Path) -> Result<PathBuf, ContainerError> {
        let out_dir = self.new_temp_dir()?;
        let img = image::open(path).map_err(|e| ContainerError::Image(e.to_string()))?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();

        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 85)
            .encode_image(&rgb)
            .map_err(|e| ContainerError::Image(e.to_string()))?;

        let pdf_bytes = jpeg_to_pdf(&jpeg, width, height);

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "bild".to_string());
        let target = out_dir.join(format!("{}.pdf", stem));
        std::fs::write(&target, pdf_bytes)?;
        debug!("Bild konvertiert: {} -> {}", path.display(), target.display());
        Ok(target)
    }
}

/// Read one ZIP entry, walking the known passwords when the plain
/// open reports an encrypted file. Directories and unreadable entries
/// yield `None`.
fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::fs::File>,
    index: usize,
    passwords: &[String],
) -> Option<(String, Vec<u8>)> {
    fn drain(mut entry: zip::read::ZipFile<'_>, index: usize) -> Option<(String, Vec<u8>)> {
        if entry.is_dir() {
            return None;
        }
        let name = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| format!("eintrag_{}", index));
        let mut content = Vec::new();
        entry.read_to_end(&mut content).ok()?;
        Some((name, content))
    }

    if let Ok(entry) = archive.by_index(index) {
        return drain(entry, index);
    }
    for password in passwords {
        if let Ok(entry) = archive.by_index_decrypt(index, password.as_bytes()) {
            if let Some(result) = drain(entry, index) {
                return Some(result);
            }
        }
    }
    warn!("ZIP-Eintrag {} nicht lesbar (Passwort?)", index);
    None
}

fn is_zip_file(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    infer::archive::is_zip(&magic)
}

/// Pick a collision-free name inside `dir` for this extraction pass.
fn unique_name(dir: &Path, filename: &str, seen: &mut HashSet<String>) -> PathBuf {
    let safe = filename.replace(['/', '\\'], "_");
    if seen.insert(safe.to_lowercase()) && !dir.join(&safe).exists() {
        return dir.join(safe);
    }
    let (stem, ext) = match safe.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{}", e)),
        _ => (safe.clone(), String::new()),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{}_{}{}", stem, counter, ext);
        if seen.insert(candidate.to_lowercase()) && !dir.join(&candidate).exists() {
            return dir.join(candidate);
        }
        counter += 1;
    }
}

/// One-page PDF embedding a JPEG at its native size.
fn jpeg_to_pdf(jpeg: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut doc = PdfDocument::with_version("1.5");
    let pages_id = doc.new_object_id();

    let image_stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg.to_vec(),
    );
    let image_id = doc.add_object(image_stream);
    let resources_id = doc.add_object(dictionary! {
        "XObject" => dictionary! { "Im0" => image_id },
    });

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    (width as i64).into(),
                    0.into(),
                    0.into(),
                    (height as i64).into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec!["Im0".into()]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![
            0.into(),
            0.into(),
            (width as i64).into(),
            (height as i64).into(),
        ],
    });

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).expect("in-memory PDF serialization");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn expander() -> ContainerExpander {
        ContainerExpander::new(PdfService::new(None), Vec::new())
    }

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    fn placements(jobs: &[UploadJob]) -> Vec<(String, BoxType)> {
        jobs.iter()
            .map(|j| {
                (
                    j.path.file_name().unwrap().to_string_lossy().to_string(),
                    j.placement,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_file_goes_to_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brief.txt");
        std::fs::write(&path, b"hello").unwrap();

        let mut exp = expander();
        let jobs = exp.expand(&[path]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].placement, BoxType::Eingang);
    }

    #[tokio::test]
    async fn test_zip_expands_recursively() {
        let dir = tempfile::tempdir().unwrap();

        // Inner zip with one PDF inside the outer zip.
        let inner_path = dir.path().join("inner.zip");
        build_zip(&inner_path, &[("tief.pdf", b"%PDF-1.4 x")]);
        let inner_bytes = std::fs::read(&inner_path).unwrap();

        let outer = dir.path().join("quartal.zip");
        build_zip(
            &outer,
            &[("rechnung.pdf", b"%PDF-1.4 y"), ("inner.zip", &inner_bytes)],
        );

        let mut exp = expander();
        let jobs = exp.expand(&[outer]).await.unwrap();
        let named = placements(&jobs);

        assert!(named.contains(&("quartal.zip".to_string(), BoxType::Roh)));
        assert!(named.contains(&("rechnung.pdf".to_string(), BoxType::Eingang)));
        assert!(named.contains(&("inner.zip".to_string(), BoxType::Roh)));
        assert!(named.contains(&("tief.pdf".to_string(), BoxType::Eingang)));
    }

    #[tokio::test]
    async fn test_msg_attachments_are_recursed() {
        let dir = tempfile::tempdir().unwrap();
        let msg_path = dir.path().join("inner.msg");
        msg::test_support::build_msg(&msg_path, &[("report.pdf", b"%PDF-1.4 z")]);

        let mut exp = expander();
        let jobs = exp.expand(&[msg_path]).await.unwrap();
        let named = placements(&jobs);

        assert!(named.contains(&("inner.msg".to_string(), BoxType::Roh)));
        assert!(named.contains(&("report.pdf".to_string(), BoxType::Eingang)));
    }

    #[tokio::test]
    async fn test_image_is_converted_and_original_archived() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("bild.png");
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200u8, 10, 10]));
        img.save(&img_path).unwrap();

        let mut exp = expander();
        let jobs = exp.expand(&[img_path]).await.unwrap();
        let named = placements(&jobs);

        assert!(named.contains(&("bild.pdf".to_string(), BoxType::Eingang)));
        assert!(named.contains(&("bild.png".to_string(), BoxType::Roh)));

        // The converted file must be a real PDF with one page.
        let pdf_job = jobs.iter().find(|j| j.path.extension().is_some_and(|e| e == "pdf")).unwrap();
        let doc = PdfDocument::load(&pdf_job.path).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_names_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doppel.zip");
        build_zip(
            &path,
            &[("a/report.pdf", b"%PDF-1.4 a"), ("b/report.pdf", b"%PDF-1.4 b")],
        );

        let mut exp = expander();
        let jobs = exp.expand(&[path]).await.unwrap();
        let names: Vec<String> = jobs
            .iter()
            .filter(|j| j.placement == BoxType::Eingang)
            .map(|j| j.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names.len(), 2);
        assert!(names.contains(&"report.pdf".to_string()));
        assert!(names.contains(&"report_1.pdf".to_string()));
    }

    #[test]
    fn test_unique_name_counts_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = HashSet::new();
        let a = unique_name(dir.path(), "x.pdf", &mut seen);
        let b = unique_name(dir.path(), "x.pdf", &mut seen);
        let c = unique_name(dir.path(), "x.pdf", &mut seen);
        assert_eq!(a.file_name().unwrap(), "x.pdf");
        assert_eq!(b.file_name().unwrap(), "x_1.pdf");
        assert_eq!(c.file_name().unwrap(), "x_2.pdf");
    }
}
