//! Content probing: file hashing, magic-byte type detection and GDV
//! preamble parsing.
//!
//! GDV files are fixed-width CP1252 records; the preamble (record type
//! `0001`) carries carrier number, sender name and creation date at
//! fixed columns. Probing never needs more than the first 256 bytes of
//! a file except for hashing.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Fallback carrier number when the preamble has neither VU nor sender.
pub const GDV_FALLBACK_VU: &str = "Xvu";
/// Fallback date when the preamble carries no parseable creation date.
pub const GDV_FALLBACK_DATE: &str = "kDatum";

const HASH_BUF_SIZE: usize = 64 * 1024;

/// SHA-256 of a file's raw bytes as lowercase hex, streamed in 64 KiB
/// chunks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer as lowercase hex.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// File type detected from the first bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedType {
    Pdf,
    Xml,
    Gdv,
}

impl DetectedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Xml => "xml",
            Self::Gdv => "gdv",
        }
    }
}

/// Decode legacy bytes, trying CP1252 first (GDV default), then
/// Latin-1, then UTF-8.
fn decode_legacy(bytes: &[u8]) -> Option<String> {
    for encoding in [
        encoding_rs::WINDOWS_1252,
        encoding_rs::ISO_8859_15,
        encoding_rs::UTF_8,
    ] {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return Some(text.into_owned());
        }
    }
    None
}

/// Classify a file by its first bytes (at most 256 are inspected).
///
/// Order matters: PDF magic bytes are checked before the GDV preamble
/// because a PDF can contain "0001" by accident, and XML before GDV
/// because index deliveries are XML with numeric content.
pub fn detect_type(first_bytes: &[u8]) -> Option<DetectedType> {
    let window = &first_bytes[..first_bytes.len().min(256)];
    if window.is_empty() {
        return None;
    }

    if window.starts_with(b"%PDF") {
        return Some(DetectedType::Pdf);
    }

    let trimmed = {
        let start = window
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(window.len());
        &window[start..]
    };
    if trimmed.starts_with(b"<?xml") || (trimmed.starts_with(b"<") && trimmed.contains(&b'>')) {
        return Some(DetectedType::Xml);
    }

    if let Some(text) = decode_legacy(window) {
        if text.trim_start().starts_with("0001") {
            return Some(DetectedType::Gdv);
        }
    }

    None
}

/// Metadata extracted from a GDV preamble record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdvHeader {
    /// Carrier number, columns 5-9, or the `Xvu` fallback.
    pub vu_number: String,
    /// Sender name, columns 10-39, trimmed; `None` when blank.
    pub sender: Option<String>,
    /// Creation date converted to ISO `YYYY-MM-DD`, or the `kDatum`
    /// fallback.
    pub date_iso: String,
}

impl GdvHeader {
    /// True when the header carries real data rather than fallbacks.
    pub fn is_verified(&self) -> bool {
        (self.vu_number != GDV_FALLBACK_VU && !self.vu_number.is_empty())
            || self.sender.is_some()
    }

    fn fallback() -> Self {
        Self {
            vu_number: GDV_FALLBACK_VU.to_string(),
            sender: None,
            date_iso: GDV_FALLBACK_DATE.to_string(),
        }
    }
}

fn parse_preamble_line(line: &str) -> Option<GdvHeader> {
    let chars: Vec<char> = line.chars().collect();
    if chars.len() < 77 || chars[0..4].iter().collect::<String>() != "0001" {
        return None;
    }

    let field = |from: usize, to: usize| -> String {
        chars[from..to.min(chars.len())].iter().collect::<String>().trim().to_string()
    };

    let mut vu_number = field(4, 9);
    let sender_raw = field(9, 39);
    let sender = if sender_raw.is_empty() { None } else { Some(sender_raw) };

    let date_raw = field(69, 77);
    let date_iso = if date_raw.len() == 8 && date_raw.chars().all(|c| c.is_ascii_digit()) {
        // DDMMYYYY -> YYYY-MM-DD
        format!("{}-{}-{}", &date_raw[4..8], &date_raw[2..4], &date_raw[0..2])
    } else {
        warn!("GDV preamble without creation date, using '{}'", GDV_FALLBACK_DATE);
        GDV_FALLBACK_DATE.to_string()
    };

    if vu_number.is_empty() && sender.is_none() {
        warn!("GDV preamble without carrier, using '{}'", GDV_FALLBACK_VU);
        vu_number = GDV_FALLBACK_VU.to_string();
    }

    Some(GdvHeader { vu_number, sender, date_iso })
}

/// Extract the preamble metadata from a GDV file.
///
/// Scans for the first record starting with `0001` and reads the fixed
/// columns. On any failure the fixed fallbacks are returned so a
/// renamed file always has a deterministic structure.
pub fn extract_gdv_header(path: &Path) -> GdvHeader {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("GDV header read failed for {}: {}", path.display(), e);
            return GdvHeader::fallback();
        }
    };

    let mut reader = BufReader::new(file);
    let mut raw_line = Vec::new();
    loop {
        raw_line.clear();
        match reader.read_until(b'\n', &mut raw_line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("GDV header read failed for {}: {}", path.display(), e);
                break;
            }
        }
        let Some(line) = decode_legacy(&raw_line) else {
            continue;
        };
        if let Some(header) = parse_preamble_line(line.trim_end_matches(['\r', '\n'])) {
            debug!(
                "GDV header: vu={}, sender={:?}, date={}",
                header.vu_number, header.sender, header.date_iso
            );
            return header;
        }
    }

    warn!("no GDV preamble (0001) found in {}", path.display());
    GdvHeader::fallback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gdv_line(vu: &str, sender: &str, date: &str) -> String {
        // Fixed-width preamble: 0001 | VU (5) | sender (30) | filler | date at 70-77.
        let mut line = String::from("0001");
        line.push_str(&format!("{:<5}", vu));
        line.push_str(&format!("{:<30}", sender));
        while line.len() < 69 {
            line.push(' ');
        }
        line.push_str(date);
        line.push_str("30042025"); // erstellungsdatum_bis, ignored
        line
    }

    #[test]
    fn test_sha256_file_streaming() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"Hello, World!").unwrap();
        let hash = sha256_file(tmp.path()).unwrap();
        assert_eq!(
            hash,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_detect_type_pdf_first() {
        assert_eq!(detect_type(b"%PDF-1.7 rest"), Some(DetectedType::Pdf));
        // A PDF that happens to contain 0001 later must stay a PDF.
        assert_eq!(detect_type(b"%PDF0001"), Some(DetectedType::Pdf));
    }

    #[test]
    fn test_detect_type_xml() {
        assert_eq!(detect_type(b"<?xml version=\"1.0\"?>"), Some(DetectedType::Xml));
        assert_eq!(detect_type(b"  \n\t<Lieferung>x</Lieferung>"), Some(DetectedType::Xml));
        assert_eq!(detect_type(b"<unterminated"), None);
    }

    #[test]
    fn test_detect_type_gdv() {
        let line = gdv_line("12345", "Hanse Versicherung", "30042025");
        assert_eq!(detect_type(line.as_bytes()), Some(DetectedType::Gdv));
        assert_eq!(detect_type(b"0002 not a preamble"), None);
        assert_eq!(detect_type(b""), None);
    }

    #[test]
    fn test_gdv_header_positions_exact() {
        let line = gdv_line("12345", "Hanse Versicherung", "30042025");
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(line.as_bytes()).unwrap();

        let header = extract_gdv_header(tmp.path());
        assert_eq!(header.vu_number, "12345");
        assert_eq!(header.sender.as_deref(), Some("Hanse Versicherung"));
        assert_eq!(header.date_iso, "2025-04-30");
        assert!(header.is_verified());
    }

    #[test]
    fn test_gdv_header_cp1252_umlauts() {
        // "Münchener Rück" in CP1252 is not valid UTF-8.
        let mut line = gdv_line("00000", "", "31012024").into_bytes();
        line[4..9].copy_from_slice(b"54321");
        let name = b"M\xfcnchener R\xfcck";
        line[9..9 + name.len()].copy_from_slice(name);

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&line).unwrap();

        let header = extract_gdv_header(tmp.path());
        assert_eq!(header.vu_number, "54321");
        assert_eq!(header.sender.as_deref(), Some("Münchener Rück"));
        assert_eq!(header.date_iso, "2024-01-31");
    }

    #[test]
    fn test_gdv_header_fixed_fallbacks() {
        // Preamble with neither VU nor sender and a blank date field.
        let mut line = String::from("0001");
        while line.len() < 77 {
            line.push(' ');
        }
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(line.as_bytes()).unwrap();

        let header = extract_gdv_header(tmp.path());
        assert_eq!(header.vu_number, GDV_FALLBACK_VU);
        assert_eq!(header.sender, None);
        assert_eq!(header.date_iso, GDV_FALLBACK_DATE);
        assert!(!header.is_verified());

        // A file with no preamble at all gets the same fallbacks.
        let mut tmp2 = tempfile::NamedTempFile::new().unwrap();
        tmp2.write_all(b"9999 trailer only\n").unwrap();
        let header2 = extract_gdv_header(tmp2.path());
        assert_eq!(header2.vu_number, GDV_FALLBACK_VU);
        assert_eq!(header2.date_iso, GDV_FALLBACK_DATE);
    }

    #[test]
    fn test_gdv_header_skips_leading_records() {
        let preamble = gdv_line("11111", "Concordia", "01122023");
        let content = format!("XXXX leading junk line\n{}\n0100 data record\n", preamble);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(content.as_bytes()).unwrap();

        let header = extract_gdv_header(tmp.path());
        assert_eq!(header.vu_number, "11111");
        assert_eq!(header.sender.as_deref(), Some("Concordia"));
        assert_eq!(header.date_iso, "2023-12-01");
    }
}
