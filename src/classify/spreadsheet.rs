//! Text extraction from tabular files for LLM classification.
//!
//! Only the first rows matter; the classifier reads headers and a few
//! data lines, not the whole sheet.

use std::io::{BufRead, BufReader};
use std::path::Path;

use calamine::{Data, Reader};
use tracing::warn;

/// Rows handed to the classifier.
pub const MAX_LINES: usize = 50;

fn decode_lines(bytes: &[u8], max_lines: usize) -> Option<String> {
    for encoding in [encoding_rs::UTF_8, encoding_rs::WINDOWS_1252] {
        let (text, _, had_errors) = encoding.decode(bytes);
        if had_errors {
            continue;
        }
        let lines: Vec<&str> = text.lines().take(max_lines).collect();
        return Some(lines.join("\n"));
    }
    None
}

fn extract_csv(path: &Path, max_lines: usize) -> String {
    let Ok(file) = std::fs::File::open(path) else {
        return String::new();
    };
    let mut reader = BufReader::new(file);
    let mut bytes = Vec::new();
    // Bounded read: 50 rows never need more than a handful of KiB.
    let mut raw_line = Vec::new();
    for _ in 0..max_lines {
        raw_line.clear();
        match reader.read_until(b'\n', &mut raw_line) {
            Ok(0) => break,
            Ok(_) => bytes.extend_from_slice(&raw_line),
            Err(_) => break,
        }
    }
    decode_lines(&bytes, max_lines).unwrap_or_default()
}

fn extract_xlsx(path: &Path, max_lines: usize) -> String {
    let mut workbook = match calamine::open_workbook_auto(path) {
        Ok(wb) => wb,
        Err(e) => {
            warn!("Excel-Extraktion fehlgeschlagen: {}", e);
            return String::new();
        }
    };

    let Some(Ok(range)) = workbook.worksheet_range_at(0) else {
        return String::new();
    };

    let mut lines = Vec::new();
    for row in range.rows().take(max_lines) {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| match cell {
                Data::Empty => String::new(),
                other => other.to_string(),
            })
            .collect();
        lines.push(cells.join(" | "));
    }
    lines.join("\n")
}

/// First rows of a tabular file as plain text.
pub fn extract_text(path: &Path, max_lines: usize) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" | "tsv" => extract_csv(path, max_lines),
        "xlsx" | "xls" => extract_xlsx(path, max_lines),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_csv_first_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abrechnung.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..100 {
            writeln!(file, "VSNR;Beitrag;Courtage;{}", i).unwrap();
        }

        let text = extract_text(&path, MAX_LINES);
        assert_eq!(text.lines().count(), MAX_LINES);
        assert!(text.starts_with("VSNR;Beitrag;Courtage;0"));
    }

    #[test]
    fn test_csv_cp1252_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        // "Müller" in CP1252.
        std::fs::write(&path, b"Name;Betrag\nM\xfcller;12,50\n").unwrap();

        let text = extract_text(&path, MAX_LINES);
        assert!(text.contains("Müller"));
    }

    #[test]
    fn test_unknown_extension_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bild.png");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(extract_text(&path, MAX_LINES), "");
    }
}
