//! Offline pipeline test: drop-target expansion feeding the content
//! probes, mirroring what the batch upload does before any server
//! contact.

use std::io::Write;
use std::path::Path;

use atlas::classify::slugify;
use atlas::containers::ContainerExpander;
use atlas::models::BoxType;
use atlas::pdf::PdfService;
use atlas::probe::{detect_type, extract_gdv_header, sha256_file, DetectedType};

fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (name, content) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

fn gdv_preamble(vu: &str, sender: &str, date: &str) -> String {
    let mut line = String::from("0001");
    line.push_str(&format!("{:<5}", vu));
    line.push_str(&format!("{:<30}", sender));
    while line.len() < 69 {
        line.push(' ');
    }
    line.push_str(date);
    line.push_str("01052025");
    line
}

#[tokio::test]
async fn test_dropped_zip_expands_into_typed_upload_jobs() {
    let dir = tempfile::tempdir().unwrap();

    let gdv_line = gdv_preamble("12345", "Hanse Versicherung", "30042025");
    let zip_path = dir.path().join("lieferung.zip");
    build_zip(
        &zip_path,
        &[
            ("bestand.gdv", gdv_line.as_bytes()),
            ("index.xml", b"<?xml version=\"1.0\"?><Lieferung/>"),
            ("notiz.txt", b"kein container"),
        ],
    );

    let mut expander = ContainerExpander::new(PdfService::new(None), Vec::new());
    let jobs = expander.expand(&[zip_path.clone()]).await.unwrap();

    // The archive itself is archived raw, every entry is queued for
    // the inbox.
    let raw: Vec<_> = jobs.iter().filter(|j| j.placement == BoxType::Roh).collect();
    let inbox: Vec<_> = jobs.iter().filter(|j| j.placement == BoxType::Eingang).collect();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].path, zip_path);
    assert_eq!(inbox.len(), 3);

    // The extracted files survive byte-identical, so the probes see
    // exactly what the classifier will see after upload.
    for job in &inbox {
        let bytes = std::fs::read(&job.path).unwrap();
        let name = job.path.file_name().unwrap().to_string_lossy().to_string();
        match name.as_str() {
            "bestand.gdv" => {
                assert_eq!(detect_type(&bytes), Some(DetectedType::Gdv));
                let header = extract_gdv_header(&job.path);
                assert_eq!(header.vu_number, "12345");
                assert_eq!(header.sender.as_deref(), Some("Hanse Versicherung"));
                assert_eq!(header.date_iso, "2025-04-30");
                assert_eq!(
                    format!(
                        "{}_{}_VU{}.gdv",
                        slugify(header.sender.as_deref().unwrap()),
                        header.date_iso,
                        header.vu_number
                    ),
                    "Hanse_Versicherung_2025-04-30_VU12345.gdv"
                );
            }
            "index.xml" => {
                assert_eq!(detect_type(&bytes), Some(DetectedType::Xml));
            }
            "notiz.txt" => {
                assert_eq!(detect_type(&bytes), None);
            }
            other => panic!("unexpected job {}", other),
        }
    }
}

#[tokio::test]
async fn test_identical_payloads_share_a_content_hash() {
    // Two copies of the same bytes under different names must hash
    // identically; this is what keys the classification dedup cache.
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.pdf");
    let b = dir.path().join("b.pdf");
    std::fs::write(&a, b"%PDF-1.4 identical payload").unwrap();
    std::fs::write(&b, b"%PDF-1.4 identical payload").unwrap();

    assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());

    let c = dir.path().join("c.pdf");
    std::fs::write(&c, b"%PDF-1.4 different payload").unwrap();
    assert_ne!(sha256_file(&a).unwrap(), sha256_file(&c).unwrap());
}
