//! Outlook `.msg` attachment extraction.
//!
//! MSG files are CFB (compound file binary) containers; attachments
//! live in storages named `__attach_version1.0_#NNNNNNNN` with MAPI
//! property streams: 0x3707 (long filename, UTF-16LE), 0x3704 (short
//! filename) and 0x3701 with type 0x0102 (the attachment bytes).

use std::io::Read;
use std::path::Path;

use tracing::debug;

use super::ContainerError;

const ATTACH_STORAGE_PREFIX: &str = "__attach_version1.0_";
const STREAM_LONG_FILENAME: &str = "__substg1.0_3707001F";
const STREAM_SHORT_FILENAME: &str = "__substg1.0_3704001F";
const STREAM_DATA: &str = "__substg1.0_37010102";

/// One attachment pulled out of an MSG container.
#[derive(Debug)]
pub struct MsgAttachment {
    pub filename: String,
    pub content: Vec<u8>,
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

/// True when the first bytes carry the CFB magic (`D0 CF 11 E0 ...`).
pub fn is_msg_file(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 8];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    magic == [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]
}

/// Extract all attachments of an Outlook message.
pub fn extract_attachments(path: &Path) -> Result<Vec<MsgAttachment>, ContainerError> {
    let mut comp = cfb::open(path).map_err(|e| ContainerError::Msg(e.to_string()))?;

    let attachment_storages: Vec<String> = comp
        .walk()
        .filter(|entry| entry.is_storage())
        .filter_map(|entry| {
            let name = entry.name().to_string();
            name.starts_with(ATTACH_STORAGE_PREFIX)
                .then(|| entry.path().to_string_lossy().to_string())
        })
        .collect();

    let mut attachments = Vec::new();
    for (index, storage) in attachment_storages.iter().enumerate() {
        let read_stream = |comp: &mut cfb::CompoundFile<std::fs::File>, name: &str| {
            let stream_path = format!("{}/{}", storage, name);
            let mut buf = Vec::new();
            match comp.open_stream(&stream_path) {
                Ok(mut stream) => {
                    stream
                        .read_to_end(&mut buf)
                        .map_err(|e| ContainerError::Msg(e.to_string()))?;
                    Ok::<Option<Vec<u8>>, ContainerError>(Some(buf))
                }
                Err(_) => Ok(None),
            }
        };

        let Some(content) = read_stream(&mut comp, STREAM_DATA)? else {
            // Embedded messages and OLE objects have no plain byte stream.
            debug!("MSG-Anhang ohne Datenstrom: {}", storage);
            continue;
        };

        let filename = match read_stream(&mut comp, STREAM_LONG_FILENAME)? {
            Some(bytes) => decode_utf16le(&bytes),
            None => match read_stream(&mut comp, STREAM_SHORT_FILENAME)? {
                Some(bytes) => decode_utf16le(&bytes),
                None => format!("anhang_{}", index + 1),
            },
        };
        let filename = if filename.is_empty() {
            format!("anhang_{}", index + 1)
        } else {
            filename
        };

        attachments.push(MsgAttachment { filename, content });
    }

    Ok(attachments)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::path::Path;

    use super::*;

    /// Write a minimal MSG-style CFB file with the given attachments.
    pub fn build_msg(path: &Path, attachments: &[(&str, &[u8])]) {
        let mut comp = cfb::create(path).unwrap();
        for (i, (name, content)) in attachments.iter().enumerate() {
            let storage = format!("/{}#{:08}", ATTACH_STORAGE_PREFIX, i);
            comp.create_storage(&storage).unwrap();

            let mut data = comp
                .create_stream(format!("{}/{}", storage, STREAM_DATA))
                .unwrap();
            data.write_all(content).unwrap();
            drop(data);

            let utf16: Vec<u8> = name
                .encode_utf16()
                .flat_map(|u| u.to_le_bytes())
                .collect();
            let mut fname = comp
                .create_stream(format!("{}/{}", storage, STREAM_LONG_FILENAME))
                .unwrap();
            fname.write_all(&utf16).unwrap();
            drop(fname);
        }
        comp.flush().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_msg;
    use super::*;

    #[test]
    fn test_extract_attachments_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.msg");
        build_msg(&path, &[("report.pdf", b"%PDF-1.4 fake"), ("notiz.txt", b"hello")]);

        assert!(is_msg_file(&path));

        let attachments = extract_attachments(&path).unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].filename, "report.pdf");
        assert_eq!(attachments[0].content, b"%PDF-1.4 fake");
        assert_eq!(attachments[1].filename, "notiz.txt");
    }

    #[test]
    fn test_is_msg_file_rejects_other_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.msg");
        std::fs::write(&path, b"PK\x03\x04 zip header").unwrap();
        assert!(!is_msg_file(&path));
    }
}
