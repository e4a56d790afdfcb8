//! MTOM/XOP multipart parsing for getShipment responses.
//!
//! A `multipart/related` response carries the SOAP envelope as its
//! first part and every binary attachment as a further part addressed
//! by Content-ID. `<xop:Include href="cid:..."/>` markers inside the
//! envelope are spliced back as Base64 so the document extraction can
//! treat both response shapes identically.

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::Engine as _;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MtomError {
    #[error("Multipart ohne boundary im Content-Type: {0}")]
    MissingBoundary(String),
    #[error("Multipart ohne Root-Part")]
    MissingRoot,
}

/// One MIME part of a multipart/related body.
#[derive(Debug, Clone)]
pub struct MimePart {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl MimePart {
    /// Content-ID with angle brackets stripped.
    pub fn content_id(&self) -> Option<String> {
        self.headers
            .get("content-id")
            .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    }
}

/// Parsed MTOM response: the SOAP root plus binary parts by cid.
#[derive(Debug)]
pub struct MtomMessage {
    pub root_xml: String,
    pub parts_by_cid: HashMap<String, Vec<u8>>,
}

impl MtomMessage {
    /// Envelope with every `xop:Include` replaced by the Base64 of the
    /// referenced part.
    pub fn spliced_xml(&self) -> String {
        splice_xop(&self.root_xml, &self.parts_by_cid)
    }
}

/// Pull the boundary out of a `multipart/related; boundary=...` header.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    let pos = lower.find("boundary=")?;
    let raw = &content_type[pos + "boundary=".len()..];
    let raw = raw.split(';').next().unwrap_or(raw).trim();
    let boundary = raw.trim_matches('"').to_string();
    (!boundary.is_empty()).then_some(boundary)
}

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn parse_part(raw: &[u8]) -> MimePart {
    let (header_end, body_start) = match find_bytes(raw, b"\r\n\r\n", 0) {
        Some(pos) => (pos, pos + 4),
        None => match find_bytes(raw, b"\n\n", 0) {
            Some(pos) => (pos, pos + 2),
            None => (0, 0),
        },
    };

    let mut headers = HashMap::new();
    for line in String::from_utf8_lossy(&raw[..header_end]).lines() {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let mut body = raw[body_start..].to_vec();
    // Strip the trailing CRLF that belongs to the boundary delimiter.
    while body.ends_with(b"\n") || body.ends_with(b"\r") {
        body.pop();
    }

    MimePart { headers, body }
}

/// Split a multipart body into its parts.
pub fn split_multipart(body: &[u8], boundary: &str) -> Vec<MimePart> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();

    let mut cursor = match find_bytes(body, &delimiter, 0) {
        Some(pos) => pos + delimiter.len(),
        None => return parts,
    };

    loop {
        // Closing delimiter "--boundary--".
        if body[cursor..].starts_with(b"--") {
            break;
        }
        // Skip the CRLF after the delimiter line.
        while cursor < body.len() && (body[cursor] == b'\r' || body[cursor] == b'\n') {
            cursor += 1;
        }
        let Some(next) = find_bytes(body, &delimiter, cursor) else {
            break;
        };
        parts.push(parse_part(&body[cursor..next]));
        cursor = next + delimiter.len();
        if cursor >= body.len() {
            break;
        }
    }

    parts
}

/// Parse a multipart/related MTOM response.
pub fn parse_mtom(body: &[u8], content_type: &str) -> Result<MtomMessage, MtomError> {
    let boundary = extract_boundary(content_type)
        .ok_or_else(|| MtomError::MissingBoundary(content_type.to_string()))?;

    let parts = split_multipart(body, &boundary);
    if parts.is_empty() {
        return Err(MtomError::MissingRoot);
    }

    // The SOAP envelope is the first part; everything else is binary,
    // addressable by Content-ID.
    let root_xml = String::from_utf8_lossy(&parts[0].body).into_owned();
    let mut parts_by_cid = HashMap::new();
    for part in &parts[1..] {
        if let Some(cid) = part.content_id() {
            parts_by_cid.insert(cid, part.body.clone());
        }
    }

    debug!(
        "MTOM: Root-Part {} Bytes, {} Binaer-Part(s)",
        parts[0].body.len(),
        parts_by_cid.len()
    );

    Ok(MtomMessage { root_xml, parts_by_cid })
}

fn xop_include_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<xop:Include[^>]*href="cid:([^"]+)"[^>]*?(?:/>|></xop:Include>)"#)
            .expect("static regex")
    })
}

/// Replace `xop:Include` markers with the Base64 of the referenced
/// binary part. Unknown cids are left untouched.
pub fn splice_xop(xml: &str, parts_by_cid: &HashMap<String, Vec<u8>>) -> String {
    xop_include_regex()
        .replace_all(xml, |caps: &regex::Captures<'_>| {
            let cid = &caps[1];
            match parts_by_cid.get(cid) {
                Some(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
                None => {
                    debug!("xop:Include ohne passenden Part: cid={}", cid);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mtom_body(boundary: &str, xml: &str, cid: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Type: application/xop+xml; charset=UTF-8\r\nContent-ID: <root>\r\n\r\n",
        );
        body.extend_from_slice(xml.as_bytes());
        body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Type: application/octet-stream\r\nContent-ID: <{}>\r\n\r\n",
                cid
            )
            .as_bytes(),
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn test_extract_boundary_variants() {
        assert_eq!(
            extract_boundary("multipart/related; boundary=MIMEBoundary_abc; type=\"application/xop+xml\""),
            Some("MIMEBoundary_abc".to_string())
        );
        assert_eq!(
            extract_boundary("multipart/related; boundary=\"quoted-b\""),
            Some("quoted-b".to_string())
        );
        assert_eq!(extract_boundary("text/xml; charset=utf-8"), None);
    }

    #[test]
    fn test_split_and_parse_parts() {
        let xml = "<env>ok</env>";
        let payload = b"\x01\x02binary\xff";
        let body = mtom_body("B42", xml, "doc1@bipro", payload);

        let parts = split_multipart(&body, "B42");
        assert_eq!(parts.len(), 2);
        assert_eq!(String::from_utf8_lossy(&parts[0].body), xml);
        assert_eq!(parts[1].content_id().as_deref(), Some("doc1@bipro"));
        assert_eq!(parts[1].body, payload);
    }

    #[test]
    fn test_parse_mtom_and_splice() {
        let payload = b"%PDF-1.4 binary payload of a shipment document...";
        let xml = r#"<tran:Dokument xmlns:tran="t" xmlns:xop="http://www.w3.org/2004/08/xop/include">
            <tran:Dateiname>police.pdf</tran:Dateiname>
            <tran:Inhalt><xop:Include href="cid:doc1@bipro"/></tran:Inhalt>
        </tran:Dokument>"#;
        let body = mtom_body("MIMEBoundary", xml, "doc1@bipro", payload);

        let message = parse_mtom(
            &body,
            "multipart/related; boundary=MIMEBoundary; type=\"application/xop+xml\"",
        )
        .unwrap();
        assert_eq!(message.parts_by_cid.len(), 1);

        let spliced = message.spliced_xml();
        assert!(!spliced.contains("xop:Include"));

        let docs = crate::bipro::envelope::parse_document_blobs(&spliced);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "police.pdf");
        assert_eq!(docs[0].content_bytes, payload);
    }

    #[test]
    fn test_splice_leaves_unknown_cid() {
        let xml = r#"<a><xop:Include href="cid:missing"/></a>"#;
        let spliced = splice_xop(xml, &HashMap::new());
        assert!(spliced.contains("cid:missing"));
    }
}
