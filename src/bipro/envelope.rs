//! SOAP envelope construction and response parsing for BiPRO 410/430.
//!
//! Envelopes are built from fixed templates with every interpolated
//! value XML-escaped. Responses arrive with varying namespace prefixes
//! (`tran:`, `t:`, none), so parsing matches on local names only.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::models::{ShipmentDocument, ShipmentInfo};

use super::profile::StsStyle;

pub const BIPRO_VERSION: &str = "2.6.1.1.0";

/// Escape all five XML entities on an interpolated value.
pub fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// STS request envelope (BiPRO 410), shaped per carrier profile.
pub fn sts_envelope(style: StsStyle, username: &str, password: &str) -> String {
    let user = escape(username);
    let pass = escape(password);
    match style {
        StsStyle::Addressing => format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                  xmlns:xsd="http://www.w3.org/2001/XMLSchema"
                  xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
   <soapenv:Header>
      <wsa:Action soapenv:actor="" soapenv:mustUnderstand="0" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing/">http://schemas.xmlsoap.org/ws/2005/02/trust/RST/SCT</wsa:Action>
      <wsse:Security soapenv:actor="" soapenv:mustUnderstand="1" xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
         <wsse:UsernameToken xmlns:bipro="http://www.bipro.net/namespace">
            <wsse:Username>{user}</wsse:Username>
            <wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText">{pass}</wsse:Password>
         </wsse:UsernameToken>
      </wsse:Security>
   </soapenv:Header>
   <soapenv:Body>
      <RequestSecurityToken xmlns="http://schemas.xmlsoap.org/ws/2005/02/trust">
         <TokenType>http://schemas.xmlsoap.org/ws/2005/02/sc/sct</TokenType>
         <RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</RequestType>
      </RequestSecurityToken>
   </soapenv:Body>
</soapenv:Envelope>"#
        ),
        StsStyle::WsTrust => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                  xmlns:wst="http://schemas.xmlsoap.org/ws/2005/02/trust"
                  xmlns:nac="http://www.bipro.net/namespace/nachrichten">
   <soapenv:Header>
      <wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
         <wsse:UsernameToken>
            <wsse:Username>{user}</wsse:Username>
            <wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText">{pass}</wsse:Password>
         </wsse:UsernameToken>
      </wsse:Security>
   </soapenv:Header>
   <soapenv:Body>
      <wst:RequestSecurityToken>
         <wst:TokenType>http://schemas.xmlsoap.org/ws/2005/02/sc/sct</wst:TokenType>
         <wst:RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</wst:RequestType>
         <nac:BiPROVersion>{version}</nac:BiPROVersion>
      </wst:RequestSecurityToken>
   </soapenv:Body>
</soapenv:Envelope>"#,
            version = BIPRO_VERSION
        ),
    }
}

/// SOAP security header: empty for certificate auth (the TLS client
/// certificate authenticates), SecurityContextToken otherwise.
pub fn security_header(token: Option<&str>) -> String {
    match token {
        None => "<soapenv:Header/>".to_string(),
        Some(token) => format!(
            r#"<soapenv:Header>
      <wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
         <wsc:SecurityContextToken xmlns:wsc="http://schemas.xmlsoap.org/ws/2005/02/sc">
            <wsc:Identifier>{}</wsc:Identifier>
         </wsc:SecurityContextToken>
      </wsse:Security>
   </soapenv:Header>"#,
            escape(token)
        ),
    }
}

fn transfer_envelope(operation: &str, header: &str, request_body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                  xmlns:tran="http://www.bipro.net/namespace/transfer"
                  xmlns:nac="http://www.bipro.net/namespace/nachrichten"
                  xmlns:bas="http://www.bipro.net/namespace/basis">
   {header}
   <soapenv:Body>
      <tran:{operation}>
         <tran:Request>
            <nac:BiPROVersion>{version}</nac:BiPROVersion>
            {request_body}
         </tran:Request>
      </tran:{operation}>
   </soapenv:Body>
</soapenv:Envelope>"#,
        header = header,
        operation = operation,
        request_body = request_body,
        version = BIPRO_VERSION
    )
}

fn consumer_id_xml(consumer_id: Option<&str>) -> String {
    match consumer_id {
        Some(id) if !id.is_empty() => {
            format!("<nac:ConsumerID>{}</nac:ConsumerID>", escape(id))
        }
        _ => String::new(),
    }
}

/// `listShipments` request. `confirm` is `None` for profiles that must
/// not send the confirmation element.
pub fn list_shipments_envelope(
    header: &str,
    consumer_id: Option<&str>,
    confirm: Option<bool>,
) -> String {
    let mut body = consumer_id_xml(consumer_id);
    if let Some(confirm) = confirm {
        body.push_str(&format!(
            "<tran:BestaetigeLieferungen>{}</tran:BestaetigeLieferungen>",
            confirm
        ));
    }
    transfer_envelope("listShipments", header, &body)
}

/// `getShipment` request.
pub fn get_shipment_envelope(header: &str, consumer_id: Option<&str>, shipment_id: &str) -> String {
    let body = format!(
        "{}<tran:ID>{}</tran:ID>",
        consumer_id_xml(consumer_id),
        escape(shipment_id)
    );
    transfer_envelope("getShipment", header, &body)
}

/// `acknowledgeShipment` request.
pub fn acknowledge_envelope(header: &str, consumer_id: Option<&str>, shipment_id: &str) -> String {
    let body = format!(
        "{}<tran:ID>{}</tran:ID>",
        consumer_id_xml(consumer_id),
        escape(shipment_id)
    );
    transfer_envelope("acknowledgeShipment", header, &body)
}

// --------------------------------------------------------------------
// Response parsing
// --------------------------------------------------------------------

fn local_name(raw: &[u8]) -> String {
    let name = match raw.iter().rposition(|&b| b == b':') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };
    String::from_utf8_lossy(name).into_owned()
}

/// Collect `(element local name, text)` pairs with the enclosing
/// element path tracked by the callback.
fn walk_texts(xml: &str, mut on_text: impl FnMut(&[String], &str)) {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(local_name(e.name().as_ref())),
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                if let Ok(text) = t.unescape() {
                    let text = text.trim();
                    if !text.is_empty() {
                        on_text(&stack, text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("XML-Parsing abgebrochen: {}", e);
                break;
            }
        }
    }
}

/// SecurityContextToken identifier from an STS response.
pub fn extract_token(xml: &str) -> Option<String> {
    let mut token = None;
    walk_texts(xml, |stack, text| {
        if token.is_none() && stack.last().map(String::as_str) == Some("Identifier") {
            token = Some(text.to_string());
        }
    });
    token
}

/// Token expiry (`wsu:Expires`) from an STS response.
pub fn extract_expires(xml: &str) -> Option<DateTime<Utc>> {
    let mut expires = None;
    walk_texts(xml, |stack, text| {
        if expires.is_none() && stack.last().map(String::as_str) == Some("Expires") {
            expires = DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
    });
    expires
}

/// True when the response carries `<StatusID>NOK</StatusID>`.
pub fn status_is_nok(xml: &str) -> bool {
    let mut nok = false;
    walk_texts(xml, |stack, text| {
        if stack.last().map(String::as_str) == Some("StatusID") && text == "NOK" {
            nok = true;
        }
    });
    nok
}

/// True when the response carries `<StatusID>OK</StatusID>`.
pub fn status_is_ok(xml: &str) -> bool {
    let mut ok = false;
    walk_texts(xml, |stack, text| {
        if stack.last().map(String::as_str) == Some("StatusID") && text == "OK" {
            ok = true;
        }
    });
    ok
}

/// First error message (`<Text>` or `<faultstring>`).
pub fn error_text(xml: &str) -> Option<String> {
    let mut message = None;
    walk_texts(xml, |stack, text| {
        if message.is_none()
            && matches!(stack.last().map(String::as_str), Some("Text") | Some("faultstring"))
        {
            message = Some(text.to_string());
        }
    });
    message
}

/// Shipment category from a getShipment response.
pub fn extract_category(xml: &str) -> Option<String> {
    let mut category = None;
    walk_texts(xml, |stack, text| {
        let inside_lieferung = stack.iter().any(|n| n == "Lieferung");
        if category.is_none()
            && !inside_lieferung
            && stack.last().map(String::as_str) == Some("Kategorie")
        {
            category = Some(text.to_string());
        }
    });
    category
}

/// Shipment list from a listShipments response.
pub fn parse_shipment_list(xml: &str) -> Vec<ShipmentInfo> {
    let mut shipments = Vec::new();
    let mut current: Option<ShipmentInfo> = None;

    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "Lieferung" {
                    current = Some(ShipmentInfo {
                        shipment_id: String::new(),
                        created_at: None,
                        category: None,
                        available_until: None,
                        transfer_count: 1,
                        contains_only_data: false,
                    });
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "Lieferung" {
                    if let Some(info) = current.take() {
                        if !info.shipment_id.is_empty() {
                            debug!("Lieferung gefunden: ID={}", info.shipment_id);
                            shipments.push(info);
                        }
                    }
                }
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let Some(info) = current.as_mut() else {
                    continue;
                };
                let Ok(text) = t.unescape() else { continue };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match stack.last().map(String::as_str) {
                    Some("ID") => info.shipment_id = text.to_string(),
                    Some("Einstellzeitpunkt") => info.created_at = Some(text.to_string()),
                    Some("Kategorie") => info.category = Some(text.to_string()),
                    Some("VerfuegbarBis") => info.available_until = Some(text.to_string()),
                    Some("AnzahlTransfers") => {
                        info.transfer_count = text.parse().unwrap_or(1);
                    }
                    Some("EnthaeltNurDaten") => {
                        info.contains_only_data = text == "true";
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Lieferungs-Parsing abgebrochen: {}", e);
                break;
            }
        }
    }

    shipments
}

fn mime_for(filename: &str, content: &[u8]) -> String {
    if let Some(kind) = infer::get(content) {
        return kind.mime_type().to_string();
    }
    match filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()) {
        Some(ext) if ext == "xml" => "application/xml".to_string(),
        Some(ext) if ext == "gdv" || ext == "txt" => "text/plain".to_string(),
        _ => "application/pdf".to_string(),
    }
}

/// Documents with Base64 content from a plain-XML getShipment
/// response (the non-MTOM fallback path).
pub fn parse_document_blobs(xml: &str) -> Vec<ShipmentDocument> {
    let mut documents = Vec::new();

    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut in_dokument = 0usize;
    let mut filename: Option<String> = None;
    let mut content: Option<Vec<u8>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name.ends_with("Dokument") {
                    in_dokument += 1;
                    if in_dokument == 1 {
                        filename = None;
                        content = None;
                    }
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                stack.pop();
                if name.ends_with("Dokument") && in_dokument > 0 {
                    in_dokument -= 1;
                    if in_dokument == 0 {
                        if let Some(bytes) = content.take() {
                            let filename = filename
                                .take()
                                .unwrap_or_else(|| format!("dokument_{}.pdf", documents.len() + 1));
                            let mime_type = mime_for(&filename, &bytes);
                            documents.push(ShipmentDocument {
                                filename,
                                content_bytes: bytes,
                                mime_type,
                            });
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if in_dokument == 0 {
                    continue;
                }
                let Ok(text) = t.unescape() else { continue };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match stack.last().map(String::as_str) {
                    Some(name) if name.contains("Dateiname") => {
                        filename = Some(text.to_string());
                    }
                    Some("Inhalt") | Some("Content") | Some("Daten") => {
                        let compact: String =
                            text.chars().filter(|c| !c.is_whitespace()).collect();
                        // Short payloads are status fields, not documents.
                        if compact.len() > 50 {
                            if let Ok(decoded) =
                                base64::engine::general_purpose::STANDARD.decode(&compact)
                            {
                                content = Some(decoded);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Dokument-Parsing abgebrochen: {}", e);
                break;
            }
        }
    }

    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTILE: &str = "&x<y>\"z'";

    #[test]
    fn test_escape_all_five_entities() {
        assert_eq!(escape(HOSTILE), "&amp;x&lt;y&gt;&quot;z&apos;");
    }

    #[test]
    fn test_consumer_id_roundtrips_through_parser() {
        let header = security_header(Some("tok"));
        let envelope = list_shipments_envelope(&header, Some(HOSTILE), Some(true));

        // The envelope must be well-formed and yield the exact input back.
        let mut consumer = None;
        walk_texts(&envelope, |stack, text| {
            if stack.last().map(String::as_str) == Some("ConsumerID") {
                consumer = Some(text.to_string());
            }
        });
        assert_eq!(consumer.as_deref(), Some(HOSTILE));
    }

    #[test]
    fn test_shipment_id_escaped_in_get_envelope() {
        let envelope = get_shipment_envelope("<soapenv:Header/>", None, "id<&>'\"");
        assert!(envelope.contains("<tran:ID>id&lt;&amp;&gt;&apos;&quot;</tran:ID>"));

        let mut id = None;
        walk_texts(&envelope, |stack, text| {
            if stack.last().map(String::as_str) == Some("ID") {
                id = Some(text.to_string());
            }
        });
        assert_eq!(id.as_deref(), Some("id<&>'\""));
    }

    #[test]
    fn test_sts_envelope_escapes_credentials() {
        for style in [StsStyle::WsTrust, StsStyle::Addressing] {
            let envelope = sts_envelope(style, "user&name", "pa<ss>word");
            assert!(envelope.contains("user&amp;name"));
            assert!(envelope.contains("pa&lt;ss&gt;word"));
            assert!(!envelope.contains("pa<ss>word"));
        }
    }

    #[test]
    fn test_confirm_element_presence() {
        let with = list_shipments_envelope("<soapenv:Header/>", None, Some(false));
        assert!(with.contains("<tran:BestaetigeLieferungen>false</tran:BestaetigeLieferungen>"));

        let without = list_shipments_envelope("<soapenv:Header/>", Some("app-1"), None);
        assert!(!without.contains("BestaetigeLieferungen"));
        assert!(without.contains("<nac:ConsumerID>app-1</nac:ConsumerID>"));
    }

    #[test]
    fn test_extract_token_and_expires() {
        let xml = r#"<Envelope><Body>
            <wst:RequestSecurityTokenResponse xmlns:wst="x">
              <wst:Lifetime><wsu:Expires xmlns:wsu="y">2026-02-03T14:30:00Z</wsu:Expires></wst:Lifetime>
              <wsc:SecurityContextToken xmlns:wsc="z"><wsc:Identifier>uuid:token-1</wsc:Identifier></wsc:SecurityContextToken>
            </wst:RequestSecurityTokenResponse>
        </Body></Envelope>"#;
        assert_eq!(extract_token(xml).as_deref(), Some("uuid:token-1"));
        let expires = extract_expires(xml).unwrap();
        assert_eq!(expires.to_rfc3339(), "2026-02-03T14:30:00+00:00");
    }

    #[test]
    fn test_parse_shipment_list_with_prefixes() {
        let xml = r#"<resp xmlns:tran="t">
          <tran:Lieferung>
            <tran:ID>L-100</tran:ID>
            <tran:Einstellzeitpunkt>2025-06-01T08:00:00</tran:Einstellzeitpunkt>
            <tran:Kategorie>999005000</tran:Kategorie>
            <tran:AnzahlTransfers>2</tran:AnzahlTransfers>
            <tran:EnthaeltNurDaten>true</tran:EnthaeltNurDaten>
          </tran:Lieferung>
          <tran:Lieferung><tran:ID>L-101</tran:ID></tran:Lieferung>
        </resp>"#;
        let shipments = parse_shipment_list(xml);
        assert_eq!(shipments.len(), 2);
        assert_eq!(shipments[0].shipment_id, "L-100");
        assert_eq!(shipments[0].transfer_count, 2);
        assert!(shipments[0].contains_only_data);
        assert_eq!(shipments[0].category.as_deref(), Some("999005000"));
        assert_eq!(shipments[1].shipment_id, "L-101");
        assert_eq!(shipments[1].transfer_count, 1);
    }

    #[test]
    fn test_status_and_error_extraction() {
        let nok = r#"<r><nac:Status xmlns:nac="n"><nac:StatusID>NOK</nac:StatusID>
            <nac:Meldung><nac:Text>Zugang gesperrt</nac:Text></nac:Meldung></nac:Status></r>"#;
        assert!(status_is_nok(nok));
        assert!(!status_is_ok(nok));
        assert_eq!(error_text(nok).as_deref(), Some("Zugang gesperrt"));

        let ok = r#"<r><Status><StatusID>OK</StatusID></Status></r>"#;
        assert!(status_is_ok(ok));
        assert!(!status_is_nok(ok));
    }

    #[test]
    fn test_parse_document_blobs_base64() {
        let payload = b"%PDF-1.4 minimal but long enough to pass the length gate...";
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        let xml = format!(
            r#"<resp xmlns:tran="t">
              <tran:Dokument>
                <tran:Dateiname>police.pdf</tran:Dateiname>
                <tran:Inhalt>{}</tran:Inhalt>
              </tran:Dokument>
              <tran:Dokument>
                <tran:Dateiname>leer.pdf</tran:Dateiname>
                <tran:Inhalt>c2hvcnQ=</tran:Inhalt>
              </tran:Dokument>
            </resp>"#,
            encoded
        );
        let docs = parse_document_blobs(&xml);
        assert_eq!(docs.len(), 1, "short payloads are not documents");
        assert_eq!(docs[0].filename, "police.pdf");
        assert_eq!(docs[0].content_bytes, payload);
        assert_eq!(docs[0].mime_type, "application/pdf");
    }
}
