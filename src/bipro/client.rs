//! BiPRO 430 transfer service client.
//!
//! Flow: obtain a SecurityContextToken from the STS (BiPRO 410),
//! then call the transfer service with the token in the SOAP header.
//! Certificate-authenticated connections (PFX/JKS/PEM) skip the STS
//! entirely; the TLS client certificate authenticates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{ShipmentContent, ShipmentInfo};

use super::envelope;
use super::keystore::{self, TempFileRegistry};
use super::mtom;
use super::profile::{self, VuProfile};
use super::BiproError;

/// Shortest remaining lifetime before a token counts as expired.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;
/// Assumed lifetime when the STS response carries no expiry.
const TOKEN_DEFAULT_LIFETIME_MINS: i64 = 10;

const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const GET_TIMEOUT: Duration = Duration::from_secs(120);
const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const STS_TIMEOUT: Duration = Duration::from_secs(30);

const PROXY_ENV_VARS: [&str; 8] = [
    "HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy",
    "ALL_PROXY", "all_proxy", "NO_PROXY", "no_proxy",
];

/// Known endpoints for quick configuration.
pub const KNOWN_ENDPOINTS: [(&str, &str); 2] = [
    (
        "degenia",
        "https://transfer.degenia.de/X4/httpstarter/ReST/BiPRO/430_Transfer/Service_2.6.1.1.0",
    ),
    ("biprohub", "https://www.biprohub.eu/soap/TransferService"),
];

const DEGENIA_STS_URL: &str =
    "https://transfer.degenia.de/X4/httpstarter/ReST/BiPRO/410_STS/UserPasswordLogin_2.6.1.1.0";

/// BiPRO access data supporting four authentication variants:
/// username/password + STS, PFX keystore, JKS keystore, PEM pair.
#[derive(Debug, Clone, Default)]
pub struct BiproCredentials {
    pub username: String,
    pub password: String,
    pub endpoint_url: String,
    pub vu_name: String,
    pub vu_number: String,
    pub sts_endpoint_url: String,
    /// Application identifier, required by some carriers (VEMA).
    pub consumer_id: String,

    pub pfx_path: Option<PathBuf>,
    pub pfx_password: String,

    pub jks_path: Option<PathBuf>,
    pub jks_password: String,
    pub jks_alias: String,
    pub jks_key_password: String,

    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl BiproCredentials {
    pub fn uses_certificate(&self) -> bool {
        self.pfx_path.is_some()
            || self.jks_path.is_some()
            || (self.cert_path.is_some() && self.key_path.is_some())
    }

    pub fn auth_method(&self) -> &'static str {
        if self.pfx_path.is_some() {
            "X.509-Zertifikat PFX"
        } else if self.jks_path.is_some() {
            "X.509-Zertifikat JKS"
        } else if self.cert_path.is_some() && self.key_path.is_some() {
            "X.509-Zertifikat PEM"
        } else {
            "STS-Token"
        }
    }
}

struct StsToken {
    value: String,
    expires: DateTime<Utc>,
}

impl StsToken {
    fn is_valid(&self) -> bool {
        Utc::now() + ChronoDuration::seconds(TOKEN_EXPIRY_BUFFER_SECS) < self.expires
    }
}

/// BiPRO 430 client with per-VU profile dispatch.
pub struct TransferClient {
    credentials: BiproCredentials,
    profile: &'static VuProfile,
    client: reqwest::Client,
    transfer_url: String,
    sts_url: Option<String>,
    uses_certificate: bool,
    token: Mutex<Option<StsToken>>,
    registry: Arc<TempFileRegistry>,
}

fn system_proxy_enabled() -> bool {
    std::env::var("BIPRO_USE_SYSTEM_PROXY")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl TransferClient {
    pub fn new(credentials: BiproCredentials) -> Result<Self, BiproError> {
        let uses_certificate = credentials.uses_certificate();

        let sts_url = if uses_certificate {
            None
        } else if !credentials.sts_endpoint_url.is_empty() {
            Some(credentials.sts_endpoint_url.clone())
        } else if credentials.endpoint_url.contains("430_Transfer") {
            Some(
                credentials
                    .endpoint_url
                    .replace("430_Transfer/Service", "410_STS/UserPasswordLogin"),
            )
        } else {
            Some(DEGENIA_STS_URL.to_string())
        };

        let profile = profile::detect(
            &credentials.vu_name,
            &[
                credentials.endpoint_url.as_str(),
                credentials.sts_endpoint_url.as_str(),
            ],
        );
        if profile.key != "default" {
            info!("VU-Profil erkannt: {}", profile.key);
        }

        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if system_proxy_enabled() {
            info!("BiPRO: System-Proxy wird verwendet (BIPRO_USE_SYSTEM_PROXY=1)");
        } else {
            for var in PROXY_ENV_VARS {
                std::env::remove_var(var);
            }
            builder = builder.no_proxy();
        }

        let registry = Arc::new(TempFileRegistry::new());

        if uses_certificate {
            let (cert_path, key_path) = if let Some(pfx) = &credentials.pfx_path {
                keystore::pfx_to_pem(pfx, &credentials.pfx_password, &registry)?
            } else if let Some(jks) = &credentials.jks_path {
                let key_password = if credentials.jks_key_password.is_empty() {
                    &credentials.jks_password
                } else {
                    &credentials.jks_key_password
                };
                keystore::jks_to_pem(jks, key_password, &registry)?
            } else {
                (
                    credentials.cert_path.clone().expect("checked by uses_certificate"),
                    credentials.key_path.clone().expect("checked by uses_certificate"),
                )
            };

            let mut pem = std::fs::read(&cert_path)
                .map_err(|e| BiproError::Keystore(format!("Zertifikat nicht lesbar: {}", e)))?;
            let key = std::fs::read(&key_path)
                .map_err(|e| BiproError::Keystore(format!("Key nicht lesbar: {}", e)))?;
            pem.extend_from_slice(&key);

            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| BiproError::Keystore(format!("Client-Identitaet ungueltig: {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| BiproError::Network(e.to_string()))?;

        info!("Auth-Methode: {}", credentials.auth_method());

        Ok(Self {
            transfer_url: credentials.endpoint_url.clone(),
            credentials,
            profile,
            client,
            sts_url,
            uses_certificate,
            token: Mutex::new(None),
            registry,
        })
    }

    pub fn profile_key(&self) -> &'static str {
        self.profile.key
    }

    async fn soap_post(
        &self,
        url: &str,
        envelope: String,
        timeout: Duration,
    ) -> Result<(Vec<u8>, String), BiproError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", self.profile.soap_action)
            .body(envelope)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BiproError::Network(e.to_string()))?;

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        debug!("SOAP Response Status: {}", response.status());

        let body = response
            .bytes()
            .await
            .map_err(|e| BiproError::Network(e.to_string()))?;
        Ok((body.to_vec(), content_type))
    }

    /// Make sure authentication is ready; returns the token for the
    /// SOAP header, `None` for certificate auth.
    async fn ensure_token(&self) -> Result<Option<String>, BiproError> {
        if self.uses_certificate {
            return Ok(None);
        }

        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref() {
            if token.is_valid() {
                return Ok(Some(token.value.clone()));
            }
            info!("STS-Token abgelaufen oder bald ablaufend, hole neues Token");
        }

        let sts_url = self
            .sts_url
            .as_deref()
            .ok_or_else(|| BiproError::Auth("Kein STS-Endpoint konfiguriert".to_string()))?;
        info!("Hole STS-Token von: {}", sts_url);

        let body = envelope::sts_envelope(
            self.profile.sts_style,
            &self.credentials.username,
            &self.credentials.password,
        );
        let (response, _) = self.soap_post(sts_url, body, STS_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&response);

        let Some(value) = envelope::extract_token(&text) else {
            let detail = envelope::error_text(&text)
                .unwrap_or_else(|| "Kein Token in STS-Response gefunden".to_string());
            return Err(BiproError::Auth(detail));
        };

        let expires = envelope::extract_expires(&text).unwrap_or_else(|| {
            debug!("Kein Token-Ablaufdatum in Response, nehme 10 Minuten an");
            Utc::now() + ChronoDuration::minutes(TOKEN_DEFAULT_LIFETIME_MINS)
        });
        info!("STS-Token erhalten, gueltig bis {}", expires);

        let result = value.clone();
        *slot = Some(StsToken { value, expires });
        Ok(Some(result))
    }

    fn consumer_id(&self) -> Result<Option<&str>, BiproError> {
        let id = self.credentials.consumer_id.as_str();
        if id.is_empty() {
            if self.profile.requires_consumer_id {
                return Err(BiproError::Auth(format!(
                    "Profil '{}' erfordert eine Consumer-ID",
                    self.profile.key
                )));
            }
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Probe the connection by authenticating and listing shipments.
    pub async fn test_connection(&self) -> bool {
        match self.list_shipments(false).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Verbindungstest fehlgeschlagen: {}", e);
                false
            }
        }
    }

    /// List pending shipments. With `confirm` the carrier marks them
    /// as picked up (profiles that reject the element never send it).
    pub async fn list_shipments(&self, confirm: bool) -> Result<Vec<ShipmentInfo>, BiproError> {
        let token = self.ensure_token().await?;
        let header = envelope::security_header(token.as_deref());
        let consumer_id = self.consumer_id()?;
        let confirm = self.profile.include_confirm.then_some(confirm);

        info!("Rufe listShipments auf (confirm={:?})...", confirm);
        let body = envelope::list_shipments_envelope(&header, consumer_id, confirm);
        let (response, _) = self.soap_post(&self.transfer_url, body, LIST_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&response).into_owned();

        if envelope::status_is_nok(&text) {
            let detail =
                envelope::error_text(&text).unwrap_or_else(|| "Unbekannter Fehler".to_string());
            return Err(BiproError::Service(detail));
        }

        let shipments = envelope::parse_shipment_list(&text);
        info!("listShipments: {} Lieferung(en) gefunden", shipments.len());
        Ok(shipments)
    }

    /// Fetch one shipment; handles both MTOM multipart and plain XML
    /// responses.
    pub async fn get_shipment(&self, shipment_id: &str) -> Result<ShipmentContent, BiproError> {
        let token = self.ensure_token().await?;
        let header = envelope::security_header(token.as_deref());
        let consumer_id = self.consumer_id()?;

        info!("Rufe getShipment auf fuer ID: {}", shipment_id);
        let body = envelope::get_shipment_envelope(&header, consumer_id, shipment_id);
        let (response, content_type) =
            self.soap_post(&self.transfer_url, body, GET_TIMEOUT).await?;
        info!("getShipment Response: {} Bytes", response.len());

        let is_mtom =
            content_type.to_lowercase().contains("multipart") || response.starts_with(b"--");

        let (raw_xml, spliced) = if is_mtom {
            info!("MTOM/XOP Multipart Response erkannt");
            let message = mtom::parse_mtom(&response, &content_type)?;
            let spliced = message.spliced_xml();
            (message.root_xml, spliced)
        } else {
            let text = String::from_utf8_lossy(&response).into_owned();
            (text.clone(), text)
        };

        if envelope::status_is_nok(&spliced) {
            let detail =
                envelope::error_text(&spliced).unwrap_or_else(|| "Unbekannter Fehler".to_string());
            return Err(BiproError::Service(detail));
        }

        let documents = envelope::parse_document_blobs(&spliced);
        info!("getShipment: {} Dokument(e) gefunden", documents.len());

        Ok(ShipmentContent {
            shipment_id: shipment_id.to_string(),
            category: envelope::extract_category(&spliced),
            documents,
            raw_xml,
        })
    }

    /// Acknowledge receipt of a shipment.
    pub async fn acknowledge_shipment(&self, shipment_id: &str) -> Result<bool, BiproError> {
        let token = self.ensure_token().await?;
        let header = envelope::security_header(token.as_deref());
        let consumer_id = self.consumer_id()?;

        info!("Rufe acknowledgeShipment auf fuer ID: {}", shipment_id);
        let body = envelope::acknowledge_envelope(&header, consumer_id, shipment_id);
        let (response, _) = self.soap_post(&self.transfer_url, body, ACK_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&response);

        let success = envelope::status_is_ok(&text);
        if success {
            info!("acknowledgeShipment erfolgreich: {}", shipment_id);
        } else {
            let detail =
                envelope::error_text(&text).unwrap_or_else(|| "Unbekannter Fehler".to_string());
            warn!("acknowledgeShipment fehlgeschlagen fuer {}: {}", shipment_id, detail);
        }
        Ok(success)
    }

    /// Drop the cached token and erase converted key material.
    pub async fn shutdown(&self) {
        *self.token.lock().await = None;
        self.registry.cleanup();
        debug!("BiPRO-Verbindung geschlossen");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sts_credentials() -> BiproCredentials {
        BiproCredentials {
            username: "user".into(),
            password: "pass".into(),
            endpoint_url:
                "https://transfer.degenia.de/X4/httpstarter/ReST/BiPRO/430_Transfer/Service_2.6.1.1.0"
                    .into(),
            vu_name: "Degenia".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sts_url_derived_from_transfer_url() {
        let client = TransferClient::new(sts_credentials()).unwrap();
        assert_eq!(
            client.sts_url.as_deref(),
            Some("https://transfer.degenia.de/X4/httpstarter/ReST/BiPRO/410_STS/UserPasswordLogin_2.6.1.1.0")
        );
        assert_eq!(client.profile_key(), "default");
        assert!(!client.uses_certificate);
    }

    #[test]
    fn test_vema_profile_requires_consumer_id() {
        let mut credentials = sts_credentials();
        credentials.vu_name = "VEMA eG".into();
        credentials.endpoint_url = "https://ws.vemaeg.de/430".into();
        let client = TransferClient::new(credentials).unwrap();

        assert_eq!(client.profile_key(), "vema");
        assert!(client.consumer_id().is_err());

        let mut with_id = sts_credentials();
        with_id.vu_name = "VEMA eG".into();
        with_id.consumer_id = "app-42".into();
        let client = TransferClient::new(with_id).unwrap();
        assert_eq!(client.consumer_id().unwrap(), Some("app-42"));
    }

    #[test]
    fn test_auth_method_labels() {
        assert_eq!(sts_credentials().auth_method(), "STS-Token");

        let mut pfx = sts_credentials();
        pfx.pfx_path = Some(PathBuf::from("/tmp/a.pfx"));
        assert_eq!(pfx.auth_method(), "X.509-Zertifikat PFX");
        assert!(pfx.uses_certificate());

        let mut pem_pair = sts_credentials();
        pem_pair.cert_path = Some(PathBuf::from("c.pem"));
        assert!(!pem_pair.uses_certificate(), "cert without key is incomplete");
        pem_pair.key_path = Some(PathBuf::from("k.pem"));
        assert!(pem_pair.uses_certificate());
    }

    #[test]
    fn test_token_validity_buffer() {
        let fresh = StsToken {
            value: "t".into(),
            expires: Utc::now() + ChronoDuration::minutes(5),
        };
        assert!(fresh.is_valid());

        // Inside the 60 s buffer counts as expired.
        let stale = StsToken {
            value: "t".into(),
            expires: Utc::now() + ChronoDuration::seconds(30),
        };
        assert!(!stale.is_valid());
    }
}
