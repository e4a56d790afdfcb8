//! PKCS#12/JKS keystore conversion to PEM pairs for mutual TLS.
//!
//! Converted key material lands in temp files with owner-only
//! permissions. Every file is tracked by a registry that removes it on
//! shutdown and on drop, so neither normal exit nor a panic leaves
//! `bipro_cert_*` / `bipro_key_*` / `bipro_jks_*` files behind.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use super::BiproError;

/// Registry of temp files that must not outlive the client.
#[derive(Default)]
pub struct TempFileRegistry {
    files: Mutex<Vec<PathBuf>>,
}

impl TempFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: PathBuf) {
        self.files.lock().unwrap().push(path);
    }

    /// Remove every tracked file; idempotent.
    pub fn cleanup(&self) {
        let mut files = self.files.lock().unwrap();
        for path in files.drain(..) {
            if std::fs::remove_file(&path).is_ok() {
                debug!("Temp-PEM aufgeraeumt: {}", path.display());
            }
        }
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

impl Drop for TempFileRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn write_tracked_pem(
    registry: &TempFileRegistry,
    prefix: &str,
    pem_text: &str,
) -> Result<PathBuf, BiproError> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".pem")
        .tempfile()
        .map_err(|e| BiproError::Keystore(format!("Temp-Datei nicht erstellbar: {}", e)))?;
    let (_, path) = file
        .keep()
        .map_err(|e| BiproError::Keystore(format!("Temp-Datei nicht persistierbar: {}", e)))?;

    std::fs::write(&path, pem_text)
        .map_err(|e| BiproError::Keystore(format!("PEM nicht schreibbar: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }

    registry.register(path.clone());
    Ok(path)
}

fn pkcs12_to_pem_strings(
    der: &[u8],
    password: &str,
    origin: &str,
) -> Result<(String, String), BiproError> {
    let pfx = p12::PFX::parse(der)
        .map_err(|e| BiproError::Keystore(format!("{} nicht parsebar: {:?}", origin, e)))?;

    if !pfx.verify_mac(password) {
        return Err(BiproError::Keystore(format!(
            "{} konnte nicht entschluesselt werden. Moegliche Ursache: Falsches Passwort.",
            origin
        )));
    }

    let keys = pfx
        .key_bags(password)
        .map_err(|e| BiproError::Keystore(format!("{}: Key nicht lesbar: {:?}", origin, e)))?;
    let certs = pfx
        .cert_x509_bags(password)
        .map_err(|e| BiproError::Keystore(format!("{}: Zertifikate nicht lesbar: {:?}", origin, e)))?;

    let key_der = keys
        .into_iter()
        .next()
        .ok_or_else(|| BiproError::Keystore(format!("{} enthaelt keinen Private Key", origin)))?;
    if certs.is_empty() {
        return Err(BiproError::Keystore(format!(
            "{} enthaelt kein Zertifikat",
            origin
        )));
    }

    let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key_der));
    // Leaf first, then the CA chain, concatenated into one PEM blob.
    let cert_pem: String = certs
        .into_iter()
        .map(|der| pem::encode(&pem::Pem::new("CERTIFICATE", der)))
        .collect();

    Ok((cert_pem, key_pem))
}

/// Convert a PFX keystore to tracked PEM temp files.
pub fn pfx_to_pem(
    pfx_path: &Path,
    password: &str,
    registry: &TempFileRegistry,
) -> Result<(PathBuf, PathBuf), BiproError> {
    info!("Lade PFX-Zertifikat: {}", pfx_path.display());
    let der = std::fs::read(pfx_path)
        .map_err(|e| BiproError::Keystore(format!("PFX-Datei nicht lesbar: {}", e)))?;

    let (cert_pem, key_pem) = pkcs12_to_pem_strings(&der, password, "PFX-Datei")?;

    let cert_file = write_tracked_pem(registry, "bipro_cert_", &cert_pem)?;
    let key_file = write_tracked_pem(registry, "bipro_key_", &key_pem)?;
    info!("PFX-Zertifikat erfolgreich geladen");
    Ok((cert_file, key_file))
}

/// Convert a JKS keystore to tracked PEM temp files.
///
/// Java keystores are PKCS#12-format since Java 9; pre-9 proprietary
/// JKS is rejected with a conversion hint.
pub fn jks_to_pem(
    jks_path: &Path,
    password: &str,
    registry: &TempFileRegistry,
) -> Result<(PathBuf, PathBuf), BiproError> {
    info!("Lade JKS-Zertifikat: {}", jks_path.display());
    let der = std::fs::read(jks_path)
        .map_err(|e| BiproError::Keystore(format!("JKS-Datei nicht lesbar: {}", e)))?;

    // Legacy JKS magic 0xFEEDFEED; modern keystores are PKCS#12.
    if der.len() >= 4 && der[0..4] == [0xFE, 0xED, 0xFE, 0xED] {
        return Err(BiproError::Keystore(
            "JKS im proprietaeren Legacy-Format. Bitte nach PKCS#12 konvertieren: \
             keytool -importkeystore -deststoretype pkcs12"
                .to_string(),
        ));
    }

    let (cert_pem, key_pem) = pkcs12_to_pem_strings(&der, password, "JKS-Datei")?;

    let cert_file = write_tracked_pem(registry, "bipro_jks_cert_", &cert_pem)?;
    let key_file = write_tracked_pem(registry, "bipro_jks_key_", &key_pem)?;
    info!("JKS-Zertifikat erfolgreich geladen");
    Ok((cert_file, key_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_cleanup_removes_files() {
        let registry = TempFileRegistry::new();
        let path = write_tracked_pem(&registry, "bipro_cert_", "-----BEGIN X-----\n").unwrap();
        assert!(path.exists());
        assert_eq!(registry.tracked(), 1);

        registry.cleanup();
        assert!(!path.exists());
        assert_eq!(registry.tracked(), 0);

        // Idempotent.
        registry.cleanup();
    }

    #[test]
    fn test_registry_drop_cleans_up() {
        let path;
        {
            let registry = TempFileRegistry::new();
            path = write_tracked_pem(&registry, "bipro_key_", "x").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_registry_survives_panic_unwind() {
        let registry = std::sync::Arc::new(TempFileRegistry::new());
        let path = write_tracked_pem(&registry, "bipro_jks_cert_", "x").unwrap();

        let registry_clone = registry.clone();
        let result = std::panic::catch_unwind(move || {
            let _hold = registry_clone;
            panic!("simulated crash");
        });
        assert!(result.is_err());

        drop(registry);
        assert!(!path.exists());
    }

    #[test]
    fn test_legacy_jks_is_rejected_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.jks");
        std::fs::write(&path, [0xFEu8, 0xED, 0xFE, 0xED, 0x00, 0x00]).unwrap();

        let registry = TempFileRegistry::new();
        let err = jks_to_pem(&path, "pw", &registry).unwrap_err();
        assert!(err.to_string().contains("PKCS#12"));
    }

    #[test]
    fn test_garbage_pfx_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pfx");
        std::fs::write(&path, b"not a keystore at all").unwrap();

        let registry = TempFileRegistry::new();
        assert!(pfx_to_pem(&path, "pw", &registry).is_err());
        assert_eq!(registry.tracked(), 0);
    }
}
