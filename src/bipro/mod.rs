//! BiPRO 430 data transfer: SOAP envelopes, STS token lifecycle,
//! MTOM parsing, keystore conversion and the transfer client.

pub mod client;
pub mod envelope;
pub mod keystore;
pub mod mtom;
pub mod profile;

use thiserror::Error;

pub use client::{BiproCredentials, TransferClient, KNOWN_ENDPOINTS};
pub use keystore::TempFileRegistry;
pub use profile::{StsStyle, VuProfile, PROFILES};

#[derive(Debug, Error)]
pub enum BiproError {
    /// No token obtainable or credentials incomplete.
    #[error("BiPRO-Authentifizierung fehlgeschlagen: {0}")]
    Auth(String),

    /// The service answered with StatusID NOK.
    #[error("BiPRO Fehler: {0}")]
    Service(String),

    /// Keystore could not be converted to a TLS identity.
    #[error("Keystore-Fehler: {0}")]
    Keystore(String),

    #[error("Netzwerkfehler: {0}")]
    Network(String),

    #[error(transparent)]
    Mtom(#[from] mtom::MtomError),
}
