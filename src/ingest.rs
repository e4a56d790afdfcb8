//! Ingestion adapters: BiPRO shipment import and drop-target uploads.
//!
//! Every inbound source ends in the same place: files uploaded into
//! `eingang` for classification, containers and raw XML into `roh`
//! for archival.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::api::{ApiError, DocumentsApi, PasswordType, PasswordsApi, UploadOptions};
use crate::bipro::{BiproError, TransferClient};
use crate::containers::{ContainerError, ContainerExpander};
use crate::models::{BoxType, SourceType};
use crate::pdf::PdfService;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Bipro(#[from] BiproError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload tally of an import run.
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub shipments: usize,
    pub documents: usize,
    pub raw_files: usize,
    pub failed: usize,
}

/// Imports BiPRO shipments into the archive.
pub struct ShipmentImporter {
    transfer: TransferClient,
    docs: DocumentsApi,
    vu_name: String,
}

impl ShipmentImporter {
    pub fn new(transfer: TransferClient, docs: DocumentsApi, vu_name: String) -> Self {
        Self { transfer, docs, vu_name }
    }

    /// Release the transfer client (token + converted key material).
    pub async fn shutdown(&self) {
        self.transfer.shutdown().await;
    }

    /// Fetch, upload and acknowledge every pending shipment.
    ///
    /// Documents land in `eingang` with their BiPRO category; the raw
    /// SOAP XML of each shipment is archived in `roh`.
    pub async fn import_pending(&self) -> Result<ImportSummary, IngestError> {
        let mut summary = ImportSummary::default();

        let shipments = self.transfer.list_shipments(true).await?;
        info!("{} Lieferung(en) bereitstehend", shipments.len());

        for shipment in shipments {
            let content = match self.transfer.get_shipment(&shipment.shipment_id).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Lieferung {} nicht abrufbar: {}", shipment.shipment_id, e);
                    summary.failed += 1;
                    continue;
                }
            };

            let tmpdir = tempfile::tempdir()?;
            let category = content.category.clone().or(shipment.category.clone());

            for document in &content.documents {
                let path = tmpdir.path().join(&document.filename);
                std::fs::write(&path, &document.content_bytes)?;

                let options = UploadOptions {
                    source_type: SourceType::BiproAuto,
                    box_type: Some(BoxType::Eingang),
                    shipment_id: Some(shipment.shipment_id.clone()),
                    vu_name: Some(self.vu_name.clone()),
                    bipro_category: category.clone(),
                    validation_status: None,
                };
                match self.docs.upload(&path, &options).await {
                    Ok(_) => summary.documents += 1,
                    Err(e) => {
                        warn!("Upload fehlgeschlagen fuer {}: {}", document.filename, e);
                        summary.failed += 1;
                    }
                }
            }

            // Raw SOAP XML for the audit trail.
            let raw_path = tmpdir
                .path()
                .join(format!("Lieferung_{}_roh.xml", shipment.shipment_id));
            std::fs::write(&raw_path, content.raw_xml.as_bytes())?;
            let raw_options = UploadOptions {
                source_type: SourceType::BiproAuto,
                box_type: Some(BoxType::Roh),
                shipment_id: Some(shipment.shipment_id.clone()),
                vu_name: Some(self.vu_name.clone()),
                bipro_category: category,
                validation_status: None,
            };
            match self.docs.upload(&raw_path, &raw_options).await {
                Ok(_) => summary.raw_files += 1,
                Err(e) => warn!("Roh-XML-Upload fehlgeschlagen: {}", e),
            }

            if let Err(e) = self.transfer.acknowledge_shipment(&shipment.shipment_id).await {
                warn!("Quittierung fehlgeschlagen fuer {}: {}", shipment.shipment_id, e);
            }
            summary.shipments += 1;
        }

        Ok(summary)
    }
}

/// Expands dropped paths and uploads the resulting jobs.
pub struct DropUploader {
    docs: DocumentsApi,
    passwords: PasswordsApi,
    pdf: PdfService,
}

impl DropUploader {
    pub fn new(docs: DocumentsApi, passwords: PasswordsApi, pdf: PdfService) -> Self {
        Self { docs, passwords, pdf }
    }

    /// Expand containers and upload everything; temp directories are
    /// removed once the uploads finished, success or failure.
    pub async fn upload_paths(&self, paths: &[PathBuf]) -> Result<ImportSummary, IngestError> {
        let zip_passwords = match self.passwords.get_passwords(PasswordType::Zip).await {
            Ok(passwords) => passwords,
            Err(e) => {
                warn!("ZIP-Passwoerter nicht abrufbar: {}", e);
                Vec::new()
            }
        };

        let mut expander = ContainerExpander::new(self.pdf.clone(), zip_passwords);
        let jobs = expander.expand(paths).await?;

        let mut summary = ImportSummary::default();
        for job in &jobs {
            let options = UploadOptions {
                source_type: SourceType::ManualUpload,
                box_type: Some(job.placement),
                ..Default::default()
            };
            match self.docs.upload(&job.path, &options).await {
                Ok(_) => match job.placement {
                    BoxType::Roh => summary.raw_files += 1,
                    _ => summary.documents += 1,
                },
                Err(e) => {
                    warn!("Upload fehlgeschlagen fuer {}: {}", job.path.display(), e);
                    summary.failed += 1;
                }
            }
        }

        // Expander drop removes the extraction temp dirs.
        drop(expander);
        Ok(summary)
    }
}
