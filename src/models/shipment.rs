//! BiPRO shipment list items and fetched payloads.

use serde::{Deserialize, Serialize};

/// One entry of a `listShipments` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentInfo {
    pub shipment_id: String,
    pub created_at: Option<String>,
    pub category: Option<String>,
    pub available_until: Option<String>,
    pub transfer_count: u32,
    pub contains_only_data: bool,
}

/// A single document inside a fetched shipment.
#[derive(Debug, Clone)]
pub struct ShipmentDocument {
    pub filename: String,
    pub content_bytes: Vec<u8>,
    pub mime_type: String,
}

/// Payload of a `getShipment` call.
///
/// `raw_xml` keeps the SOAP root part (MTOM: the first multipart part)
/// so the delivery can be archived alongside its documents.
#[derive(Debug, Clone)]
pub struct ShipmentContent {
    pub shipment_id: String,
    pub documents: Vec<ShipmentDocument>,
    pub category: Option<String>,
    pub raw_xml: String,
}
