//! Domain models shared across the pipeline.

pub mod batch;
pub mod document;
pub mod shipment;

pub use batch::{BatchProcessingResult, CreditsProvider, ProcessingResult};
pub use document::{
    BoxStats, BoxType, ClassificationSource, Confidence, DisplayColor, Document,
    ProcessingStatus, SourceType, BOX_TYPES,
};
pub use shipment::{ShipmentContent, ShipmentDocument, ShipmentInfo};
