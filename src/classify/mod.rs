//! Document classification: the decision ladder, the content-hash
//! cache and filename slugging.

pub mod cache;
pub mod engine;
pub mod slug;
pub mod spreadsheet;

pub use cache::{CachedClassification, ClassificationCache};
pub use engine::{ClassifierEngine, DEFAULT_RAW_XML_PATTERNS};
pub use slug::slugify;
