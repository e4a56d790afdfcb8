//! Process-local classification cache keyed by content hash.
//!
//! Identical bytes classify identically, so a second occurrence of a
//! hash reuses the first outcome and skips the LLM entirely.
//! Concurrent writers for the same key are idempotent: every
//! successful classifier agrees on the outcome, so last-writer-wins
//! is safe.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::models::{BoxType, Confidence};

/// Cached outcome of a classification.
#[derive(Debug, Clone)]
pub struct CachedClassification {
    pub target_box: BoxType,
    pub category: Option<String>,
    pub new_filename: Option<String>,
    pub confidence: Confidence,
}

/// Thread-safe cache; reads and writes are short.
#[derive(Default)]
pub struct ClassificationCache {
    entries: Mutex<HashMap<String, CachedClassification>>,
}

impl ClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, content_hash: Option<&str>) -> Option<CachedClassification> {
        let hash = content_hash?;
        if hash.is_empty() {
            return None;
        }
        self.entries.lock().unwrap().get(hash).cloned()
    }

    pub fn put(&self, content_hash: Option<&str>, entry: CachedClassification) {
        let Some(hash) = content_hash else {
            return;
        };
        if hash.is_empty() {
            return;
        }
        debug!("Klassifikation gecached fuer Hash {}...", &hash[..hash.len().min(12)]);
        self.entries.lock().unwrap().insert(hash.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(box_type: BoxType) -> CachedClassification {
        CachedClassification {
            target_box: box_type,
            category: Some("sparte_sach".into()),
            new_filename: Some("Hanse_Sach.pdf".into()),
            confidence: Confidence::High,
        }
    }

    #[test]
    fn test_put_and_get() {
        let cache = ClassificationCache::new();
        assert!(cache.get(Some("abc")).is_none());

        cache.put(Some("abc"), entry(BoxType::Sach));
        let hit = cache.get(Some("abc")).unwrap();
        assert_eq!(hit.target_box, BoxType::Sach);
        assert_eq!(hit.new_filename.as_deref(), Some("Hanse_Sach.pdf"));
    }

    #[test]
    fn test_missing_hash_is_ignored() {
        let cache = ClassificationCache::new();
        cache.put(None, entry(BoxType::Gdv));
        cache.put(Some(""), entry(BoxType::Gdv));
        assert!(cache.is_empty());
        assert!(cache.get(None).is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = ClassificationCache::new();
        cache.put(Some("h"), entry(BoxType::Sach));
        cache.put(Some("h"), entry(BoxType::Leben));
        assert_eq!(cache.get(Some("h")).unwrap().target_box, BoxType::Leben);
        assert_eq!(cache.len(), 1);
    }
}
