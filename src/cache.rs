//! In-memory document and stats cache with TTL, background refresh
//! and pause/resume.
//!
//! The background ticker refreshes the `all` bucket and the box stats
//! at a fixed interval. Long-running operations (batch processing)
//! pause the ticker; a paused cache still answers from its snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{ApiResult, DocumentFilter, DocumentsApi};
use crate::models::{BoxStats, BoxType, Document};

/// Default background refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20);

/// Events emitted on cache changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// `None` means the `all` bucket.
    DocumentsUpdated(Option<BoxType>),
    StatsUpdated,
    RefreshStarted,
    RefreshFinished,
}

struct Snapshot<T> {
    value: T,
    loaded_at: Instant,
}

impl<T> Snapshot<T> {
    fn new(value: T) -> Self {
        Self { value, loaded_at: Instant::now() }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }
}

/// Shared document/stats cache with auto-refresh.
pub struct DocumentCache {
    docs: DocumentsApi,
    interval: Duration,
    documents_by_box: RwLock<HashMap<Option<BoxType>, Snapshot<Vec<Document>>>>,
    stats: RwLock<Option<Snapshot<BoxStats>>>,
    paused: AtomicBool,
    events: broadcast::Sender<CacheEvent>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentCache {
    pub fn new(docs: DocumentsApi, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            docs,
            interval,
            documents_by_box: RwLock::new(HashMap::new()),
            stats: RwLock::new(None),
            paused: AtomicBool::new(false),
            events,
            ticker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    /// Suspend the ticker; the next tick is skipped immediately.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        debug!("Auto-Refresh pausiert");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        debug!("Auto-Refresh fortgesetzt");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Start the background ticker refreshing `all` and stats.
    pub fn start(self: &Arc<Self>) {
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if cache.is_paused() {
                    continue;
                }
                if let Err(e) = cache.refresh_all().await {
                    warn!("Auto-Refresh fehlgeschlagen: {}", e);
                }
            }
        });

        let mut slot = self.ticker.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop the ticker.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Refresh the `all` bucket and the box stats.
    pub async fn refresh_all(&self) -> ApiResult<()> {
        self.emit(CacheEvent::RefreshStarted);

        let all = self.docs.list(&DocumentFilter::default()).await?;
        self.documents_by_box
            .write()
            .unwrap()
            .insert(None, Snapshot::new(all));
        self.emit(CacheEvent::DocumentsUpdated(None));

        let stats = self.docs.stats().await?;
        *self.stats.write().unwrap() = Some(Snapshot::new(stats));
        self.emit(CacheEvent::StatsUpdated);

        self.emit(CacheEvent::RefreshFinished);
        Ok(())
    }

    /// Documents of a box, served from the cache while fresh.
    pub async fn documents(&self, box_type: Option<BoxType>) -> ApiResult<Vec<Document>> {
        if let Some(snapshot) = self.documents_by_box.read().unwrap().get(&box_type) {
            if snapshot.is_fresh(self.interval) || self.is_paused() {
                return Ok(snapshot.value.clone());
            }
        }

        let filter = match box_type {
            Some(bt) => DocumentFilter::by_box(bt),
            None => DocumentFilter::default(),
        };
        let documents = self.docs.list(&filter).await?;
        self.documents_by_box
            .write()
            .unwrap()
            .insert(box_type, Snapshot::new(documents.clone()));
        self.emit(CacheEvent::DocumentsUpdated(box_type));
        Ok(documents)
    }

    /// Cached snapshot without fetching; `None` when never loaded.
    pub fn snapshot(&self, box_type: Option<BoxType>) -> Option<Vec<Document>> {
        self.documents_by_box
            .read()
            .unwrap()
            .get(&box_type)
            .map(|s| s.value.clone())
    }

    /// Box stats, cached while fresh.
    pub async fn stats(&self) -> ApiResult<BoxStats> {
        if let Some(snapshot) = self.stats.read().unwrap().as_ref() {
            if snapshot.is_fresh(self.interval) || self.is_paused() {
                return Ok(snapshot.value.clone());
            }
        }

        let stats = self.docs.stats().await?;
        *self.stats.write().unwrap() = Some(Snapshot::new(stats.clone()));
        self.emit(CacheEvent::StatsUpdated);
        Ok(stats)
    }

    /// Drop the entries touched by a mutation: the box itself and the
    /// `all` bucket.
    pub fn invalidate_box(&self, box_type: BoxType) {
        let mut map = self.documents_by_box.write().unwrap();
        map.remove(&Some(box_type));
        map.remove(&None);
        drop(map);
        *self.stats.write().unwrap() = None;
        self.emit(CacheEvent::DocumentsUpdated(Some(box_type)));
    }
}

impl Drop for DocumentCache {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiClient, ApiConfig};

    fn cache() -> DocumentCache {
        let client = ApiClient::new(ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(50),
        });
        DocumentCache::new(DocumentsApi::new(client), Duration::from_secs(20))
    }

    fn doc(id: i64) -> Document {
        serde_json::from_value(serde_json::json!({"id": id, "filename": "x.pdf"})).unwrap()
    }

    #[test]
    fn test_pause_resume() {
        let cache = cache();
        assert!(!cache.is_paused());
        cache.pause();
        assert!(cache.is_paused());
        cache.resume();
        assert!(!cache.is_paused());
    }

    #[test]
    fn test_snapshot_and_invalidate() {
        let cache = cache();
        cache
            .documents_by_box
            .write()
            .unwrap()
            .insert(Some(BoxType::Eingang), Snapshot::new(vec![doc(1)]));
        cache
            .documents_by_box
            .write()
            .unwrap()
            .insert(None, Snapshot::new(vec![doc(1), doc(2)]));

        assert_eq!(cache.snapshot(Some(BoxType::Eingang)).unwrap().len(), 1);
        assert_eq!(cache.snapshot(None).unwrap().len(), 2);

        let mut events = cache.subscribe();
        cache.invalidate_box(BoxType::Eingang);

        assert!(cache.snapshot(Some(BoxType::Eingang)).is_none());
        assert!(cache.snapshot(None).is_none(), "all bucket invalidates too");
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::DocumentsUpdated(Some(BoxType::Eingang))
        );
    }

    #[tokio::test]
    async fn test_paused_cache_answers_from_stale_snapshot() {
        let cache = cache();
        let stale = Snapshot {
            value: vec![doc(7)],
            loaded_at: Instant::now() - Duration::from_secs(60),
        };
        cache
            .documents_by_box
            .write()
            .unwrap()
            .insert(Some(BoxType::Gdv), stale);

        cache.pause();
        // Expired TTL, but paused: no fetch, snapshot answer.
        let docs = cache.documents(Some(BoxType::Gdv)).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, 7);
    }

    #[test]
    fn test_snapshot_freshness() {
        let fresh = Snapshot::new(1);
        assert!(fresh.is_fresh(Duration::from_secs(20)));

        let stale = Snapshot {
            value: 1,
            loaded_at: Instant::now() - Duration::from_secs(21),
        };
        assert!(!stale.is_fresh(Duration::from_secs(20)));
    }
}
