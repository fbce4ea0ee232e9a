use crate::{
    error::{CacheError, FetchError},
    item::ItemId,
    metadata::{CacheEntry, MetadataRecord},
    remote::MetadataFetcher,
};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::Path,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, info, warn};

pub const DEFAULT_SOFT_CAP_MB: u64 = 100;

#[derive(Default)]
struct CacheState {
    records: HashMap<ItemId, MetadataRecord>,
    // Ids whose fetch failed this process lifetime; not asked for again
    // until `clear` or `forget_failures`.
    unavailable: HashSet<ItemId>,
}

/// Id-keyed metadata store shared by every component of the process.
///
/// Mutations (`load`, `ensure_populated`, `clear`) hold the write lock for
/// their whole duration; `save` and lookups hold the read lock.
pub struct MetadataCache {
    state: RwLock<CacheState>,
    fetcher: Arc<dyn MetadataFetcher>,
    persist: Mutex<()>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct PopulateReport {
    pub fetched: Vec<ItemId>,
    pub failed: Vec<FetchError>,
}

impl PopulateReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl MetadataCache {
    pub fn new(fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            fetcher,
            persist: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self, path: &Path) -> LoadReport {
        let mut state = self.write();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no metadata cache yet");
                return LoadReport::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "metadata cache unreadable, continuing without it");
                return LoadReport::default();
            }
        };
        if raw.trim().is_empty() {
            return LoadReport::default();
        }
        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => {
                warn!(path = %path.display(), "metadata cache is not a JSON array, ignoring it");
                return LoadReport::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "metadata cache is not valid JSON, ignoring it");
                return LoadReport::default();
            }
        };

        let mut report = LoadReport::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let record = serde_json::from_value::<CacheEntry>(entry)
                .map_err(|err| err.to_string())
                .and_then(|entry| entry.into_record().map_err(|err| err.to_string()));
            match record {
                Ok(record) => {
                    state.records.insert(record.id(), record);
                    report.loaded += 1;
                }
                Err(reason) => {
                    warn!(index, %reason, "skipping malformed metadata cache entry");
                    report.skipped += 1;
                }
            }
        }
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            "metadata cache loaded"
        );
        report
    }

    /// Writes every record to `path`. The document is built in memory first
    /// and swapped in with a rename, so a failure leaves the old file intact.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let state = self.read();
        let mut entries: Vec<CacheEntry> =
            state.records.values().map(MetadataRecord::to_entry).collect();
        entries.sort_by_key(|entry| entry.key);
        let raw = serde_json::to_string_pretty(&entries)?;

        let _guard = self.persist.lock().unwrap_or_else(PoisonError::into_inner);
        let io_err = |source: io::Error| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, raw).map_err(io_err)?;
        if let Err(err) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(io_err(err));
        }
        debug!(path = %path.display(), entries = entries.len(), "metadata cache saved");
        Ok(())
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.read().records.contains_key(&id)
    }

    pub fn get(&self, id: ItemId) -> Option<MetadataRecord> {
        self.read().records.get(&id).cloned()
    }

    pub fn title(&self, id: ItemId) -> Option<String> {
        self.read()
            .records
            .get(&id)
            .map(|record| record.title().to_string())
    }

    pub fn ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.read().records.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_unavailable(&self, id: ItemId) -> bool {
        self.read().unavailable.contains(&id)
    }

    /// Fetches whatever in `ids` is not cached yet. Ids that fail stay absent
    /// and are not requested again by later calls.
    pub fn ensure_populated<I>(&self, ids: I) -> PopulateReport
    where
        I: IntoIterator<Item = ItemId>,
    {
        let mut state = self.write();
        let mut missing: Vec<ItemId> = ids
            .into_iter()
            .filter(|id| !state.records.contains_key(id) && !state.unavailable.contains(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return PopulateReport::default();
        }
        missing.sort();
        info!(count = missing.len(), "fetching missing workshop metadata");

        let mut report = PopulateReport::default();
        for (id, result) in self.fetcher.fetch_batch(&missing) {
            match result {
                Ok(record) if record.id() == id => {
                    state.records.insert(id, record);
                    report.fetched.push(id);
                }
                Ok(record) => {
                    warn!(%id, got = %record.id(), "fetcher answered for a different item");
                    state.unavailable.insert(id);
                    report.failed.push(FetchError::InvalidResponse {
                        id,
                        reason: format!("record describes item {}", record.id()),
                    });
                }
                Err(err) => {
                    warn!(%id, error = %err, "metadata unavailable");
                    state.unavailable.insert(id);
                    report.failed.push(err);
                }
            }
        }
        report
    }

    pub fn clear(&self) {
        let mut state = self.write();
        let dropped = state.records.len();
        state.records.clear();
        state.unavailable.clear();
        info!(dropped, "metadata cache cleared");
    }

    pub fn forget_failures(&self) {
        self.write().unavailable.clear();
    }

    pub fn stats(&self, path: &Path, soft_cap_bytes: u64) -> CacheStats {
        let file_bytes = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        CacheStats {
            file_bytes,
            soft_cap_bytes,
            entries: self.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub file_bytes: u64,
    pub soft_cap_bytes: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn used_kib(&self) -> u64 {
        bytes_to_kibibytes(self.file_bytes)
    }

    pub fn free_kib(&self) -> u64 {
        bytes_to_kibibytes(self.soft_cap_bytes).saturating_sub(self.used_kib())
    }

    pub fn over_cap(&self) -> bool {
        self.file_bytes > self.soft_cap_bytes
    }
}

pub fn megabytes_to_bytes(megabytes: u64) -> u64 {
    megabytes.saturating_mul(1024 * 1024)
}

pub fn bytes_to_kibibytes(bytes: u64) -> u64 {
    bytes / 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{thread, time::Duration};
    use tempfile::TempDir;

    fn id(raw: u64) -> ItemId {
        ItemId::new(raw).unwrap()
    }

    fn record(raw: u64) -> MetadataRecord {
        MetadataRecord::from_remote(
            id(raw),
            json!({
                "publishedfileid": raw.to_string(),
                "title": format!("Mod {raw}"),
                "preview_url": format!("https://example.invalid/{raw}.png"),
                "tags": [{ "tag": "Mod" }]
            }),
        )
        .unwrap()
    }

    #[derive(Default)]
    struct FakeFetcher {
        calls: Mutex<Vec<ItemId>>,
        delay: Duration,
    }

    impl MetadataFetcher for FakeFetcher {
        fn fetch(&self, id: ItemId) -> Result<MetadataRecord, FetchError> {
            self.calls.lock().unwrap().push(id);
            thread::sleep(self.delay);
            if id.get() < 1000 {
                Ok(record(id.get()))
            } else {
                Err(FetchError::Transport {
                    id,
                    message: "connection refused".to_string(),
                })
            }
        }
    }

    fn cache_with(fetcher: Arc<FakeFetcher>) -> MetadataCache {
        MetadataCache::new(fetcher)
    }

    #[test]
    fn ensure_populated_fetches_only_missing_ids() {
        let fetcher = Arc::new(FakeFetcher::default());
        let cache = cache_with(fetcher.clone());
        let report = cache.ensure_populated([id(1), id(2)]);
        assert_eq!(report.fetched, vec![id(1), id(2)]);
        assert!(cache.contains(id(1)));
        assert_eq!(cache.get(id(2)).map(|r| r.id()), Some(id(2)));

        cache.ensure_populated([id(1), id(2), id(3)]);
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn failed_ids_stay_absent_and_are_not_retried() {
        let fetcher = Arc::new(FakeFetcher::default());
        let cache = cache_with(fetcher.clone());
        let report = cache.ensure_populated([id(5), id(5000)]);
        assert_eq!(report.fetched, vec![id(5)]);
        assert_eq!(report.failed.len(), 1);
        assert!(!cache.contains(id(5000)));
        assert!(cache.is_unavailable(id(5000)));

        let again = cache.ensure_populated([id(5000)]);
        assert!(again.fetched.is_empty() && again.is_clean());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 2);

        cache.forget_failures();
        cache.ensure_populated([id(5000)]);
        assert_eq!(fetcher.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn missing_file_is_a_cold_cache() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(Arc::new(FakeFetcher::default()));
        assert_eq!(cache.load(&dir.path().join("cache.json")), LoadReport::default());
        assert!(cache.is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let doc = json!([
            { "key": 1, "value": { "id": 1, "data": { "title": "One", "preview_url": "", "tags": [] } } },
            { "key": 2, "value": { "id": 2, "data": { "title": "Two", "tags": [] } } },
            { "key": "three" },
            42,
            { "key": 4, "value": { "id": 4, "data": { "title": "Four", "preview_url": "", "tags": ["Mod"] } } }
        ]);
        fs::write(&path, doc.to_string()).unwrap();

        let cache = cache_with(Arc::new(FakeFetcher::default()));
        let report = cache.load(&path);
        assert_eq!(report, LoadReport { loaded: 2, skipped: 3 });
        assert_eq!(cache.ids(), vec![id(1), id(4)]);
        assert_eq!(cache.title(id(4)).as_deref(), Some("Four"));
    }

    #[test]
    fn garbage_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{ not json").unwrap();
        let cache = cache_with(Arc::new(FakeFetcher::default()));
        assert_eq!(cache.load(&path).loaded, 0);
        fs::write(&path, r#"{"key": 1}"#).unwrap();
        assert_eq!(cache.load(&path).loaded, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn save_then_load_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let cache = cache_with(Arc::new(FakeFetcher::default()));
        cache.ensure_populated([id(3), id(1), id(2)]);
        cache.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = cache_with(Arc::new(FakeFetcher::default()));
        assert_eq!(reloaded.load(&path).loaded, 3);
        for raw in [1, 2, 3] {
            assert_eq!(reloaded.get(id(raw)), cache.get(id(raw)));
        }

        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<u64> = doc
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["key"].as_u64().unwrap())
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = cache_with(Arc::new(FakeFetcher::default()));
        cache.ensure_populated([id(1), id(9999)]);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.is_unavailable(id(9999)));
    }

    #[test]
    fn concurrent_population_keeps_the_union() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_millis(2),
            ..FakeFetcher::default()
        });
        let cache = Arc::new(cache_with(fetcher.clone()));
        let left: Vec<ItemId> = (1..=30).map(id).collect();
        let right: Vec<ItemId> = (20..=50).map(id).collect();

        let workers: Vec<_> = [left, right]
            .into_iter()
            .map(|ids| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.ensure_populated(ids))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(cache.ids(), (1..=50).map(id).collect::<Vec<_>>());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 50);

        cache.save(&path).unwrap();
        let doc: Vec<Value> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let keys: HashSet<u64> = doc.iter().map(|e| e["key"].as_u64().unwrap()).collect();
        assert_eq!(doc.len(), 50);
        assert_eq!(keys.len(), 50);
    }

    #[test]
    fn stats_report_usage_against_soft_cap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, vec![b' '; 4096]).unwrap();
        let cache = cache_with(Arc::new(FakeFetcher::default()));
        let stats = cache.stats(&path, megabytes_to_bytes(DEFAULT_SOFT_CAP_MB));
        assert_eq!(stats.used_kib(), 4);
        assert_eq!(stats.free_kib(), 100 * 1024 - 4);
        assert!(!stats.over_cap());

        let tiny = cache.stats(&path, 1024);
        assert!(tiny.over_cap());
        assert_eq!(tiny.free_kib(), 0);
        assert_eq!(cache.stats(&dir.path().join("absent.json"), 1).file_bytes, 0);
    }
}
