use crate::{
    actions::ActionItem,
    cache::MetadataCache,
    item::{ItemId, PackageExtension},
    scanner::{LocationKind, PresenceRecord, Scanner},
    staleness::{is_update_available, Freshness},
    transfer::TransferJob,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError, RwLock,
    },
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roots {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl Roots {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModView {
    pub id: ItemId,
    pub title: Option<String>,
    pub source: Option<PresenceRecord>,
    pub target: Option<PresenceRecord>,
    pub freshness: Option<Freshness>,
}

impl ModView {
    pub fn display_title(&self) -> String {
        match &self.title {
            Some(title) => title.clone(),
            None => format!("<unknown {}>", self.id),
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.source.is_none() && self.target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub roots: Roots,
    pub extension: PackageExtension,
    pub views: Vec<ModView>,
}

impl Reconciliation {
    pub fn get(&self, id: ItemId) -> Option<&ModView> {
        self.views.iter().find(|view| view.id == id)
    }

    pub fn pending(&self) -> Vec<ItemId> {
        self.views
            .iter()
            .filter(|view| view.freshness.is_some_and(Freshness::needs_transfer))
            .map(|view| view.id)
            .collect()
    }

    pub fn orphans(&self) -> Vec<ItemId> {
        self.views
            .iter()
            .filter(|view| view.is_orphan())
            .map(|view| view.id)
            .collect()
    }

    pub fn target_path(&self, id: ItemId) -> PathBuf {
        self.roots.target.join(id.file_name(&self.extension))
    }

    pub fn copy_jobs(&self, ids: &[ItemId]) -> Vec<TransferJob> {
        ids.iter()
            .filter_map(|id| {
                let source = self.get(*id)?.source.as_ref()?;
                Some(TransferJob::new(&source.path, self.target_path(*id)))
            })
            .collect()
    }

    /// Unknown ids are kept so the executor can report them individually.
    pub fn action_items(&self, ids: &[ItemId]) -> Vec<ActionItem> {
        ids.iter()
            .map(|id| {
                let view = self.get(*id);
                ActionItem {
                    id: *id,
                    title: view.and_then(|view| view.title.clone()),
                    source: view
                        .and_then(|view| view.source.as_ref())
                        .map(|record| record.path.clone()),
                    target: view
                        .and_then(|view| view.target.as_ref())
                        .map(|record| record.path.clone())
                        .unwrap_or_else(|| self.target_path(*id)),
                }
            })
            .collect()
    }
}

pub struct Reconciler {
    scanner: Scanner,
    cache: Arc<MetadataCache>,
    roots: RwLock<Roots>,
    subscribers: Mutex<Vec<Sender<Reconciliation>>>,
}

impl Reconciler {
    pub fn new(cache: Arc<MetadataCache>, extension: PackageExtension, roots: Roots) -> Self {
        Self {
            scanner: Scanner::new(Arc::clone(&cache), extension),
            cache,
            roots: RwLock::new(roots),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn roots(&self) -> Roots {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_roots(&self, roots: Roots) {
        debug!(source = %roots.source.display(), target = %roots.target.display(), "roots changed");
        *self.roots.write().unwrap_or_else(PoisonError::into_inner) = roots;
    }

    pub fn extension(&self) -> &PackageExtension {
        self.scanner.extension()
    }

    pub fn subscribe(&self) -> Receiver<Reconciliation> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn refresh(&self) -> Reconciliation {
        let roots = self.roots();
        let sources = self.scan_side(&roots.source, LocationKind::Source);
        let targets = self.scan_side(&roots.target, LocationKind::Target);

        let mut joined: BTreeMap<ItemId, (Option<PresenceRecord>, Option<PresenceRecord>)> =
            BTreeMap::new();
        for record in sources {
            let id = record.id;
            joined.entry(id).or_default().0 = Some(record);
        }
        for record in targets {
            let id = record.id;
            joined.entry(id).or_default().1 = Some(record);
        }

        let mut views: Vec<ModView> = joined
            .into_iter()
            .map(|(id, (source, target))| {
                let freshness = source
                    .as_ref()
                    .map(|source| is_update_available(source, target.as_ref()));
                ModView {
                    id,
                    title: self.cache.title(id),
                    source,
                    target,
                    freshness,
                }
            })
            .collect();
        views.sort_by(|a, b| {
            let key = |view: &ModView| view.title.as_ref().map(|title| title.to_lowercase());
            match (key(a), key(b)) {
                (Some(left), Some(right)) => left.cmp(&right),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then(a.id.cmp(&b.id))
        });

        let reconciliation = Reconciliation {
            roots,
            extension: self.extension().clone(),
            views,
        };
        self.publish(&reconciliation);
        reconciliation
    }

    fn scan_side(&self, root: &Path, kind: LocationKind) -> Vec<PresenceRecord> {
        match self.scanner.scan(root, kind) {
            Ok(records) => records,
            Err(err) => {
                warn!(side = kind.label(), error = %err, "treating side as empty");
                Vec::new()
            }
        }
    }

    fn publish(&self, reconciliation: &Reconciliation) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(reconciliation.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::FetchError, metadata::MetadataRecord, remote::MetadataFetcher};
    use filetime::{set_file_mtime, FileTime};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Titles;

    impl MetadataFetcher for Titles {
        fn fetch(&self, id: ItemId) -> Result<MetadataRecord, FetchError> {
            let title = match id.get() {
                10 => "Zebra Hats",
                20 => "armored wagons",
                30 => "Better Lights",
                _ => {
                    return Err(FetchError::Transport {
                        id,
                        message: "offline".to_string(),
                    })
                }
            };
            let raw = json!({
                "publishedfileid": id.get().to_string(),
                "title": title,
                "preview_url": "https://example.invalid/p.png",
                "tags": [],
            });
            MetadataRecord::from_remote(id, raw).map_err(|err| FetchError::InvalidResponse {
                id,
                reason: err.to_string(),
            })
        }
    }

    fn touch(path: &Path, secs: i64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"pak").unwrap();
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    fn id(raw: u64) -> ItemId {
        ItemId::new(raw).unwrap()
    }

    fn fixture() -> (TempDir, Reconciler) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("workshop");
        let target = dir.path().join("mods");
        touch(&source.join("10/contents.pak"), 2_000);
        touch(&source.join("20/contents.pak"), 1_000);
        touch(&source.join("30/contents.pak"), 1_000);
        touch(&target.join("10.pak"), 1_000);
        touch(&target.join("30.pak"), 1_000);
        touch(&target.join("40.pak"), 1_000);

        let cache = Arc::new(MetadataCache::new(Arc::new(Titles)));
        let reconciler = Reconciler::new(cache, PackageExtension::default(), Roots::new(source, target));
        (dir, reconciler)
    }

    #[test]
    fn joins_both_trees_with_freshness() {
        let (_dir, reconciler) = fixture();
        let view = reconciler.refresh();

        assert_eq!(view.get(id(10)).unwrap().freshness, Some(Freshness::Stale));
        assert_eq!(view.get(id(20)).unwrap().freshness, Some(Freshness::Absent));
        assert_eq!(view.get(id(30)).unwrap().freshness, Some(Freshness::UpToDate));
        assert_eq!(view.get(id(40)).unwrap().freshness, None);
        assert_eq!(view.pending(), vec![id(20), id(10)]);
        assert_eq!(view.orphans(), vec![id(40)]);
    }

    #[test]
    fn sorts_by_title_with_unknown_titles_last() {
        let (_dir, reconciler) = fixture();
        let view = reconciler.refresh();
        let order: Vec<u64> = view.views.iter().map(|view| view.id.get()).collect();
        assert_eq!(order, vec![20, 30, 10, 40]);
        assert_eq!(view.get(id(40)).unwrap().title, None);
        assert_eq!(view.get(id(40)).unwrap().display_title(), "<unknown 40>");
    }

    #[test]
    fn copy_jobs_skip_ids_without_a_source() {
        let (dir, reconciler) = fixture();
        let view = reconciler.refresh();
        let jobs = view.copy_jobs(&[id(20), id(40), id(99)]);
        assert_eq!(
            jobs,
            vec![TransferJob::new(
                dir.path().join("workshop/20/contents.pak"),
                dir.path().join("mods/20.pak"),
            )]
        );
    }

    #[test]
    fn action_items_keep_unknown_ids() {
        let (dir, reconciler) = fixture();
        let view = reconciler.refresh();
        let items = view.action_items(&[id(40), id(99)]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source, None);
        assert_eq!(items[0].target, dir.path().join("mods/40.pak"));
        assert_eq!(items[1].target, dir.path().join("mods/99.pak"));
        assert_eq!(items[1].title, None);
    }

    #[test]
    fn missing_root_counts_as_empty_side() {
        let (dir, reconciler) = fixture();
        reconciler.set_roots(Roots::new(dir.path().join("workshop"), dir.path().join("nope")));
        let view = reconciler.refresh();
        assert!(view.orphans().is_empty());
        assert_eq!(view.pending().len(), 3);
    }

    #[test]
    fn subscribers_receive_each_refresh() {
        let (_dir, reconciler) = fixture();
        let updates = reconciler.subscribe();
        let first = reconciler.refresh();
        reconciler.refresh();
        assert_eq!(updates.try_recv().unwrap(), first);
        assert!(updates.try_recv().is_ok());
        assert!(updates.try_recv().is_err());
    }
}
