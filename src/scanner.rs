use crate::{
    cache::MetadataCache,
    error::InvalidRootError,
    item::{ItemId, PackageExtension},
};
use filetime::FileTime;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, trace};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Source,
    Target,
}

impl LocationKind {
    pub fn label(self) -> &'static str {
        match self {
            LocationKind::Source => "source",
            LocationKind::Target => "target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub id: ItemId,
    pub last_modified: FileTime,
    pub kind: LocationKind,
    pub path: PathBuf,
}

/// Lists the items under `root` for the given layout. Entries that do not
/// look like an item are skipped; only an unusable root is an error.
pub fn scan(
    root: &Path,
    kind: LocationKind,
    ext: &PackageExtension,
) -> Result<Vec<PresenceRecord>, InvalidRootError> {
    if !root.is_dir() {
        return Err(InvalidRootError {
            path: root.to_path_buf(),
        });
    }

    let mut found: BTreeMap<ItemId, PresenceRecord> = BTreeMap::new();
    for entry in immediate_children(root) {
        let record = match kind {
            LocationKind::Source => source_record(&entry, ext),
            LocationKind::Target => target_record(&entry, ext),
        };
        let Some(record) = record else {
            trace!(path = %entry.path().display(), "not an item, skipped");
            continue;
        };
        let shadowed = found
            .get(&record.id)
            .is_some_and(|existing| existing.last_modified >= record.last_modified);
        if shadowed {
            debug!(id = %record.id, path = %record.path.display(), "duplicate item entry ignored");
        } else {
            found.insert(record.id, record);
        }
    }

    debug!(
        root = %root.display(),
        kind = kind.label(),
        count = found.len(),
        "scan finished"
    );
    Ok(found.into_values().collect())
}

fn immediate_children(dir: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
}

fn source_record(entry: &DirEntry, ext: &PackageExtension) -> Option<PresenceRecord> {
    if !entry.file_type().is_dir() {
        return None;
    }
    let id = ItemId::parse_name(&entry.file_name().to_string_lossy())?;
    let mut packages = immediate_children(entry.path())
        .filter(|child| child.file_type().is_file() && ext.matches(child.path()));
    let package = packages.next()?;
    if packages.next().is_some() {
        debug!(%id, "workshop folder holds more than one package, skipped");
        return None;
    }
    let last_modified = modified_time(&package)?;
    Some(PresenceRecord {
        id,
        last_modified,
        kind: LocationKind::Source,
        path: package.into_path(),
    })
}

fn target_record(entry: &DirEntry, ext: &PackageExtension) -> Option<PresenceRecord> {
    if !entry.file_type().is_file() {
        return None;
    }
    let id = ItemId::from_file_name(&entry.file_name().to_string_lossy(), ext)?;
    let last_modified = modified_time(entry)?;
    Some(PresenceRecord {
        id,
        last_modified,
        kind: LocationKind::Target,
        path: entry.path().to_path_buf(),
    })
}

// The file may vanish between listing and stat; that is a skip.
fn modified_time(entry: &DirEntry) -> Option<FileTime> {
    let meta = entry.metadata().ok()?;
    Some(FileTime::from_last_modification_time(&meta))
}

#[derive(Clone)]
pub struct Scanner {
    cache: Arc<MetadataCache>,
    extension: PackageExtension,
}

impl Scanner {
    pub fn new(cache: Arc<MetadataCache>, extension: PackageExtension) -> Self {
        Self { cache, extension }
    }

    pub fn extension(&self) -> &PackageExtension {
        &self.extension
    }

    pub fn scan(
        &self,
        root: &Path,
        kind: LocationKind,
    ) -> Result<Vec<PresenceRecord>, InvalidRootError> {
        let records = scan(root, kind, &self.extension)?;
        self.cache
            .ensure_populated(records.iter().map(|record| record.id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;
    use std::fs;
    use tempfile::TempDir;

    fn ids(records: &[PresenceRecord]) -> Vec<u64> {
        records.iter().map(|record| record.id.get()).collect()
    }

    fn touch(path: &Path, unix_secs: i64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"pak").unwrap();
        set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0)).unwrap();
    }

    #[test]
    fn source_layout_uses_the_single_package_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("10").join("contents.pak"), 1_000);
        touch(&root.join("20").join("contents.pak"), 2_000);
        // two packages: ambiguous
        touch(&root.join("30").join("a.pak"), 1_000);
        touch(&root.join("30").join("b.pak"), 1_000);
        // no package yet
        fs::create_dir_all(root.join("40")).unwrap();
        touch(&root.join("40").join("partial.tmp"), 1_000);
        // foreign names
        touch(&root.join("notes").join("contents.pak"), 1_000);
        touch(&root.join("50.pak"), 1_000);

        let records = scan(root, LocationKind::Source, &PackageExtension::default()).unwrap();
        assert_eq!(ids(&records), vec![10, 20]);
        assert_eq!(records[0].last_modified, FileTime::from_unix_time(1_000, 0));
        assert_eq!(records[1].path, root.join("20").join("contents.pak"));
        assert!(records.iter().all(|r| r.kind == LocationKind::Source));
    }

    #[test]
    fn unrelated_files_beside_the_package_are_ignored() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("10").join("contents.pak"), 3_000);
        touch(&root.join("10").join("readme.txt"), 9_000);
        touch(&root.join("10").join("preview.png"), 9_000);

        let records = scan(root, LocationKind::Source, &PackageExtension::default()).unwrap();
        assert_eq!(ids(&records), vec![10]);
        assert_eq!(records[0].path, root.join("10").join("contents.pak"));
        assert_eq!(records[0].last_modified, FileTime::from_unix_time(3_000, 0));
    }

    #[test]
    fn source_mtime_comes_from_the_file_not_the_folder() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("10");
        touch(&folder.join("contents.pak"), 5_000);
        set_file_mtime(&folder, FileTime::from_unix_time(9_000, 0)).unwrap();
        let records = scan(dir.path(), LocationKind::Source, &PackageExtension::default()).unwrap();
        assert_eq!(records[0].last_modified, FileTime::from_unix_time(5_000, 0));
    }

    #[test]
    fn target_layout_reads_ids_from_file_stems() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("10.pak"), 1_000);
        touch(&root.join("7.pak"), 1_000);
        touch(&root.join("readme.txt"), 1_000);
        touch(&root.join("custom.pak"), 1_000);
        touch(&root.join("0.pak"), 1_000);
        fs::create_dir_all(root.join("11.pak")).unwrap();

        let records = scan(root, LocationKind::Target, &PackageExtension::default()).unwrap();
        assert_eq!(ids(&records), vec![7, 10]);
        assert_eq!(records[1].path, root.join("10.pak"));
    }

    #[test]
    fn missing_or_file_root_is_invalid() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert_eq!(
            scan(&missing, LocationKind::Target, &PackageExtension::default()),
            Err(InvalidRootError { path: missing })
        );
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(scan(&file, LocationKind::Source, &PackageExtension::default()).is_err());
    }

    #[test]
    fn empty_root_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let records = scan(dir.path(), LocationKind::Source, &PackageExtension::default()).unwrap();
        assert!(records.is_empty());
    }
}
