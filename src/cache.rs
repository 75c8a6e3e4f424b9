use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ResolvedConfig, GB_BYTES};
use crate::domain::{
    manifest_file_name, resource_file_name, ResourceCategory, ResourceKind, SiteId,
};
use crate::error::WindsolError;

/// One cached resource file. Entries are only ever added; nothing in the
/// cache is evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub site_id: SiteId,
    pub kind: ResourceKind,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    pub entries: Vec<CacheEntry>,
}

impl CacheIndex {
    pub fn contains(&self, site_id: SiteId, kind: ResourceKind) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.site_id == site_id && entry.kind == kind)
    }

    fn insert(&mut self, site_id: SiteId, kind: ResourceKind) -> bool {
        if self.contains(site_id, kind) {
            return false;
        }
        self.entries.push(CacheEntry {
            site_id,
            kind,
            registered_at: Utc::now(),
        });
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatus {
    pub category: ResourceCategory,
    pub sites: usize,
    pub files: BTreeMap<ResourceKind, usize>,
    pub size_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub root: String,
    pub used_gb: f64,
    pub max_gb: Option<f64>,
    pub categories: Vec<CategoryStatus>,
}

/// Size-bounded on-disk cache of resource files, one directory per
/// category. A JSON index per category tracks what is present; the data
/// files themselves are the source of truth and the index can always be
/// rebuilt from their names. Multiple processes may share one root: all
/// index mutations run under a per-category file lock, reads are
/// lock-free.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: Utf8PathBuf,
    max_bytes: Option<u64>,
}

impl LocalCache {
    pub fn new(root: Utf8PathBuf, max_bytes: Option<u64>) -> Result<Self, WindsolError> {
        let cache = Self { root, max_bytes };
        for category in ResourceCategory::ALL {
            fs::create_dir_all(cache.category_dir(category).as_std_path())
                .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        }
        Ok(cache)
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, WindsolError> {
        Self::new(config.cache_root.clone(), config.max_cache_bytes)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    pub fn category_dir(&self, category: ResourceCategory) -> Utf8PathBuf {
        self.root.join(category.as_str())
    }

    /// Deterministic path of one site's resource file, present or not.
    pub fn file_path(
        &self,
        category: ResourceCategory,
        kind: ResourceKind,
        site_id: SiteId,
    ) -> Utf8PathBuf {
        self.category_dir(category)
            .join(resource_file_name(category, kind, site_id))
    }

    pub fn manifest_path(&self, category: ResourceCategory) -> Utf8PathBuf {
        self.category_dir(category).join(manifest_file_name(category))
    }

    fn index_path(&self, category: ResourceCategory) -> Utf8PathBuf {
        self.category_dir(category)
            .join(format!("{category}_cache.json"))
    }

    fn lock_path(&self, category: ResourceCategory) -> Utf8PathBuf {
        self.category_dir(category).join(format!("{category}.lock"))
    }

    /// Lock-free presence check. The index may lag concurrent writers,
    /// so an index miss falls back to probing for the file itself.
    pub fn present(&self, category: ResourceCategory, kind: ResourceKind, site_id: SiteId) -> bool {
        match self.read_index(category) {
            Ok(index) if index.contains(site_id, kind) => true,
            _ => self.file_path(category, kind, site_id).as_std_path().is_file(),
        }
    }

    /// Record one fetched file in the category index. Idempotent, and
    /// safe against concurrent registrations from other processes: the
    /// index is re-read and rewritten under an exclusive file lock.
    pub fn register(
        &self,
        category: ResourceCategory,
        kind: ResourceKind,
        site_id: SiteId,
    ) -> Result<(), WindsolError> {
        let lock = self.acquire_lock(category)?;

        let mut index = match self.read_index(category) {
            Ok(index) => index,
            Err(err) => {
                warn!("{} cache index unreadable ({}), rebuilding", category, err);
                CacheIndex {
                    entries: self.scan_entries(category)?,
                }
            }
        };

        if index.insert(site_id, kind) {
            self.write_index(category, &index)?;
            debug!("registered {}", resource_file_name(category, kind, site_id));
        }

        FileExt::unlock(&lock).map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Total size of all cached `.hdf5` files under the root.
    pub fn used_bytes(&self) -> Result<u64, WindsolError> {
        let mut total = 0;
        for category in ResourceCategory::ALL {
            total += self.category_bytes(category)?;
        }
        Ok(total)
    }

    pub fn category_bytes(&self, category: ResourceCategory) -> Result<u64, WindsolError> {
        let dir = self.category_dir(category);
        let mut total = 0;
        for path in walk_dir(dir.as_std_path())? {
            if is_hdf5(&path) {
                let meta = fs::metadata(&path)
                    .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Reconstruct the category index from the file names on disk and
    /// persist it. Recovery path for a lost or corrupt index, also run
    /// by `cache refresh`.
    pub fn rebuild_index(&self, category: ResourceCategory) -> Result<CacheIndex, WindsolError> {
        let lock = self.acquire_lock(category)?;
        let index = CacheIndex {
            entries: self.scan_entries(category)?,
        };
        self.write_index(category, &index)?;
        FileExt::unlock(&lock).map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        debug!("rebuilt {} cache index: {} entries", category, index.entries.len());
        Ok(index)
    }

    /// Cache totals plus a per-category summary of sites and file kinds.
    pub fn status(&self) -> Result<CacheStatus, WindsolError> {
        let mut categories = Vec::new();
        let mut used = 0;
        for category in ResourceCategory::ALL {
            let index = match self.read_index(category) {
                Ok(index) => index,
                Err(err) => {
                    warn!("{} cache index unreadable ({}), scanning directory", category, err);
                    CacheIndex {
                        entries: self.scan_entries(category)?,
                    }
                }
            };
            let mut sites: Vec<SiteId> =
                index.entries.iter().map(|entry| entry.site_id).collect();
            sites.sort();
            sites.dedup();

            let mut files = BTreeMap::new();
            for entry in &index.entries {
                *files.entry(entry.kind).or_insert(0) += 1;
            }

            let bytes = self.category_bytes(category)?;
            used += bytes;
            categories.push(CategoryStatus {
                category,
                sites: sites.len(),
                files,
                size_gb: bytes_to_gb(bytes),
            });
        }

        Ok(CacheStatus {
            root: self.root.to_string(),
            used_gb: bytes_to_gb(used),
            max_gb: self.max_bytes.map(bytes_to_gb),
            categories,
        })
    }

    fn acquire_lock(&self, category: ResourceCategory) -> Result<fs::File, WindsolError> {
        let lock = fs::File::create(self.lock_path(category).as_std_path())
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        lock.lock_exclusive()
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        Ok(lock)
    }

    fn read_index(&self, category: ResourceCategory) -> Result<CacheIndex, WindsolError> {
        let path = self.index_path(category);
        if !path.as_std_path().exists() {
            return Ok(CacheIndex::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content).map_err(|err| WindsolError::Filesystem(err.to_string()))
    }

    fn write_index(&self, category: ResourceCategory, index: &CacheIndex) -> Result<(), WindsolError> {
        let content = serde_json::to_vec_pretty(index)
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(&self.index_path(category), &content)
    }

    /// File names are authoritative: `{category}_{kind}_{site}.hdf5`.
    fn scan_entries(&self, category: ResourceCategory) -> Result<Vec<CacheEntry>, WindsolError> {
        let pattern = format!(r"^{category}_([a-z-]+)_(\d+)\.hdf5$");
        let matcher = Regex::new(&pattern).map_err(|err| WindsolError::CacheScan {
            category,
            message: err.to_string(),
        })?;

        let mut entries = Vec::new();
        let dir = self.category_dir(category);
        for path in walk_dir(dir.as_std_path()).map_err(|err| WindsolError::CacheScan {
            category,
            message: err.to_string(),
        })? {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(captures) = matcher.captures(name) else {
                continue;
            };
            let Ok(kind) = captures[1].parse::<ResourceKind>() else {
                warn!("skipping unrecognized cache file {}", name);
                continue;
            };
            let Ok(site_id) = captures[2].parse::<SiteId>() else {
                continue;
            };
            let registered_at = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(CacheEntry {
                site_id,
                kind,
                registered_at,
            });
        }
        entries.sort_by_key(|entry| (entry.site_id, entry.kind));
        Ok(entries)
    }

    /// Write a fetched payload through a uniquely named temporary in
    /// the destination directory. Concurrent workers writing the same
    /// file each get their own temporary, so the final rename is
    /// last-writer-wins and never partial.
    pub fn write_payload_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), WindsolError> {
        let parent = path
            .parent()
            .ok_or_else(|| WindsolError::Filesystem(format!("no parent directory for {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".windsol-")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content)
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), WindsolError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GB_BYTES
}

fn is_hdf5(path: &Path) -> bool {
    path.is_file() && path.extension().map(|ext| ext == "hdf5").unwrap_or(false)
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, WindsolError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| WindsolError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| WindsolError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(max_bytes: Option<u64>) -> (tempfile::TempDir, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = LocalCache::new(root, max_bytes).unwrap();
        (dir, cache)
    }

    fn put_file(cache: &LocalCache, category: ResourceCategory, kind: ResourceKind, id: u64) {
        let path = cache.file_path(category, kind, SiteId(id));
        fs::write(path.as_std_path(), vec![0u8; 100]).unwrap();
    }

    #[test]
    fn register_then_present() {
        let (_dir, cache) = temp_cache(None);
        let site = SiteId(42);
        assert!(!cache.present(ResourceCategory::Wind, ResourceKind::Power, site));

        put_file(&cache, ResourceCategory::Wind, ResourceKind::Power, 42);
        cache
            .register(ResourceCategory::Wind, ResourceKind::Power, site)
            .unwrap();
        assert!(cache.present(ResourceCategory::Wind, ResourceKind::Power, site));
        assert!(!cache.present(ResourceCategory::Wind, ResourceKind::Met, site));
    }

    #[test]
    fn register_is_idempotent() {
        let (_dir, cache) = temp_cache(None);
        let site = SiteId(7);
        put_file(&cache, ResourceCategory::Solar, ResourceKind::Met, 7);

        cache
            .register(ResourceCategory::Solar, ResourceKind::Met, site)
            .unwrap();
        let before = cache.read_index(ResourceCategory::Solar).unwrap();
        cache
            .register(ResourceCategory::Solar, ResourceKind::Met, site)
            .unwrap();
        let after = cache.read_index(ResourceCategory::Solar).unwrap();

        assert_eq!(before.entries, after.entries);
        assert_eq!(after.entries.len(), 1);
    }

    #[test]
    fn present_falls_back_to_file_probe() {
        let (_dir, cache) = temp_cache(None);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Met, 9);
        assert!(cache.present(ResourceCategory::Wind, ResourceKind::Met, SiteId(9)));
    }

    #[test]
    fn rebuild_index_from_file_names() {
        let (_dir, cache) = temp_cache(None);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Met, 1);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Power, 1);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::ForecastProb, 3);
        fs::write(
            cache.category_dir(ResourceCategory::Wind).join("notes.txt").as_std_path(),
            b"ignored",
        )
        .unwrap();

        let index = cache.rebuild_index(ResourceCategory::Wind).unwrap();
        assert_eq!(index.entries.len(), 3);
        assert!(index.contains(SiteId(1), ResourceKind::Met));
        assert!(index.contains(SiteId(1), ResourceKind::Power));
        assert!(index.contains(SiteId(3), ResourceKind::ForecastProb));
    }

    #[test]
    fn used_bytes_counts_only_hdf5() {
        let (_dir, cache) = temp_cache(None);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Met, 1);
        put_file(&cache, ResourceCategory::Solar, ResourceKind::Met, 2);
        fs::write(
            cache.category_dir(ResourceCategory::Wind).join("stray.csv").as_std_path(),
            vec![0u8; 555],
        )
        .unwrap();

        assert_eq!(cache.used_bytes().unwrap(), 200);
        assert_eq!(cache.category_bytes(ResourceCategory::Solar).unwrap(), 100);
    }

    #[test]
    fn status_summarizes_categories() {
        let (_dir, cache) = temp_cache(Some(1_000_000));
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Met, 1);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Power, 1);
        cache
            .register(ResourceCategory::Wind, ResourceKind::Met, SiteId(1))
            .unwrap();
        cache
            .register(ResourceCategory::Wind, ResourceKind::Power, SiteId(1))
            .unwrap();

        let status = cache.status().unwrap();
        assert_eq!(status.categories.len(), 2);
        let wind = &status.categories[0];
        assert_eq!(wind.category, ResourceCategory::Wind);
        assert_eq!(wind.sites, 1);
        assert_eq!(wind.files[&ResourceKind::Met], 1);
        assert_eq!(wind.files[&ResourceKind::Power], 1);
        assert!(status.max_gb.is_some());
    }

    #[test]
    fn status_scans_when_index_is_corrupt() {
        let (_dir, cache) = temp_cache(None);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Met, 1);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Power, 2);
        fs::write(
            cache.index_path(ResourceCategory::Wind).as_std_path(),
            b"not json",
        )
        .unwrap();

        let status = cache.status().unwrap();
        let wind = &status.categories[0];
        assert_eq!(wind.sites, 2);
        assert_eq!(wind.files[&ResourceKind::Met], 1);
        assert_eq!(wind.files[&ResourceKind::Power], 1);
        assert!(wind.size_gb > 0.0);
    }

    #[test]
    fn corrupt_index_recovers_on_register() {
        let (_dir, cache) = temp_cache(None);
        put_file(&cache, ResourceCategory::Wind, ResourceKind::Met, 5);
        fs::write(
            cache.index_path(ResourceCategory::Wind).as_std_path(),
            b"not json",
        )
        .unwrap();

        put_file(&cache, ResourceCategory::Wind, ResourceKind::Power, 6);
        cache
            .register(ResourceCategory::Wind, ResourceKind::Power, SiteId(6))
            .unwrap();

        let index = cache.read_index(ResourceCategory::Wind).unwrap();
        assert!(index.contains(SiteId(5), ResourceKind::Met));
        assert!(index.contains(SiteId(6), ResourceKind::Power));
    }
}
