//! Кэш загруженных рядов с явным правилом инвалидации.
//!
//! Запись привязана к пути и «отпечатку» файла (размер + время изменения).
//! Если отпечаток на диске отличается, ряд перечитывается. Если файл пропал
//! или больше не разбирается, запись выбрасывается.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::LoadError;
use crate::series::{Series, load_series};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(path: &Path) -> Result<Self, LoadError> {
        let meta = fs::metadata(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

struct CacheEntry {
    fingerprint: Fingerprint,
    series: Arc<Series>,
}

#[derive(Default)]
pub struct SeriesCache {
    entries: HashMap<PathBuf, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает ряд из кэша или читает файл заново, если он изменился.
    pub fn load(&mut self, path: &Path) -> Result<Arc<Series>, LoadError> {
        let fingerprint = match Fingerprint::of(path) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                self.invalidate(path);
                return Err(err);
            }
        };
        if let Some(entry) = self.entries.get(path)
            && entry.fingerprint == fingerprint
        {
            self.hits += 1;
            tracing::debug!(path = %path.display(), "Series cache hit");
            return Ok(Arc::clone(&entry.series));
        }

        self.misses += 1;
        tracing::debug!(path = %path.display(), "Series cache miss");
        let series = match load_series(path) {
            Ok(series) => Arc::new(series),
            Err(err) => {
                if self.invalidate(path) {
                    tracing::debug!(path = %path.display(), "Dropped stale cache entry");
                }
                return Err(err);
            }
        };
        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                fingerprint,
                series: Arc::clone(&series),
            },
        );
        Ok(series)
    }

    pub fn invalidate(&mut self, path: &Path) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (попадания, промахи) с момента создания.
    pub const fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(path: &Path, body: &str) {
        let mut file = fs::File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn second_load_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_ndvi_indore.csv");
        write_csv(&path, "date,ndvi\n2023-01-01,0.4\n2023-01-17,0.5\n");

        let mut cache = SeriesCache::new();
        let first = cache.load(&path).unwrap();
        let second = cache.load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn changed_file_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_ndvi_sagar.csv");
        write_csv(&path, "date,ndvi\n2023-01-01,0.4\n");

        let mut cache = SeriesCache::new();
        let before = cache.load(&path).unwrap();
        write_csv(&path, "date,ndvi\n2023-01-01,0.4\n2023-01-17,0.55\n");
        let after = cache.load(&path).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert_eq!(cache.stats(), (0, 2));
    }

    #[test]
    fn invalidate_forces_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_ndvi_satna.csv");
        write_csv(&path, "date,ndvi\n2023-01-01,0.4\n");

        let mut cache = SeriesCache::new();
        let first = cache.load(&path).unwrap();
        assert!(cache.invalidate(&path));
        assert!(!cache.invalidate(&path));
        let second = cache.load(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn broken_rewrite_drops_cached_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_ndvi_rewa.csv");
        write_csv(&path, "date,ndvi\n2023-01-01,0.4\n");

        let mut cache = SeriesCache::new();
        cache.load(&path).unwrap();
        assert_eq!(cache.len(), 1);

        write_csv(&path, "date,ndvi\nnot-a-date,0.4\n2023-01-17,0.5\n");
        assert!(cache.load(&path).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn deleted_file_drops_cached_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_ndvi_ujjain.csv");
        write_csv(&path, "date,ndvi\n2023-01-01,0.4\n");

        let mut cache = SeriesCache::new();
        cache.load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(cache.load(&path).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn missing_file_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SeriesCache::new();
        assert!(cache.load(&dir.path().join("absent.csv")).is_err());
        assert!(cache.is_empty());
    }
}
