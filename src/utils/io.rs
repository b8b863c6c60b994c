//! Persistence of covariance matrices, which are expensive to build and never change
//! once built for a given galaxy and emission line.

use crate::covariance::CovarianceMatrix;
use crate::error::{io_err, Result, SfrError};
use crate::kernel::Kernel;
use crate::spaxels::EmissionLine;
use dashmap::DashMap;
use glob::glob;
use log::{debug, info};
use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded as Parallel};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifies the covariance of one emission line of one galaxy under one kernel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub galaxy: String,
    pub line: EmissionLine,
    /// Bit patterns of a non-default kernel's cutoff and scale
    pub kernel: Option<(u64, u64)>,
}

impl CacheKey {
    pub fn new(galaxy: impl Into<String>, line: EmissionLine, kernel: &Kernel) -> Self {
        let kernel = (*kernel != Kernel::default())
            .then(|| (kernel.cutoff.to_bits(), kernel.scale.to_bits()));
        CacheKey {
            galaxy: galaxy.into(),
            line,
            kernel,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.galaxy, self.line)?;
        if let Some((cutoff, scale)) = self.kernel {
            write!(f, ".c{cutoff:016x}.s{scale:016x}")?;
        }
        Ok(())
    }
}

/// Somewhere covariance matrices can be saved and loaded by key. A `save` must be
/// all-or-nothing: a later `load` sees either no entry or the complete matrix.
pub trait CovarianceStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `key`. A stored entry that cannot be
    /// decoded is an error, not a miss.
    fn load(&self, key: &str) -> Result<Option<CovarianceMatrix>>;

    fn save(&self, key: &str, matrix: &CovarianceMatrix) -> Result<()>;

    /// Every key currently stored
    fn keys(&self) -> Result<Vec<String>>;
}

fn encode(key: &str, matrix: &CovarianceMatrix) -> Result<Vec<u8>> {
    bincode::serialize(matrix).map_err(|err| SfrError::CorruptCache {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

fn decode(key: &str, bytes: &[u8]) -> Result<CovarianceMatrix> {
    let corrupt = |reason: String| SfrError::CorruptCache {
        key: key.to_string(),
        reason,
    };
    let matrix: CovarianceMatrix =
        bincode::deserialize(bytes).map_err(|err| corrupt(err.to_string()))?;
    matrix.validate().map_err(corrupt)?;
    Ok(matrix)
}

/// RocksDB-backed store. A single `put` is atomic, so an interrupted build never
/// leaves a partial matrix behind.
pub struct DiskDB {
    db: DBWithThreadMode<Parallel>,
}

impl DiskDB {
    pub fn connect(path: impl AsRef<Path>) -> Result<DiskDB> {
        // Attempt to read existing database, creating it if missing
        let db = DBWithThreadMode::<Parallel>::open_default(path.as_ref()).map_err(|source| {
            SfrError::Storage {
                key: path.as_ref().display().to_string(),
                source,
            }
        })?;

        Ok(DiskDB { db })
    }
}

impl CovarianceStore for DiskDB {
    fn load(&self, key: &str) -> Result<Option<CovarianceMatrix>> {
        match self.db.get(key.as_bytes()) {
            // Matrix present
            Ok(Some(bytes)) => Ok(Some(decode(key, &bytes)?)),

            // Matrix not present
            Ok(None) => Ok(None),

            // RocksDB error
            Err(source) => Err(SfrError::Storage {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn save(&self, key: &str, matrix: &CovarianceMatrix) -> Result<()> {
        self.db
            .put(key.as_bytes(), encode(key, matrix)?)
            .map_err(|source| SfrError::Storage {
                key: key.to_string(),
                source,
            })
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.db.iterator(IteratorMode::Start) {
            let (key, _) = entry.map_err(|source| SfrError::Storage {
                key: "<iterator>".to_string(),
                source,
            })?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}

/// One file per matrix, `<root>/<key>.cov`. Files are written to a temporary name in
/// the same directory and renamed into place once complete.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

const EXTENSION: &str = "cov";

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| io_err(&root, err))?;
        Ok(FileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{EXTENSION}"))
    }
}

impl CovarianceStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<CovarianceMatrix>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(decode(key, &bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(path, err)),
        }
    }

    fn save(&self, key: &str, matrix: &CovarianceMatrix) -> Result<()> {
        let path = self.path_for(key);
        let bytes = encode(key, matrix)?;

        let mut file = tempfile::NamedTempFile::new_in(&self.root).map_err(|err| io_err(&self.root, err))?;
        file.write_all(&bytes).map_err(|err| io_err(file.path(), err))?;
        file.as_file().sync_all().map_err(|err| io_err(file.path(), err))?;
        file.persist(&path).map_err(|err| io_err(&path, err.error))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let pattern = self.root.join(format!("*.{EXTENSION}"));
        let paths = glob(&pattern.to_string_lossy()).map_err(|err| {
            SfrError::InvalidArgument(format!("bad cache directory pattern: {err}"))
        })?;

        let mut keys = Vec::new();
        for path in paths {
            let path = path.map_err(|err| io_err(err.path().to_path_buf(), err.into_error()))?;
            if let Some(stem) = path.file_stem() {
                keys.push(stem.to_string_lossy().into_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Loads covariance matrices from a store, building and storing them on a miss.
/// Matrices already handed out are also kept in memory until evicted.
pub struct CovarianceCache<S> {
    store: S,
    memory: DashMap<CacheKey, Arc<CovarianceMatrix>>,
}

impl<S: CovarianceStore> CovarianceCache<S> {
    pub fn new(store: S) -> Self {
        CovarianceCache {
            store,
            memory: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the matrix stored under `key`, or runs `build`, stores its result and
    /// returns it. Nothing is stored if `build` fails.
    ///
    /// Concurrent misses on the same key may each build; the builds are deterministic,
    /// so whichever save lands last stores an identical matrix.
    pub fn get_or_build<F>(&self, key: &CacheKey, build: F) -> Result<Arc<CovarianceMatrix>>
    where
        F: FnOnce() -> Result<CovarianceMatrix>,
    {
        if let Some(matrix) = self.memory.get(key) {
            return Ok(matrix.value().clone());
        }

        let name = key.to_string();
        let matrix = match self.store.load(&name)? {
            Some(matrix) => {
                debug!("loaded covariance {name} ({} entries)", matrix.nnz());
                matrix
            }
            None => {
                info!("covariance {name} not cached, building");
                let matrix = build()?;
                self.store.save(&name, &matrix)?;
                info!("stored covariance {name} ({} entries)", matrix.nnz());
                matrix
            }
        };

        let matrix = Arc::new(matrix);
        self.memory.insert(key.clone(), matrix.clone());
        Ok(matrix)
    }

    /// Drops the in-memory copies of every line of `galaxy`, under any kernel. Stored
    /// entries are kept.
    pub fn evict(&self, galaxy: &str) {
        self.memory.retain(|key, _| key.galaxy != galaxy);
    }
}

#[cfg(test)]
use crate::covariance::{build_covariance, PixelGrid};

#[cfg(test)]
fn sample_matrix() -> CovarianceMatrix {
    let grid = PixelGrid::new(12).unwrap();
    let errors: Vec<Option<f64>> = (0..144)
        .map(|i| if i % 5 == 0 { None } else { Some(0.3 + i as f64 * 0.01) })
        .collect();
    build_covariance(grid, &errors, &Kernel::default()).unwrap()
}

#[test]
fn test_cache_key_format() {
    let name = "1-593159_127_5679242.fits.gz";
    let key = CacheKey::new(name, EmissionLine::HBeta, &Kernel::default());
    assert_eq!(key.to_string(), "1-593159_127_5679242.fits.gz.Hb");

    let narrow = Kernel::new(0.5, 1.9).unwrap();
    let other = CacheKey::new(name, EmissionLine::HBeta, &narrow);
    assert_ne!(other, key);
    assert_eq!(
        other.to_string(),
        format!(
            "{name}.Hb.c{:016x}.s{:016x}",
            0.5_f64.to_bits(),
            1.9_f64.to_bits()
        )
    );
}

#[test]
fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path()).unwrap();
    let matrix = sample_matrix();

    assert!(store.load("gal.Ha").unwrap().is_none());
    store.save("gal.Ha", &matrix).unwrap();
    let loaded = store.load("gal.Ha").unwrap().expect("entry not found");

    assert_eq!(loaded, matrix);
    assert!(loaded.triplets().eq(matrix.triplets()));
    assert_eq!(store.keys().unwrap(), vec!["gal.Ha".to_string()]);
}

#[test]
fn test_file_store_corrupt_entry_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path()).unwrap();
    std::fs::write(dir.path().join("gal.Ha.cov"), b"definitely not a matrix").unwrap();

    assert!(matches!(
        store.load("gal.Ha"),
        Err(SfrError::CorruptCache { .. })
    ));
}

#[test]
fn test_disk_db_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let disk_db = DiskDB::connect(dir.path()).expect("connection to db failed");
    let matrix = sample_matrix();

    assert!(disk_db.load("gal.Hb").expect("db retrieval error").is_none());
    disk_db.save("gal.Hb", &matrix).unwrap();
    assert_eq!(
        disk_db
            .load("gal.Hb")
            .expect("db retrieval error")
            .expect("entry not found"),
        matrix
    );
    assert_eq!(disk_db.keys().unwrap(), vec!["gal.Hb".to_string()]);
}

#[test]
fn test_cache_builds_once() {
    use std::cell::Cell;

    let dir = tempfile::tempdir().unwrap();
    let cache = CovarianceCache::new(FileStore::new(dir.path()).unwrap());
    let key = CacheKey::new("gal", EmissionLine::HAlpha, &Kernel::default());
    let builds = Cell::new(0);

    for _ in 0..3 {
        let matrix = cache
            .get_or_build(&key, || {
                builds.set(builds.get() + 1);
                Ok(sample_matrix())
            })
            .unwrap();
        assert_eq!(*matrix, sample_matrix());
    }
    assert_eq!(builds.get(), 1);

    // A fresh cache over the same directory loads instead of building
    let reopened = CovarianceCache::new(FileStore::new(dir.path()).unwrap());
    reopened
        .get_or_build(&key, || panic!("should have been loaded from disk"))
        .unwrap();
}

#[test]
fn test_failed_build_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CovarianceCache::new(FileStore::new(dir.path()).unwrap());
    let key = CacheKey::new("gal", EmissionLine::HBeta, &Kernel::default());

    let result = cache.get_or_build(&key, || Err(SfrError::InvalidArgument("boom".to_string())));
    assert!(result.is_err());
    assert!(cache.store().keys().unwrap().is_empty());
    assert!(cache.store().load("gal.Hb").unwrap().is_none());
}

#[test]
fn test_corrupt_entry_is_not_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("gal.Ha.cov"), [0u8; 3]).unwrap();
    let cache = CovarianceCache::new(FileStore::new(dir.path()).unwrap());

    let key = CacheKey::new("gal", EmissionLine::HAlpha, &Kernel::default());
    let result = cache.get_or_build(&key, || panic!("corrupt entries must surface, not rebuild"));
    assert!(matches!(result, Err(SfrError::CorruptCache { .. })));
}

#[test]
fn test_each_kernel_gets_its_own_entry() {
    let dir = tempfile::tempdir().unwrap();
    let grid = PixelGrid::new(4).unwrap();
    let errors = vec![Some(1.0); 16];
    let wide = Kernel::default();
    let narrow = Kernel::new(0.5, 1.9).unwrap();

    let cache = CovarianceCache::new(FileStore::new(dir.path()).unwrap());
    let key = CacheKey::new("gal", EmissionLine::HAlpha, &wide);
    let built = cache
        .get_or_build(&key, || build_covariance(grid, &errors, &wide))
        .unwrap();
    assert!(built.nnz() > 16);

    // Same store, different kernel: the wide matrix must not be handed back
    let reopened = CovarianceCache::new(FileStore::new(dir.path()).unwrap());
    let key = CacheKey::new("gal", EmissionLine::HAlpha, &narrow);
    let diagonal = reopened
        .get_or_build(&key, || build_covariance(grid, &errors, &narrow))
        .unwrap();
    assert_eq!(diagonal.nnz(), 16);
    assert_eq!(diagonal.total(), 16.0);
    assert_eq!(reopened.store().keys().unwrap().len(), 2);
}

#[test]
fn test_evict_drops_every_kernel_of_a_galaxy() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CovarianceCache::new(FileStore::new(dir.path()).unwrap());
    let narrow = Kernel::new(0.5, 1.9).unwrap();
    for kernel in [Kernel::default(), narrow] {
        for galaxy in ["gal", "other"] {
            let key = CacheKey::new(galaxy, EmissionLine::HBeta, &kernel);
            cache.get_or_build(&key, || Ok(sample_matrix())).unwrap();
        }
    }
    assert_eq!(cache.memory.len(), 4);

    cache.evict("gal");
    assert_eq!(cache.memory.len(), 2);
    assert!(cache.memory.iter().all(|entry| entry.key().galaxy == "other"));
    // Stored entries survive eviction
    assert_eq!(cache.store().keys().unwrap().len(), 4);
}
