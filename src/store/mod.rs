//! Durable tile artifact store.
//!
//! Every stage writes exactly one artifact per tile. Artifacts live on disk
//! as bincode files laid out `<root>/<stage>/r00001_c00002.tile`, each
//! written to a temporary name, synced and atomically renamed, so a crash
//! never leaves a torn artifact under a final name. An LRU of recently used
//! artifacts keeps the hand-off between stages cheap; the full artifact set
//! only ever exists on disk, which is what lets a run outgrow memory.
//!
//! Opening a store rescans the directory, which is how a resumed run
//! rediscovers the tiles it already finished.

use crate::core::error::{StoreError, StoreResult};
use crate::core::grid::{PixelWindow, TileId};
use crate::stages::StageId;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Default number of artifacts kept hot in memory.
pub const DEFAULT_HOT_CAPACITY: usize = 16;

const ARTIFACT_EXT: &str = "tile";
const TMP_SUFFIX: &str = ".tmp";

/// Identifies one artifact: which stage produced it, for which tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// Producing stage.
    pub stage: StageId,
    /// Tile the artifact covers.
    pub tile: TileId,
}

/// One named band of pixel data inside an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBand {
    /// Band name; stack stages use the source file stem, derived stages
    /// use product names.
    pub name: String,
    /// Time span of the underlying interferogram in years, for stack bands.
    pub span_years: Option<f64>,
    /// Row-major pixels covering the artifact window.
    pub data: Vec<f32>,
}

/// The unit of exchange between stages: all bands of one tile.
///
/// `window` is the pixel region the data covers, which includes any halo the
/// producing stage read. `interior` is the region the tile owns; the merge
/// only ever copies interior pixels, so halo pixels can never leak into a
/// product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileArtifact {
    /// Tile this artifact belongs to.
    pub tile: TileId,
    /// Pixel region covered by every band, halo included.
    pub window: PixelWindow,
    /// Pixel region the tile owns.
    pub interior: PixelWindow,
    /// Pixel bands, all `window.area()` values long.
    pub bands: Vec<ArtifactBand>,
}

impl TileArtifact {
    /// Assemble an artifact, checking band shapes in debug builds.
    pub fn new(
        tile: TileId,
        window: PixelWindow,
        interior: PixelWindow,
        bands: Vec<ArtifactBand>,
    ) -> Self {
        debug_assert!(window.contains(&interior));
        debug_assert!(bands.iter().all(|b| b.data.len() as u64 == window.area()));
        Self {
            tile,
            window,
            interior,
            bands,
        }
    }

    /// Look up a band by name.
    pub fn band(&self, name: &str) -> Option<&ArtifactBand> {
        self.bands.iter().find(|b| b.name == name)
    }

    /// Check structural invariants of an artifact read from disk.
    pub fn is_consistent(&self) -> bool {
        self.window.contains(&self.interior)
            && self
                .bands
                .iter()
                .all(|b| b.data.len() as u64 == self.window.area())
    }

    /// Approximate in-memory size in bytes.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .bands
                .iter()
                .map(|b| b.name.len() + b.data.len() * std::mem::size_of::<f32>())
                .sum::<usize>()
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Artifacts served from the hot cache.
    pub hits: u64,
    /// Artifacts read from disk.
    pub misses: u64,
    /// Artifacts written.
    pub writes: u64,
    /// Hot cache evictions.
    pub evictions: u64,
}

impl StoreStats {
    /// Fraction of reads served from memory.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Thread-safe disk-backed artifact store with an LRU hot layer.
pub struct TileStore {
    root: PathBuf,
    index: Mutex<HashSet<StoreKey>>,
    hot: Mutex<LruCache<StoreKey, Arc<TileArtifact>>>,
    stats: Mutex<StoreStats>,
}

impl TileStore {
    /// Open (or create) a store rooted at `root` and rescan its contents.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::with_hot_capacity(root, DEFAULT_HOT_CAPACITY)
    }

    /// Open a store with a custom hot cache capacity.
    pub fn with_hot_capacity(root: impl Into<PathBuf>, capacity: usize) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::CreateDir {
            path: root.clone(),
            source,
        })?;
        let index = rescan(&root);
        log::debug!(
            "tile store at {} holds {} artifact(s)",
            root.display(),
            index.len()
        );
        Ok(Self {
            root,
            index: Mutex::new(index),
            hot: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            stats: Mutex::new(StoreStats::default()),
        })
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist one artifact, replacing any previous artifact for the same
    /// stage and tile.
    pub fn put(&self, stage: StageId, artifact: TileArtifact) -> StoreResult<()> {
        let key = StoreKey {
            stage,
            tile: artifact.tile,
        };
        let dir = self.root.join(stage.slug());
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let name = artifact_file_name(artifact.tile);
        let path = dir.join(&name);
        let tmp = dir.join(format!("{name}{TMP_SUFFIX}"));

        let write = |tmp: &Path| -> StoreResult<()> {
            let file = File::create(tmp).map_err(|source| StoreError::Write {
                path: tmp.to_path_buf(),
                source,
            })?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &artifact).map_err(|source| {
                StoreError::Encode {
                    stage,
                    tile: artifact.tile,
                    source,
                }
            })?;
            writer.flush().map_err(|source| StoreError::Write {
                path: tmp.to_path_buf(),
                source,
            })?;
            let file = writer
                .into_inner()
                .map_err(|e| StoreError::Write {
                    path: tmp.to_path_buf(),
                    source: e.into_error(),
                })?;
            file.sync_all().map_err(|source| StoreError::Write {
                path: tmp.to_path_buf(),
                source,
            })
        };

        if let Err(err) = write(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &path).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;

        self.index.lock().insert(key);
        let bytes = artifact.memory_size();
        self.insert_hot(key, Arc::new(artifact));
        self.stats.lock().writes += 1;
        log::trace!("stored {} {} ({bytes} B)", stage.slug(), key.tile);
        Ok(())
    }

    /// Fetch one artifact, from memory when hot, from disk otherwise.
    pub fn get(&self, stage: StageId, tile: TileId) -> StoreResult<Arc<TileArtifact>> {
        let key = StoreKey { stage, tile };

        if let Some(artifact) = self.hot.lock().get(&key) {
            self.stats.lock().hits += 1;
            return Ok(Arc::clone(artifact));
        }
        self.stats.lock().misses += 1;

        if !self.index.lock().contains(&key) {
            return Err(StoreError::NotFound { stage, tile });
        }

        let path = self.artifact_path(key);
        let file = File::open(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let artifact: TileArtifact = bincode::deserialize_from(BufReader::new(file))
            .map_err(|source| StoreError::Decode {
                path: path.clone(),
                source,
            })?;
        debug_assert!(artifact.is_consistent());

        let artifact = Arc::new(artifact);
        self.insert_hot(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    /// Whether an artifact exists for this stage and tile.
    pub fn contains(&self, stage: StageId, tile: TileId) -> bool {
        self.index.lock().contains(&StoreKey { stage, tile })
    }

    /// Tile IDs a stage has artifacts for, in row-major order.
    pub fn tile_ids(&self, stage: StageId) -> Vec<TileId> {
        let mut ids: Vec<TileId> = self
            .index
            .lock()
            .iter()
            .filter(|k| k.stage == stage)
            .map(|k| k.tile)
            .collect();
        ids.sort();
        ids
    }

    /// All artifacts of one stage, in row-major tile order.
    pub fn all(&self, stage: StageId) -> StoreResult<Vec<(TileId, Arc<TileArtifact>)>> {
        self.tile_ids(stage)
            .into_iter()
            .map(|tile| self.get(stage, tile).map(|a| (tile, a)))
            .collect()
    }

    /// Number of stored artifacts across all stages.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// Whether the store holds no artifacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete all artifacts of one stage. Returns how many were removed.
    pub fn remove_stage(&self, stage: StageId) -> StoreResult<usize> {
        let keys: Vec<StoreKey> = self
            .index
            .lock()
            .iter()
            .filter(|k| k.stage == stage)
            .copied()
            .collect();

        for key in &keys {
            let path = self.artifact_path(*key);
            fs::remove_file(&path).map_err(|source| StoreError::Write { path, source })?;
            self.hot.lock().pop(key);
            self.index.lock().remove(key);
        }
        let _ = fs::remove_dir(self.root.join(stage.slug()));
        Ok(keys.len())
    }

    /// Delete every artifact and reset the hot cache.
    pub fn clear(&self) -> StoreResult<()> {
        for stage in StageId::all() {
            let dir = self.root.join(stage.slug());
            if dir.is_dir() {
                fs::remove_dir_all(&dir)
                    .map_err(|source| StoreError::Write { path: dir, source })?;
            }
        }
        self.index.lock().clear();
        self.hot.lock().clear();
        Ok(())
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    fn artifact_path(&self, key: StoreKey) -> PathBuf {
        self.root
            .join(key.stage.slug())
            .join(artifact_file_name(key.tile))
    }

    fn insert_hot(&self, key: StoreKey, artifact: Arc<TileArtifact>) {
        if let Some((evicted, _)) = self.hot.lock().push(key, artifact) {
            if evicted != key {
                self.stats.lock().evictions += 1;
            }
        }
    }
}

fn artifact_file_name(tile: TileId) -> String {
    format!("r{:05}_c{:05}.{ARTIFACT_EXT}", tile.row, tile.col)
}

fn parse_artifact_file_name(name: &str) -> Option<TileId> {
    let stem = name.strip_suffix(&format!(".{ARTIFACT_EXT}"))?;
    let rest = stem.strip_prefix('r')?;
    let (row, col) = rest.split_once("_c")?;
    Some(TileId::new(row.parse().ok()?, col.parse().ok()?))
}

/// Walk the store directory and rebuild the key index. Leftover temp files
/// from an interrupted writer are deleted along the way.
fn rescan(root: &Path) -> HashSet<StoreKey> {
    let mut index = HashSet::new();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.ends_with(TMP_SUFFIX) {
            let _ = fs::remove_file(entry.path());
            continue;
        }
        let stage = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(StageId::from_slug);
        if let (Some(stage), Some(tile)) = (stage, parse_artifact_file_name(name)) {
            index.insert(StoreKey { stage, tile });
        }
    }
    index
}
