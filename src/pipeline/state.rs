//! Persistent run state.
//!
//! One JSON file per output directory records the run identity, the pinned
//! tile grid and the outcome of every stage. It is what lets a later
//! invocation pick up where an earlier one stopped, and what stops a
//! resumed run from silently mixing two partitions of the same extent.

use crate::core::error::{AvaniError, ConfigError};
use crate::core::grid::{TileGrid, TileId};
use crate::stages::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the run state inside the output directory.
pub const RUN_STATE_FILE: &str = "run_state.json";

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not run yet, or rolled back by a cancellation.
    #[default]
    Pending,
    /// A run is underway (or was cut short without rollback).
    Running,
    /// Ran within the failure threshold; artifacts are in the store.
    Complete,
    /// Ran past the failure threshold, or aborted.
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Complete => "complete",
            StageState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Recorded outcome of one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    /// Where the stage is in its lifecycle.
    pub state: StageState,
    /// Tiles with a stored artifact after the last run.
    pub completed_tiles: usize,
    /// Tiles that failed in the last run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tiles: Vec<TileId>,
    /// Why the stage failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the stage last finished, complete or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// Whether the stage can serve as a predecessor.
    pub fn is_complete(&self) -> bool {
        self.state == StageState::Complete
    }

    /// Transition into a fresh run.
    pub fn mark_running(&mut self) {
        self.state = StageState::Running;
        self.message = None;
        self.finished = None;
    }

    /// Record a run that stayed within the failure threshold.
    pub fn mark_complete(&mut self, completed_tiles: usize, failed_tiles: Vec<TileId>) {
        self.state = StageState::Complete;
        self.completed_tiles = completed_tiles;
        self.failed_tiles = failed_tiles;
        self.finished = Some(Utc::now());
    }

    /// Record a failed run.
    pub fn mark_failed(&mut self, message: String, failed_tiles: Vec<TileId>) {
        self.state = StageState::Failed;
        self.message = Some(message);
        self.failed_tiles = failed_tiles;
        self.finished = Some(Utc::now());
    }

    /// Roll back to pending, keeping whatever artifacts exist for resume.
    pub fn mark_pending(&mut self) {
        self.state = StageState::Pending;
        self.finished = None;
    }
}

/// The pinned tile partition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    /// Raster width in pixels.
    pub width: u32,
    /// Raster height in pixels.
    pub height: u32,
    /// Tile rows.
    pub rows: usize,
    /// Tile columns.
    pub cols: usize,
}

impl GridShape {
    /// The shape of a computed grid.
    pub fn of(grid: &TileGrid) -> Self {
        Self {
            width: grid.width(),
            height: grid.height(),
            rows: grid.rows(),
            cols: grid.cols(),
        }
    }

    /// Whether `grid` is the same partition.
    pub fn matches(&self, grid: &TileGrid) -> bool {
        *self == Self::of(grid)
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} tiles over {}x{} px",
            self.rows, self.cols, self.width, self.height
        )
    }
}

/// Per-stage records, keyed by stage slug in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageLedger {
    #[serde(default)]
    conv2tif: StageRecord,
    #[serde(default)]
    prepifg: StageRecord,
    #[serde(default)]
    process: StageRecord,
    #[serde(default)]
    merge: StageRecord,
}

impl StageLedger {
    fn record(&self, stage: StageId) -> &StageRecord {
        match stage {
            StageId::Convert => &self.conv2tif,
            StageId::Prepare => &self.prepifg,
            StageId::Process => &self.process,
            StageId::Merge => &self.merge,
        }
    }

    fn record_mut(&mut self, stage: StageId) -> &mut StageRecord {
        match stage {
            StageId::Convert => &mut self.conv2tif,
            StageId::Prepare => &mut self.prepifg,
            StageId::Process => &mut self.process,
            StageId::Merge => &mut self.merge,
        }
    }
}

/// Everything recorded about one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Identity of the run.
    pub run_id: Uuid,
    /// When the run was first created.
    pub created: DateTime<Utc>,
    /// When the state was last written.
    pub updated: DateTime<Utc>,
    /// The partition every stage of this run must use.
    pub grid: GridShape,
    /// Worker count of the most recent invocation.
    #[serde(default)]
    pub workers: usize,
    /// Resolved input stack of the most recent invocation.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Outcome of each stage.
    pub stages: StageLedger,
}

impl RunState {
    /// Fresh state pinning `grid`.
    pub fn new(grid: &TileGrid) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            created: now,
            updated: now,
            grid: GridShape::of(grid),
            workers: 0,
            inputs: Vec::new(),
            stages: StageLedger::default(),
        }
    }

    /// Path of the state file inside `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(RUN_STATE_FILE)
    }

    /// Load the state recorded in `dir`, if any.
    pub fn load(dir: &Path) -> Result<Option<Self>, AvaniError> {
        let path = Self::path(dir);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        let state = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(state))
    }

    /// Load the recorded state or start a new one, refusing a grid that
    /// conflicts with the recorded partition.
    pub fn load_or_create(dir: &Path, grid: &TileGrid) -> Result<Self, AvaniError> {
        match Self::load(dir)? {
            Some(state) => {
                state.ensure_grid(grid, &Self::path(dir))?;
                Ok(state)
            }
            None => Ok(Self::new(grid)),
        }
    }

    /// Check `grid` against the pinned partition.
    pub fn ensure_grid(&self, grid: &TileGrid, state_path: &Path) -> Result<(), ConfigError> {
        if self.grid.matches(grid) {
            return Ok(());
        }
        Err(ConfigError::GridMismatch {
            requested: GridShape::of(grid).to_string(),
            recorded: self.grid.to_string(),
            state_path: state_path.to_path_buf(),
        })
    }

    /// Write the state into `dir`, atomically.
    pub fn save(&mut self, dir: &Path) -> Result<(), AvaniError> {
        self.updated = Utc::now();
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");

        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The record of one stage.
    pub fn stage(&self, id: StageId) -> &StageRecord {
        self.stages.record(id)
    }

    /// The record of one stage, mutably.
    pub fn stage_mut(&mut self, id: StageId) -> &mut StageRecord {
        self.stages.record_mut(id)
    }

    /// The first stage that has not completed, in run order.
    pub fn first_incomplete(&self) -> Option<StageId> {
        StageId::all()
            .into_iter()
            .find(|id| !self.stage(*id).is_complete())
    }
}
