//! Progress tracking for stage runs.

use crate::core::grid::TileId;
use crate::stages::StageId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// A stage run has started.
    Started { stage: StageId, total_tiles: usize },
    /// A tile finished and its artifact is in the store.
    TileCompleted {
        tile: TileId,
        duration_ms: u64,
        done: usize,
        total: usize,
        estimated_remaining_ms: Option<u64>,
    },
    /// A tile's artifact was already in the store and was left alone.
    TileSkipped { tile: TileId },
    /// A tile failed; the run carries on and the failure is recorded.
    TileFailed { tile: TileId, message: String },
    /// The stage run has finished.
    Completed {
        stage: StageId,
        duration_ms: u64,
        completed: usize,
        skipped: usize,
        failed: usize,
    },
    /// The stage run was cancelled.
    Cancelled { stage: StageId },
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Tracks one stage run and carries the cancellation flag.
///
/// Workers update the tracker concurrently; the flag can be shared with a
/// signal handler so an interrupt stops tile dispatch.
pub struct ProgressTracker {
    stage: StageId,
    total_tiles: usize,
    completed_tiles: AtomicU64,
    skipped_tiles: AtomicU64,
    failed_tiles: AtomicU64,
    cancelled: Arc<AtomicBool>,
    start_time: Option<Instant>,
    callback: Option<ProgressCallback>,
    tile_times: parking_lot::Mutex<Vec<u64>>,
}

impl ProgressTracker {
    /// Create a new progress tracker for a stage run.
    pub fn new(stage: StageId, total_tiles: usize) -> Self {
        Self {
            stage,
            total_tiles,
            completed_tiles: AtomicU64::new(0),
            skipped_tiles: AtomicU64::new(0),
            failed_tiles: AtomicU64::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
            start_time: None,
            callback: None,
            tile_times: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Start tracking.
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.send_update(ProgressUpdate::Started {
            stage: self.stage,
            total_tiles: self.total_tiles,
        });
    }

    /// Report a completed tile.
    pub fn tile_completed(&self, tile: TileId, duration_ms: u64) {
        let done = self.completed_tiles.fetch_add(1, Ordering::Relaxed) as usize + 1;
        self.tile_times.lock().push(duration_ms);

        self.send_update(ProgressUpdate::TileCompleted {
            tile,
            duration_ms,
            done,
            total: self.total_tiles,
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }

    /// Report a tile skipped because its artifact already exists.
    pub fn tile_skipped(&self, tile: TileId) {
        self.skipped_tiles.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::TileSkipped { tile });
    }

    /// Report a failed tile.
    pub fn tile_failed(&self, tile: TileId, message: String) {
        self.failed_tiles.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::TileFailed { tile, message });
    }

    /// Check whether the run should stop dispatching tiles.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.send_update(ProgressUpdate::Cancelled { stage: self.stage });
    }

    /// Number of tiles completed, skipped and failed so far.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.completed_tiles.load(Ordering::Relaxed) as usize,
            self.skipped_tiles.load(Ordering::Relaxed) as usize,
            self.failed_tiles.load(Ordering::Relaxed) as usize,
        )
    }

    /// Finish tracking.
    pub fn finish(&self) {
        let duration = self
            .start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let (completed, skipped, failed) = self.counts();

        self.send_update(ProgressUpdate::Completed {
            stage: self.stage,
            duration_ms: duration,
            completed,
            skipped,
            failed,
        });
    }

    /// Estimate remaining time from the mean tile duration so far.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.tile_times.lock();
        if times.is_empty() {
            return None;
        }

        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let (completed, skipped, failed) = self.counts();
        let remaining = self
            .total_tiles
            .saturating_sub(completed + skipped + failed);

        Some(avg_time * remaining as u64)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_counts_accumulate() {
        let tracker = ProgressTracker::new(StageId::Convert, 10);
        assert_eq!(tracker.counts(), (0, 0, 0));

        tracker.tile_completed(TileId::new(0, 0), 10);
        tracker.tile_completed(TileId::new(0, 1), 20);
        tracker.tile_skipped(TileId::new(0, 2));
        tracker.tile_failed(TileId::new(0, 3), "no data".to_string());
        assert_eq!(tracker.counts(), (2, 1, 1));
    }

    #[test]
    fn test_cancellation_via_shared_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let tracker = ProgressTracker::new(StageId::Prepare, 10).with_cancel_flag(flag.clone());
        assert!(!tracker.is_cancelled());

        flag.store(true, Ordering::Relaxed);
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_callback_invoked() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let mut tracker =
            ProgressTracker::new(StageId::Convert, 5).with_callback(Box::new(move |_| {
                call_count_clone.fetch_add(1, Ordering::Relaxed);
            }));

        tracker.start();
        tracker.tile_completed(TileId::new(0, 0), 100);
        tracker.tile_skipped(TileId::new(0, 1));
        tracker.finish();

        // Started, TileCompleted, TileSkipped, Completed
        assert_eq!(call_count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_remaining_estimate_uses_mean_tile_time() {
        let tracker = ProgressTracker::new(StageId::Process, 4);
        assert_eq!(tracker.estimated_remaining_ms(), None);

        tracker.tile_completed(TileId::new(0, 0), 100);
        tracker.tile_completed(TileId::new(0, 1), 300);
        assert_eq!(tracker.estimated_remaining_ms(), Some(400));
    }
}
