//! Obstacle detection seam
//!
//! The detection model lives outside this crate. Feed consumers hand it one
//! JPEG frame at a time through [`ObstacleDetector`] and forward the result
//! to the UI as a [`UiEvent::Detection`](crate::UiEvent::Detection).

use anyhow::Result;
use serde::Serialize;

/// Grid of obstacle depths over the frame, row-major.
///
/// `None` marks a cell with no obstacle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<Option<f32>>,
}

impl DetectionResult {
    /// A grid with no obstacles
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![None; rows * cols],
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells.get(row * self.cols + col).copied().flatten()
    }

    pub fn obstacle_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Closest obstacle as `(row, col, depth)`
    pub fn nearest(&self) -> Option<(usize, usize, f32)> {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|d| (i / self.cols, i % self.cols, d)))
            .min_by(|a, b| a.2.total_cmp(&b.2))
    }
}

/// Given a frame, return a detection result.
///
/// Called from a blocking thread; implementations may be slow.
pub trait ObstacleDetector: Send + Sync {
    fn detect(&self, jpeg: &[u8]) -> Result<DetectionResult>;
}

/// Detector that never reports obstacles, used when no model is attached
#[derive(Debug, Clone, Copy)]
pub struct NullDetector {
    pub rows: usize,
    pub cols: usize,
}

impl Default for NullDetector {
    fn default() -> Self {
        Self { rows: 6, cols: 8 }
    }
}

impl ObstacleDetector for NullDetector {
    fn detect(&self, _jpeg: &[u8]) -> Result<DetectionResult> {
        Ok(DetectionResult::empty(self.rows, self.cols))
    }
}
