//! Volume surge detection over a sliding trade window.
//!
//! Each instrument keeps an ordered window of `(timestamp, size)` entries and
//! a smoothed historical average of the window sum. A trade that pushes the
//! window sum above `average * threshold` produces a [`SurgeAlert`] and moves
//! the average toward the current sum. Sub-threshold trades leave the average
//! untouched.
//!
//! Alerts repeat on every trade while the window stays above threshold.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SurgeConfig;

/// Emitted when a window sum exceeds the surge threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurgeAlert {
    pub instrument_id: String,
    /// Sum of trade sizes inside the window when the alert fired
    pub window_volume: f64,
    /// Average the sum was compared against (before smoothing)
    pub historical_average: f64,
    pub ratio: f64,
    pub threshold: f64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
struct VolumeWindow {
    entries: VecDeque<(u64, f64)>,
    sum: f64,
    historical_average: Option<f64>,
}

impl VolumeWindow {
    fn push(&mut self, timestamp_ms: u64, size: f64, window_ms: u64) {
        // Keep entries ordered even if a late print arrives
        let pos = self
            .entries
            .iter()
            .rposition(|(ts, _)| *ts <= timestamp_ms)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.entries.insert(pos, (timestamp_ms, size));

        let newest = self.entries.back().map(|(ts, _)| *ts).unwrap_or(timestamp_ms);
        let cutoff = newest.saturating_sub(window_ms);
        while let Some((ts, _)) = self.entries.front() {
            if *ts >= cutoff {
                break;
            }
            self.entries.pop_front();
        }

        // Recompute rather than subtract to avoid float drift over long runs
        self.sum = self.entries.iter().map(|(_, s)| s).sum();
    }
}

/// Per-instrument sliding-window surge detector
#[derive(Debug)]
pub struct VolumeSurgeDetector {
    windows: DashMap<String, VolumeWindow>,
    threshold: f64,
    window_ms: u64,
    alpha: f64,
}

impl VolumeSurgeDetector {
    pub fn new(config: &SurgeConfig) -> Self {
        Self {
            windows: DashMap::new(),
            threshold: config.threshold,
            window_ms: config.window_ms(),
            alpha: config.smoothing_alpha,
        }
    }

    /// Record a trade and evaluate the window.
    pub fn on_trade(&self, instrument_id: &str, size: f64, timestamp_ms: u64) -> Option<SurgeAlert> {
        if !size.is_finite() || size <= 0.0 {
            return None;
        }

        let mut window = self.windows.entry(instrument_id.to_string()).or_default();
        window.push(timestamp_ms, size, self.window_ms);
        let sum = window.sum;

        let average = match window.historical_average {
            Some(avg) if avg > 0.0 => avg,
            _ => {
                window.historical_average = Some(sum);
                debug!(instrument = %instrument_id, seed = sum, "[SURGE] Seeded historical average");
                return None;
            }
        };

        let ratio = sum / average;
        if ratio <= self.threshold {
            return None;
        }

        window.historical_average = Some(average * (1.0 - self.alpha) + sum * self.alpha);

        Some(SurgeAlert {
            instrument_id: instrument_id.to_string(),
            window_volume: sum,
            historical_average: average,
            ratio,
            threshold: self.threshold,
            timestamp_ms,
        })
    }

    pub fn historical_average(&self, instrument_id: &str) -> Option<f64> {
        self.windows
            .get(instrument_id)
            .and_then(|w| w.historical_average)
    }

    pub fn window_volume(&self, instrument_id: &str) -> f64 {
        self.windows.get(instrument_id).map(|w| w.sum).unwrap_or(0.0)
    }

    pub fn tracked_instruments(&self) -> usize {
        self.windows.len()
    }
}
