//! Sampling motion gate.
//!
//! Decides whether the recognition engine is worth running by comparing a
//! fixed random sample of zone pixels between successive checks. The cost
//! is proportional to the sample size, not the frame size.

use std::collections::VecDeque;

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::logger;
use crate::settings::MotionSettings;
use crate::types::{Frame, Zone};

/// RunningAverage only adapts once this many scores are known.
const MIN_AVERAGE_HISTORY: usize = 5;
const MAX_THRESHOLD_FACTOR: f64 = 3.0;

const TREND_HISTORY: usize = 5;
const TREND_RECENT: usize = 3;
const TREND_RISE: f64 = 1.1;
const TREND_DISCOUNT: f64 = 0.85;

/// Lag weights for MultiScale, lag 1 first.
const LAG_WEIGHTS: [f64; 3] = [1.0, 0.7, 0.5];

fn default_history_size() -> usize {
    10
}

fn default_multiplier() -> f64 {
    0.3
}

/// How the effective threshold is derived from the base threshold.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdStrategy {
    #[default]
    Fixed,
    /// Raises the threshold with the mean recent score (slow lighting drift).
    RunningAverage {
        #[serde(default = "default_history_size")]
        history_size: usize,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
    /// Lowers the threshold while scores are rising.
    TrendAdaptive,
    /// Compares against the last three snapshots with decaying weights.
    MultiScale,
}

impl ThresholdStrategy {
    fn history_capacity(&self) -> usize {
        match self {
            ThresholdStrategy::Fixed => 0,
            ThresholdStrategy::RunningAverage { history_size, .. } => (*history_size).max(1),
            ThresholdStrategy::TrendAdaptive | ThresholdStrategy::MultiScale => TREND_HISTORY,
        }
    }

    fn snapshot_depth(&self) -> usize {
        match self {
            ThresholdStrategy::MultiScale => LAG_WEIGHTS.len(),
            _ => 1,
        }
    }

    fn threshold(&self, base: f64, history: &VecDeque<f64>) -> f64 {
        match self {
            ThresholdStrategy::Fixed => base,
            ThresholdStrategy::RunningAverage { multiplier, .. } => {
                if history.len() < MIN_AVERAGE_HISTORY {
                    return base;
                }
                let adapted = base + mean(history.iter().copied()) * multiplier;
                adapted.clamp(base, base * MAX_THRESHOLD_FACTOR)
            }
            ThresholdStrategy::TrendAdaptive | ThresholdStrategy::MultiScale => {
                trend_threshold(base, history)
            }
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn trend_threshold(base: f64, history: &VecDeque<f64>) -> f64 {
    if history.len() < TREND_HISTORY {
        return base;
    }
    let split = history.len() - TREND_RECENT;
    let older = mean(history.iter().take(split).copied());
    let recent = mean(history.iter().skip(split).copied());
    if recent > older * TREND_RISE {
        base * TREND_DISCOUNT
    } else {
        base
    }
}

/// Mean absolute difference, widened before subtracting.
fn mae(current: &[u8], previous: &[u8]) -> f64 {
    if current.is_empty() {
        return 0.0;
    }
    let total: u64 = current
        .iter()
        .zip(previous)
        .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs() as u64)
        .sum();
    total as f64 / current.len() as f64
}

/// Outcome of one `check_motion` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionCheck {
    pub triggered: bool,
    pub score: f64,
}

impl MotionCheck {
    pub const QUIET: MotionCheck = MotionCheck { triggered: false, score: 0.0 };
}

pub struct MotionGate {
    width: u32,
    height: u32,
    threshold: f64,
    min_consecutive: u32,
    cooldown_period: u32,
    strategy: ThresholdStrategy,
    /// (row, col), fixed for the gate's lifetime.
    samples: Vec<(u32, u32)>,
    /// Sampled intensities of earlier checks, newest last.
    snapshots: VecDeque<Vec<u8>>,
    consecutive: u32,
    cooldown: u32,
    history: VecDeque<f64>,
}

impl MotionGate {
    /// Build a gate, seeding sample placement from `settings.seed` when set.
    pub fn from_settings(zone: Zone, width: u32, height: u32, settings: &MotionSettings) -> Result<Self> {
        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::new(zone, width, height, settings, &mut rng)
    }

    /// Build a gate for `preferred` when given and usable, else for
    /// `fallback`. Returns the zone the gate was built for.
    pub fn with_fallback(
        preferred: Option<Zone>,
        fallback: Zone,
        width: u32,
        height: u32,
        settings: &MotionSettings,
    ) -> Result<(Zone, Self)> {
        if let Some(zone) = preferred {
            match Self::from_settings(zone, width, height, settings) {
                Ok(gate) => return Ok((zone, gate)),
                Err(e) => logger::warn_p(
                    "motion",
                    &format!("rejecting zone {}..{}: {:#}", zone.left(), zone.right(), e),
                ),
            }
        }
        Ok((fallback, Self::from_settings(fallback, width, height, settings)?))
    }

    pub fn new(
        zone: Zone,
        width: u32,
        height: u32,
        settings: &MotionSettings,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        ensure!(settings.sample_size > 0, "sample_size must be positive");
        ensure!(settings.min_consecutive >= 1, "min_consecutive must be at least 1");
        ensure!(
            settings.threshold.is_finite() && settings.threshold >= 0.0,
            "motion threshold must be >= 0"
        );
        ensure!(width > 0 && height > 0, "frame size must be non-zero");
        ensure!(!zone.is_degenerate(), "zone {}..{} is empty", zone.left(), zone.right());
        ensure!(
            zone.left() < width,
            "zone starts at x={} outside a {}px wide frame",
            zone.left(),
            width
        );

        let max_x = zone.right().min(width - 1);
        let samples = (0..settings.sample_size)
            .map(|_| (rng.gen_range(0..height), rng.gen_range(zone.left()..=max_x)))
            .collect();

        Ok(Self {
            width,
            height,
            threshold: settings.threshold,
            min_consecutive: settings.min_consecutive,
            cooldown_period: settings.cooldown,
            strategy: settings.strategy.clone(),
            samples,
            snapshots: VecDeque::new(),
            consecutive: 0,
            cooldown: 0,
            history: VecDeque::new(),
        })
    }

    pub fn sample_points(&self) -> &[(u32, u32)] {
        &self.samples
    }

    pub fn strategy(&self) -> &ThresholdStrategy {
        &self.strategy
    }

    /// Score `frame` against the previous check and decide whether to trigger.
    pub fn check_motion(&mut self, frame: &Frame) -> Result<MotionCheck> {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            return Ok(MotionCheck::QUIET);
        }
        ensure!(
            frame.width() == self.width && frame.height() == self.height,
            "frame is {}x{}, gate expects {}x{}",
            frame.width(),
            frame.height(),
            self.width,
            self.height
        );

        let current: Vec<u8> = self.samples.iter().map(|&(row, col)| frame.luma(row, col)).collect();

        if self.snapshots.is_empty() {
            self.snapshots.push_back(current);
            return Ok(MotionCheck::QUIET);
        }

        // Weighted score per lag; only MultiScale keeps more than one.
        let lag_scores: Vec<f64> = self
            .snapshots
            .iter()
            .rev()
            .zip(LAG_WEIGHTS)
            .map(|(prev, weight)| mae(&current, prev) * weight)
            .collect();
        let score = lag_scores.iter().copied().fold(0.0, f64::max);

        self.snapshots.push_back(current);
        while self.snapshots.len() > self.strategy.snapshot_depth() {
            self.snapshots.pop_front();
        }

        self.history.push_back(score);
        while self.history.len() > self.strategy.history_capacity() {
            self.history.pop_front();
        }

        let threshold = self.strategy.threshold(self.threshold, &self.history);
        let exceeded = match self.strategy {
            ThresholdStrategy::MultiScale => lag_scores.iter().any(|s| *s > threshold),
            _ => score > threshold,
        };

        if exceeded {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }

        if self.consecutive >= self.min_consecutive {
            self.consecutive = 0;
            self.cooldown = self.cooldown_period;
            return Ok(MotionCheck { triggered: true, score });
        }
        Ok(MotionCheck { triggered: false, score })
    }

    /// Forget everything learned from earlier frames. Call on any change
    /// of processing regime; comparisons across regimes are meaningless.
    pub fn reset(&mut self) {
        self.snapshots.clear();
        self.consecutive = 0;
        self.cooldown = 0;
        self.history.clear();
    }

    /// Lift trigger suppression so the next check samples again.
    pub fn clear_cooldown(&mut self) {
        self.cooldown = 0;
    }

    pub fn cooldown_remaining(&self) -> u32 {
        self.cooldown
    }
}
