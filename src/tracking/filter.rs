// src/tracking/filter.rs
//! Retention filter for raw location samples
//!
//! Each new point is compared with the last *retained* point. Real movement
//! is always kept. While the device sits still, a confirmation point is kept
//! at most every `stationary_after` and only while fewer than
//! `max_confirmations` retained points already cover the spot within the
//! confirmation window.

use crate::geo::Coordinate;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Distance from the last retained point that counts as movement
    pub movement_threshold_m: f64,
    /// Stationary points younger than this are noise
    pub stationary_after_secs: i64,
    /// Lookback for counting earlier confirmations
    pub confirmation_window_secs: i64,
    pub max_confirmations: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            movement_threshold_m: 30.0,
            stationary_after_secs: 10 * 60,
            confirmation_window_secs: 15 * 60,
            max_confirmations: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    First,
    Moved,
    Confirmation,
    TooSoon,
    AlreadyConfirmed,
}

impl FilterDecision {
    pub fn is_retained(&self) -> bool {
        matches!(self, FilterDecision::First | FilterDecision::Moved | FilterDecision::Confirmation)
    }
}

#[derive(Debug, Clone)]
pub struct PointFilter {
    config: FilterConfig,
    /// Retained points, oldest first; the back is the last retained point
    retained: VecDeque<(Coordinate, DateTime<Utc>)>,
}

impl PointFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            retained: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn last_retained(&self) -> Option<(Coordinate, DateTime<Utc>)> {
        self.retained.back().copied()
    }

    /// Forget every retained point; the next sample is a first point again.
    pub fn reset(&mut self) {
        self.retained.clear();
    }

    /// Classify a sample without recording it
    pub fn evaluate(&self, point: &Coordinate, at: DateTime<Utc>) -> FilterDecision {
        let Some((last, last_at)) = self.retained.back() else {
            return FilterDecision::First;
        };

        if last.distance_to(point) >= self.config.movement_threshold_m {
            return FilterDecision::Moved;
        }

        if at.signed_duration_since(*last_at) <= Duration::seconds(self.config.stationary_after_secs) {
            return FilterDecision::TooSoon;
        }

        let window_start = at - Duration::seconds(self.config.confirmation_window_secs);
        let nearby = self
            .retained
            .iter()
            .filter(|(p, t)| *t >= window_start && p.distance_to(point) < self.config.movement_threshold_m)
            .count();

        if nearby >= self.config.max_confirmations {
            FilterDecision::AlreadyConfirmed
        } else {
            FilterDecision::Confirmation
        }
    }

    /// Classify a sample and record it when retained
    pub fn offer(&mut self, point: Coordinate, at: DateTime<Utc>) -> FilterDecision {
        let decision = self.evaluate(&point, at);
        if decision.is_retained() {
            self.retained.push_back((point, at));
            self.prune(at);
        }
        decision
    }

    /// Drop history that can no longer fall inside a confirmation window,
    /// always keeping the last retained point.
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(self.config.confirmation_window_secs);
        while self.retained.len() > 1 {
            match self.retained.front() {
                Some((_, t)) if *t < horizon => {
                    self.retained.pop_front();
                }
                _ => break,
            }
        }
    }
}

impl Default for PointFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}
