// src/delivery/timer.rs
//! Time-on-stop derived from the persisted start timestamp
//!
//! Elapsed time is never accumulated in memory. Every reading recomputes
//! `now - start_time`, so a process that was suspended for an hour reads the
//! right value on its first tick after resuming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub is_active: bool,
    pub start_time: Option<DateTime<Utc>>,
}

impl TimerState {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            is_active: true,
            start_time: Some(at),
        }
    }

    pub fn stopped() -> Self {
        Self::default()
    }

    /// Seconds since the start timestamp, clamped at zero against clock skew
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        match (self.is_active, self.start_time) {
            (true, Some(start)) => now.signed_duration_since(start).num_seconds().max(0),
            _ => 0,
        }
    }
}

/// `HH:MM:SS` once an hour has passed, `MM:SS` before that
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTick {
    pub elapsed_seconds: i64,
    pub display: String,
}

/// Produces timer readings on every foreground tick and on resume
#[derive(Debug, Clone, Default)]
pub struct TimerReconciler {
    foreground: bool,
}

impl TimerReconciler {
    pub fn new() -> Self {
        Self { foreground: true }
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    /// The process went to the background; periodic ticks pause.
    pub fn suspend(&mut self) {
        self.foreground = false;
    }

    /// Back in the foreground: recompute immediately from the persisted start.
    pub fn resume(&mut self, timer: &TimerState, now: DateTime<Utc>) -> Option<TimerTick> {
        self.foreground = true;
        Self::reconcile(timer, now)
    }

    /// Periodic tick, only while in the foreground
    pub fn tick(&self, timer: &TimerState, now: DateTime<Utc>) -> Option<TimerTick> {
        if !self.foreground {
            return None;
        }
        Self::reconcile(timer, now)
    }

    pub fn reconcile(timer: &TimerState, now: DateTime<Utc>) -> Option<TimerTick> {
        if !timer.is_active {
            return None;
        }
        let elapsed_seconds = timer.elapsed_seconds(now);
        Some(TimerTick {
            elapsed_seconds,
            display: format_elapsed(elapsed_seconds),
        })
    }
}
