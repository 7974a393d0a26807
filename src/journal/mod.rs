//! DC-015: Run journal and content hashing.

pub mod eventlog;
pub mod hasher;

use serde::{Deserialize, Serialize};

/// Journal event, one JSON line each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        recipe: String,
        run_id: String,
        dbchef_version: String,
        mode: String,
    },
    StepFinished {
        recipe: String,
        step: String,
        priority: i32,
        duration_seconds: f64,
    },
    StepSkipped {
        recipe: String,
        step: String,
        priority: i32,
    },
    StepCancelled {
        recipe: String,
        step: String,
        priority: i32,
    },
    StepFailed {
        recipe: String,
        step: String,
        priority: i32,
        stage: String,
        error: String,
    },
    RunCompleted {
        recipe: String,
        run_id: String,
        steps_finished: u32,
        steps_skipped: u32,
        steps_cancelled: u32,
        steps_failed: u32,
        interrupted: bool,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: RunEvent,
}
