//! Idle detection for supervised agents.
//!
//! A long-lived assistant occasionally goes quiet without exiting. The
//! detector tracks time since the last output and, once per stall episode,
//! asks the supervisor to nudge the agent. Activity resets the episode.

use std::time::{Duration, Instant};

/// Outcome of a stall check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// Output seen within the window.
    Active,
    /// The idle window elapsed; nudge the agent once.
    Nudge,
    /// Already nudged this episode; keep waiting.
    AlreadyNudged,
}

/// Timer-based stall detector with a single nudge per episode.
pub struct StallDetector {
    window: Duration,
    last_activity: Instant,
    nudged: bool,
}

/// What the supervisor types at a stalled agent.
pub const NUDGE_MESSAGE: &str = "Please continue working on the task.";

impl StallDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_activity: Instant::now(),
            nudged: false,
        }
    }

    /// Record agent output, resetting the episode.
    pub fn activity(&mut self) {
        self.last_activity = Instant::now();
        self.nudged = false;
    }

    /// Check the idle timer; called whenever the poll loop times out.
    pub fn check(&mut self) -> StallCheck {
        if self.last_activity.elapsed() < self.window {
            return StallCheck::Active;
        }
        if self.nudged {
            return StallCheck::AlreadyNudged;
        }
        self.nudged = true;
        StallCheck::Nudge
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }
}
