//! Adaptive poll interval and pause/resume bookkeeping.

use std::time::Duration;
use tokio::time::Instant;

pub const MIN_INTERVAL_MS: u64 = 5_000;
pub const MAX_INTERVAL_MS: u64 = 20_000;

/// Voice call or chat request in progress.
pub const ACTIVE_INTERVAL_MS: u64 = 5_000;
/// Activity within [`RECENT_WINDOW`]; also what any activity signal resets to.
pub const RECENT_INTERVAL_MS: u64 = 8_000;
/// Activity within [`IDLE_WINDOW`].
pub const WARM_INTERVAL_MS: u64 = 10_000;
pub const IDLE_INTERVAL_MS: u64 = 15_000;

pub const RECENT_WINDOW: Duration = Duration::from_millis(120_000);
pub const IDLE_WINDOW: Duration = Duration::from_millis(600_000);

/// Pause only once more than this many polls in a row came back empty.
pub const PAUSE_AFTER_EMPTY_POLLS: u32 = 5;
/// Beyond this many empty polls the interval is stretched by 6/5.
pub const DAMPEN_AFTER_EMPTY_POLLS: u32 = 25;
/// A failed fetch counts as one empty poll plus this much.
pub const FAILURE_PENALTY: u32 = 2;

/// What to do after a poll completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    After(Duration),
    Paused,
}

#[derive(Debug, Clone)]
pub struct DeliveryState {
    pub session_id: String,
    pub poll_interval_ms: u64,
    pub last_activity_at: Instant,
    pub consecutive_empty_polls: u32,
    pub is_paused: bool,
    pub last_delivered_count: usize,
    pub voice_active: bool,
    pub chat_active: bool,
}

impl DeliveryState {
    pub fn new(session_id: &str, now: Instant) -> Self {
        Self {
            session_id: session_id.to_string(),
            poll_interval_ms: RECENT_INTERVAL_MS,
            last_activity_at: now,
            consecutive_empty_polls: 0,
            is_paused: false,
            last_delivered_count: 0,
            voice_active: false,
            chat_active: false,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns true if this woke a paused client.
    pub fn mark_activity(&mut self, now: Instant) -> bool {
        self.consecutive_empty_polls = 0;
        self.last_activity_at = now;
        self.poll_interval_ms = RECENT_INTERVAL_MS;

        let resumed = self.is_paused;
        self.is_paused = false;
        resumed
    }

    pub fn set_voice_active(&mut self, active: bool, now: Instant) -> bool {
        self.voice_active = active;
        if active {
            self.mark_activity(now)
        } else {
            false
        }
    }

    pub fn set_chat_active(&mut self, active: bool, now: Instant) -> bool {
        self.chat_active = active;
        if active {
            self.mark_activity(now)
        } else {
            false
        }
    }

    pub fn record_poll(&mut self, new_entries: usize) {
        if new_entries > 0 {
            self.consecutive_empty_polls = 0;
        } else {
            self.consecutive_empty_polls = self.consecutive_empty_polls.saturating_add(1);
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_empty_polls = self
            .consecutive_empty_polls
            .saturating_add(1 + FAILURE_PENALTY);
    }

    fn flagged_active(&self) -> bool {
        self.voice_active || self.chat_active
    }

    /// Re-evaluates the interval after a poll. May pause the client.
    pub fn next_schedule(&mut self, now: Instant) -> Schedule {
        let since_activity = now.saturating_duration_since(self.last_activity_at);

        if !self.flagged_active()
            && since_activity > IDLE_WINDOW
            && self.consecutive_empty_polls > PAUSE_AFTER_EMPTY_POLLS
        {
            self.is_paused = true;
            return Schedule::Paused;
        }

        let mut interval = if self.flagged_active() {
            ACTIVE_INTERVAL_MS
        } else if since_activity < RECENT_WINDOW {
            RECENT_INTERVAL_MS
        } else if since_activity < IDLE_WINDOW {
            WARM_INTERVAL_MS
        } else {
            IDLE_INTERVAL_MS
        };

        if self.consecutive_empty_polls > DAMPEN_AFTER_EMPTY_POLLS {
            interval = (interval * 6 / 5).min(MAX_INTERVAL_MS);
        }

        self.poll_interval_ms = interval.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        self.is_paused = false;
        Schedule::After(self.poll_interval())
    }
}
