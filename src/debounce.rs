//! Quiet-period debouncing.
//!
//! A [`Debouncer`] tracks a stable level and at most one candidate level. A
//! sample that differs from the stable level starts a candidate; the candidate
//! is promoted once it has gone unchallenged for the whole window. Bounces
//! inside the window therefore collapse into a single transition, stamped with
//! the instant the new level first appeared.

use std::time::Duration;

use crate::gpio::{EdgeDirection, PinState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub direction: EdgeDirection,
    pub at: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    level: bool,
    since: Duration,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    stable: Option<bool>,
    candidate: Option<Candidate>,
    last_sample: Option<Duration>,
    last_transition: Option<Duration>,
}

impl Debouncer {
    /// The first sample seeds the stable level without emitting anything.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stable: None,
            candidate: None,
            last_sample: None,
            last_transition: None,
        }
    }

    pub fn seeded(window: Duration, level: bool, at: Duration) -> Self {
        Self {
            stable: Some(level),
            last_sample: Some(at),
            ..Self::new(window)
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn stable(&self) -> Option<bool> {
        self.stable
    }

    pub fn is_settling(&self) -> bool {
        self.candidate.is_some()
    }

    /// When the pending candidate will be promoted if nothing contradicts it.
    pub fn deadline(&self) -> Option<Duration> {
        self.candidate.map(|c| c.since + self.window)
    }

    pub fn state(&self) -> Option<PinState> {
        self.stable.map(|level| PinState {
            level,
            last_sample: self.last_sample,
            last_transition: self.last_transition,
        })
    }

    /// Feed one raw sample. Timestamps older than the previous sample are
    /// clamped forward so emitted edges never go back in time.
    pub fn sample(&mut self, level: bool, at: Duration) -> Option<Transition> {
        let at = match self.last_sample {
            Some(last) if at < last => last,
            _ => at,
        };
        self.last_sample = Some(at);

        let promoted = self.poll(at);

        let Some(stable) = self.stable else {
            self.stable = Some(level);
            return promoted;
        };

        if level == stable {
            self.candidate = None;
            return promoted;
        }

        match self.candidate {
            Some(candidate) if candidate.level == level => {}
            _ if self.window.is_zero() && promoted.is_none() => {
                return Some(self.promote(level, at));
            }
            _ => self.candidate = Some(Candidate { level, since: at }),
        }
        promoted
    }

    /// Promote the candidate if its window has elapsed by `now`.
    pub fn poll(&mut self, now: Duration) -> Option<Transition> {
        let candidate = self.candidate?;
        if now.saturating_sub(candidate.since) < self.window {
            return None;
        }
        self.candidate = None;
        Some(self.promote(candidate.level, candidate.since))
    }

    fn promote(&mut self, level: bool, at: Duration) -> Transition {
        self.stable = Some(level);
        self.last_transition = Some(at);
        Transition {
            direction: EdgeDirection::towards(level),
            at,
        }
    }
}
