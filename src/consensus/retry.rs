use std::time::Duration;

/// Client-side failover policy for submits that land on a deposed or
/// unreachable leader.
#[derive(Debug, Clone, Copy)]
pub struct FailoverConfig {
    /// Total attempts across all replicas before surfacing the error.
    pub max_attempts: u32,
    /// Base wait between retries against the same replica.
    pub base_wait: Duration,
    /// Attempts against one replica before advancing to the next.
    pub attempts_per_leader: u32,
}

impl FailoverConfig {
    pub fn new(max_attempts: u32, base_wait: Duration) -> Self {
        Self {
            max_attempts,
            base_wait,
            attempts_per_leader: 3,
        }
    }
}

/// One step of the schedule: how long to wait, and whether to move on to the
/// next replica first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverStep {
    pub advance_leader: bool,
    pub wait: Duration,
}

/// Two-phase back-off: a few same-leader attempts with a growing wait, then
/// advance to the next replica with the wait reset. A fresh leader hint
/// short-circuits straight to the hinted replica.
#[derive(Debug)]
pub struct FailoverSchedule {
    config: FailoverConfig,
    attempts: u32,
    attempts_on_current: u32,
}

impl FailoverSchedule {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            attempts: 0,
            attempts_on_current: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next step, or `None` once the attempt budget is exhausted.
    pub fn next(&mut self) -> Option<FailoverStep> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        if self.attempts_on_current < self.config.attempts_per_leader {
            self.attempts_on_current += 1;
            let wait = self
                .config
                .base_wait
                .saturating_mul(self.attempts_on_current);
            Some(FailoverStep {
                advance_leader: false,
                wait,
            })
        } else {
            self.attempts_on_current = 1;
            Some(FailoverStep {
                advance_leader: true,
                wait: self.config.base_wait,
            })
        }
    }

    /// A leader hint restarts the same-leader phase against the hinted node.
    pub fn note_leader_hint(&mut self) {
        self.attempts_on_current = 0;
    }
}
