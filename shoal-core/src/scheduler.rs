//! Retry scheduling: per-chain backoff state machine and the protocol's random delays.
//!
//! A chain is driven by the host: send, sleep `delay()`, re-check the completion
//! predicate against live state, then call `advance`. The chain never sleeps or sends
//! itself, so it has no call-stack growth and stops as soon as the host stops driving it.

use std::time::Duration;

use rand::Rng;

/// Base unit of backup and restore backoff.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Upper bound of the random jitter added to retries and replies (inclusive, ms).
pub const JITTER_MAX_MS: u64 = 400;

/// Backup stops doubling at this multiplier of the base delay, then gives up.
pub const BACKUP_MAX_MULTIPLIER: u32 = 16;

/// Restore sends at most this many GETCHUNKs per chunk.
pub const RESTORE_MAX_SENDS: u32 = 5;

/// Delete broadcasts DELETE this many times.
pub const DELETE_SENDS: u32 = 5;

/// How the delay grows between sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Multiplier doubles after every unsatisfied check.
    Doubling,
    /// Jitter only.
    Flat,
}

/// Retry parameters for one kind of chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub growth: Growth,
    pub max_sends: u32,
    pub jitter_max_ms: u64,
}

impl RetryPolicy {
    /// PUTCHUNK: 1, 2, 4, 8, 16 x base, then give up.
    pub fn backup(base: Duration) -> Self {
        Self {
            base,
            growth: Growth::Doubling,
            max_sends: BACKUP_MAX_MULTIPLIER.trailing_zeros() + 1,
            jitter_max_ms: JITTER_MAX_MS,
        }
    }

    /// GETCHUNK: at most 5 sends, doubling from 1 x base.
    pub fn restore(base: Duration) -> Self {
        Self {
            base,
            growth: Growth::Doubling,
            max_sends: RESTORE_MAX_SENDS,
            jitter_max_ms: JITTER_MAX_MS,
        }
    }

    /// DELETE: fixed number of sends separated by jitter only.
    pub fn delete() -> Self {
        Self {
            base: Duration::ZERO,
            growth: Growth::Flat,
            max_sends: DELETE_SENDS,
            jitter_max_ms: JITTER_MAX_MS,
        }
    }
}

/// What the host does after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Predicate satisfied: stop, never resend.
    Done,
    /// Send again and wait `delay()`.
    Resend,
    /// Ceiling reached without satisfying the predicate.
    GiveUp,
}

/// State of one retry chain.
#[derive(Debug, Clone)]
pub struct RetryChain {
    policy: RetryPolicy,
    sends: u32,
    multiplier: u32,
}

impl RetryChain {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sends: 0,
            multiplier: 1,
        }
    }

    /// Sends recorded so far.
    pub fn sends(&self) -> u32 {
        self.sends
    }

    /// Record that the host just sent.
    pub fn record_send(&mut self) {
        self.sends = self.sends.saturating_add(1);
    }

    /// Wait before the next check, without jitter.
    pub fn base_delay(&self) -> Duration {
        match self.policy.growth {
            Growth::Doubling => self.policy.base * self.multiplier,
            Growth::Flat => self.policy.base,
        }
    }

    /// Wait before the next check: backoff plus random jitter.
    pub fn delay(&self) -> Duration {
        self.base_delay() + jitter(self.policy.jitter_max_ms)
    }

    /// Decide what happens after waiting. `satisfied` must be read from live state.
    pub fn advance(&mut self, satisfied: bool) -> Step {
        if satisfied {
            return Step::Done;
        }
        if self.sends >= self.policy.max_sends {
            return Step::GiveUp;
        }
        if self.policy.growth == Growth::Doubling {
            self.multiplier = self.multiplier.saturating_mul(2);
        }
        Step::Resend
    }
}

/// Random delay in `0..=max_ms` milliseconds.
pub fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Delay before a STORED/CHUNK reply or a re-backup, to desynchronize peers.
pub fn reply_delay() -> Duration {
    jitter(JITTER_MAX_MS)
}

/// Pause between successive PUTCHUNKs of one file: 10-30 ms.
pub fn pacing_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(10..30))
}
