use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::states::JobState;

/// Jobs with a priority below this value are counted as urgent.
pub const URGENT_THRESHOLD: u32 = 1024;

/// A job identifier. IDs start at 1, increase strictly in creation order,
/// and are never reused for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct JobId(NonZeroU64);

impl JobId {
    /// The ID assigned to the first job ever created.
    pub fn first() -> Self {
        Self(NonZeroU64::MIN)
    }

    /// The ID following this one.
    pub fn succ(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Converts a raw wire-level ID. Zero is not a valid ID.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A job priority. Lower values are served first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct Pri(u32);

impl Pri {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_urgent(self) -> bool {
        self.0 < URGENT_THRESHOLD
    }
}

/// The unit of work. A job is always owned by exactly one collection (ready
/// heap, delay heap, a connection's reservation set, or the graveyard) and
/// moves between them as it changes state.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub pri: Pri,
    /// Initial delay in seconds, as submitted. Kept for `stats <id>`.
    pub delay: u32,
    /// Time-to-run in seconds. Always at least 1.
    pub ttr: u32,
    /// Body bytes, excluding the wire CRLF framing. Immutable after `put`,
    /// so replies can share it without copying.
    pub body: Bytes,
    pub created: Instant,
    pub state: JobState,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

impl Job {
    pub fn new(
        id: JobId,
        pri: Pri,
        delay: u32,
        ttr: u32,
        body: Bytes,
        now: Instant,
    ) -> Self {
        Self {
            id,
            pri,
            delay,
            // A zero TTR would expire in the same tick the reservation is
            // granted.
            ttr: ttr.max(1),
            body,
            created: now,
            state: JobState::Ready,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }

    pub fn ttr_duration(&self) -> Duration {
        Duration::from_secs(self.ttr as u64)
    }

    /// Seconds since this job was created.
    pub fn age_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.created).as_secs()
    }

    /// Seconds until the state-specific deadline passes: readiness for a
    /// delayed job, reservation expiry for a reserved one, zero otherwise.
    pub fn time_left_secs(&self, now: Instant) -> u64 {
        match self.state {
            JobState::Delayed { until } => {
                until.saturating_duration_since(now).as_secs()
            },
            JobState::Reserved { deadline } => {
                deadline.saturating_duration_since(now).as_secs()
            },
            JobState::Ready | JobState::Buried => 0,
        }
    }
}
