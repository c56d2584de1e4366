use tokio::time::Instant;

use serde::Serialize;

/// The lifecycle state of a job, with the state-specific deadline embedded.
///
/// The containing collection is authoritative: a `Ready` job lives in the
/// ready heap, a `Delayed` job in the delay heap, a `Reserved` job in the
/// reserving connection's set, and a `Buried` job in the graveyard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Ready,
    /// Becomes ready once `until` passes.
    Delayed { until: Instant },
    /// The reservation expires at `deadline` unless the worker deletes,
    /// releases, or buries the job first.
    Reserved { deadline: Instant },
    Buried,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed { .. } => "delayed",
            Reserved { .. } => "reserved",
            Buried => "buried",
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
