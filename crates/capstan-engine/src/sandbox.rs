//! Deterministic sandbox primitives
//!
//! Everything nondeterministic a workflow can observe is derived from
//! the run itself: correlation ids come from a ULID generator seeded by
//! the run id and pinned to the run's creation timestamp, `random()`
//! draws from a run-seeded RNG, and `now()` follows a replay clock that
//! only advances to the persisted timestamps of consumed events. Two
//! replays of the same log therefore observe identical values.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use capstan_storage::{CorrelationId, HookId, RunId, StepId};

/// Seed material derived from the run id
fn run_seed(run_id: &RunId, domain: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_str().as_bytes());
    hasher.update(domain.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Deterministic correlation-id generator.
///
/// IDs are ULIDs whose timestamp half is the run's creation time and
/// whose random half comes from the seeded RNG, so the k-th id of every
/// replay is identical.
pub(crate) struct DeterministicIds {
    timestamp_ms: u64,
    rng: StdRng,
}

impl DeterministicIds {
    pub fn new(run_id: &RunId, created_at: DateTime<Utc>) -> Self {
        Self {
            timestamp_ms: created_at.timestamp_millis().max(0) as u64,
            rng: StdRng::seed_from_u64(run_seed(run_id, "ids")),
        }
    }

    fn next_ulid(&mut self) -> Ulid {
        Ulid::from_parts(self.timestamp_ms, self.rng.gen::<u128>())
    }

    pub fn next_step(&mut self) -> StepId {
        StepId::from_ulid(self.next_ulid())
    }

    pub fn next_hook(&mut self) -> HookId {
        HookId::from_ulid(self.next_ulid())
    }

    pub fn next_wait(&mut self) -> CorrelationId {
        CorrelationId::new(format!("wait_{}", self.next_ulid()))
    }

    pub fn next_stream_name(&mut self) -> String {
        format!("strm_{}", self.next_ulid())
    }

    pub fn next_token(&mut self) -> String {
        format!("whk_{}", self.next_ulid())
    }
}

/// Run-seeded RNG behind `ctx.random()`
pub(crate) struct SandboxRng {
    rng: StdRng,
}

impl SandboxRng {
    pub fn new(run_id: &RunId) -> Self {
        Self {
            rng: StdRng::seed_from_u64(run_seed(run_id, "random")),
        }
    }

    pub fn random(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

/// Replay-controlled monotonic clock.
///
/// Starts at the run's creation time and advances only when the replay
/// consumes an event, to that event's persisted timestamp.
pub(crate) struct ReplayClock {
    now: DateTime<Utc>,
}

impl ReplayClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: start }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn advance_to(&mut self, ts: DateTime<Utc>) {
        if ts > self.now {
            self.now = ts;
        }
    }
}
