//! # Event log + entity store
//!
//! The append-only per-run event log is the source of truth for the
//! engine. Run, step, hook, and wait rows are a materialized cache,
//! updated synchronously in the same transaction as each event append.
//! Conditional state transitions make concurrent appends
//! commutative-or-rejected, which is what lets two racing workflow
//! continuations converge on one log.
//!
//! Two backends ship here: [`MemoryStorage`] (tests, local world) and
//! [`PostgresStorage`] (production). The named stream store and its
//! coalescing writer live in [`stream`].

mod event;
mod ids;
mod memory;
mod model;
mod postgres;
mod state;
mod store;
pub mod stream;

pub use event::{Event, EventData};
pub use ids::{wait_key, CorrelationId, EventId, HookId, IdParseError, RunId, StepId};
pub use memory::MemoryStorage;
pub use model::{
    Hook, RunStatus, StepRecord, StepStatus, Wait, WaitStatus, WorkflowRun, CURRENT_SPEC_VERSION,
    MIN_SUPPORTED_SPEC_VERSION,
};
pub use postgres::PostgresStorage;
pub use store::{
    load_all_events, CreateEvent, EventOrder, EventOutcome, EventPage, Page, Pagination,
    RunFilter, Storage, StoreError,
};
pub use stream::{
    MemoryStreamStore, StreamError, StreamStore, StreamWriter, STREAM_FLUSH_INTERVAL,
};

// The structured error blob is shared with the codec.
pub use capstan_codec::ErrorValue;
