//! Test-run orchestration: a pure state machine driven by a single actor task.

pub mod actor;
pub mod machine;

pub use actor::{
    RunNotice, RunSnapshot, RunTimings, SyncTrigger, TestRunDeps, TestRunOrchestrator,
    callback_headers,
};
pub use machine::{RunContext, RunState, StateTag, is_fully_configured};
