//! One build run, end to end.
//!
//! This module provides:
//! - [`context`] - The aggregate handed to engines and converters
//! - [`state`] - Run state machine and the recorded outcome
//! - [`orchestrator`] - The stage sequence
//! - [`cancel`] - Cancellation token checked between stages
//! - [`scratch`] - Temporary directories scoped to one engine call

pub mod cancel;
pub mod context;
pub mod orchestrator;
pub mod scratch;
pub mod state;

pub use cancel::CancelToken;
pub use context::BuildContext;
pub use orchestrator::{BuildRequest, Orchestrator};
pub use scratch::ScratchDir;
pub use state::{BuildOutcome, BuildState};

use time::OffsetDateTime;

/// Current UTC time as `YYYYMMDDTHHMMSSZ`, used to name build outputs.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
