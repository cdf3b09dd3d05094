use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::image::Image;

/// Where a run is. A run only moves forward; `Failed` and `Done` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Init,
    ConfigResolved,
    EngineSelected,
    DistroResolved,
    ImageMerged,
    Configured,
    /// Converting to the output at this index.
    Converting(usize),
    Done,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Init => f.write_str("init"),
            BuildState::ConfigResolved => f.write_str("config-resolved"),
            BuildState::EngineSelected => f.write_str("engine-selected"),
            BuildState::DistroResolved => f.write_str("distro-resolved"),
            BuildState::ImageMerged => f.write_str("image-merged"),
            BuildState::Configured => f.write_str("configured"),
            BuildState::Converting(i) => write!(f, "converting({i})"),
            BuildState::Done => f.write_str("done"),
            BuildState::Failed => f.write_str("failed"),
        }
    }
}

/// Everything observable about a finished run, including partial results.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Every state entered, in order.
    pub history: Vec<BuildState>,
    /// Image realized by the engine, if it got that far.
    pub configured: Option<Image>,
    /// Conversion results, one per finished output.
    pub converted: Vec<Image>,
    pub result: Result<Image>,
}

/// Accumulates states and partial results while a run is in flight.
#[derive(Debug)]
pub(crate) struct Progress {
    history: Vec<BuildState>,
    pub configured: Option<Image>,
    pub converted: Vec<Image>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            history: vec![BuildState::Init],
            configured: None,
            converted: Vec::new(),
        }
    }

    pub fn enter(&mut self, state: BuildState) {
        debug!("build state: {}", state);
        self.history.push(state);
    }

    pub fn last(&self) -> BuildState {
        self.history.last().copied().unwrap_or(BuildState::Init)
    }

    /// Close the run with `Done` or `Failed` depending on `result`.
    pub fn finish(mut self, result: Result<Image>) -> BuildOutcome {
        self.enter(match result {
            Ok(_) => BuildState::Done,
            Err(_) => BuildState::Failed,
        });
        BuildOutcome {
            history: self.history,
            configured: self.configured,
            converted: self.converted,
            result,
        }
    }
}

impl BuildOutcome {
    pub fn state(&self) -> BuildState {
        self.history.last().copied().unwrap_or(BuildState::Init)
    }

    /// The last state reached before the run failed.
    pub fn failed_at(&self) -> Option<BuildState> {
        if self.state() != BuildState::Failed {
            return None;
        }
        self.history.iter().rev().nth(1).copied()
    }

    pub fn is_success(&self) -> bool {
        self.state() == BuildState::Done && self.result.is_ok()
    }

    pub fn into_result(self) -> Result<Image> {
        self.result
    }
}
