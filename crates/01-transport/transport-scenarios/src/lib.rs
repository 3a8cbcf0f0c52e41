#![allow(missing_docs)]
//! Sequenced-frame traffic generators for exercising a [`transport::Transport`]
//! pair, plus checks over what the receiving side drained.

mod checks;
mod config;
mod engine;
mod frame;
mod stats;

pub use checks::{verify_backpressure, verify_burst, verify_flood, CheckResult, DrainReport};
pub use config::{ScenarioConfig, ScenarioKind};
pub use engine::{ScenarioDriver, StepOutcome};
pub use frame::{decode_frames, frame_payload, FRAME_HEADER_LEN};
pub use stats::{ScenarioStats, StatsSink};
