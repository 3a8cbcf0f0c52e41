use tracing::trace;
use transport::{Transport, TransportError, TransportResult};

use crate::config::{ScenarioConfig, ScenarioKind};
use crate::frame::frame_payload;
use crate::stats::StatsSink;

/// What a single [`ScenarioDriver::step`] achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    /// Frames accepted during this step.
    pub sent: u32,
    /// The transport pushed back; call again after the peer drains.
    pub blocked: bool,
}

/// Issues sequenced frames on a sender transport following a scenario.
pub struct ScenarioDriver<S> {
    config: ScenarioConfig,
    stats: S,
    state: ScenarioState,
}

enum ScenarioState {
    Flood {
        frame_count: u32,
        current: u32,
    },
    Burst {
        bursts: u32,
        burst_size: u32,
        current_burst: u32,
        current_offset: u32,
    },
    Backpressure {
        frames: u32,
        produced: u32,
    },
}

impl<S: StatsSink> ScenarioDriver<S> {
    pub fn new(config: ScenarioConfig, stats: S) -> Self {
        let state = match config.kind {
            ScenarioKind::Flood { frame_count } => ScenarioState::Flood {
                frame_count,
                current: 0,
            },
            ScenarioKind::Burst { bursts, burst_size } => ScenarioState::Burst {
                bursts,
                burst_size,
                current_burst: 0,
                current_offset: 0,
            },
            ScenarioKind::Backpressure { frames } => ScenarioState::Backpressure {
                frames,
                produced: 0,
            },
        };
        Self {
            config,
            stats,
            state,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.state {
            ScenarioState::Flood {
                frame_count,
                current,
            } => current >= frame_count,
            ScenarioState::Burst {
                bursts,
                current_burst,
                ..
            } => current_burst >= bursts,
            ScenarioState::Backpressure { frames, produced } => produced >= frames,
        }
    }

    /// Sends as much as the scenario allows right now. Backpressure is
    /// recorded and ends the step; any other transport error is returned.
    pub fn step(&mut self, transport: &Transport) -> TransportResult<StepOutcome> {
        let stats = &self.stats;
        let payload_len = self.config.payload_len;
        let budget = self.config.step_budget;
        let mut outcome = StepOutcome {
            sent: 0,
            blocked: false,
        };

        match &mut self.state {
            ScenarioState::Flood {
                frame_count,
                current,
            } => {
                while *current < *frame_count && outcome.sent < budget {
                    if !Self::produce_frame(transport, stats, *current, payload_len)? {
                        outcome.blocked = true;
                        break;
                    }
                    *current += 1;
                    outcome.sent += 1;
                }
            }
            ScenarioState::Burst {
                bursts,
                burst_size,
                current_burst,
                current_offset,
            } => {
                if *current_burst < *bursts {
                    while *current_offset < *burst_size {
                        let seq = *current_burst * *burst_size + *current_offset;
                        if !Self::produce_frame(transport, stats, seq, payload_len)? {
                            outcome.blocked = true;
                            break;
                        }
                        *current_offset += 1;
                        outcome.sent += 1;
                    }
                    if *current_offset == *burst_size {
                        *current_offset = 0;
                        *current_burst += 1;
                    }
                }
            }
            ScenarioState::Backpressure { frames, produced } => {
                while *produced < *frames {
                    if !Self::produce_frame(transport, stats, *produced, payload_len)? {
                        outcome.blocked = true;
                        break;
                    }
                    *produced += 1;
                    outcome.sent += 1;
                }
            }
        }
        trace!(
            backend = ?transport.backend_kind(),
            sent = outcome.sent,
            blocked = outcome.blocked,
            "scenario step"
        );
        Ok(outcome)
    }

    fn produce_frame(
        transport: &Transport,
        stats: &S,
        seq: u32,
        payload_len: usize,
    ) -> TransportResult<bool> {
        let before = transport.queued_frames();
        match transport.transfer(&frame_payload(seq, payload_len), &[]) {
            Ok(()) => {
                let depth = transport.queued_frames();
                stats.with_stats(|stats| {
                    stats.produced = stats.produced.wrapping_add(1);
                    if depth > before {
                        stats.queued = stats.queued.wrapping_add(1);
                    }
                    stats.max_queue_depth = stats.max_queue_depth.max(depth as u32);
                });
                Ok(true)
            }
            Err(TransportError::Backpressure { .. }) => {
                stats.with_stats(|stats| {
                    stats.backpressured = stats.backpressured.wrapping_add(1);
                });
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
