/// Traffic shape issued by a [`ScenarioDriver`](crate::ScenarioDriver).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Steady stream of frames, at most one step's worth at a time.
    Flood { frame_count: u32 },
    /// `bursts` rounds of `burst_size` back-to-back frames, one round per step.
    Burst { bursts: u32, burst_size: u32 },
    /// Sends without yielding until the transport pushes back.
    Backpressure { frames: u32 },
}

impl ScenarioKind {
    pub fn total_frames(&self) -> u32 {
        match *self {
            ScenarioKind::Flood { frame_count } => frame_count,
            ScenarioKind::Burst { bursts, burst_size } => bursts.saturating_mul(burst_size),
            ScenarioKind::Backpressure { frames } => frames,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScenarioConfig {
    pub kind: ScenarioKind,
    /// Bytes per frame, header included.
    pub payload_len: usize,
    /// Frames issued per step at most, for kinds that yield between frames.
    pub step_budget: u32,
}

impl ScenarioConfig {
    pub const DEFAULT_PAYLOAD_LEN: usize = 64;
    pub const DEFAULT_STEP_BUDGET: u32 = 100;

    pub fn flood(frame_count: u32) -> Self {
        Self::new(ScenarioKind::Flood { frame_count })
    }

    pub fn burst(bursts: u32, burst_size: u32) -> Self {
        Self::new(ScenarioKind::Burst { bursts, burst_size })
    }

    pub fn backpressure(frames: u32) -> Self {
        Self::new(ScenarioKind::Backpressure { frames })
    }

    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    fn new(kind: ScenarioKind) -> Self {
        Self {
            kind,
            payload_len: Self::DEFAULT_PAYLOAD_LEN,
            step_budget: Self::DEFAULT_STEP_BUDGET,
        }
    }
}
