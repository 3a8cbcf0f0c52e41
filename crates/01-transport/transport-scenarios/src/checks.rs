use crate::stats::ScenarioStats;

/// What the receiving side observed.
pub struct DrainReport<'a> {
    /// Frame sequence numbers in arrival order.
    pub frames: &'a [u32],
    /// Deepest send queue seen by the sender, if tracked.
    pub max_queue_depth: Option<usize>,
}

pub type CheckResult = Result<(), String>;

fn verify_sequence(drain: &DrainReport<'_>, stats: &ScenarioStats, expected_frames: u32) -> CheckResult {
    if drain.frames.len() as u32 != expected_frames {
        return Err(format!(
            "drained {} frames (expected {})",
            drain.frames.len(),
            expected_frames
        ));
    }
    if let Some(position) = drain
        .frames
        .iter()
        .enumerate()
        .position(|(i, seq)| *seq != i as u32)
    {
        return Err(format!(
            "frame order broken at position {position}: got {}",
            drain.frames[position]
        ));
    }
    if stats.produced != expected_frames {
        return Err(format!(
            "stats produced {} frames (expected {})",
            stats.produced, expected_frames
        ));
    }
    Ok(())
}

pub fn verify_flood(
    drain: &DrainReport<'_>,
    stats: &ScenarioStats,
    expected_frames: u32,
) -> CheckResult {
    verify_sequence(drain, stats, expected_frames)?;
    if stats.backpressured != 0 {
        return Err(format!(
            "flood hit backpressure {} times (expected 0)",
            stats.backpressured
        ));
    }
    Ok(())
}

pub fn verify_burst(
    drain: &DrainReport<'_>,
    stats: &ScenarioStats,
    expected_frames: u32,
    queue_budget: usize,
) -> CheckResult {
    verify_sequence(drain, stats, expected_frames)?;
    if let Some(depth) = drain.max_queue_depth {
        if depth > queue_budget {
            return Err(format!(
                "send queue depth {} exceeded budget {}",
                depth, queue_budget
            ));
        }
    }
    if stats.max_queue_depth as usize > queue_budget {
        return Err(format!(
            "stats saw queue depth {} over budget {}",
            stats.max_queue_depth, queue_budget
        ));
    }
    Ok(())
}

pub fn verify_backpressure(
    drain: &DrainReport<'_>,
    stats: &ScenarioStats,
    expected_frames: u32,
) -> CheckResult {
    verify_sequence(drain, stats, expected_frames)?;
    if stats.backpressured == 0 {
        return Err("backpressure scenario never saw the transport push back".into());
    }
    if stats.queued == 0 {
        return Err("backpressure scenario never queued a frame".into());
    }
    Ok(())
}
