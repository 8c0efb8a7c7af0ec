//! Cross-clock alignment of logged events onto the recording's frames.
//!
//! The event log and the motion-capture system keep independent clocks.
//! Each event is assigned the first frame whose elapsed time is not
//! earlier than the event's own elapsed time (left insertion into the
//! frame clock), and its archive time becomes that frame's time, so the
//! event table is always frame-quantized.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::events::EventLog;

/// What to do with an event stamped after the last recorded frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Assign the last frame and count the event as clamped.
    #[default]
    Clamp,
    /// Fail the alignment.
    Reject,
}

#[derive(Debug, Error, PartialEq)]
pub enum AlignError {
    #[error("reference clock has no frames")]
    EmptyReference,
    #[error("reference clock has {frames} frames but {times} times")]
    LengthMismatch { frames: usize, times: usize },
    #[error("reference clock is not sorted at position {0}")]
    Unsorted(usize),
    #[error("event at {time}s falls after the last frame ({last}s)")]
    AfterLastFrame { time: f64, last: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub frame: u64,
    pub time: f64,
    pub clamped: bool,
}

/// Frame numbers paired with their elapsed times, sorted by time.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frames: Vec<u64>,
    times: Vec<f64>,
}

impl FrameClock {
    pub fn new(frames: Vec<u64>, times: Vec<f64>) -> Result<Self, AlignError> {
        if frames.len() != times.len() {
            return Err(AlignError::LengthMismatch {
                frames: frames.len(),
                times: times.len(),
            });
        }
        if times.is_empty() {
            return Err(AlignError::EmptyReference);
        }
        if let Some(pos) = times.windows(2).position(|w| !(w[0] <= w[1])) {
            return Err(AlignError::Unsorted(pos + 1));
        }
        Ok(Self { frames, times })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The returned frame is the recording's frame label at the insertion
    /// position, not the position itself; the two differ only for
    /// recordings with gaps or a non-zero first frame.
    pub fn place(&self, time: f64, policy: OverflowPolicy) -> Result<Placement, AlignError> {
        let mut idx = insertion_index(&self.times, time);
        let mut clamped = false;
        if idx == self.times.len() {
            let last = self.times[idx - 1];
            match policy {
                OverflowPolicy::Clamp => {
                    idx -= 1;
                    clamped = true;
                }
                OverflowPolicy::Reject => return Err(AlignError::AfterLastFrame { time, last }),
            }
        }
        Ok(Placement {
            frame: self.frames[idx],
            time: self.times[idx],
            clamped,
        })
    }
}

/// Leftmost position whose reference time is not smaller than `t`.
pub fn insertion_index(sorted: &[f64], t: f64) -> usize {
    sorted.partition_point(|&r| r < t)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedEvents {
    pub frames: Vec<u64>,
    pub times: Vec<f64>,
    pub names: Vec<String>,
    pub arguments: Vec<String>,
    pub exp_times: Vec<f64>,
    pub extra: Vec<(String, Vec<String>)>,
    /// Frames of phase-start events in log order; may repeat or go back.
    pub phase_start_frames: Vec<u64>,
    pub clamped: usize,
}

impl AlignedEvents {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

pub fn align_events(
    clock: &FrameClock,
    log: &EventLog,
    phase_prefix: &str,
    policy: OverflowPolicy,
) -> Result<AlignedEvents, AlignError> {
    let mut out = AlignedEvents {
        extra: log
            .extra_columns
            .iter()
            .map(|name| (name.clone(), Vec::with_capacity(log.len())))
            .collect(),
        ..AlignedEvents::default()
    };
    for record in &log.records {
        let placement = clock.place(record.exp_time, policy)?;
        if placement.clamped {
            out.clamped += 1;
        }
        out.frames.push(placement.frame);
        out.times.push(placement.time);
        out.names.push(record.name.clone());
        out.arguments.push(record.arguments.clone());
        out.exp_times.push(record.exp_time);
        for ((_, column), value) in out.extra.iter_mut().zip(&record.extra) {
            column.push(value.clone());
        }
    }
    out.phase_start_frames = phase_start_frames(&out.names, &out.frames, phase_prefix);
    if out.clamped > 0 {
        warn!(
            clamped = out.clamped,
            "events after the last recorded frame were clamped to it"
        );
    }
    Ok(out)
}

pub fn phase_start_frames(names: &[String], frames: &[u64], prefix: &str) -> Vec<u64> {
    names
        .iter()
        .zip(frames)
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(_, &frame)| frame)
        .collect()
}
