// THEORY:
// A `TrackingUnit` is everything the system knows about one animal: its ROI,
// a locator with its learned state, a bounded history of where the animal has
// been, and optionally the stimulator acting on it.
//
// Key architectural principles:
// 1.  **Exclusive Ownership**: a unit is only ever mutated by the single loop
//     iteration that processes its ROI for the current frame (`&mut self`).
//     Different units share nothing mutable, so they can be processed in any
//     order or in parallel.
// 2.  **Inference Policy**: a missed frame is normal. When the locator finds
//     nothing, the unit repeats the last known position flagged
//     `is_inferred = true`, but only while the last real detection is recent
//     enough. Past that window the unit emits nothing, and the gap in the
//     results is the signal that the animal was lost.
// 3.  **Bounded Memory**: history is a time window, not a count. The oldest
//     entries are evicted as soon as the retained span exceeds
//     `max_history_ms`, whatever the frame rate.
// 4.  **Relative Storage, Absolute on Demand**: positions are stored in ROI
//     coordinates; `get_last_positions(true)` shifts them by the ROI offset.

use crate::core_modules::roi::Roi;
use crate::core_modules::stimulators::{DecisionContext, Interaction, Stimulator};
use crate::core_modules::tracker::{Locate, Locator};
use crate::core_modules::variables::{DataPoint, Variable, VariableKind};
use crate::error::TrackingError;
use image::GrayImage;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Time windows of the inference and history policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingLimits {
    pub max_inference_ms: i64,
    pub max_history_ms: i64,
}

impl Default for TrackingLimits {
    fn default() -> Self {
        Self {
            max_inference_ms: 30_000,
            max_history_ms: 250_000,
        }
    }
}

pub struct TrackingUnit<L: Locate = Locator> {
    roi: Arc<Roi>,
    locator: L,
    state: L::State,
    stimulator: Option<Stimulator>,
    limits: TrackingLimits,
    positions: VecDeque<Vec<DataPoint>>,
    times: VecDeque<i64>,
    last_non_inferred_time: Option<i64>,
    last_time_point: i64,
    last_interaction: Interaction,
}

impl<L: Locate> std::fmt::Debug for TrackingUnit<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingUnit")
            .field("roi", &self.roi.idx())
            .field("history", &self.times.len())
            .field("last_time_point", &self.last_time_point)
            .field("stimulator", &self.stimulator.is_some())
            .finish()
    }
}

impl<L: Locate> TrackingUnit<L> {
    pub fn new(roi: Arc<Roi>, locator: L, stimulator: Option<Stimulator>, limits: TrackingLimits) -> Self {
        let state = locator.initial_state();
        Self {
            roi,
            locator,
            state,
            stimulator,
            limits,
            positions: VecDeque::new(),
            times: VecDeque::new(),
            last_non_inferred_time: None,
            last_time_point: 0,
            last_interaction: Interaction::none(),
        }
    }

    pub fn roi(&self) -> &Arc<Roi> {
        &self.roi
    }

    pub fn positions(&self) -> &VecDeque<Vec<DataPoint>> {
        &self.positions
    }

    pub fn times(&self) -> &VecDeque<i64> {
        &self.times
    }

    pub fn last_time_point(&self) -> i64 {
        self.last_time_point
    }

    pub fn last_interaction(&self) -> Interaction {
        self.last_interaction
    }

    pub fn locator_state(&self) -> &L::State {
        &self.state
    }

    /// Tracks the animal in `frame` at `t` ms, using the system clock for the scheduler.
    pub fn track(&mut self, t: i64, frame: &GrayImage) -> Result<Vec<DataPoint>, TrackingError> {
        let now_s = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.track_at(t, frame, now_s)
    }

    /// As `track`, with an explicit wall clock (unix seconds) for the scheduler.
    pub fn track_at(&mut self, t: i64, frame: &GrayImage, wall_clock_s: f64) -> Result<Vec<DataPoint>, TrackingError> {
        if let Some(&last) = self.times.back() {
            if t < last {
                return Err(TrackingError::TimeReversal { previous: last, current: t });
            }
        }
        self.last_time_point = t;

        let (sub_image, mask) = self.roi.apply(frame)?;
        let located = self.locator.locate(&mut self.state, &sub_image, mask, t)?;

        let mut rows = match located {
            Some(points) if points.is_empty() => return Ok(points),
            Some(points) => {
                self.last_non_inferred_time = Some(t);
                points
                    .into_iter()
                    .map(|mut p| {
                        p.append(Variable::boolean(VariableKind::IsInferred, false));
                        p
                    })
                    .collect()
            }
            None => self.infer_position(t),
        };

        if rows.is_empty() {
            return Ok(rows);
        }

        self.positions.push_back(rows.clone());
        self.times.push_back(t);
        self.evict_history();

        if self.stimulator.is_some() {
            let interaction = self.apply_stimulator(wall_clock_s);
            for row in &mut rows {
                row.append(Variable::int(VariableKind::HasInteracted, interaction.has_interacted as i64));
                row.append(Variable::int(VariableKind::InteractionDuration, interaction.duration as i64));
            }
        }

        Ok(rows)
    }

    fn infer_position(&self, t: i64) -> Vec<DataPoint> {
        let Some(last_real) = self.last_non_inferred_time else {
            return Vec::new();
        };
        if t - last_real > self.limits.max_inference_ms {
            return Vec::new();
        }
        let Some(previous) = self.positions.back() else {
            return Vec::new();
        };
        previous
            .iter()
            .map(|p| {
                let mut p = p.clone();
                p.append(Variable::boolean(VariableKind::IsInferred, true));
                p
            })
            .collect()
    }

    fn evict_history(&mut self) {
        while let (Some(&oldest), Some(&newest)) = (self.times.front(), self.times.back()) {
            if newest - oldest <= self.limits.max_history_ms {
                break;
            }
            self.times.pop_front();
            self.positions.pop_front();
        }
    }

    fn apply_stimulator(&mut self, wall_clock_s: f64) -> Interaction {
        let ctx = DecisionContext {
            roi_idx: self.roi.idx(),
            longest_axis: self.roi.longest_axis(),
            positions: &self.positions,
            times: &self.times,
            last_time_point: self.last_time_point,
            wall_clock_s,
        };
        let interaction = match self.stimulator.as_mut().map(|s| s.apply(&ctx)) {
            Some(Ok(interaction)) => interaction,
            Some(Err(e)) => {
                warn!("ROI {} at {} ms: stimulator failed: {}", self.roi.idx(), self.last_time_point, e);
                Interaction::none()
            }
            None => Interaction::none(),
        };
        self.last_interaction = interaction;
        interaction
    }

    /// Last retained positions; shifted to frame coordinates when `absolute`.
    pub fn get_last_positions(&self, absolute: bool) -> Vec<DataPoint> {
        let Some(last) = self.positions.back() else {
            return Vec::new();
        };
        if !absolute {
            return last.clone();
        }
        let (dx, dy) = self.roi.offset();
        last.iter().map(|p| p.with_offset(dx as i64, dy as i64)).collect()
    }
}
