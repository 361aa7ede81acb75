// THEORY:
// Whether the animal moved between the last two frames is the primitive most
// stimulators are built on. The tracker stores displacement as
// `log10(1/W + d/W) * 1000`; the classifier undoes the log and compares the
// resulting (width-relative) distance, scaled by an empirical correction
// coefficient, against 1.0.
//
// The animal is only considered moving when it was actually seen on the
// current frame: if the last tracked time differs from the last history time,
// or the last entry is an inferred copy, the current frame was a miss, and a
// miss is never movement.

use super::{Decide, Decision, DecisionContext};
use crate::core_modules::hardware::Stimulus;
use crate::core_modules::variables::VariableKind;
use crate::error::StimulatorError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementClassifier {
    pub velocity_correction_coef: f64,
}

impl MovementClassifier {
    pub fn new(velocity_correction_coef: f64) -> Self {
        Self {
            velocity_correction_coef,
        }
    }

    pub fn has_moved(&self, ctx: &DecisionContext<'_>) -> Result<bool, StimulatorError> {
        if ctx.positions.len() < 2 || ctx.times.len() < 2 {
            return Ok(false);
        }

        let last = match ctx.positions.back() {
            Some(last) if last.len() == 1 => &last[0],
            Some(last) => return Err(StimulatorError::MultipleAnimals(last.len())),
            None => return Ok(false),
        };

        let n = ctx.times.len();
        if ctx.times[n - 1] != ctx.last_time_point || last.is_inferred() {
            return Ok(false);
        }

        let xy = last
            .get(VariableKind::XyDistLog10x1000)
            .ok_or(StimulatorError::MissingVariable("xy_dist_log10x1000"))?
            .as_f64();

        let dt_s = ((ctx.times[n - 1] - ctx.times[n - 2]).abs() as f64 / 1000.0).max(f64::EPSILON);
        let dist = 10f64.powf(xy / 1000.0);
        let velocity = dist / dt_s;
        let velocity_corrected = velocity * dt_s / self.velocity_correction_coef;

        Ok(velocity_corrected > 1.0)
    }
}

/// Interacts whenever the animal did not move. Used with the no-op interface
/// to record immobility without driving hardware.
#[derive(Debug, Clone)]
pub struct IsMoving {
    classifier: MovementClassifier,
}

impl IsMoving {
    pub fn new(classifier: MovementClassifier) -> Self {
        Self { classifier }
    }
}

impl Decide for IsMoving {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        if self.classifier.has_moved(ctx)? {
            Ok(Decision::Idle)
        } else {
            Ok(Decision::Interact(Stimulus::on_channel(ctx.roi_idx)))
        }
    }
}
