// THEORY:
// Midline crossing stimulation disturbs the animal when it walks across the
// middle of its tube. The position is normalised by the ROI's longest axis
// and centred, `x / W - 0.5`, so a crossing is a change of sign between the
// last two retained positions. Crossings fire with probability `p` and never
// closer together than the refractory period.

use super::channels::ChannelMap;
use super::{Decide, Decision, DecisionContext};
use crate::core_modules::hardware::Stimulus;
use crate::core_modules::variables::{DataPoint, VariableKind};
use crate::error::StimulatorError;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct MidlineCrossing {
    channels: ChannelMap,
    p: f64,
    refractory_ms: i64,
    template: Stimulus,
    last_stimulus_time: i64,
}

impl MidlineCrossing {
    pub fn new(channels: ChannelMap, p: f64, refractory_period_s: f64, template: Stimulus) -> Self {
        Self {
            channels,
            p,
            refractory_ms: (refractory_period_s * 1000.0).round() as i64,
            template,
            last_stimulus_time: 0,
        }
    }
}

fn centred_x(point: &DataPoint, longest_axis: u32) -> Result<f64, StimulatorError> {
    let x = point
        .get(VariableKind::X)
        .ok_or(StimulatorError::MissingVariable("x"))?
        .as_f64();
    Ok(x / longest_axis.max(1) as f64 - 0.5)
}

fn single(entry: &[DataPoint]) -> Result<&DataPoint, StimulatorError> {
    match entry {
        [one] => Ok(one),
        other => Err(StimulatorError::MultipleAnimals(other.len())),
    }
}

impl Decide for MidlineCrossing {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        let now = ctx.last_time_point;
        if now - self.last_stimulus_time < self.refractory_ms {
            return Ok(Decision::Idle);
        }
        let Some(&channel) = self.channels.get(&ctx.roi_idx) else {
            return Ok(Decision::Idle);
        };

        let n = ctx.positions.len();
        if n < 2 {
            return Ok(Decision::Idle);
        }
        let current = centred_x(single(&ctx.positions[n - 1])?, ctx.longest_axis)?;
        let previous = centred_x(single(&ctx.positions[n - 2])?, ctx.longest_axis)?;

        if (current > 0.0) != (previous > 0.0) && rand::thread_rng().r#gen::<f64>() < self.p {
            self.last_stimulus_time = now;
            return Ok(Decision::Interact(Stimulus {
                channel,
                ..self.template
            }));
        }
        Ok(Decision::Idle)
    }
}
