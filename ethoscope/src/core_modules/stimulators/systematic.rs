//! Behaviour-independent stimulation at a fixed interval.
//!
//! Used as a control for closed-loop sleep deprivation: animals receive
//! stimuli on a clock, whatever they are doing. ROIs are staggered by
//! `idx * 100` ms so that neighbouring motors do not all turn at once.

use super::channels::ChannelMap;
use super::{Decide, Decision, DecisionContext};
use crate::core_modules::hardware::Stimulus;
use crate::error::StimulatorError;

/// Clock rule deciding when the interval has come round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fires in the first 100 ms of every interval, at most once a second.
    PhaseLocked,
    /// Fires once more than an interval has passed since the last firing.
    Elapsed,
}

#[derive(Debug, Clone)]
pub struct Systematic {
    channels: ChannelMap,
    interval_ms: i64,
    cadence: Cadence,
    template: Stimulus,
    t0: i64,
}

impl Systematic {
    pub fn new(channels: ChannelMap, interval_ms: i64, cadence: Cadence, template: Stimulus) -> Self {
        Self {
            channels,
            interval_ms: interval_ms.max(1),
            cadence,
            template,
            t0: 0,
        }
    }
}

impl Decide for Systematic {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        let Some(&channel) = self.channels.get(&ctx.roi_idx) else {
            return Ok(Decision::Idle);
        };
        let now = ctx.last_time_point + ctx.roi_idx as i64 * 100;

        let due = match self.cadence {
            Cadence::PhaseLocked => now - self.t0 > 1000 && now.rem_euclid(self.interval_ms) < 100,
            Cadence::Elapsed => now - self.t0 > self.interval_ms,
        };
        if !due {
            return Ok(Decision::Idle);
        }
        self.t0 = now;
        Ok(Decision::Interact(Stimulus {
            channel,
            ..self.template
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::stimulators::channels;
    use crate::core_modules::stimulators::testing::History;

    fn fire_times(cadence: Cadence, roi: u32) -> Vec<i64> {
        let mut d = Systematic::new(channels::robust(), 10_000, cadence, Stimulus::default());
        let mut h = History::new(roi);
        let mut out = Vec::new();
        // 20 fps for 35 s, animal behaviour irrelevant
        for i in 0..700 {
            let t = i * 50;
            h.missed(t);
            if let Decision::Interact(_) = d.decide(&h.ctx()).unwrap() {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn phase_locked_fires_once_per_interval() {
        // ROI 1 is shifted by 100 ms: now = t + 100 enters [10 000, 10 100) at t = 9 900.
        assert_eq!(fire_times(Cadence::PhaseLocked, 1), vec![9_900, 19_900, 29_900]);
    }

    #[test]
    fn rois_are_staggered() {
        // ROI 3: now = t + 300, first window at t = 9 700.
        assert_eq!(fire_times(Cadence::PhaseLocked, 3)[0], 9_700);
    }

    #[test]
    fn elapsed_cadence() {
        // now = t + 100 must exceed t0 by more than 10 000, t0 being the last firing.
        assert_eq!(fire_times(Cadence::Elapsed, 1), vec![9_950, 20_000, 30_050]);
    }
}
