// THEORY:
// Wrappers change *how much* stimulus is delivered without changing *when*.
// They decorate any other strategy and only rewrite the duration of the
// interactions it produces.
//
// - `SegmentedDuration` follows a treatment program: the duration depends on
//   the hours elapsed since the scheduled window opened.
// - `DynamicDuration` escalates: the more often an animal needed waking in
//   the recent past, the harder it is assumed to be to arouse, and the longer
//   the next pulse.

use super::{Decide, Decision, DecisionContext};
use crate::core_modules::hardware::Stimulus;
use crate::core_modules::scheduler::SegmentedScheduler;
use crate::error::StimulatorError;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct SegmentedDuration {
    inner: Box<dyn Decide>,
    scheduler: SegmentedScheduler,
}

impl SegmentedDuration {
    pub fn new(inner: Box<dyn Decide>, scheduler: SegmentedScheduler) -> Self {
        Self { inner, scheduler }
    }
}

impl Decide for SegmentedDuration {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        match self.inner.decide(ctx)? {
            Decision::Interact(mut stimulus) => {
                if let Some(duration) = self.scheduler.check_duration(ctx.wall_clock_s) {
                    stimulus.duration = Some(duration);
                }
                Ok(Decision::Interact(stimulus))
            }
            other => Ok(other),
        }
    }

    fn reset_timers(&mut self) {
        self.inner.reset_timers();
    }

    fn on_window_closed(&mut self, ctx: &DecisionContext<'_>) -> Option<Stimulus> {
        self.inner.on_window_closed(ctx)
    }
}

/// Parameters of the adaptive pulse duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicParams {
    pub window_ms: i64,
    /// Interactions per hour considered normal; at this rate the base duration is used.
    pub reference_frequency_per_h: f64,
    pub base_duration_ms: u32,
    pub min_duration_ms: u32,
    pub max_duration_ms: u32,
}

impl Default for DynamicParams {
    fn default() -> Self {
        Self {
            window_ms: 30 * 60 * 1000,
            reference_frequency_per_h: 20.0,
            base_duration_ms: 1000,
            min_duration_ms: 500,
            max_duration_ms: 10_000,
        }
    }
}

#[derive(Debug)]
pub struct DynamicDuration {
    inner: Box<dyn Decide>,
    params: DynamicParams,
    history: VecDeque<i64>,
}

impl DynamicDuration {
    pub fn new(inner: Box<dyn Decide>, params: DynamicParams) -> Self {
        Self {
            inner,
            params,
            history: VecDeque::new(),
        }
    }

    /// Observed interaction rate relative to the reference rate.
    pub fn arousal_threshold(&self) -> f64 {
        let window_h = self.params.window_ms as f64 / 3_600_000.0;
        let frequency = self.history.len() as f64 / window_h;
        frequency / self.params.reference_frequency_per_h
    }

    fn duration(&self) -> u32 {
        let scaled = self.params.base_duration_ms as f64 * self.arousal_threshold();
        (scaled.round() as u32).clamp(self.params.min_duration_ms, self.params.max_duration_ms)
    }
}

impl Decide for DynamicDuration {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        let now = ctx.last_time_point;
        while let Some(&oldest) = self.history.front() {
            if now - oldest > self.params.window_ms {
                self.history.pop_front();
            } else {
                break;
            }
        }

        match self.inner.decide(ctx)? {
            Decision::Interact(mut stimulus) => {
                self.history.push_back(now);
                stimulus.duration = Some(self.duration());
                Ok(Decision::Interact(stimulus))
            }
            other => Ok(other),
        }
    }

    fn reset_timers(&mut self) {
        self.inner.reset_timers();
    }

    fn on_window_closed(&mut self, ctx: &DecisionContext<'_>) -> Option<Stimulus> {
        self.inner.on_window_closed(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::scheduler::timestamp_of;
    use crate::core_modules::stimulators::testing::History;

    #[derive(Debug)]
    struct Always;

    impl Decide for Always {
        fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
            Ok(Decision::Interact(Stimulus {
                duration: Some(42),
                ..Stimulus::on_channel(ctx.roi_idx)
            }))
        }
    }

    fn duration_of(d: Decision) -> Option<u32> {
        match d {
            Decision::Interact(s) => s.duration,
            _ => None,
        }
    }

    #[test]
    fn segmented_overrides_inside_program_only() {
        let sched = SegmentedScheduler::new("2024-01-01 00:00:00 > 2024-01-02 00:00:00", "0 > 250; 3 > 500").unwrap();
        let mut d = SegmentedDuration::new(Box::new(Always), sched);
        let mut h = History::new(1);
        h.seen(0, 10, 0.0);

        h.wall_clock_s = timestamp_of("2024-01-01 04:00:00").unwrap();
        assert_eq!(duration_of(d.decide(&h.ctx()).unwrap()), Some(500));

        h.wall_clock_s = timestamp_of("2024-01-05 00:00:00").unwrap();
        assert_eq!(duration_of(d.decide(&h.ctx()).unwrap()), Some(42));
    }

    #[test]
    fn dynamic_duration_escalates_and_is_clamped() {
        let params = DynamicParams {
            window_ms: 3_600_000,
            reference_frequency_per_h: 2.0,
            base_duration_ms: 1000,
            min_duration_ms: 400,
            max_duration_ms: 2500,
        };
        let mut d = DynamicDuration::new(Box::new(Always), params);
        let mut h = History::new(1);
        let mut durations = Vec::new();
        for i in 0..6 {
            h.missed(i * 60_000);
            durations.push(duration_of(d.decide(&h.ctx()).unwrap()).unwrap());
        }
        // arousal = n / 2 after the n-th firing in one hour
        assert_eq!(durations, vec![500, 1000, 1500, 2000, 2500, 2500]);
    }

    #[test]
    fn dynamic_history_forgets_old_firings() {
        let params = DynamicParams {
            window_ms: 60_000,
            reference_frequency_per_h: 60.0,
            base_duration_ms: 1000,
            min_duration_ms: 0,
            max_duration_ms: 100_000,
        };
        let mut d = DynamicDuration::new(Box::new(Always), params);
        let mut h = History::new(1);
        h.missed(0);
        d.decide(&h.ctx()).unwrap();
        h.missed(10_000);
        d.decide(&h.ctx()).unwrap();
        h.missed(200_000);
        // both earlier firings are older than the window: one per minute is the reference
        assert_eq!(duration_of(d.decide(&h.ctx()).unwrap()), Some(1000));
    }
}
