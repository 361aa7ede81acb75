// THEORY:
// The inactivity timer is the sleep deprivation trigger. It remembers `t0`,
// the last time the animal was seen moving. When the animal has been still
// for longer than the threshold the timer fires once and restarts, so a fly
// that keeps sleeping is woken again only after another full period.
//
// Every sleep depriver module (servo, continuous rotation servo, gear motor
// boards, optogenetic boards) uses this same decision; they differ only in
// channel map, threshold and the stimulus template handed to the hardware.

use super::channels::ChannelMap;
use super::movement::MovementClassifier;
use super::{Decide, Decision, DecisionContext};
use crate::core_modules::hardware::Stimulus;
use crate::error::StimulatorError;

/// How long the animal must stay still before the timer fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InactivityThreshold {
    Fixed { ms: i64 },
    /// `round(channel^1.7) * 20 s`, so each channel tests a different threshold.
    PerChannel,
}

impl InactivityThreshold {
    pub fn for_channel(&self, channel: u32) -> i64 {
        match *self {
            InactivityThreshold::Fixed { ms } => ms,
            InactivityThreshold::PerChannel => (channel as f64).powf(1.7).round() as i64 * 20 * 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InactivityTimer {
    classifier: MovementClassifier,
    channels: ChannelMap,
    threshold: InactivityThreshold,
    /// Channel is filled in at decision time.
    template: Stimulus,
    t0: Option<i64>,
}

impl InactivityTimer {
    pub fn new(
        classifier: MovementClassifier,
        channels: ChannelMap,
        threshold: InactivityThreshold,
        template: Stimulus,
    ) -> Self {
        Self {
            classifier,
            channels,
            threshold,
            template,
            t0: None,
        }
    }

    pub fn t0(&self) -> Option<i64> {
        self.t0
    }
}

impl Decide for InactivityTimer {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        let Some(&channel) = self.channels.get(&ctx.roi_idx) else {
            return Ok(Decision::Idle);
        };
        let now = ctx.last_time_point;
        let has_moved = self.classifier.has_moved(ctx)?;
        let t0 = *self.t0.get_or_insert(now);

        if has_moved {
            self.t0 = Some(now);
        } else if now - t0 > self.threshold.for_channel(channel) {
            self.t0 = None;
            return Ok(Decision::Interact(Stimulus {
                channel,
                ..self.template
            }));
        }
        Ok(Decision::Idle)
    }

    fn reset_timers(&mut self) {
        self.t0 = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::stimulators::channels;
    use crate::core_modules::stimulators::testing::History;
    use crate::core_modules::stimulators::{Interaction, Stimulator, WindowPolicy};
    use crate::core_modules::scheduler::{timestamp_of, Scheduler};

    fn timer(threshold_ms: i64) -> InactivityTimer {
        InactivityTimer::new(
            MovementClassifier::new(0.01),
            channels::servo(),
            InactivityThreshold::Fixed { ms: threshold_ms },
            Stimulus::default(),
        )
    }

    /// Feeds a still animal every second from 0 to `until_s` and returns the firing times.
    fn firings(timer: &mut InactivityTimer, until_s: i64) -> Vec<i64> {
        let mut h = History::new(1);
        let mut out = Vec::new();
        for s in 0..=until_s {
            let t = s * 1000;
            h.seen(t, 10, 0.0);
            if let Decision::Interact(_) = timer.decide(&h.ctx()).unwrap() {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn fires_once_per_full_inactivity_period() {
        let mut t = timer(10_000);
        // t0 is set at 0, fires at the first frame strictly past 10 s, then
        // t0 restarts on the next frame (12 s) and fires again past 22 s.
        assert_eq!(firings(&mut t, 30), vec![11_000, 23_000]);
    }

    #[test]
    fn movement_restarts_the_timer() {
        let mut t = timer(10_000);
        let mut h = History::new(1);
        for s in 0..=8 {
            h.seen(s * 1000, 10, 0.0);
            assert_eq!(t.decide(&h.ctx()).unwrap(), Decision::Idle);
        }
        h.seen(9_000, 40, 30.0);
        t.decide(&h.ctx()).unwrap();
        assert_eq!(t.t0(), Some(9_000));
        for s in 10..=19 {
            h.seen(s * 1000, 40, 0.0);
            assert_eq!(t.decide(&h.ctx()).unwrap(), Decision::Idle);
        }
        h.seen(20_000, 40, 0.0);
        assert!(matches!(t.decide(&h.ctx()).unwrap(), Decision::Interact(s) if s.channel == 1));
    }

    #[test]
    fn unmapped_roi_never_interacts() {
        let mut t = timer(0);
        let mut h = History::new(2);
        for s in 0..100 {
            h.seen(s * 1000, 10, 0.0);
            assert_eq!(t.decide(&h.ctx()).unwrap(), Decision::Idle);
        }
        assert_eq!(t.t0(), None);
    }

    #[test]
    fn per_channel_threshold() {
        assert_eq!(InactivityThreshold::PerChannel.for_channel(1), 20_000);
        // 2^1.7 = 3.249 rounds to 3
        assert_eq!(InactivityThreshold::PerChannel.for_channel(2), 60_000);
        assert_eq!(InactivityThreshold::Fixed { ms: 5 }.for_channel(9), 5);
    }

    fn gated(policy: WindowPolicy) -> (Stimulator, f64, f64) {
        let start = timestamp_of("2024-01-01 00:00:00").unwrap();
        let end = timestamp_of("2024-01-02 00:00:00").unwrap();
        let scheduler = Scheduler::new("2024-01-01 00:00:00 > 2024-01-02 00:00:00").unwrap();
        (Stimulator::new(Box::new(timer(10_000)), scheduler, None, policy), start, end)
    }

    #[test]
    fn restart_policy_forgets_inactivity_outside_the_window() {
        let (mut stim, start, _) = gated(WindowPolicy::RestartTimers);
        let mut h = History::new(1);
        h.wall_clock_s = start + 1.0;
        h.seen(0, 10, 0.0);
        stim.apply(&h.ctx()).unwrap();

        h.wall_clock_s = start - 100.0;
        h.seen(20_000, 10, 0.0);
        assert_eq!(stim.apply(&h.ctx()).unwrap(), Interaction::none());

        h.wall_clock_s = start + 2.0;
        h.seen(21_000, 10, 0.0);
        assert!(!stim.apply(&h.ctx()).unwrap().has_interacted);
    }

    #[test]
    fn keep_policy_accumulates_inactivity_across_the_gap() {
        let (mut stim, start, _) = gated(WindowPolicy::KeepTimers);
        let mut h = History::new(1);
        h.wall_clock_s = start + 1.0;
        h.seen(0, 10, 0.0);
        stim.apply(&h.ctx()).unwrap();

        h.wall_clock_s = start - 100.0;
        h.seen(20_000, 10, 0.0);
        assert_eq!(stim.apply(&h.ctx()).unwrap(), Interaction::none());

        h.wall_clock_s = start + 2.0;
        h.seen(21_000, 10, 0.0);
        assert!(stim.apply(&h.ctx()).unwrap().has_interacted);
    }
}
