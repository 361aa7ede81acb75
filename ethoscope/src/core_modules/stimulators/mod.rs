// THEORY:
// A stimulator closes the loop between what the tracker sees and what the
// hardware does. Once per frame and per ROI it looks at the recent position
// history of its animal and decides whether to poke it, shine a light on it,
// or leave it alone.
//
// Key architectural principles:
// 1.  **Composition over Hierarchy**: every behaviour is a small strategy
//     implementing `Decide`. Strategies are configured once (channel map,
//     thresholds, durations) and carry only the mutable state their decision
//     needs. Variants that only differ in configuration are the same strategy
//     built with different parameters (see `kinds`). Behaviour that modifies
//     another decision (segmented or dynamic pulse durations) wraps it.
// 2.  **Gate First**: `Stimulator::apply` asks the scheduler before any
//     strategy runs, so nothing stateful happens outside the allowed window.
//     What happens to running timers while outside the window is an explicit
//     `WindowPolicy`. A strategy that left the hardware switched on is told
//     when the window closes and switches it off, whatever the policy.
// 3.  **Fire and Forget**: an interaction is enqueued on the hardware handle
//     and `apply` returns at once. Delivery failures are the hardware
//     worker's problem, not the tracking loop's.
// 4.  **Silently Inert**: a ROI without a hardware channel never interacts.
//     That is configuration, not an error.

pub mod channels;
pub mod inactivity;
pub mod kinds;
pub mod midline;
pub mod movement;
pub mod state;
pub mod systematic;
pub mod wrappers;

use crate::core_modules::hardware::{HardwareHandle, Stimulus};
use crate::core_modules::scheduler::Scheduler;
use crate::core_modules::variables::DataPoint;
use crate::error::StimulatorError;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Debug;

/// Read-only view of one tracking unit handed to the strategy each frame.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub roi_idx: u32,
    pub longest_axis: u32,
    /// Retained history, oldest first. Each entry holds the animals of one frame.
    pub positions: &'a VecDeque<Vec<DataPoint>>,
    pub times: &'a VecDeque<i64>,
    /// Timestamp (ms) of the frame being processed, whether or not the animal was found.
    pub last_time_point: i64,
    /// Wall clock (unix seconds) used by the schedulers.
    pub wall_clock_s: f64,
}

/// Outcome of one decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Idle,
    /// Deliver a stimulus to the animal.
    Interact(Stimulus),
    /// Send a hardware command that is not itself an interaction (e.g. lights off).
    Release(Stimulus),
}

/// A decision strategy. Implementations own their per-ROI state.
pub trait Decide: Send + Debug {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError>;

    /// Forgets any running timer. Called while outside the scheduled window.
    fn reset_timers(&mut self) {}

    /// Called on every frame outside the scheduled window. A strategy holding
    /// the hardware in a sustained state returns the command that ends it.
    fn on_window_closed(&mut self, _ctx: &DecisionContext<'_>) -> Option<Stimulus> {
        None
    }
}

/// What a tracking unit records about the last `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interaction {
    pub has_interacted: bool,
    /// Milliseconds, 0 when nothing was delivered.
    pub duration: u32,
}

impl Interaction {
    pub fn none() -> Self {
        Self::default()
    }
}

/// What happens to inactivity timers while the scheduler is out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WindowPolicy {
    /// Timers restart when the window opens again.
    #[default]
    RestartTimers,
    /// Timers keep the time they had; inactivity accumulates across the gap.
    KeepTimers,
}

/// A strategy gated by a scheduler and bound to a hardware handle.
#[derive(Debug)]
pub struct Stimulator {
    decider: Box<dyn Decide>,
    scheduler: Scheduler,
    hardware: Option<HardwareHandle>,
    window_policy: WindowPolicy,
}

impl Stimulator {
    pub fn new(
        decider: Box<dyn Decide>,
        scheduler: Scheduler,
        hardware: Option<HardwareHandle>,
        window_policy: WindowPolicy,
    ) -> Self {
        Self {
            decider,
            scheduler,
            hardware,
            window_policy,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn apply(&mut self, ctx: &DecisionContext<'_>) -> Result<Interaction, StimulatorError> {
        if !self.scheduler.check_time_range(ctx.wall_clock_s) {
            if let Some(stimulus) = self.decider.on_window_closed(ctx) {
                debug!(
                    "ROI {}: window closed, releasing channel {} at {} ms",
                    ctx.roi_idx, stimulus.channel, ctx.last_time_point
                );
                self.send(ctx.roi_idx, &stimulus);
            }
            if self.window_policy == WindowPolicy::RestartTimers {
                self.decider.reset_timers();
            }
            return Ok(Interaction::none());
        }

        match self.decider.decide(ctx)? {
            Decision::Idle => Ok(Interaction::none()),
            Decision::Interact(stimulus) => {
                debug!(
                    "ROI {}: interacting on channel {} at {} ms",
                    ctx.roi_idx, stimulus.channel, ctx.last_time_point
                );
                self.send(ctx.roi_idx, &stimulus);
                Ok(Interaction {
                    has_interacted: true,
                    duration: stimulus.duration.unwrap_or(0),
                })
            }
            Decision::Release(stimulus) => {
                self.send(ctx.roi_idx, &stimulus);
                Ok(Interaction::none())
            }
        }
    }

    fn send(&self, roi_idx: u32, stimulus: &Stimulus) {
        if let Some(hardware) = &self.hardware {
            if let Err(e) = hardware.activate(stimulus) {
                error!("ROI {roi_idx}: could not queue stimulus: {e}");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::History;
    use super::*;
    use crate::core_modules::hardware::tests::SharedPort;
    use crate::core_modules::hardware::{HardwareConnection, IndefiniteOptogeneticInterface, SleepDepriverInterface};
    use crate::core_modules::scheduler::timestamp_of;
    use crate::core_modules::stimulators::movement::MovementClassifier;
    use crate::core_modules::stimulators::state::{StateTrigger, TargetState};
    use std::sync::Arc;

    /// Interacts on every call, counting how often its timers were reset.
    #[derive(Debug, Default)]
    struct Always {
        resets: usize,
    }

    impl Decide for Always {
        fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
            Ok(Decision::Interact(Stimulus {
                duration: Some(250),
                ..Stimulus::on_channel(ctx.roi_idx)
            }))
        }

        fn reset_timers(&mut self) {
            self.resets += 1;
        }
    }

    #[test]
    fn out_of_window_short_circuits() {
        let scheduler = Scheduler::new("2024-01-01 00:00:00 > 2024-01-02 00:00:00").unwrap();
        let mut stim = Stimulator::new(Box::new(Always::default()), scheduler, None, WindowPolicy::RestartTimers);
        let mut history = History::new(1);
        history.seen(0, 10, 0.0);
        history.wall_clock_s = 0.5;
        assert_eq!(stim.apply(&history.ctx()).unwrap(), Interaction::none());
    }

    #[test]
    fn interaction_is_queued_on_the_hardware() {
        let port = SharedPort::default();
        let mut conn = HardwareConnection::new(Arc::new(SleepDepriverInterface), Box::new(port.clone()));
        let mut stim = Stimulator::new(
            Box::new(Always::default()),
            Scheduler::always(),
            Some(conn.handle()),
            WindowPolicy::default(),
        );
        let mut history = History::new(3);
        history.seen(0, 10, 0.0);
        let out = stim.apply(&history.ctx()).unwrap();
        assert_eq!(
            out,
            Interaction {
                has_interacted: true,
                duration: 250
            }
        );
        conn.stop();
        assert_eq!(port.text(), "P 3 250\r\n");
    }

    #[test]
    fn closing_window_switches_a_held_light_off() {
        for policy in [WindowPolicy::RestartTimers, WindowPolicy::KeepTimers] {
            let port = SharedPort::default();
            let mut conn = HardwareConnection::new(Arc::new(IndefiniteOptogeneticInterface), Box::new(port.clone()));
            let trigger = StateTrigger::new(
                MovementClassifier::new(0.01),
                channels::robust(),
                TargetState::Asleep,
                5_000,
                Stimulus {
                    pulse_on: Some(50),
                    pulse_off: Some(50),
                    ..Stimulus::default()
                },
            );
            let scheduler = Scheduler::new("2024-01-01 00:00:00 > 2024-01-01 00:00:08").unwrap();
            let start = timestamp_of("2024-01-01 00:00:00").unwrap();
            let mut stim = Stimulator::new(Box::new(trigger), scheduler, Some(conn.handle()), policy);

            let mut history = History::new(3);
            for s in 0..=20 {
                history.seen(s * 1000, 20, 0.0);
                history.wall_clock_s = start + s as f64 + 0.5;
                let out = stim.apply(&history.ctx()).unwrap();
                assert_eq!(out.has_interacted, (6..=7).contains(&s), "{policy:?} at {s} s");
            }
            conn.stop();
            // asleep from 6 s, window over after 7.5 s, light off exactly once
            assert_eq!(port.text(), "S 3 50 50\r\nS 3 50 50\r\nU 3\r\n", "{policy:?}");
        }
    }
}
