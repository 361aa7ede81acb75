// THEORY:
// State triggers drive sustained stimulation (typically light) for as long as
// the animal is in a target behavioural state. Unlike the inactivity timer
// this is level triggered: every frame spent in the state re-asserts the
// stimulus. When the state ends, or the scheduled window closes while the
// light is on, a single `turnon = false` instruction is sent so the hardware
// does not keep the light on.
//
// "Asleep" means not moving for longer than the inactivity threshold;
// "awake" means moving on the current frame.

use super::channels::ChannelMap;
use super::movement::MovementClassifier;
use super::{Decide, Decision, DecisionContext};
use crate::core_modules::hardware::Stimulus;
use crate::error::StimulatorError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Asleep,
    Awake,
}

#[derive(Debug, Clone)]
pub struct StateTrigger {
    classifier: MovementClassifier,
    channels: ChannelMap,
    target: TargetState,
    min_inactive_ms: i64,
    template: Stimulus,
    last_movement: Option<i64>,
    active: bool,
}

impl StateTrigger {
    pub fn new(
        classifier: MovementClassifier,
        channels: ChannelMap,
        target: TargetState,
        min_inactive_ms: i64,
        template: Stimulus,
    ) -> Self {
        Self {
            classifier,
            channels,
            target,
            min_inactive_ms,
            template,
            last_movement: None,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Decide for StateTrigger {
    fn decide(&mut self, ctx: &DecisionContext<'_>) -> Result<Decision, StimulatorError> {
        let Some(&channel) = self.channels.get(&ctx.roi_idx) else {
            return Ok(Decision::Idle);
        };
        let now = ctx.last_time_point;
        let has_moved = self.classifier.has_moved(ctx)?;
        let last_movement = *self.last_movement.get_or_insert(now);
        if has_moved {
            self.last_movement = Some(now);
        }

        let in_state = match self.target {
            TargetState::Awake => has_moved,
            TargetState::Asleep => !has_moved && now - last_movement > self.min_inactive_ms,
        };

        let stimulus = Stimulus {
            channel,
            turnon: Some(in_state),
            ..self.template
        };

        match (in_state, self.active) {
            (true, _) => {
                self.active = true;
                Ok(Decision::Interact(stimulus))
            }
            (false, true) => {
                self.active = false;
                Ok(Decision::Release(stimulus))
            }
            (false, false) => Ok(Decision::Idle),
        }
    }

    fn reset_timers(&mut self) {
        self.last_movement = None;
    }

    fn on_window_closed(&mut self, ctx: &DecisionContext<'_>) -> Option<Stimulus> {
        if !self.active {
            return None;
        }
        self.active = false;
        let channel = *self.channels.get(&ctx.roi_idx)?;
        Some(Stimulus {
            channel,
            turnon: Some(false),
            ..self.template
        })
    }
}
