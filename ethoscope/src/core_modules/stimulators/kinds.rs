// THEORY:
// The registry of stimulator kinds. Experiment configurations name a kind
// ("SleepDepStimulator", "RobustSleepDepriver", ...) and optionally override
// its parameters. Names are resolved once, when the configuration is parsed;
// an unknown name is a configuration error, never a failure discovered
// halfway through an experiment.
//
// Most kinds are the same strategy with different wiring: which channel map,
// which hardware module, which default durations. That wiring lives in one
// table (`KindDefaults`) and `StimulatorConfig::build` assembles the strategy,
// its wrappers and its scheduler from it.

use super::channels::{self, ChannelMap};
use super::inactivity::{InactivityThreshold, InactivityTimer};
use super::midline::MidlineCrossing;
use super::movement::{IsMoving, MovementClassifier};
use super::state::{StateTrigger, TargetState};
use super::systematic::{Cadence, Systematic};
use super::wrappers::{DynamicDuration, DynamicParams, SegmentedDuration};
use super::{Decide, Stimulator, WindowPolicy};
use crate::core_modules::hardware::{
    DefaultInterface, HardwareHandle, HardwareInterface, IndefiniteOptogeneticInterface,
    OptoMotorInterface, OptogeneticInterface, SleepDepriverInterface, StaticOptogeneticInterface, Stimulus,
};
use crate::core_modules::scheduler::{Scheduler, SegmentedScheduler};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimulatorKind {
    IsMovingStimulator,
    SleepDepStimulator,
    SleepDepStimulatorCR,
    ExperimentalSleepDepStimulator,
    OptomotorSleepDepriver,
    GearOptomotorSleepDepriver,
    RobustSleepDepriver,
    OptogeneticStimulator,
    SegmentedStimulator,
    DynamicStimulator,
    MiddleCrossingStimulator,
    OptoMidlineCrossStimulator,
    MotoMidlineCrossStimulator,
    RobustMotoMidlineCrossStimulator,
    SleepStimulator,
    AwakeStimulator,
    OptomotorSleepDepriverSystematic,
    RobustOptomotorSleepDepriverSystematic,
    OptogeneticStimulatorSystematic,
}

/// Optional overrides; anything left out takes the kind's default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulatorParams {
    pub velocity_correction_coef: Option<f64>,
    /// Seconds.
    pub min_inactive_time: Option<f64>,
    /// Milliseconds.
    pub pulse_duration: Option<u32>,
    pub pulse_intensity: Option<u32>,
    pub pulse_on: Option<u32>,
    pub pulse_off: Option<u32>,
    /// 1 = light, 2 = motor.
    pub stimulus_type: Option<u8>,
    pub p: Option<f64>,
    /// Seconds.
    pub refractory_period: Option<f64>,
    /// 0 = TLC5947 board, 1 = Darlington array.
    pub chip: Option<u8>,
    /// Seconds.
    pub interval: Option<f64>,
    pub program: Option<String>,
    pub min_pulse_duration: Option<u32>,
    pub max_pulse_duration: Option<u32>,
    pub window_minutes: Option<f64>,
    pub reference_frequency_per_h: Option<f64>,
    /// State kinds only: hold the light steadily (`S ch` / `U ch`) instead of pulsing it.
    pub static_light: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulatorConfig {
    pub kind: StimulatorKind,
    #[serde(default)]
    pub date_range: String,
    #[serde(default)]
    pub window_policy: WindowPolicy,
    #[serde(flatten)]
    pub params: StimulatorParams,
}

#[derive(Debug, Clone, Copy)]
enum Module {
    Default,
    SleepDepriver,
    OptoMotor,
    Optogenetic,
    StaticOptogenetic,
    IndefiniteOptogenetic,
}

struct KindDefaults {
    coef: f64,
    min_inactive_s: f64,
    pulse_duration: u32,
    channels: fn() -> ChannelMap,
    module: Module,
}

impl StimulatorKind {
    fn defaults(&self) -> KindDefaults {
        use StimulatorKind::*;
        let (coef, min_inactive_s, pulse_duration, channels, module): (f64, f64, u32, fn() -> ChannelMap, Module) =
            match self {
                IsMovingStimulator => (3.0e-3, 0.0, 0, channels::servo, Module::Default),
                SleepDepStimulator | SleepDepStimulatorCR | ExperimentalSleepDepStimulator => {
                    (3.0e-3, 120.0, 1000, channels::servo, Module::SleepDepriver)
                }
                OptomotorSleepDepriver => (0.01, 10.0, 1000, channels::optomotor_moto, Module::OptoMotor),
                GearOptomotorSleepDepriver => (0.01, 10.0, 2000, channels::optomotor_moto, Module::OptoMotor),
                RobustSleepDepriver => (0.01, 10.0, 1000, channels::robust, Module::SleepDepriver),
                OptogeneticStimulator => (0.01, 10.0, 1000, channels::robust, Module::Optogenetic),
                SegmentedStimulator => (0.01, 10.0, 500, channels::robust, Module::SleepDepriver),
                DynamicStimulator => (0.01, 10.0, 1000, channels::robust, Module::SleepDepriver),
                MiddleCrossingStimulator => (0.0, 0.0, 1000, channels::robust, Module::OptoMotor),
                OptoMidlineCrossStimulator => (0.0, 0.0, 1000, channels::optomotor_opto, Module::OptoMotor),
                MotoMidlineCrossStimulator => (0.0, 0.0, 2000, channels::optomotor_moto, Module::OptoMotor),
                RobustMotoMidlineCrossStimulator => (0.0, 0.0, 100, channels::robust, Module::SleepDepriver),
                SleepStimulator | AwakeStimulator => {
                    (0.01, 10.0, 1000, channels::robust, Module::IndefiniteOptogenetic)
                }
                OptomotorSleepDepriverSystematic => {
                    (0.0, 0.0, 1000, channels::optomotor_moto, Module::OptoMotor)
                }
                RobustOptomotorSleepDepriverSystematic => (0.0, 0.0, 1000, channels::robust, Module::OptoMotor),
                OptogeneticStimulatorSystematic => (0.0, 0.0, 1000, channels::robust, Module::Optogenetic),
            };
        KindDefaults {
            coef,
            min_inactive_s,
            pulse_duration,
            channels,
            module,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::parameter(name, format!("must be positive, got {value}")))
    }
}

impl StimulatorConfig {
    pub fn new(kind: StimulatorKind) -> Self {
        Self {
            kind,
            date_range: String::new(),
            window_policy: WindowPolicy::default(),
            params: StimulatorParams::default(),
        }
    }

    /// Hardware module this kind talks to.
    pub fn hardware_interface(&self) -> Arc<dyn HardwareInterface> {
        match self.module() {
            Module::Default => Arc::new(DefaultInterface),
            Module::SleepDepriver => Arc::new(SleepDepriverInterface),
            Module::OptoMotor => Arc::new(OptoMotorInterface),
            Module::Optogenetic => Arc::new(OptogeneticInterface),
            Module::StaticOptogenetic => Arc::new(StaticOptogeneticInterface),
            Module::IndefiniteOptogenetic => Arc::new(IndefiniteOptogeneticInterface),
        }
    }

    fn module(&self) -> Module {
        match (self.kind.defaults().module, self.params.static_light) {
            (Module::IndefiniteOptogenetic, Some(true)) => Module::StaticOptogenetic,
            (module, _) => module,
        }
    }

    fn channel_map(&self, defaults: &KindDefaults) -> ChannelMap {
        use StimulatorKind::*;
        match (self.kind, self.params.stimulus_type, self.params.chip) {
            (OptomotorSleepDepriver | OptomotorSleepDepriverSystematic, Some(1), _) => channels::optomotor_opto(),
            (MiddleCrossingStimulator, _, Some(0)) => channels::optomotor_moto(),
            _ => (defaults.channels)(),
        }
    }

    /// Builds a fresh stimulator; call once per ROI.
    pub fn build(&self, hardware: Option<HardwareHandle>) -> Result<Stimulator, ConfigError> {
        use StimulatorKind::*;
        let d = self.kind.defaults();
        let p = &self.params;

        let coef = positive(
            "velocity_correction_coef",
            p.velocity_correction_coef.unwrap_or(d.coef.max(f64::MIN_POSITIVE)),
        )?;
        let classifier = MovementClassifier::new(coef);
        let min_inactive_s = match p.min_inactive_time {
            Some(s) => positive("min_inactive_time", s)?,
            None => d.min_inactive_s,
        };
        let min_inactive_ms = (min_inactive_s * 1000.0).round() as i64;
        let channels = self.channel_map(&d);
        let template = Stimulus {
            channel: 0,
            duration: Some(p.pulse_duration.unwrap_or(d.pulse_duration)),
            intensity: Some(p.pulse_intensity.unwrap_or(1000)),
            pulse_on: Some(p.pulse_on.unwrap_or(50)),
            pulse_off: Some(p.pulse_off.unwrap_or(50)),
            turnon: None,
        };
        let fixed = InactivityThreshold::Fixed { ms: min_inactive_ms };

        let decider: Box<dyn Decide> = match self.kind {
            IsMovingStimulator => Box::new(IsMoving::new(classifier)),
            SleepDepStimulator
            | SleepDepStimulatorCR
            | OptomotorSleepDepriver
            | GearOptomotorSleepDepriver
            | RobustSleepDepriver
            | OptogeneticStimulator => Box::new(InactivityTimer::new(classifier, channels, fixed, template)),
            ExperimentalSleepDepStimulator => Box::new(InactivityTimer::new(
                classifier,
                channels,
                InactivityThreshold::PerChannel,
                template,
            )),
            SegmentedStimulator => {
                let program = p.program.clone().unwrap_or_default();
                let segmented = SegmentedScheduler::new(&self.date_range, &program)?;
                let inner = InactivityTimer::new(classifier, channels, fixed, template);
                Box::new(SegmentedDuration::new(Box::new(inner), segmented))
            }
            DynamicStimulator => {
                let params = DynamicParams {
                    window_ms: (positive("window_minutes", p.window_minutes.unwrap_or(30.0))? * 60_000.0) as i64,
                    reference_frequency_per_h: positive(
                        "reference_frequency_per_h",
                        p.reference_frequency_per_h.unwrap_or(20.0),
                    )?,
                    base_duration_ms: p.pulse_duration.unwrap_or(d.pulse_duration),
                    min_duration_ms: p.min_pulse_duration.unwrap_or(500),
                    max_duration_ms: p.max_pulse_duration.unwrap_or(10_000),
                };
                if params.min_duration_ms > params.max_duration_ms {
                    return Err(ConfigError::parameter(
                        "min_pulse_duration",
                        "must not exceed max_pulse_duration",
                    ));
                }
                let inner = InactivityTimer::new(classifier, channels, fixed, template);
                Box::new(DynamicDuration::new(Box::new(inner), params))
            }
            MiddleCrossingStimulator
            | OptoMidlineCrossStimulator
            | MotoMidlineCrossStimulator
            | RobustMotoMidlineCrossStimulator => {
                let prob = p.p.unwrap_or(1.0);
                if !(0.0..=1.0).contains(&prob) {
                    return Err(ConfigError::parameter("p", format!("must be in [0, 1], got {prob}")));
                }
                let refractory = p.refractory_period.unwrap_or(5.0);
                if refractory < 0.0 {
                    return Err(ConfigError::parameter("refractory_period", "must not be negative"));
                }
                Box::new(MidlineCrossing::new(channels, prob, refractory, template))
            }
            SleepStimulator | AwakeStimulator => {
                let target = if self.kind == SleepStimulator {
                    TargetState::Asleep
                } else {
                    TargetState::Awake
                };
                Box::new(StateTrigger::new(classifier, channels, target, min_inactive_ms, template))
            }
            OptomotorSleepDepriverSystematic
            | RobustOptomotorSleepDepriverSystematic
            | OptogeneticStimulatorSystematic => {
                let interval_ms = (positive("interval", p.interval.unwrap_or(120.0))? * 1000.0) as i64;
                let cadence = if self.kind == OptogeneticStimulatorSystematic {
                    Cadence::Elapsed
                } else {
                    Cadence::PhaseLocked
                };
                Box::new(Systematic::new(channels, interval_ms, cadence, template))
            }
        };

        let scheduler = Scheduler::new(&self.date_range)?;
        Ok(Stimulator::new(decider, scheduler, hardware, self.window_policy))
    }
}
