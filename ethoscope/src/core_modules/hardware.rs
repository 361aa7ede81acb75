// THEORY:
// Hardware modules (gear motors, LEDs, servos) are driven by short ASCII
// instructions written to a serial port. Writing to a serial port can block
// for as long as the device takes to answer, and the tracking loop must never
// wait on it. The connection therefore splits into two halves:
//
// 1.  **Formatting** (`HardwareInterface`): a pure function from a `Stimulus`
//     to the bytes a given module understands. Each interface declares the
//     parameter subset it accepts and the stimulus is filtered to that subset
//     before formatting, so a stimulator can never leak parameters a module
//     does not know about.
// 2.  **Delivery** (`HardwareConnection`): an unbounded instruction queue
//     drained by a dedicated worker thread that owns the byte sink.
//     `activate` only formats and enqueues; it returns immediately.
//
// Stopping the connection lets every already enqueued instruction complete
// before the worker exits.

use crate::error::HardwareError;
use log::{debug, error, info};
use std::fmt::Debug;
use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Parameters a hardware module can be asked to honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimulusParam {
    Duration,
    Intensity,
    PulseOn,
    PulseOff,
    TurnOn,
}

/// What a stimulator asks the hardware to do on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stimulus {
    pub channel: u32,
    /// Milliseconds.
    pub duration: Option<u32>,
    /// Duty cycle, 0 to 1000.
    pub intensity: Option<u32>,
    pub pulse_on: Option<u32>,
    pub pulse_off: Option<u32>,
    /// `Some(false)` switches a sustained stimulus off.
    pub turnon: Option<bool>,
}

impl Stimulus {
    pub fn on_channel(channel: u32) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }

    /// Copy keeping only the parameters in `params`; the channel is always kept.
    pub fn restricted_to(&self, params: &[StimulusParam]) -> Self {
        let keep = |p: StimulusParam| params.contains(&p);
        Self {
            channel: self.channel,
            duration: self.duration.filter(|_| keep(StimulusParam::Duration)),
            intensity: self.intensity.filter(|_| keep(StimulusParam::Intensity)),
            pulse_on: self.pulse_on.filter(|_| keep(StimulusParam::PulseOn)),
            pulse_off: self.pulse_off.filter(|_| keep(StimulusParam::PulseOff)),
            turnon: self.turnon.filter(|_| keep(StimulusParam::TurnOn)),
        }
    }
}

/// Formats stimuli for one family of hardware module.
pub trait HardwareInterface: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Parameters this module accepts besides the channel.
    fn params(&self) -> &'static [StimulusParam];

    /// Bytes to write for an already filtered stimulus. `None` means nothing to send.
    fn format(&self, stimulus: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError>;

    fn make_instruction(&self, stimulus: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        self.format(&stimulus.restricted_to(self.params()))
    }
}

fn require(
    interface: &'static str,
    param: &'static str,
    value: Option<u32>,
) -> Result<u32, HardwareError> {
    value.ok_or(HardwareError::MissingParameter { interface, param })
}

/// Accepts everything and sends nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInterface;

impl HardwareInterface for DefaultInterface {
    fn name(&self) -> &'static str {
        "DefaultInterface"
    }

    fn params(&self) -> &'static [StimulusParam] {
        &[]
    }

    fn format(&self, _stimulus: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        Ok(None)
    }
}

/// Gear motor module without intensity control: `P {channel} {duration}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepDepriverInterface;

impl HardwareInterface for SleepDepriverInterface {
    fn name(&self) -> &'static str {
        "SleepDepriver"
    }

    fn params(&self) -> &'static [StimulusParam] {
        &[StimulusParam::Duration]
    }

    fn format(&self, s: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        let duration = require(self.name(), "duration", s.duration)?;
        Ok(Some(format!("P {} {}\r\n", s.channel, duration).into_bytes()))
    }
}

/// Motor and LED module with duty cycle: `P {channel} {duration} {intensity}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptoMotorInterface;

impl HardwareInterface for OptoMotorInterface {
    fn name(&self) -> &'static str {
        "OptoMotor"
    }

    fn params(&self) -> &'static [StimulusParam] {
        &[StimulusParam::Duration, StimulusParam::Intensity]
    }

    fn format(&self, s: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        let duration = require(self.name(), "duration", s.duration)?;
        let intensity = s.intensity.unwrap_or(1000);
        Ok(Some(
            format!("P {} {} {}\r\n", s.channel, duration, intensity).into_bytes(),
        ))
    }
}

/// Pulsed LED train of fixed length: `R {channel} {duration} {pulse_on} {pulse_off}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptogeneticInterface;

impl HardwareInterface for OptogeneticInterface {
    fn name(&self) -> &'static str {
        "OptogeneticHardware"
    }

    fn params(&self) -> &'static [StimulusParam] {
        &[
            StimulusParam::Duration,
            StimulusParam::Intensity,
            StimulusParam::PulseOn,
            StimulusParam::PulseOff,
        ]
    }

    fn format(&self, s: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        let duration = require(self.name(), "duration", s.duration)?;
        let on = require(self.name(), "pulse_on", s.pulse_on)?;
        let off = require(self.name(), "pulse_off", s.pulse_off)?;
        Ok(Some(
            format!("R {} {} {} {}\r\n", s.channel, duration, on, off).into_bytes(),
        ))
    }
}

/// Light held on until told otherwise: `S {channel}` / `U {channel}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOptogeneticInterface;

impl HardwareInterface for StaticOptogeneticInterface {
    fn name(&self) -> &'static str {
        "StaticOptogeneticHardware"
    }

    fn params(&self) -> &'static [StimulusParam] {
        &[StimulusParam::TurnOn]
    }

    fn format(&self, s: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        let out = if s.turnon.unwrap_or(true) {
            format!("S {}\r\n", s.channel)
        } else {
            format!("U {}\r\n", s.channel)
        };
        Ok(Some(out.into_bytes()))
    }
}

/// Pulse train held until told otherwise: `S {channel} {on} {off}` / `U {channel}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndefiniteOptogeneticInterface;

impl HardwareInterface for IndefiniteOptogeneticInterface {
    fn name(&self) -> &'static str {
        "IndefiniteOptogeneticHardware"
    }

    fn params(&self) -> &'static [StimulusParam] {
        &[StimulusParam::PulseOn, StimulusParam::PulseOff, StimulusParam::TurnOn]
    }

    fn format(&self, s: &Stimulus) -> Result<Option<Vec<u8>>, HardwareError> {
        if !s.turnon.unwrap_or(true) {
            return Ok(Some(format!("U {}\r\n", s.channel).into_bytes()));
        }
        let on = require(self.name(), "pulse_on", s.pulse_on)?;
        let off = require(self.name(), "pulse_off", s.pulse_off)?;
        Ok(Some(format!("S {} {} {}\r\n", s.channel, on, off).into_bytes()))
    }
}

enum Message {
    Instruction(Vec<u8>),
    Stop,
}

/// Cloneable, non-blocking handle used by stimulators to enqueue instructions.
#[derive(Debug, Clone)]
pub struct HardwareHandle {
    interface: Arc<dyn HardwareInterface>,
    sender: mpsc::UnboundedSender<Message>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Instruction(bytes) => write!(f, "Instruction({:?})", String::from_utf8_lossy(bytes)),
            Message::Stop => write!(f, "Stop"),
        }
    }
}

impl HardwareHandle {
    pub fn interface(&self) -> &dyn HardwareInterface {
        self.interface.as_ref()
    }

    /// Formats `stimulus` and enqueues it. Returns as soon as it is queued.
    pub fn activate(&self, stimulus: &Stimulus) -> Result<(), HardwareError> {
        let Some(instruction) = self.interface.make_instruction(stimulus)? else {
            return Ok(());
        };
        debug!(
            "{}: queueing {:?}",
            self.interface.name(),
            String::from_utf8_lossy(&instruction)
        );
        self.sender
            .send(Message::Instruction(instruction))
            .map_err(|_| HardwareError::Disconnected)
    }
}

/// Owns the instruction queue and the worker thread writing to the device.
pub struct HardwareConnection {
    handle: HardwareHandle,
    worker: Option<JoinHandle<()>>,
}

impl HardwareConnection {
    /// Spawns the worker that writes instructions to `port` in queue order.
    pub fn new(interface: Arc<dyn HardwareInterface>, port: Box<dyn Write + Send>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        let name = interface.name();

        let worker = std::thread::spawn(move || {
            let mut port = port;
            while let Some(message) = receiver.blocking_recv() {
                match message {
                    Message::Instruction(bytes) => {
                        if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
                            error!("{name}: failed to deliver instruction: {e}");
                        }
                    }
                    Message::Stop => break,
                }
            }
            info!("{name}: hardware worker stopped");
        });

        Self {
            handle: HardwareHandle { interface, sender },
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> HardwareHandle {
        self.handle.clone()
    }

    pub fn activate(&self, stimulus: &Stimulus) -> Result<(), HardwareError> {
        self.handle.activate(stimulus)
    }

    /// Waits for every queued instruction to be written, then stops the worker.
    pub fn stop(&mut self) {
        let _ = self.handle.sender.send(Message::Stop);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{}: hardware worker panicked", self.handle.interface.name());
            }
        }
    }
}

impl Drop for HardwareConnection {
    fn drop(&mut self) {
        self.stop();
    }
}
