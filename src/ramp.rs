//! Linear temperature setpoint ramps on a background thread.
//!
//! A ramp reads the setpoint once, then every period moves it one step towards
//! the target and writes it, until the written value equals the target at the
//! instrument's resolution. Step size is `rate × period / 60 s`, so with the
//! default one second period a rate of 6 K/min moves 0.1 K per step.
//!
//! At most one ramp task runs per [`RampEngine`]. Starting a ramp first
//! cancels the running one and joins it, so two tasks never write setpoints
//! concurrently. Cancellation is cooperative: the task notices it while
//! waiting for the next step, writes its current setpoint once more to settle
//! the instrument there, and exits.

use crate::error::{Error, Result};
use crate::protocol::{round_to, TEMPERATURE_DECIMALS};
use log::*;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Time between two ramp steps.
pub const DEFAULT_RAMP_PERIOD: Duration = Duration::from_secs(1);

/// Ramp rate in K/min before one is configured.
pub const DEFAULT_RAMP_RATE: f64 = 1.0;

/// Setpoint change per step for `rate` K/min.
pub fn step_size(rate: f64, period: Duration) -> f64 {
    rate * period.as_secs_f64() / 60.0
}

/// Whether `current` equals `target` at the instrument's resolution.
pub fn reached(current: f64, target: f64) -> bool {
    round_to((target - current).abs(), TEMPERATURE_DECIMALS) == 0.0
}

/// Moves `current` one `step` towards `target`, never past it.
pub fn next_setpoint(current: f64, target: f64, step: f64) -> f64 {
    let remaining = target - current;
    if remaining.abs() <= step {
        target
    } else {
        current + step.copysign(remaining)
    }
}

/// The setpoint access a ramp task needs.
///
/// Every method is one locked round trip, so foreground calls interleave with
/// the ramp between steps.
pub trait RampDevice: Send + Sync + 'static {
    /// Reads the setpoint the ramp starts from.
    fn read_setpoint(&self) -> Result<f64>;

    /// If ramping is still enabled, computes the next setpoint from the
    /// current rate and writes it, under one lock. Returns `None` if ramping
    /// was disabled in the meantime.
    fn advance(&self, next: &mut dyn FnMut(f64) -> f64) -> Result<Option<f64>>;

    /// Writes a setpoint unconditionally.
    fn write_setpoint(&self, kelvin: f64) -> Result<()>;
}

/// How a ramp task ended.
#[derive(Debug)]
pub enum RampOutcome {
    /// The target was written.
    Reached(f64),
    /// Stopped early, settled at the contained setpoint.
    Cancelled(f64),
    /// A round trip failed. The setpoint is wherever the last write left it.
    Failed(Error),
}

struct RampTask {
    target: f64,
    cancel: Sender<()>,
    handle: JoinHandle<RampOutcome>,
}

/// Owner of the single background ramp task.
#[derive(Default)]
pub struct RampEngine {
    task: Option<RampTask>,
}

impl RampEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a ramp to `target`, replacing any running ramp.
    ///
    /// Returns the outcome of the replaced ramp, if there was one.
    pub fn start<D: RampDevice>(
        &mut self,
        device: Arc<D>,
        target: f64,
        period: Duration,
    ) -> Option<RampOutcome> {
        let previous = self.cancel();
        let (cancel, cancelled) = mpsc::channel();
        let handle = thread::spawn(move || run(device.as_ref(), target, period, cancelled));
        self.task = Some(RampTask {
            target,
            cancel,
            handle,
        });
        previous
    }

    /// Signals the running ramp to stop and waits until it has.
    pub fn cancel(&mut self) -> Option<RampOutcome> {
        let task = self.task.take()?;
        // The task may have finished and dropped its receiver already.
        let _ = task.cancel.send(());
        join(task)
    }

    /// Waits until the running ramp finishes on its own.
    pub fn wait(&mut self) -> Option<RampOutcome> {
        let task = self.task.take()?;
        join(task)
    }

    pub fn is_active(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Target of the running ramp.
    pub fn target(&self) -> Option<f64> {
        self.task
            .as_ref()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.target)
    }
}

impl Drop for RampEngine {
    fn drop(&mut self) {
        if let Some(outcome) = self.cancel() {
            debug!("Ramp stopped on drop: {outcome:?}");
        }
    }
}

fn join(task: RampTask) -> Option<RampOutcome> {
    match task.handle.join() {
        Ok(outcome) => Some(outcome),
        Err(_) => {
            error!("Ramp task to {:.2} K panicked", task.target);
            None
        }
    }
}

/// Waits one period. Returns `true` if cancellation was requested meanwhile.
fn cancelled_within(cancelled: &Receiver<()>, period: Duration) -> bool {
    match cancelled.recv_timeout(period) {
        Err(RecvTimeoutError::Timeout) => false,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
    }
}

fn settle<D: RampDevice + ?Sized>(device: &D, current: f64) -> RampOutcome {
    let setpoint = round_to(current, TEMPERATURE_DECIMALS);
    match device.write_setpoint(setpoint) {
        Ok(()) => {
            info!("Ramp stopped at {setpoint:.2} K");
            RampOutcome::Cancelled(setpoint)
        }
        Err(err) => {
            error!("Ramp stopped, but settling at {setpoint:.2} K failed: {err}");
            RampOutcome::Failed(err)
        }
    }
}

fn run<D: RampDevice + ?Sized>(
    device: &D,
    target: f64,
    period: Duration,
    cancelled: Receiver<()>,
) -> RampOutcome {
    let mut current = match device.read_setpoint() {
        Ok(setpoint) => setpoint,
        Err(err) => {
            error!("Ramp to {target:.2} K aborted, cannot read setpoint: {err}");
            return RampOutcome::Failed(err);
        }
    };
    info!("Ramping setpoint from {current:.2} K to {target:.2} K");

    let mut steps = 0u32;
    while !reached(current, target) {
        let step = device.advance(&mut |rate| {
            next_setpoint(current, target, step_size(rate, period))
        });
        match step {
            Ok(Some(setpoint)) => current = setpoint,
            Ok(None) => {
                debug!("Ramping disabled after {steps} steps");
                return settle(device, current);
            }
            Err(err) => {
                error!("Ramp to {target:.2} K aborted after {steps} steps: {err}");
                return RampOutcome::Failed(err);
            }
        }
        steps += 1;
        debug!("Ramp step {steps}: {current:.2} K");
        if reached(current, target) {
            break;
        }
        if cancelled_within(&cancelled, period) {
            debug!("Ramp to {target:.2} K cancelled after {steps} steps");
            return settle(device, current);
        }
    }
    info!("Ramp reached {target:.2} K after {steps} steps");
    RampOutcome::Reached(target)
}
