//! A simulated ITC503 speaking the wire protocol in memory.
//!
//! [`SimulatedItc503`] keeps the instrument state, answers commands the way the
//! firmware does and records every command line it receives. Connect a driver
//! to it through [`SimulatedItc503::connector`]; clones share one instrument.
//!
//! Faults can be injected to exercise error paths: a broken link, refused
//! connections, refused commands and arbitrary status replies.

use crate::protocol::{AutoMode, ControlMode, LineTermination, Sensor, StatusWord};
use crate::transport::{ConnectOptions, Connector, Transport};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Full scale heater voltage.
const HEATER_MAX_VOLTS: f64 = 40.0;

/// Fraction of the remaining distance the simulated temperature moves towards
/// the setpoint per reading while the heater is automatic.
const RELAXATION: f64 = 0.2;

#[derive(Debug)]
struct Instrument {
    setpoint: f64,
    temperatures: [f64; 3],
    heater_percent: f64,
    gas_flow: f64,
    auto: AutoMode,
    control: ControlMode,
    sensor: Sensor,
    termination: LineTermination,
    commands: Vec<String>,
    status_reply: Option<String>,
    rejected: Option<char>,
    link_broken: bool,
    refuse_connections: bool,
    connects: usize,
    closes: usize,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            setpoint: 10.0,
            temperatures: [10.0, 4.2, 295.0],
            heater_percent: 0.0,
            gas_flow: 0.0,
            auto: AutoMode::default(),
            control: ControlMode::LocalLocked,
            sensor: Sensor::Sensor1,
            termination: LineTermination::Cr,
            commands: Vec::new(),
            status_reply: None,
            rejected: None,
            link_broken: false,
            refuse_connections: false,
            connects: 0,
            closes: 0,
        }
    }
}

impl Instrument {
    fn status(&self) -> String {
        if let Some(reply) = &self.status_reply {
            return reply.clone();
        }
        StatusWord {
            system: 0,
            auto: self.auto,
            control: self.control,
            sweep: 0,
            control_sensor: self.sensor,
            auto_pid: false,
        }
        .to_string()
    }

    fn read_channel(&mut self, channel: u8) -> Option<f64> {
        let sensor = self.sensor as usize - 1;
        let value = match channel {
            0 => self.setpoint,
            1..=3 => {
                let index = channel as usize - 1;
                if index == sensor && self.auto.heater {
                    let current = self.temperatures[index];
                    self.temperatures[index] = current + (self.setpoint - current) * RELAXATION;
                }
                self.temperatures[index]
            }
            4 => self.setpoint - self.temperatures[sensor],
            5 => self.heater_percent,
            6 => self.heater_percent / 100.0 * HEATER_MAX_VOLTS,
            7 => self.gas_flow,
            8 => 5.0,
            9 => 1.0,
            _ => return None,
        };
        Some(value)
    }

    /// Applies `command` and returns the reply line, if any.
    fn handle(&mut self, command: &str) -> Option<String> {
        let rejected = || Some(format!("?{command}"));
        let mut chars = command.chars();
        let letter = chars.next()?;
        let argument = chars.as_str();

        if self.rejected == Some(letter) {
            return rejected();
        }
        if matches!(letter, 'T' | 'O' | 'G' | 'A' | 'H') && !self.control.is_remote() {
            return rejected();
        }

        match letter {
            'Q' => {
                match argument {
                    "0" => self.termination = LineTermination::Cr,
                    "2" => self.termination = LineTermination::CrLf,
                    _ => {}
                }
                None
            }
            'C' => match argument.parse().ok().and_then(ControlMode::decode) {
                Some(mode) => {
                    self.control = mode;
                    Some("C".to_string())
                }
                None => rejected(),
            },
            'X' if argument.is_empty() => Some(self.status()),
            'R' => match argument.parse().ok().and_then(|n| self.read_channel(n)) {
                Some(value) => Some(format!("R{value:+.3}")),
                None => rejected(),
            },
            'T' => match argument.parse::<f64>() {
                Ok(kelvin) if (0.0..=300.0).contains(&kelvin) => {
                    self.setpoint = kelvin;
                    Some("T".to_string())
                }
                _ => rejected(),
            },
            'O' => match argument.parse::<f64>() {
                Ok(percent) if (0.0..=99.9).contains(&percent) => {
                    self.heater_percent = percent;
                    Some("O".to_string())
                }
                _ => rejected(),
            },
            'G' => match argument.parse::<f64>() {
                Ok(percent) if (0.0..=99.9).contains(&percent) => {
                    self.gas_flow = percent;
                    Some("G".to_string())
                }
                _ => rejected(),
            },
            'A' => match argument.parse().ok().and_then(AutoMode::decode) {
                Some(mode) => {
                    self.auto = mode;
                    Some("A".to_string())
                }
                None => rejected(),
            },
            'H' => match argument.parse().ok().and_then(Sensor::decode) {
                Some(sensor) => {
                    self.sensor = sensor;
                    Some("H".to_string())
                }
                None => rejected(),
            },
            _ => rejected(),
        }
    }
}

fn broken_link() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated link failure")
}

/// A simulated instrument shared by all its clones.
#[derive(Debug, Clone, Default)]
pub struct SimulatedItc503 {
    instrument: Arc<Mutex<Instrument>>,
}

impl SimulatedItc503 {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Instrument> {
        self.instrument
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector opening links to this instrument.
    pub fn connector(&self) -> SimulatedConnector {
        SimulatedConnector {
            instrument: self.clone(),
        }
    }

    /// Every command line received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Makes every following read, write and close fail with an I/O error.
    pub fn break_link(&self, broken: bool) {
        self.lock().link_broken = broken;
    }

    /// Answers every command starting with `letter` with `?`. `None` stops.
    pub fn reject_commands(&self, letter: Option<char>) {
        self.lock().rejected = letter;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Replaces the reply to `X`. `None` restores the real status word.
    pub fn set_status_reply(&self, reply: Option<&str>) {
        self.lock().status_reply = reply.map(str::to_string);
    }

    pub fn set_temperature(&self, sensor: Sensor, kelvin: f64) {
        self.lock().temperatures[sensor as usize - 1] = kelvin;
    }

    pub fn set_auto_mode(&self, mode: AutoMode) {
        self.lock().auto = mode;
    }

    pub fn set_control_mode(&self, mode: ControlMode) {
        self.lock().control = mode;
    }

    pub fn setpoint(&self) -> f64 {
        self.lock().setpoint
    }

    pub fn auto_mode(&self) -> AutoMode {
        self.lock().auto
    }

    pub fn control_mode(&self) -> ControlMode {
        self.lock().control
    }

    pub fn sensor(&self) -> Sensor {
        self.lock().sensor
    }

    pub fn heater_output(&self) -> f64 {
        self.lock().heater_percent
    }

    pub fn gas_flow(&self) -> f64 {
        self.lock().gas_flow
    }

    pub fn termination(&self) -> LineTermination {
        self.lock().termination
    }

    /// Number of links opened so far.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of links closed so far.
    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

/// Opens [`SimulatedTransport`]s to a [`SimulatedItc503`].
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    instrument: SimulatedItc503,
}

impl Connector for SimulatedConnector {
    type Transport = SimulatedTransport;

    fn connect(&self, _address: &str, _options: &ConnectOptions) -> io::Result<Self::Transport> {
        let mut instrument = self.instrument.lock();
        if instrument.refuse_connections {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "simulated instrument refused the connection",
            ));
        }
        instrument.connects += 1;
        Ok(SimulatedTransport {
            instrument: self.instrument.clone(),
            replies: VecDeque::new(),
        })
    }
}

/// One link to a [`SimulatedItc503`].
#[derive(Debug)]
pub struct SimulatedTransport {
    instrument: SimulatedItc503,
    replies: VecDeque<String>,
}

impl Transport for SimulatedTransport {
    fn write(&mut self, command: &str) -> io::Result<()> {
        let mut instrument = self.instrument.lock();
        if instrument.link_broken {
            return Err(broken_link());
        }
        instrument.commands.push(command.to_string());
        if let Some(reply) = instrument.handle(command) {
            self.replies.push_back(reply);
        }
        Ok(())
    }

    fn read(&mut self) -> io::Result<String> {
        if self.instrument.lock().link_broken {
            return Err(broken_link());
        }
        self.replies
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no reply from instrument"))
    }

    fn close(&mut self) -> io::Result<()> {
        let mut instrument = self.instrument.lock();
        instrument.closes += 1;
        if instrument.link_broken {
            return Err(broken_link());
        }
        Ok(())
    }
}
