//! Wire protocol of the ITC503 temperature controller.
//!
//! The ITC503 speaks a line-oriented ASCII protocol: every command is a single
//! upper-case letter followed by an optional argument, and every command except
//! `Q` is answered with exactly one line. A successful set command is answered
//! with its own command letter, a refused command with `?` followed by the
//! command.
//!
//! This module is pure: it encodes [`Command`]s, validates argument domains and
//! decodes responses into typed values. All I/O lives in [`crate::transport`]
//! and [`crate::itc503`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lower bound of the temperature setpoint in Kelvin.
pub const TEMPERATURE_MIN: f64 = 0.0;
/// Upper bound of the temperature setpoint in Kelvin.
pub const TEMPERATURE_MAX: f64 = 300.0;
/// Lower bound of manual heater and gas-flow outputs in percent.
pub const PERCENT_MIN: f64 = 0.0;
/// Upper bound of manual heater and gas-flow outputs in percent.
pub const PERCENT_MAX: f64 = 99.9;

/// Decimals the instrument resolves for a temperature setpoint.
pub const TEMPERATURE_DECIMALS: i32 = 2;
/// Decimals the instrument resolves for heater and gas-flow outputs.
pub const PERCENT_DECIMALS: i32 = 1;

/// Age after which a cached status word must be fetched again.
pub const STATUS_MAX_AGE: Duration = Duration::from_secs(1);

/// Names of the selectable temperature sensor inputs.
pub const SENSOR_NAMES: [&str; 3] = ["1", "2", "3"];

/// Failure to accept a caller-supplied value. Raised before anything is sent.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ArgumentError {
    #[error("{quantity} of {value} is outside of {min}..={max}")]
    OutOfRange {
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("ramp rate must be a positive number of K/min, got {0}")]
    RampRate(f64),
    #[error("ramp period must be longer than zero")]
    RampPeriod,
    #[error("unknown module '{0}', expected one of '1', '2' or '3'")]
    UnknownModule(String),
}

/// Failure to make sense of an instrument response.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("malformed status word '{response}': {reason}")]
    MalformedStatus { response: String, reason: String },
    #[error("malformed reading '{0}'")]
    MalformedReading(String),
    #[error("instrument rejected '{command}' (reply '{response}')")]
    Rejected { command: String, response: String },
    #[error("unexpected reply '{response}' to '{command}'")]
    UnexpectedReply { command: String, response: String },
}

/// Rounds `value` to `decimals` decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

fn check_range(
    quantity: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<f64, ArgumentError> {
    // NaN fails `contains`, so it is rejected here as well.
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ArgumentError::OutOfRange {
            quantity,
            value,
            min,
            max,
        })
    }
}

/// Validates a temperature setpoint in Kelvin.
pub fn check_temperature(value: f64) -> Result<f64, ArgumentError> {
    check_range(
        "Temperature setpoint",
        value,
        TEMPERATURE_MIN,
        TEMPERATURE_MAX,
    )
}

/// Validates a ramp rate in K/min.
pub fn check_ramp_rate(value: f64) -> Result<f64, ArgumentError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ArgumentError::RampRate(value))
    }
}

/// Line termination negotiated with the `Q` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LineTermination {
    /// Replies end with `\r` (`Q0`).
    Cr,
    /// Replies end with `\r\n` (`Q2`).
    #[default]
    CrLf,
}

impl LineTermination {
    /// Argument of the `Q` command selecting this mode.
    pub fn code(&self) -> u8 {
        match self {
            LineTermination::Cr => 0,
            LineTermination::CrLf => 2,
        }
    }

    /// Byte sequence terminating each reply.
    pub fn terminator(&self) -> &'static str {
        match self {
            LineTermination::Cr => "\r",
            LineTermination::CrLf => "\r\n",
        }
    }
}

impl fmt::Display for LineTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineTermination::Cr => write!(f, "CR"),
            LineTermination::CrLf => write!(f, "CR LF"),
        }
    }
}

/// Local/remote and front panel lock state, the `C` status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    LocalLocked = 0,
    RemoteLocked = 1,
    LocalUnlocked = 2,
    RemoteUnlocked = 3,
}

impl ControlMode {
    pub fn decode(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControlMode::LocalLocked),
            1 => Some(ControlMode::RemoteLocked),
            2 => Some(ControlMode::LocalUnlocked),
            3 => Some(ControlMode::RemoteUnlocked),
            _ => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ControlMode::RemoteLocked | ControlMode::RemoteUnlocked)
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::LocalLocked => write!(f, "local & locked"),
            ControlMode::RemoteLocked => write!(f, "remote & locked"),
            ControlMode::LocalUnlocked => write!(f, "local & unlocked"),
            ControlMode::RemoteUnlocked => write!(f, "remote & unlocked"),
        }
    }
}

/// Combined heater / gas-flow automatic mode, the `A` status field.
///
/// Both flags share one 2-bit code: bit 0 is the heater, bit 1 the gas flow.
/// Changing one flag must start from the current code so that the other one
/// is written back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AutoMode {
    pub heater: bool,
    pub gas: bool,
}

impl AutoMode {
    pub fn decode(code: u8) -> Option<Self> {
        (code <= 3).then_some(AutoMode {
            heater: code & 0b01 != 0,
            gas: code & 0b10 != 0,
        })
    }

    pub fn encode(&self) -> u8 {
        u8::from(self.heater) | (u8::from(self.gas) << 1)
    }

    pub fn with_heater(self, heater: bool) -> Self {
        AutoMode { heater, ..self }
    }

    pub fn with_gas(self, gas: bool) -> Self {
        AutoMode { gas, ..self }
    }
}

/// A temperature sensor input that can drive the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Sensor1 = 1,
    Sensor2 = 2,
    Sensor3 = 3,
}

impl Sensor {
    pub fn decode(code: u8) -> Option<Self> {
        match code {
            1 => Some(Sensor::Sensor1),
            2 => Some(Sensor::Sensor2),
            3 => Some(Sensor::Sensor3),
            _ => None,
        }
    }

    /// The channel reading this sensor's temperature.
    pub fn channel(&self) -> Channel {
        match self {
            Sensor::Sensor1 => Channel::Sensor1,
            Sensor::Sensor2 => Channel::Sensor2,
            Sensor::Sensor3 => Channel::Sensor3,
        }
    }
}

impl FromStr for Sensor {
    type Err = ArgumentError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim() {
            "1" => Ok(Sensor::Sensor1),
            "2" => Ok(Sensor::Sensor2),
            "3" => Ok(Sensor::Sensor3),
            _ => Err(ArgumentError::UnknownModule(name.to_string())),
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Parameters readable with the `R` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    TemperatureSetpoint = 0,
    Sensor1 = 1,
    Sensor2 = 2,
    Sensor3 = 3,
    TemperatureError = 4,
    HeaterPercent = 5,
    HeaterVolts = 6,
    GasFlow = 7,
    ProportionalBand = 8,
    IntegralTime = 9,
}

impl Channel {
    pub fn decode(code: u8) -> Option<Self> {
        use Channel::*;
        [
            TemperatureSetpoint,
            Sensor1,
            Sensor2,
            Sensor3,
            TemperatureError,
            HeaterPercent,
            HeaterVolts,
            GasFlow,
            ProportionalBand,
            IntegralTime,
        ]
        .into_iter()
        .find(|channel| *channel as u8 == code)
    }
}

/// A command that can be sent to the instrument.
///
/// Values are held unrounded; [`Display`](fmt::Display) renders the wire form
/// at the resolution the instrument accepts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetTermination(LineTermination),
    SetControl(ControlMode),
    ExamineStatus,
    Read(Channel),
    SetTemperature(f64),
    SetHeaterOutput(f64),
    SetGasFlow(f64),
    SetAutoMode(AutoMode),
    SetHeaterSensor(Sensor),
}

impl Command {
    /// `T` command after validating the setpoint.
    pub fn set_temperature(kelvin: f64) -> Result<Self, ArgumentError> {
        Ok(Command::SetTemperature(check_temperature(kelvin)?))
    }

    /// `O` command after validating the manual heater output.
    pub fn set_heater_output(percent: f64) -> Result<Self, ArgumentError> {
        let percent = check_range("Heater output", percent, PERCENT_MIN, PERCENT_MAX)?;
        Ok(Command::SetHeaterOutput(percent))
    }

    /// `G` command after validating the manual gas-flow output.
    pub fn set_gas_flow(percent: f64) -> Result<Self, ArgumentError> {
        let percent = check_range("Gas flow", percent, PERCENT_MIN, PERCENT_MAX)?;
        Ok(Command::SetGasFlow(percent))
    }

    /// The command letter the instrument echoes on success.
    pub fn letter(&self) -> char {
        match self {
            Command::SetTermination(_) => 'Q',
            Command::SetControl(_) => 'C',
            Command::ExamineStatus => 'X',
            Command::Read(_) => 'R',
            Command::SetTemperature(_) => 'T',
            Command::SetHeaterOutput(_) => 'O',
            Command::SetGasFlow(_) => 'G',
            Command::SetAutoMode(_) => 'A',
            Command::SetHeaterSensor(_) => 'H',
        }
    }

    /// Whether the instrument answers this command with a line.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Command::SetTermination(_))
    }

    /// Whether the command changes a field of the status word.
    pub fn changes_status(&self) -> bool {
        matches!(
            self,
            Command::SetControl(_) | Command::SetAutoMode(_) | Command::SetHeaterSensor(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetTermination(mode) => write!(f, "Q{}", mode.code()),
            Command::SetControl(mode) => write!(f, "C{}", *mode as u8),
            Command::ExamineStatus => write!(f, "X"),
            Command::Read(channel) => write!(f, "R{}", *channel as u8),
            Command::SetTemperature(kelvin) => write!(
                f,
                "T{:.2}",
                round_to(*kelvin, TEMPERATURE_DECIMALS)
            ),
            Command::SetHeaterOutput(percent) => {
                write!(f, "O{:.1}", round_to(*percent, PERCENT_DECIMALS))
            }
            Command::SetGasFlow(percent) => {
                write!(f, "G{:.1}", round_to(*percent, PERCENT_DECIMALS))
            }
            Command::SetAutoMode(mode) => write!(f, "A{}", mode.encode()),
            Command::SetHeaterSensor(sensor) => write!(f, "H{}", *sensor as u8),
        }
    }
}

/// Checks the acknowledgement of a set command.
pub fn check_ack(command: &Command, response: &str) -> Result<(), ResponseError> {
    let response = response.trim();
    if response.starts_with('?') {
        Err(ResponseError::Rejected {
            command: command.to_string(),
            response: response.to_string(),
        })
    } else if !response.starts_with(command.letter()) {
        Err(ResponseError::UnexpectedReply {
            command: command.to_string(),
            response: response.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Decodes the reply to an `R` command.
///
/// The value follows an `R` marker. Anything that is not part of a number is
/// dropped before parsing since firmware versions differ in padding and sign
/// formatting.
pub fn parse_reading(channel: Channel, response: &str) -> Result<f64, ResponseError> {
    let response = response.trim();
    if response.starts_with('?') {
        return Err(ResponseError::Rejected {
            command: Command::Read(channel).to_string(),
            response: response.to_string(),
        });
    }
    let Some(value) = response.strip_prefix('R') else {
        return Err(ResponseError::UnexpectedReply {
            command: Command::Read(channel).to_string(),
            response: response.to_string(),
        });
    };
    let numeric: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
        .collect();
    numeric
        .parse::<f64>()
        .map_err(|_| ResponseError::MalformedReading(response.to_string()))
}

/// The decoded reply to the `X` command.
///
/// On the wire this is `XnAnCnSn[n]HnLn`, a fixed sequence of one letter tags
/// each followed by one digit (two for the sweep state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord {
    pub system: u8,
    pub auto: AutoMode,
    pub control: ControlMode,
    pub sweep: u8,
    pub control_sensor: Sensor,
    pub auto_pid: bool,
}

impl StatusWord {
    pub fn heater_auto(&self) -> bool {
        self.auto.heater
    }

    pub fn gas_auto(&self) -> bool {
        self.auto.gas
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep != 0
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X{}A{}C{}S{}H{}L{}",
            self.system,
            self.auto.encode(),
            self.control as u8,
            self.sweep,
            self.control_sensor as u8,
            u8::from(self.auto_pid)
        )
    }
}

struct FieldScanner<'a> {
    response: &'a str,
    rest: &'a str,
}

impl<'a> FieldScanner<'a> {
    fn new(response: &'a str) -> Self {
        Self {
            response,
            rest: response,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> ResponseError {
        ResponseError::MalformedStatus {
            response: self.response.to_string(),
            reason: reason.into(),
        }
    }

    /// Consumes `tag` followed by 1 to `max_digits` digits.
    fn field(&mut self, tag: char, max_digits: usize) -> Result<u8, ResponseError> {
        let rest = self
            .rest
            .strip_prefix(tag)
            .ok_or_else(|| self.malformed(format!("expected field '{tag}'")))?;
        let len = rest
            .bytes()
            .take(max_digits)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if len == 0 {
            return Err(self.malformed(format!("field '{tag}' has no value")));
        }
        let (digits, rest) = rest.split_at(len);
        self.rest = rest;
        digits
            .parse()
            .map_err(|_| self.malformed(format!("field '{tag}' is not a number")))
    }

    fn decoded<T>(&self, tag: char, value: Option<T>) -> Result<T, ResponseError> {
        value.ok_or_else(|| self.malformed(format!("field '{tag}' is out of range")))
    }

    fn finish(self) -> Result<(), ResponseError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(self.malformed(format!("trailing characters '{}'", self.rest)))
        }
    }
}

impl FromStr for StatusWord {
    type Err = ResponseError;

    fn from_str(response: &str) -> Result<Self, Self::Err> {
        let mut scanner = FieldScanner::new(response.trim());
        let system = scanner.field('X', 1)?;
        let auto = scanner.field('A', 1)?;
        let auto = scanner.decoded('A', AutoMode::decode(auto))?;
        let control = scanner.field('C', 1)?;
        let control = scanner.decoded('C', ControlMode::decode(control))?;
        let sweep = scanner.field('S', 2)?;
        let sensor = scanner.field('H', 1)?;
        let control_sensor = scanner.decoded('H', Sensor::decode(sensor))?;
        let auto_pid = scanner.field('L', 1)?;
        let auto_pid = scanner.decoded('L', (auto_pid <= 1).then_some(auto_pid == 1))?;
        scanner.finish()?;
        Ok(StatusWord {
            system,
            auto,
            control,
            sweep,
            control_sensor,
            auto_pid,
        })
    }
}
