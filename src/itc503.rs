//! Driver for the Oxford Instruments ITC503 temperature controller.
//!
//! [`Itc503`] implements [`TemperatureController`] on top of any [`Connector`].
//! One driver value can be shared between threads: every operation holds the
//! device lock for its whole command/reply exchange, and read-modify-write
//! operations such as toggling one of the coupled auto flags hold it across
//! the read and the write.
//!
//! Setpoint ramps run on a background thread owned by the driver. While a ramp
//! is active, foreground calls are served between its steps.
//!
//! ## Example
//!
//! ```no_run
//! use itc503_lib::{Itc503, TemperatureController};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let itc = Itc503::open("/dev/ttyUSB0")?;
//!     println!("T = {:.3} K", itc.temperature()?);
//!
//!     itc.set_temperature_ramp(2.0)?;
//!     itc.set_temperature_ramp_enabled(true)?;
//!     itc.set_temperature_setpoint(77.0)?;
//!     Ok(())
//! }
//! ```

use crate::controller::{Alarms, TemperatureController};
use crate::error::{Error, Result};
use crate::protocol::{
    self as proto, AutoMode, Channel, Command, ControlMode, Sensor, StatusWord, SENSOR_NAMES,
};
use crate::ramp::{RampDevice, RampEngine, RampOutcome, DEFAULT_RAMP_PERIOD, DEFAULT_RAMP_RATE};
use crate::status::StatusCache;
use crate::transport::{ConnectOptions, Connector, LineConnector, Transport};
use log::*;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Tunables of the driver itself, as opposed to the link.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Itc503Config {
    /// How long a fetched status word is served from the cache.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub status_max_age: Duration,
    /// Time between two ramp steps.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub ramp_period: Duration,
    /// Initial ramp rate in K/min.
    pub ramp_rate: f64,
}

impl Default for Itc503Config {
    fn default() -> Self {
        Self {
            status_max_age: proto::STATUS_MAX_AGE,
            ramp_period: DEFAULT_RAMP_PERIOD,
            ramp_rate: DEFAULT_RAMP_RATE,
        }
    }
}

impl Itc503Config {
    pub fn validate(&self) -> std::result::Result<(), proto::ArgumentError> {
        proto::check_ramp_rate(self.ramp_rate)?;
        if self.ramp_period.is_zero() {
            return Err(proto::ArgumentError::RampPeriod);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything guarded by the device lock.
struct DeviceState<T> {
    transport: Option<T>,
    status: StatusCache,
    ramp_enabled: bool,
    ramp_rate: f64,
}

impl<T: Transport> DeviceState<T> {
    /// Runs one exchange on the link. An I/O error drops the link, so the
    /// driver reports itself disconnected afterwards.
    fn exchange<R>(&mut self, op: impl FnOnce(&mut T) -> io::Result<R>) -> Result<R> {
        let link = self.transport.as_mut().ok_or_else(Error::not_connected)?;
        match op(link) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("Link to the instrument failed, disconnecting: {err}");
                if let Some(mut transport) = self.transport.take() {
                    if let Err(close_err) = transport.close() {
                        debug!("Closing the failed link: {close_err}");
                    }
                }
                self.status.invalidate();
                Err(err.into())
            }
        }
    }

    fn send(&mut self, command: Command) -> Result<()> {
        let line = command.to_string();
        trace!("Sending {command:?}");
        if !command.expects_reply() {
            return self.exchange(|link| link.write(&line));
        }
        let reply = self.exchange(|link| link.query(&line))?;
        if command.changes_status() {
            self.status.invalidate();
        }
        proto::check_ack(&command, &reply)?;
        Ok(())
    }

    fn read_channel(&mut self, channel: Channel) -> Result<f64> {
        let command = Command::Read(channel).to_string();
        let reply = self.exchange(|link| link.query(&command))?;
        Ok(proto::parse_reading(channel, &reply)?)
    }

    /// The status word, fetched at most once per cache period.
    fn status(&mut self) -> Result<StatusWord> {
        if let Some(word) = self.status.fresh() {
            return Ok(word);
        }
        let command = Command::ExamineStatus.to_string();
        let reply = self.exchange(|link| link.query(&command))?;
        let word = reply.parse::<StatusWord>().inspect_err(|err| {
            warn!("Keeping the last known status: {err}");
        })?;
        debug!("Status {word}");
        self.status.store(word);
        Ok(word)
    }

    /// Rewrites the shared auto field, keeping the flag `update` leaves alone.
    fn update_auto_mode(&mut self, update: impl FnOnce(AutoMode) -> AutoMode) -> Result<()> {
        let current = self.status()?.auto;
        let next = update(current);
        self.send(Command::SetAutoMode(next))
    }
}

/// The device lock, shared with the ramp thread.
struct Shared<T> {
    state: Mutex<DeviceState<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, DeviceState<T>> {
        lock(&self.state)
    }
}

impl<T: Transport + 'static> RampDevice for Shared<T> {
    fn read_setpoint(&self) -> Result<f64> {
        self.lock().read_channel(Channel::TemperatureSetpoint)
    }

    fn advance(&self, next: &mut dyn FnMut(f64) -> f64) -> Result<Option<f64>> {
        let mut state = self.lock();
        if !state.ramp_enabled {
            return Ok(None);
        }
        let setpoint = next(state.ramp_rate);
        state.send(Command::set_temperature(setpoint)?)?;
        Ok(Some(setpoint))
    }

    fn write_setpoint(&self, kelvin: f64) -> Result<()> {
        self.lock().send(Command::set_temperature(kelvin)?)
    }
}

/// ITC503 driver, generic over how the link is opened.
///
/// Construction never touches the wire. Call
/// [`connect`](TemperatureController::connect) or use [`Itc503::open`].
pub struct Itc503<C: Connector = LineConnector> {
    address: String,
    connector: C,
    options: Mutex<ConnectOptions>,
    config: Itc503Config,
    shared: Arc<Shared<C::Transport>>,
    ramp: Mutex<RampEngine>,
}

impl Itc503<LineConnector> {
    /// Creates a driver for a serial or TCP `address` and connects it.
    pub fn open(address: impl Into<String>) -> Result<Self> {
        let driver = Self::new(address, LineConnector);
        driver.connect()?;
        Ok(driver)
    }
}

impl<C: Connector> Itc503<C> {
    pub fn new(address: impl Into<String>, connector: C) -> Self {
        let config = Itc503Config::default();
        Self {
            address: address.into(),
            connector,
            options: Mutex::new(ConnectOptions::default()),
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState {
                    transport: None,
                    status: StatusCache::new(config.status_max_age),
                    ramp_enabled: false,
                    ramp_rate: config.ramp_rate,
                }),
            }),
            config,
            ramp: Mutex::new(RampEngine::new()),
        }
    }

    /// Replaces the link settings used by the next connect.
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = Mutex::new(options);
        self
    }

    /// Replaces the driver tunables. Fails on a non-positive rate or a zero
    /// period.
    pub fn with_config(mut self, config: Itc503Config) -> Result<Self> {
        config.validate()?;
        {
            let mut state = self.shared.lock();
            state.status = StatusCache::new(config.status_max_age);
            state.ramp_rate = config.ramp_rate;
        }
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &Itc503Config {
        &self.config
    }

    pub fn options(&self) -> ConnectOptions {
        lock(&self.options).clone()
    }

    /// Connects with new link settings, which are kept for later connects.
    pub fn connect_with(&self, options: ConnectOptions) -> Result<()> {
        *lock(&self.options) = options;
        self.connect()
    }

    /// The decoded status word, served from the cache while it is fresh.
    pub fn status(&self) -> Result<StatusWord> {
        self.shared.lock().status()
    }

    /// The last status word successfully fetched, regardless of its age.
    pub fn cached_status(&self) -> Option<StatusWord> {
        self.shared.lock().status.last_known()
    }

    /// Reads one raw `R` channel.
    pub fn read_channel(&self, channel: Channel) -> Result<f64> {
        self.shared.lock().read_channel(channel)
    }

    /// Whether a ramp task is running.
    pub fn is_ramping(&self) -> bool {
        lock(&self.ramp).is_active()
    }

    /// Target of the running ramp.
    pub fn ramp_target(&self) -> Option<f64> {
        lock(&self.ramp).target()
    }

    /// Blocks until the running ramp ends and returns how it ended.
    ///
    /// Starting another ramp from a different thread waits until this returns.
    pub fn wait_for_ramp(&self) -> Option<RampOutcome> {
        lock(&self.ramp).wait()
    }

    fn stop_ramp(&self) {
        if let Some(outcome) = lock(&self.ramp).cancel() {
            debug!("Stopped ramp: {outcome:?}");
        }
    }
}

impl<C: Connector> fmt::Debug for Itc503<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Itc503")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> TemperatureController for Itc503<C> {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> Result<()> {
        let options = self.options();
        let mut state = self.shared.lock();
        if state.transport.is_some() {
            return Ok(());
        }
        info!("Connecting to ITC503 at {}", self.address);
        let transport = self
            .connector
            .connect(&self.address, &options)
            .inspect_err(|err| error!("Cannot open {}: {err}", self.address))?;
        state.transport = Some(transport);
        state.status.clear();

        let handshake = state
            .send(Command::SetTermination(options.termination))
            .and_then(|()| state.send(Command::SetControl(ControlMode::RemoteUnlocked)));
        if let Err(err) = handshake {
            // An I/O failure has already dropped the link; a refused step
            // leaves it open.
            error!("Handshake with {} failed: {err}", self.address);
            return Err(match err {
                Error::ConnectionFailure(_) => err,
                other => Error::ConnectionFailure(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    other.to_string(),
                )),
            });
        }
        info!("Connected to ITC503 at {}", self.address);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.stop_ramp();
        let mut state = self.shared.lock();
        let Some(mut transport) = state.transport.take() else {
            return Ok(());
        };
        state.status.clear();
        info!("Disconnecting from ITC503 at {}", self.address);
        transport.close().map_err(|err| {
            warn!("Closing the link to {} failed: {err}", self.address);
            Error::from(err)
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().transport.is_some()
    }

    fn select_temp_module(&self, name: &str) -> Result<()> {
        let sensor: Sensor = name.parse()?;
        self.shared.lock().send(Command::SetHeaterSensor(sensor))
    }

    fn temp_modules(&self) -> Result<Vec<String>> {
        Ok(SENSOR_NAMES.iter().map(|name| name.to_string()).collect())
    }

    fn select_heater_module(&self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("heater module selection"))
    }

    fn heater_modules(&self) -> Result<Vec<String>> {
        Err(Error::Unsupported("heater module enumeration"))
    }

    fn select_gasflow_module(&self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("gas-flow module selection"))
    }

    fn gasflow_modules(&self) -> Result<Vec<String>> {
        Err(Error::Unsupported("gas-flow module enumeration"))
    }

    fn temperature(&self) -> Result<f64> {
        self.read_channel(Channel::Sensor1)
    }

    fn temperature_setpoint(&self) -> Result<f64> {
        self.read_channel(Channel::TemperatureSetpoint)
    }

    fn set_temperature_setpoint(&self, kelvin: f64) -> Result<()> {
        let command = Command::set_temperature(kelvin)?;
        // Held until the write is issued, so a ramp cannot settle after it.
        let mut ramp = lock(&self.ramp);
        let (connected, ramp_enabled) = {
            let state = self.shared.lock();
            (state.transport.is_some(), state.ramp_enabled)
        };
        if !ramp_enabled {
            if let Some(outcome) = ramp.cancel() {
                debug!("Stopped ramp before direct write: {outcome:?}");
            }
            return self.shared.lock().send(command);
        }
        if !connected {
            return Err(Error::not_connected());
        }
        if let Some(outcome) = ramp.start(self.shared.clone(), kelvin, self.config.ramp_period) {
            debug!("Replaced ramp: {outcome:?}");
        }
        Ok(())
    }

    fn temperature_ramp(&self) -> Result<f64> {
        Ok(self.shared.lock().ramp_rate)
    }

    fn set_temperature_ramp(&self, kelvin_per_min: f64) -> Result<()> {
        let rate = proto::check_ramp_rate(kelvin_per_min)?;
        debug!("Ramp rate {rate} K/min");
        self.shared.lock().ramp_rate = rate;
        Ok(())
    }

    fn temperature_ramp_enabled(&self) -> Result<bool> {
        Ok(self.shared.lock().ramp_enabled)
    }

    fn set_temperature_ramp_enabled(&self, enabled: bool) -> Result<()> {
        self.shared.lock().ramp_enabled = enabled;
        if !enabled {
            self.stop_ramp();
        }
        Ok(())
    }

    fn heater_volt(&self) -> Result<f64> {
        self.read_channel(Channel::HeaterVolts)
    }

    fn heater_auto(&self) -> Result<bool> {
        Ok(self.status()?.heater_auto())
    }

    fn set_heater_auto(&self, auto: bool) -> Result<()> {
        self.shared
            .lock()
            .update_auto_mode(|mode| mode.with_heater(auto))
    }

    fn heater_setpoint(&self) -> Result<f64> {
        self.read_channel(Channel::HeaterPercent)
    }

    fn set_heater_setpoint(&self, percent: f64) -> Result<()> {
        let command = Command::set_heater_output(percent)?;
        self.shared.lock().send(command)
    }

    fn gasflow(&self) -> Result<f64> {
        self.read_channel(Channel::GasFlow)
    }

    fn gasflow_auto(&self) -> Result<bool> {
        Ok(self.status()?.gas_auto())
    }

    fn set_gasflow_auto(&self, auto: bool) -> Result<()> {
        self.shared.lock().update_auto_mode(|mode| mode.with_gas(auto))
    }

    fn gasflow_setpoint(&self) -> Result<f64> {
        self.read_channel(Channel::GasFlow)
    }

    fn set_gasflow_setpoint(&self, percent: f64) -> Result<()> {
        let command = Command::set_gas_flow(percent)?;
        self.shared.lock().send(command)
    }

    fn alarms(&self) -> Result<Alarms> {
        Ok(Alarms::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{SimulatedConnector, SimulatedItc503};
    use crate::protocol::{ArgumentError, LineTermination, ResponseError};
    use assert_matches::assert_matches;
    use std::thread;

    fn driver(instrument: &SimulatedItc503) -> Itc503<SimulatedConnector> {
        Itc503::new("sim", instrument.connector())
    }

    fn connected(instrument: &SimulatedItc503, config: Itc503Config) -> Itc503<SimulatedConnector> {
        let itc = driver(instrument).with_config(config).unwrap();
        itc.connect().unwrap();
        instrument.clear_commands();
        itc
    }

    fn fast_ramp() -> Itc503Config {
        Itc503Config {
            ramp_period: Duration::from_millis(10),
            ramp_rate: 600.0,
            ..Default::default()
        }
    }

    fn setpoint_writes(instrument: &SimulatedItc503) -> Vec<f64> {
        instrument
            .commands()
            .iter()
            .filter_map(|command| command.strip_prefix('T'))
            .map(|value| value.parse().unwrap())
            .collect()
    }

    #[test]
    fn connect_runs_handshake_once() {
        let instrument = SimulatedItc503::new();
        let itc = driver(&instrument);
        assert!(!itc.is_connected());
        itc.connect().unwrap();
        assert!(itc.is_connected());
        assert_eq!(instrument.commands(), ["Q2", "C3"]);
        assert_eq!(instrument.termination(), LineTermination::CrLf);
        assert_eq!(instrument.control_mode(), ControlMode::RemoteUnlocked);

        itc.connect().unwrap();
        assert_eq!(instrument.connects(), 1);
        assert_eq!(instrument.commands().len(), 2);
    }

    #[test]
    fn connect_with_cr_termination() {
        let instrument = SimulatedItc503::new();
        let itc = driver(&instrument);
        itc.connect_with(ConnectOptions {
            termination: LineTermination::Cr,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(instrument.commands(), ["Q0", "C3"]);
        assert_eq!(itc.options().termination, LineTermination::Cr);
    }

    #[test]
    fn refused_connection_leaves_driver_disconnected() {
        let instrument = SimulatedItc503::new();
        instrument.refuse_connections(true);
        let itc = driver(&instrument);
        assert_matches!(itc.connect(), Err(Error::ConnectionFailure(_)));
        assert!(!itc.is_connected());
        assert_eq!(instrument.connects(), 0);
    }

    #[test]
    fn failed_handshake_closes_the_link() {
        let instrument = SimulatedItc503::new();
        instrument.break_link(true);
        let itc = driver(&instrument);
        assert_matches!(itc.connect(), Err(Error::ConnectionFailure(_)));
        assert!(!itc.is_connected());

        instrument.break_link(false);
        itc.connect().unwrap();
        assert!(itc.is_connected());
        assert_eq!(instrument.connects(), 2);
    }

    #[test]
    fn refused_handshake_keeps_the_link() {
        let instrument = SimulatedItc503::new();
        instrument.reject_commands(Some('C'));
        let itc = driver(&instrument);
        assert_matches!(itc.connect(), Err(Error::ConnectionFailure(_)));
        assert!(itc.is_connected());
        assert_eq!(instrument.commands(), ["Q2", "C3"]);
        assert_eq!(instrument.closes(), 0);
        assert_eq!(instrument.control_mode(), ControlMode::LocalLocked);

        instrument.reject_commands(None);
        itc.disconnect().unwrap();
        itc.connect().unwrap();
        assert_eq!(instrument.control_mode(), ControlMode::RemoteUnlocked);
    }

    #[test]
    fn operations_fail_while_disconnected() {
        let instrument = SimulatedItc503::new();
        let itc = driver(&instrument);
        assert_matches!(itc.temperature(), Err(Error::ConnectionFailure(_)));
        assert_matches!(itc.heater_auto(), Err(Error::ConnectionFailure(_)));
        assert_matches!(
            itc.set_temperature_setpoint(20.0),
            Err(Error::ConnectionFailure(_))
        );
        assert!(instrument.commands().is_empty());
    }

    #[test]
    fn setpoint_round_trips() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        for kelvin in [0.0, 4.2, 123.45, 300.0] {
            itc.set_temperature_setpoint(kelvin).unwrap();
            assert_eq!(itc.temperature_setpoint().unwrap(), kelvin);
        }
        assert_eq!(instrument.count("T"), 4);
    }

    #[test]
    fn out_of_range_values_never_reach_the_wire() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        for kelvin in [-0.1, 300.01, f64::NAN] {
            assert_matches!(
                itc.set_temperature_setpoint(kelvin),
                Err(Error::InvalidArgument(ArgumentError::OutOfRange { .. }))
            );
        }
        assert_matches!(itc.set_heater_setpoint(100.0), Err(Error::InvalidArgument(_)));
        assert_matches!(itc.set_gasflow_setpoint(-1.0), Err(Error::InvalidArgument(_)));
        assert_matches!(
            itc.set_temperature_ramp(0.0),
            Err(Error::InvalidArgument(ArgumentError::RampRate(_)))
        );
        assert!(instrument.commands().is_empty());
        assert_eq!(itc.temperature_ramp().unwrap(), 1.0);
    }

    #[test]
    fn auto_flags_are_coupled() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());

        itc.set_heater_auto(true).unwrap();
        itc.set_gasflow_auto(false).unwrap();
        assert_eq!(
            instrument.auto_mode(),
            AutoMode {
                heater: true,
                gas: false
            }
        );
        assert!(itc.heater_auto().unwrap());
        assert!(!itc.gasflow_auto().unwrap());

        itc.set_gasflow_auto(true).unwrap();
        itc.set_heater_auto(false).unwrap();
        assert_eq!(
            instrument.auto_mode(),
            AutoMode {
                heater: false,
                gas: true
            }
        );
        assert_eq!(instrument.count("A"), 4);
    }

    #[test]
    fn coupled_updates_from_two_threads_keep_both_flags() {
        let instrument = SimulatedItc503::new();
        let itc = Arc::new(connected(&instrument, Itc503Config::default()));
        let heater = {
            let itc = itc.clone();
            thread::spawn(move || itc.set_heater_auto(true))
        };
        let gas = {
            let itc = itc.clone();
            thread::spawn(move || itc.set_gasflow_auto(true))
        };
        heater.join().unwrap().unwrap();
        gas.join().unwrap().unwrap();
        assert_eq!(instrument.auto_mode(), AutoMode::decode(3).unwrap());
    }

    #[test]
    fn status_is_fetched_once_per_period() {
        let instrument = SimulatedItc503::new();
        let itc = connected(
            &instrument,
            Itc503Config {
                status_max_age: Duration::from_millis(50),
                ..Default::default()
            },
        );
        itc.heater_auto().unwrap();
        itc.gasflow_auto().unwrap();
        assert_eq!(instrument.count("X"), 1);

        thread::sleep(Duration::from_millis(80));
        itc.heater_auto().unwrap();
        assert_eq!(instrument.count("X"), 2);
    }

    #[test]
    fn malformed_status_keeps_the_last_known_word() {
        let instrument = SimulatedItc503::new();
        let itc = connected(
            &instrument,
            Itc503Config {
                status_max_age: Duration::ZERO,
                ..Default::default()
            },
        );
        let good = itc.status().unwrap();
        assert_eq!(good.control, ControlMode::RemoteUnlocked);

        instrument.set_status_reply(Some("X0A1C3"));
        assert_matches!(
            itc.heater_auto(),
            Err(Error::Protocol(ResponseError::MalformedStatus { .. }))
        );
        assert_eq!(itc.cached_status(), Some(good));
        assert!(itc.is_connected());

        instrument.set_status_reply(None);
        assert!(!itc.heater_auto().unwrap());
    }

    #[test]
    fn rejected_commands_are_protocol_errors() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        instrument.set_control_mode(ControlMode::LocalLocked);
        assert_matches!(
            itc.set_heater_setpoint(50.0),
            Err(Error::Protocol(ResponseError::Rejected { .. }))
        );
        assert!(itc.is_connected());
    }

    #[test]
    fn link_failure_marks_disconnected() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        instrument.break_link(true);
        let err = itc.temperature().unwrap_err();
        assert!(err.is_connection_failure());
        assert!(!itc.is_connected());
        assert_matches!(itc.heater_auto(), Err(Error::ConnectionFailure(_)));

        instrument.break_link(false);
        itc.connect().unwrap();
        assert_eq!(itc.temperature().unwrap(), 10.0);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        itc.disconnect().unwrap();
        assert!(!itc.is_connected());
        itc.disconnect().unwrap();
        assert_eq!(instrument.closes(), 1);
        assert_eq!(itc.cached_status(), None);
    }

    #[test]
    fn failed_close_still_disconnects() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        instrument.break_link(true);
        assert_matches!(itc.disconnect(), Err(Error::ConnectionFailure(_)));
        assert!(!itc.is_connected());
    }

    #[test]
    fn readings_map_to_channels() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        itc.set_heater_setpoint(50.0).unwrap();
        itc.set_gasflow_setpoint(12.3).unwrap();
        assert_eq!(instrument.commands(), ["O50.0", "G12.3"]);
        assert_eq!(itc.heater_setpoint().unwrap(), 50.0);
        assert_eq!(itc.heater_volt().unwrap(), 20.0);
        assert_eq!(itc.gasflow().unwrap(), 12.3);
        assert_eq!(itc.gasflow_setpoint().unwrap(), 12.3);
        assert_eq!(itc.temperature().unwrap(), 10.0);
        assert!(itc.alarms().unwrap().is_empty());
    }

    #[test]
    fn module_selection() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, Itc503Config::default());
        assert_eq!(itc.temp_modules().unwrap(), ["1", "2", "3"]);
        itc.select_temp_module("2").unwrap();
        assert_eq!(instrument.sensor(), Sensor::Sensor2);
        assert_eq!(itc.status().unwrap().control_sensor, Sensor::Sensor2);
        assert_matches!(
            itc.select_temp_module("4"),
            Err(Error::InvalidArgument(ArgumentError::UnknownModule(_)))
        );
        assert_eq!(instrument.count("H"), 1);

        assert_matches!(itc.heater_modules(), Err(Error::Unsupported(_)));
        assert_matches!(itc.select_heater_module("1"), Err(Error::Unsupported(_)));
        assert_matches!(itc.gasflow_modules(), Err(Error::Unsupported(_)));
        assert_matches!(itc.select_gasflow_module("1"), Err(Error::Unsupported(_)));
    }

    #[test]
    fn invalid_config_is_refused() {
        let instrument = SimulatedItc503::new();
        assert_matches!(
            driver(&instrument).with_config(Itc503Config {
                ramp_period: Duration::ZERO,
                ..Default::default()
            }),
            Err(Error::InvalidArgument(ArgumentError::RampPeriod))
        );
    }

    #[test]
    fn ramp_steps_to_target() {
        let instrument = SimulatedItc503::new();
        let itc = connected(&instrument, fast_ramp());
        itc.set_temperature_ramp_enabled(true).unwrap();
        itc.set_temperature_setpoint(10.3).unwrap();
        assert_matches!(itc.wait_for_ramp(), Some(RampOutcome::Reached(target)) if target == 10.3);

        let writes: Vec<String> = instrument
            .commands()
            .into_iter()
            .filter(|command| command.starts_with('T'))
            .collect();
        assert_eq!(writes, ["T10.10", "T10.20", "T10.30"]);
        assert_eq!(instrument.setpoint(), 10.3);
        assert!(!itc.is_ramping());
    }

    #[test]
    fn new_ramp_replaces_the_running_one() {
        let instrument = SimulatedItc503::new();
        let itc = connected(
            &instrument,
            Itc503Config {
                ramp_period: Duration::from_millis(5),
                ..fast_ramp()
            },
        );
        itc.set_temperature_ramp_enabled(true).unwrap();
        itc.set_temperature_setpoint(30.0).unwrap();
        thread::sleep(Duration::from_millis(40));
        itc.set_temperature_setpoint(5.0).unwrap();
        assert_eq!(itc.ramp_target(), Some(5.0));
        thread::sleep(Duration::from_millis(40));
        itc.set_temperature_ramp_enabled(false).unwrap();
        assert!(!itc.is_ramping());

        let writes = setpoint_writes(&instrument);
        let turn = writes
            .windows(2)
            .position(|pair| pair[1] < pair[0])
            .expect("second ramp goes down");
        assert!(writes[..=turn].windows(2).all(|pair| pair[1] >= pair[0]));
        assert!(writes[turn..].windows(2).all(|pair| pair[1] <= pair[0]));
    }

    #[test]
    fn disabling_ramp_settles_setpoint() {
        let instrument = SimulatedItc503::new();
        let itc = connected(
            &instrument,
            Itc503Config {
                ramp_period: Duration::from_millis(20),
                ramp_rate: 60.0,
                ..Default::default()
            },
        );
        itc.set_temperature_ramp_enabled(true).unwrap();
        itc.set_temperature_setpoint(50.0).unwrap();
        thread::sleep(Duration::from_millis(70));
        assert!(itc.is_ramping());

        itc.set_temperature_ramp_enabled(false).unwrap();
        assert!(!itc.is_ramping());
        let writes = setpoint_writes(&instrument);
        let settled = writes[writes.len() - 1];
        assert!(settled > 10.0 && settled < 50.0);
        assert_eq!(instrument.setpoint(), settled);

        itc.set_temperature_setpoint(20.0).unwrap();
        assert_eq!(instrument.setpoint(), 20.0);
    }

    #[test]
    fn direct_write_lands_after_the_ramp_settles() {
        let instrument = SimulatedItc503::new();
        let itc = Arc::new(connected(
            &instrument,
            Itc503Config {
                ramp_period: Duration::from_millis(200),
                ramp_rate: 6.0,
                ..Default::default()
            },
        ));
        itc.set_temperature_ramp_enabled(true).unwrap();
        itc.set_temperature_setpoint(20.0).unwrap();

        let waiter = {
            let itc = itc.clone();
            thread::spawn(move || itc.wait_for_ramp())
        };
        thread::sleep(Duration::from_millis(30));
        let disabler = {
            let itc = itc.clone();
            thread::spawn(move || itc.set_temperature_ramp_enabled(false))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!itc.temperature_ramp_enabled().unwrap());

        itc.set_temperature_setpoint(20.0).unwrap();
        assert_matches!(waiter.join().unwrap(), Some(RampOutcome::Cancelled(_)));
        disabler.join().unwrap().unwrap();

        let commands = instrument.commands();
        assert_eq!(commands.last().map(String::as_str), Some("T20.00"));
        assert_eq!(instrument.setpoint(), 20.0);
    }

    #[test]
    fn foreground_calls_interleave_with_a_ramp() {
        let instrument = SimulatedItc503::new();
        let itc = connected(
            &instrument,
            Itc503Config {
                ramp_period: Duration::from_millis(10),
                ramp_rate: 60.0,
                ..Default::default()
            },
        );
        itc.set_temperature_ramp_enabled(true).unwrap();
        itc.set_temperature_setpoint(20.0).unwrap();
        for _ in 0..5 {
            assert_eq!(itc.temperature().unwrap(), 10.0);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(itc.is_ramping());
        itc.disconnect().unwrap();
        assert!(!itc.is_ramping());
        assert!(!itc.is_connected());
    }

    #[test]
    fn ramp_needs_a_connection() {
        let instrument = SimulatedItc503::new();
        let itc = driver(&instrument);
        itc.set_temperature_ramp_enabled(true).unwrap();
        assert_matches!(
            itc.set_temperature_setpoint(20.0),
            Err(Error::ConnectionFailure(_))
        );
        assert!(!itc.is_ramping());
    }
}
