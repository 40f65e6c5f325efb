//! The control surface shared by all temperature controller drivers.
//!
//! A front end or poller only ever talks to a [`TemperatureController`]; which
//! instrument model sits behind it is decided once, at construction.
use crate::error::Result;
use std::collections::BTreeMap;

/// Active alarms, keyed by alarm name, valued by description.
pub type Alarms = BTreeMap<String, String>;

/// Capabilities every temperature controller driver provides.
///
/// All methods take `&self` so one driver can be shared between a foreground
/// caller and a background poller. Setters validate their argument before
/// touching the wire and fail with
/// [`Error::InvalidArgument`](crate::Error::InvalidArgument) without sending
/// anything. Every operation except [`is_connected`](Self::is_connected) fails
/// with [`Error::ConnectionFailure`](crate::Error::ConnectionFailure) while the
/// link is down. Capabilities an instrument lacks fail with
/// [`Error::Unsupported`](crate::Error::Unsupported).
pub trait TemperatureController: Send + Sync {
    /// Address the driver connects to.
    fn address(&self) -> &str;

    /// Opens the link. Does nothing if already connected.
    fn connect(&self) -> Result<()>;

    /// Closes the link. The driver is disconnected afterwards even if closing
    /// the underlying transport failed. Does nothing if not connected.
    fn disconnect(&self) -> Result<()>;

    /// Whether the link is up. Never touches the wire.
    fn is_connected(&self) -> bool;

    /// Selects the temperature sensor driving the control loop.
    fn select_temp_module(&self, name: &str) -> Result<()>;

    /// Names of all selectable temperature sensors.
    fn temp_modules(&self) -> Result<Vec<String>>;

    /// Selects the heater module used with the current sensor.
    fn select_heater_module(&self, name: &str) -> Result<()>;

    /// Names of all heater modules.
    fn heater_modules(&self) -> Result<Vec<String>>;

    /// Selects the gas-flow module used with the current sensor.
    fn select_gasflow_module(&self, name: &str) -> Result<()>;

    /// Names of all gas-flow modules.
    fn gasflow_modules(&self) -> Result<Vec<String>>;

    /// Current temperature in Kelvin.
    fn temperature(&self) -> Result<f64>;

    /// Temperature setpoint in Kelvin.
    fn temperature_setpoint(&self) -> Result<f64>;

    /// Sets the temperature setpoint in Kelvin, `0..=300`.
    ///
    /// With ramping enabled this starts a ramp towards `kelvin` instead of
    /// writing it directly.
    fn set_temperature_setpoint(&self, kelvin: f64) -> Result<()>;

    /// Ramp rate in K/min.
    fn temperature_ramp(&self) -> Result<f64>;

    /// Sets the ramp rate in K/min, which must be positive.
    fn set_temperature_ramp(&self, kelvin_per_min: f64) -> Result<()>;

    fn temperature_ramp_enabled(&self) -> Result<bool>;

    /// Enables or disables ramping. Disabling stops an active ramp.
    fn set_temperature_ramp_enabled(&self, enabled: bool) -> Result<()>;

    /// Heater output in Volts.
    fn heater_volt(&self) -> Result<f64>;

    /// Whether the heater is under automatic control.
    fn heater_auto(&self) -> Result<bool>;

    fn set_heater_auto(&self, auto: bool) -> Result<()>;

    /// Heater output in percent of the maximum voltage.
    fn heater_setpoint(&self) -> Result<f64>;

    /// Sets the manual heater output in percent, `0..=99.9`.
    fn set_heater_setpoint(&self, percent: f64) -> Result<()>;

    /// Gas flow in percent.
    fn gasflow(&self) -> Result<f64>;

    /// Whether the gas flow is under automatic control.
    fn gasflow_auto(&self) -> Result<bool>;

    fn set_gasflow_auto(&self, auto: bool) -> Result<()>;

    /// Gas-flow setpoint in percent.
    fn gasflow_setpoint(&self) -> Result<f64>;

    /// Sets the manual gas flow in percent, `0..=99.9`.
    fn set_gasflow_setpoint(&self, percent: f64) -> Result<()>;

    /// Active alarms.
    fn alarms(&self) -> Result<Alarms>;
}
