//! Snapshots of everything a front end displays, collected through the
//! controller contract.
use crate::controller::{Alarms, TemperatureController};
use crate::error::Result;
use log::*;
use std::fmt;

/// One reading of all displayed values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Readings {
    /// Kelvin.
    pub temperature: f64,
    /// Kelvin.
    pub setpoint: f64,
    /// K/min.
    pub ramp_rate: f64,
    pub ramp_enabled: bool,
    pub heater_volt: f64,
    pub heater_auto: bool,
    /// Percent.
    pub heater_percent: f64,
    pub gas_auto: bool,
    /// Percent.
    pub gasflow: f64,
    /// Percent.
    pub gas_setpoint: f64,
    pub alarms: Alarms,
}

impl Readings {
    /// Reads every value once. The first failure aborts the snapshot.
    pub fn collect(controller: &dyn TemperatureController) -> Result<Self> {
        Ok(Self {
            temperature: controller.temperature()?,
            setpoint: controller.temperature_setpoint()?,
            ramp_rate: controller.temperature_ramp()?,
            ramp_enabled: controller.temperature_ramp_enabled()?,
            heater_volt: controller.heater_volt()?,
            heater_auto: controller.heater_auto()?,
            heater_percent: controller.heater_setpoint()?,
            gas_auto: controller.gasflow_auto()?,
            gasflow: controller.gasflow()?,
            gas_setpoint: controller.gasflow_setpoint()?,
            alarms: controller.alarms()?,
        })
    }
}

fn mode(auto: bool) -> &'static str {
    if auto {
        "auto"
    } else {
        "manual"
    }
}

impl fmt::Display for Readings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Temperature:   {:.3} K", self.temperature)?;
        writeln!(f, "Setpoint:      {:.2} K", self.setpoint)?;
        writeln!(
            f,
            "Ramp:          {:.3} K/min ({})",
            self.ramp_rate,
            if self.ramp_enabled { "enabled" } else { "disabled" }
        )?;
        writeln!(
            f,
            "Heater:        {:.1} % / {:.2} V ({})",
            self.heater_percent,
            self.heater_volt,
            mode(self.heater_auto)
        )?;
        writeln!(
            f,
            "Gas flow:      {:.1} % of {:.1} % ({})",
            self.gasflow,
            self.gas_setpoint,
            mode(self.gas_auto)
        )?;
        if self.alarms.is_empty() {
            write!(f, "Alarms:        none")
        } else {
            write!(f, "Alarms:")?;
            for (name, description) in &self.alarms {
                write!(f, "\n  {name}: {description}")?;
            }
            Ok(())
        }
    }
}

/// One cycle of a periodic poller.
///
/// A dropped link is reopened first. A connection failure leaves the
/// controller disconnected, so the next cycle tries again.
pub fn poll(controller: &dyn TemperatureController) -> Result<Readings> {
    if !controller.is_connected() {
        info!("Reconnecting to {}", controller.address());
        controller.connect()?;
    }
    Readings::collect(controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::itc503::Itc503;
    use crate::mock::SimulatedItc503;
    use crate::protocol::{AutoMode, ResponseError};
    use assert_matches::assert_matches;

    #[test]
    fn collects_all_values() {
        let instrument = SimulatedItc503::new();
        let itc = Itc503::new("sim", instrument.connector());
        itc.connect().unwrap();
        itc.set_temperature_setpoint(12.5).unwrap();
        itc.set_heater_setpoint(25.0).unwrap();
        itc.set_gasflow_setpoint(40.0).unwrap();
        instrument.set_auto_mode(AutoMode {
            heater: false,
            gas: true,
        });
        itc.set_temperature_ramp(3.0).unwrap();

        let readings = Readings::collect(&itc).unwrap();
        assert_eq!(
            readings,
            Readings {
                temperature: 10.0,
                setpoint: 12.5,
                ramp_rate: 3.0,
                ramp_enabled: false,
                heater_volt: 10.0,
                heater_auto: false,
                heater_percent: 25.0,
                gas_auto: true,
                gasflow: 40.0,
                gas_setpoint: 40.0,
                alarms: Alarms::new(),
            }
        );
        let text = readings.to_string();
        assert!(text.contains("Temperature:   10.000 K"));
        assert!(text.contains("Alarms:        none"));
    }

    #[test]
    fn poll_reconnects_after_link_failure() {
        let instrument = SimulatedItc503::new();
        let itc = Itc503::new("sim", instrument.connector());
        assert!(poll(&itc).is_ok());

        instrument.break_link(true);
        assert_matches!(poll(&itc), Err(err) if err.is_connection_failure());
        assert!(!itc.is_connected());
        assert_matches!(poll(&itc), Err(Error::ConnectionFailure(_)));

        instrument.break_link(false);
        assert!(poll(&itc).is_ok());
        assert!(itc.is_connected());
        assert_eq!(instrument.connects(), 3);
    }

    #[test]
    fn protocol_errors_keep_the_link() {
        let instrument = SimulatedItc503::new();
        let itc = Itc503::new("sim", instrument.connector());
        itc.connect().unwrap();
        instrument.set_status_reply(Some("garbage"));
        assert_matches!(
            poll(&itc),
            Err(Error::Protocol(ResponseError::MalformedStatus { .. }))
        );
        assert!(itc.is_connected());
    }
}
