use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use itc503_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_kelvin(s: &str) -> Result<f64, String> {
    let kelvin = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid temperature value format: {e}"))?;
    proto::check_temperature(kelvin).map_err(|e| e.to_string())
}

fn parse_ramp_rate(s: &str) -> Result<f64, String> {
    let rate = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid ramp rate format: {e}"))?;
    proto::check_ramp_rate(rate).map_err(|e| e.to_string())
}

fn parse_percent(s: &str) -> Result<f64, String> {
    let percent = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid percentage format: {e}"))?;
    if (proto::PERCENT_MIN..=proto::PERCENT_MAX).contains(&percent) {
        Ok(percent)
    } else {
        Err(format!(
            "{percent} is outside of {}..={}",
            proto::PERCENT_MIN,
            proto::PERCENT_MAX
        ))
    }
}

fn parse_sensor(s: &str) -> Result<proto::Sensor, String> {
    s.parse().map_err(|e: proto::ArgumentError| e.to_string())
}

/// Who drives an output.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The instrument's control loop.
    Auto,
    /// The fixed percentage set with `--percent`.
    Manual,
}

impl OutputMode {
    pub fn is_auto(&self) -> bool {
        *self == OutputMode::Auto
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read and display temperature, setpoint, ramp, heater, gas flow and alarms.
    Read,

    /// Read and display the decoded status word.
    Status,

    /// Set the temperature setpoint in Kelvin (0 to 300).
    /// With --ramp the setpoint is approached linearly at the given rate,
    /// and the command waits until the target is reached.
    #[clap(verbatim_doc_comment)]
    SetTemperature {
        /// Target temperature in Kelvin.
        #[arg(value_parser = parse_kelvin)]
        kelvin: f64,

        /// Ramp rate in K/min.
        #[arg(long, value_parser = parse_ramp_rate)]
        ramp: Option<f64>,
    },

    /// Switch the heater between automatic and manual control.
    Heater {
        #[arg(value_enum)]
        mode: OutputMode,

        /// Manual heater output in percent (0 to 99.9).
        #[arg(long, value_parser = parse_percent)]
        percent: Option<f64>,
    },

    /// Switch the gas flow between automatic and manual control.
    Gasflow {
        #[arg(value_enum)]
        mode: OutputMode,

        /// Manual gas flow in percent (0 to 99.9).
        #[arg(long, value_parser = parse_percent)]
        percent: Option<f64>,
    },

    /// Select the sensor used by the control loop (1, 2 or 3).
    SelectSensor {
        #[arg(value_parser = parse_sensor)]
        sensor: proto::Sensor,
    },

    /// Continuously poll all readings and print them to the standard output.
    /// A lost link is reopened on the next cycle.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Interval for polling (e.g., "1s", "500ms")
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "1s")]
        poll_interval: Duration,
    },
}

const fn about_text() -> &'static str {
    "ITC503 CLI - Control Oxford Instruments ITC503 temperature controllers via serial line or TCP."
}

#[derive(Parser, Debug)]
#[command(name="itc503", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// YAML configuration file with `connection` and `driver` sections.
    /// Defaults to "itc503.yml" in the working directory, if present.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Instrument address.
    /// Examples: "/dev/ttyUSB0", "ASRL3::INSTR", "TCPIP::10.0.0.5::7020::SOCKET".
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub address: Option<String>,

    /// Serial baud rate.
    #[arg(global = true, long)]
    pub baud_rate: Option<u32>,

    /// I/O timeout for a single read or write.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// Talk to an in-memory simulated instrument instead of real hardware.
    #[arg(global = true, long)]
    pub simulate: bool,
}
