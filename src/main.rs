//! ITC503 CLI
//!
//! A command-line interface (CLI) application for interacting with Oxford
//! Instruments ITC503 cryogenic temperature controllers over a serial line or a
//! raw TCP socket.
//!
//! This tool allows users to:
//! - Read temperature, setpoint, ramp, heater, gas flow and alarms.
//! - Read the decoded status word.
//! - Set the temperature setpoint, directly or as a linear ramp.
//! - Switch heater and gas flow between automatic and manual control.
//! - Select the sensor driving the control loop.
//! - Run a continuous monitor that survives link failures.
//!
//! The CLI leverages the `itc503_lib` crate for the protocol and the driver.

use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use itc503_lib::{
    mock::SimulatedItc503,
    ramp::RampOutcome,
    readings::{self, Readings},
    transport::{ConnectOptions, Connector, LineConnector},
    Itc503, TemperatureController,
};
use log::*;
use std::{panic, thread};

mod commandline;
mod config;

/// Starts logging and routes panics of every thread to the log.
fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Invalid log specification")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| String::from("<unknown location>"));
        let cause = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic_info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<no message>");
        error!(
            target: "itc503::panic",
            "{} thread panicked at {location}: {cause}",
            thread::current().name().unwrap_or("unnamed"),
        );
    }));
    Ok(log_handle)
}

/// Applies command line overrides on top of the config file.
fn connection_settings(
    args: &commandline::CliArgs,
    config: &config::Config,
) -> (String, ConnectOptions) {
    let address = args
        .address
        .clone()
        .unwrap_or_else(|| config.connection.address.clone());
    let mut options = config.connection.options.clone();
    if let Some(baud_rate) = args.baud_rate {
        options.baud_rate = baud_rate;
    }
    if let Some(timeout) = args.timeout {
        options.timeout = timeout;
    }
    (address, options)
}

fn print_readings(itc: &dyn TemperatureController) -> Result<()> {
    let readings = Readings::collect(itc).with_context(|| "Cannot read values")?;
    println!("{readings}");
    Ok(())
}

fn handle_set_temperature<C: Connector>(
    itc: &Itc503<C>,
    kelvin: f64,
    ramp: Option<f64>,
) -> Result<()> {
    let Some(rate) = ramp else {
        info!("Executing: Set Temperature to {kelvin} K");
        itc.set_temperature_ramp_enabled(false)?;
        itc.set_temperature_setpoint(kelvin)
            .with_context(|| format!("Failed to set temperature setpoint to {kelvin} K"))?;
        println!("Temperature setpoint set to {kelvin:.2} K.");
        return Ok(());
    };

    info!("Executing: Ramp Temperature to {kelvin} K at {rate} K/min");
    itc.set_temperature_ramp(rate)?;
    itc.set_temperature_ramp_enabled(true)?;
    itc.set_temperature_setpoint(kelvin)
        .with_context(|| format!("Failed to start ramp to {kelvin} K"))?;
    while itc.is_ramping() {
        thread::sleep(itc.config().ramp_period);
        match itc.temperature_setpoint() {
            Ok(setpoint) => println!("Setpoint: {setpoint:.2} K"),
            Err(err) => warn!("Cannot read setpoint: {err}"),
        }
    }
    match itc.wait_for_ramp() {
        Some(RampOutcome::Reached(target)) => {
            println!("Ramp reached {target:.2} K.");
            Ok(())
        }
        Some(RampOutcome::Cancelled(at)) => bail!("Ramp was cancelled at {at:.2} K"),
        Some(RampOutcome::Failed(err)) => Err(err).context("Ramp failed"),
        None => bail!("Ramp task ended unexpectedly"),
    }
}

fn handle_output<C: Connector>(
    itc: &Itc503<C>,
    name: &str,
    mode: commandline::OutputMode,
    percent: Option<f64>,
    set_auto: impl Fn(&Itc503<C>, bool) -> itc503_lib::Result<()>,
    set_percent: impl Fn(&Itc503<C>, f64) -> itc503_lib::Result<()>,
) -> Result<()> {
    info!("Executing: Set {name} to {mode:?}");
    set_auto(itc, mode.is_auto()).with_context(|| format!("Failed to switch {name} to {mode:?}"))?;
    if let Some(percent) = percent {
        if mode.is_auto() {
            warn!("{name} is automatic, the manual output of {percent} % takes effect once it is manual");
        }
        set_percent(itc, percent)
            .with_context(|| format!("Failed to set {name} output to {percent} %"))?;
        println!("{name} output set to {percent:.1} %.");
    }
    println!("{name} is {}.", if mode.is_auto() { "automatic" } else { "manual" });
    Ok(())
}

fn monitor(itc: &dyn TemperatureController, poll_interval: std::time::Duration) -> ! {
    info!("Starting monitor: interval={poll_interval:?}");
    loop {
        match readings::poll(itc) {
            Ok(readings) => println!("{readings}\n"),
            Err(err) if err.is_connection_failure() => {
                warn!("Link to {} is down, retrying next cycle: {err}", itc.address());
            }
            Err(err) => error!("Reading cycle failed: {err}"),
        }
        thread::sleep(poll_interval);
    }
}

fn run<C: Connector>(itc: Itc503<C>, command: &commandline::CliCommands) -> Result<()> {
    if let commandline::CliCommands::Monitor { poll_interval } = command {
        monitor(&itc, *poll_interval);
    }

    itc.connect()
        .with_context(|| format!("Cannot connect to {}", itc.address()))?;

    match command {
        commandline::CliCommands::Read => {
            info!("Executing: Read All Values");
            print_readings(&itc)?;
        }
        commandline::CliCommands::Status => {
            info!("Executing: Read Status");
            let status = itc.status().with_context(|| "Cannot read status")?;
            println!("Status word:    {status}");
            println!("Control:        {}", status.control);
            println!("Control sensor: {}", status.control_sensor);
            println!(
                "Heater:         {}",
                if status.heater_auto() { "auto" } else { "manual" }
            );
            println!(
                "Gas flow:       {}",
                if status.gas_auto() { "auto" } else { "manual" }
            );
            println!("Sweeping:       {}", status.is_sweeping());
            println!("Auto PID:       {}", status.auto_pid);
        }
        commandline::CliCommands::SetTemperature { kelvin, ramp } => {
            handle_set_temperature(&itc, *kelvin, *ramp)?;
        }
        commandline::CliCommands::Heater { mode, percent } => {
            handle_output(
                &itc,
                "Heater",
                *mode,
                *percent,
                |itc, auto| itc.set_heater_auto(auto),
                |itc, percent| itc.set_heater_setpoint(percent),
            )?;
        }
        commandline::CliCommands::Gasflow { mode, percent } => {
            handle_output(
                &itc,
                "Gas flow",
                *mode,
                *percent,
                |itc, auto| itc.set_gasflow_auto(auto),
                |itc, percent| itc.set_gasflow_setpoint(percent),
            )?;
        }
        commandline::CliCommands::SelectSensor { sensor } => {
            info!("Executing: Select Sensor {sensor}");
            itc.select_temp_module(&sensor.to_string())
                .with_context(|| format!("Failed to select sensor {sensor}"))?;
            println!("Control sensor set to {sensor}.");
        }
        commandline::CliCommands::Monitor { .. } => {
            unreachable!("Monitor is handled before connecting.")
        }
    }

    itc.disconnect()
        .with_context(|| format!("Cannot close the link to {}", itc.address()))?;
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "ITC503 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Merge config file and command line
    let config = config::load(args.config.as_deref())?;
    let (address, options) = connection_settings(&args, &config);
    debug!("Connecting to {address} with {options:?}");

    // 3. Execute the command
    if args.simulate {
        info!("Using a simulated instrument");
        let itc = Itc503::new(address, SimulatedItc503::new().connector())
            .with_options(options)
            .with_config(config.driver)
            .with_context(|| "Invalid driver configuration")?;
        run(itc, &args.command)
    } else {
        let itc = Itc503::new(address, LineConnector)
            .with_options(options)
            .with_config(config.driver)
            .with_context(|| "Invalid driver configuration")?;
        run(itc, &args.command)
    }
}
