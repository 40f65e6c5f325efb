//! A library for controlling the Oxford Instruments ITC503 cryogenic
//! temperature controller over a serial line or a raw TCP socket.
//!
//! The crate is layered:
//!
//! 1.  **Protocol**: pure encoding of commands and decoding of replies, see
//!     [`protocol`].
//! 2.  **Transport**: line-oriented links opened by a [`transport::Connector`].
//!     Serial ports are available with the `serial` feature.
//! 3.  **Driver**: the thread-safe [`Itc503`] implementing the
//!     [`TemperatureController`] contract, with a status cache and background
//!     setpoint ramps.
//!
//! ## Features
//!
//! - **Strongly-Typed API**: status word, auto modes, control modes and sensors
//!   are enums and records, not raw strings.
//! - **Shareable Driver**: all operations take `&self`, so one driver can serve a
//!   foreground caller and a background poller at the same time.
//! - **Setpoint Ramps**: linear ramps at a configurable rate, replaced or
//!   cancelled at any time.
//! - **Simulation**: [`mock::SimulatedItc503`] speaks the wire protocol in memory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use itc503_lib::{Itc503, TemperatureController};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let itc = Itc503::open("ASRL/dev/ttyUSB0::INSTR")?;
//!
//!     println!("Temperature: {:.3} K", itc.temperature()?);
//!     itc.set_heater_auto(true)?;
//!     itc.set_temperature_setpoint(4.2)?;
//!
//!     Ok(())
//! }
//! ```

pub mod controller;
pub mod error;
pub mod itc503;
pub mod mock;
pub mod protocol;
pub mod ramp;
pub mod readings;
pub mod status;
pub mod transport;

pub use controller::TemperatureController;
pub use error::{Error, Result};
pub use itc503::{Itc503, Itc503Config};
