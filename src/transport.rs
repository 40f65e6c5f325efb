//! Byte-stream transport to the instrument.
//!
//! A [`Transport`] is a blocking, line-oriented link: `write` sends one
//! command line, `read` returns the next reply line without its terminator.
//! A [`Connector`] opens a transport for an address string; the driver keeps
//! the connector and reopens through it on every `connect`.
//!
//! [`LineConnector`] understands serial ports (feature `serial`) and raw TCP
//! sockets, e.g. an Ethernet-to-serial gateway in front of the instrument:
//!
//! | Address                         | Link                     |
//! |---------------------------------|--------------------------|
//! | `/dev/ttyUSB0`, `COM3`          | serial port              |
//! | `ASRL/dev/ttyUSB0::INSTR`       | serial port (VISA name)  |
//! | `192.168.1.20:4001`             | TCP socket               |
//! | `tcp://moxa.local:4001`         | TCP socket               |
//! | `TCPIP::192.168.1.20::4001::SOCKET` | TCP socket (VISA name) |

use crate::protocol::LineTermination;
use log::*;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Terminator appended to every command line.
pub const WRITE_TERMINATION: &str = "\r";

/// Baud rate the ITC503 ships with.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default I/O timeout for a single read or write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A synchronous, line-oriented link to an instrument.
pub trait Transport: Send {
    /// Sends one command line.
    fn write(&mut self, command: &str) -> io::Result<()>;

    /// Receives one reply line, terminator stripped.
    fn read(&mut self) -> io::Result<String>;

    /// One round trip: write `command`, then read its reply.
    fn query(&mut self, command: &str) -> io::Result<String> {
        self.write(command)?;
        self.read()
    }

    /// Releases the link. The transport must not be used afterwards.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, command: &str) -> io::Result<()> {
        (**self).write(command)
    }

    fn read(&mut self) -> io::Result<String> {
        (**self).read()
    }

    fn query(&mut self, command: &str) -> io::Result<String> {
        (**self).query(command)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Opens transports for an address.
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    fn connect(&self, address: &str, options: &ConnectOptions) -> io::Result<Self::Transport>;
}

/// Settings used when opening a link.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectOptions {
    /// Reply termination negotiated during the connect handshake.
    pub termination: LineTermination,
    /// Serial baud rate, ignored for TCP.
    pub baud_rate: u32,
    /// Timeout of a single read or write.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            termination: LineTermination::default(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Serial device path, e.g. `/dev/ttyUSB0` or `COM3`.
    Serial(String),
    /// `host:port` of a raw TCP socket.
    Tcp(String),
}

impl FromStr for Address {
    type Err = io::Error;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid instrument address '{address}'"),
            )
        };
        let address = address.trim();
        if address.is_empty() {
            return Err(invalid());
        }

        if let Some(resource) = address.strip_prefix("ASRL") {
            let path = resource.strip_suffix("::INSTR").unwrap_or(resource);
            // VISA numbers serial ports from 1.
            return match path.parse::<u32>() {
                _ if path.is_empty() => Err(invalid()),
                Ok(n) if cfg!(windows) => Ok(Address::Serial(format!("COM{n}"))),
                Ok(n) if n > 0 => Ok(Address::Serial(format!("/dev/ttyS{}", n - 1))),
                _ => Ok(Address::Serial(path.to_string())),
            };
        }

        if address.starts_with("TCPIP") {
            let parts: Vec<&str> = address.split("::").collect();
            return match parts.as_slice() {
                [_, host, port, "SOCKET"] if port.parse::<u16>().is_ok() => {
                    Ok(Address::Tcp(format!("{host}:{port}")))
                }
                _ => Err(invalid()),
            };
        }

        let host_port = address.strip_prefix("tcp://");
        match host_port {
            Some(host_port) => match host_port.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Address::Tcp(host_port.to_string()))
                }
                _ => Err(invalid()),
            },
            None => match address.rsplit_once(':') {
                Some((host, port))
                    if !host.is_empty() && !host.starts_with('/') && port.parse::<u16>().is_ok() =>
                {
                    Ok(Address::Tcp(address.to_string()))
                }
                _ => Ok(Address::Serial(address.to_string())),
            },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Serial(path) => write!(f, "serial port {path}"),
            Address::Tcp(host_port) => write!(f, "tcp://{host_port}"),
        }
    }
}

/// Line framing on top of any byte stream.
pub struct LineTransport<S: Read + Write + Send> {
    stream: BufReader<S>,
    termination: LineTermination,
}

impl<S: Read + Write + Send> LineTransport<S> {
    pub fn new(stream: S, termination: LineTermination) -> Self {
        Self {
            stream: BufReader::new(stream),
            termination,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S: Read + Write + Send> Transport for LineTransport<S> {
    fn write(&mut self, command: &str) -> io::Result<()> {
        trace!("-> {}", command.escape_default());
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(WRITE_TERMINATION.as_bytes())?;
        stream.flush()
    }

    fn read(&mut self) -> io::Result<String> {
        let last = self.termination.terminator().as_bytes();
        let delimiter = last[last.len() - 1];
        let mut line = Vec::new();
        let n = self.stream.read_until(delimiter, &mut line)?;
        if n == 0 || line.last() != Some(&delimiter) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link closed before the reply was terminated",
            ));
        }
        let reply = String::from_utf8_lossy(&line).trim().to_string();
        trace!("<- {}", reply.escape_default());
        Ok(reply)
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.get_mut().flush()
    }
}

/// Opens serial or TCP line transports, chosen by the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineConnector;

impl LineConnector {
    #[cfg(feature = "serial")]
    fn open_serial(path: &str, options: &ConnectOptions) -> io::Result<Box<dyn Transport>> {
        // 8 data bits, 2 stop bits, no parity is the ITC503's fixed framing.
        let port = serialport::new(path, options.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::Two)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(options.timeout)
            .open()?;
        Ok(Box::new(LineTransport::new(port, options.termination)))
    }

    #[cfg(not(feature = "serial"))]
    fn open_serial(path: &str, _options: &ConnectOptions) -> io::Result<Box<dyn Transport>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("Cannot open {path}: serial support requires the 'serial' feature"),
        ))
    }

    fn open_tcp(host_port: &str, options: &ConnectOptions) -> io::Result<Box<dyn Transport>> {
        let mut last_error = None;
        for socket_addr in host_port.to_socket_addrs()? {
            match TcpStream::connect_timeout(&socket_addr, options.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(options.timeout))?;
                    stream.set_write_timeout(Some(options.timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(LineTransport::new(stream, options.termination)));
                }
                Err(err) => {
                    debug!("Cannot connect to {socket_addr}: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host_port} did not resolve to any address"),
            )
        }))
    }
}

impl Connector for LineConnector {
    type Transport = Box<dyn Transport>;

    fn connect(&self, address: &str, options: &ConnectOptions) -> io::Result<Self::Transport> {
        let address: Address = address.parse()?;
        debug!("Opening {address}");
        match &address {
            Address::Serial(path) => Self::open_serial(path, options),
            Address::Tcp(host_port) => Self::open_tcp(host_port, options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(input: &str) -> Self {
            Self {
                input: Cursor::new(input.as_bytes().to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn line_framing_crlf() {
        let mut transport =
            LineTransport::new(Duplex::new("C\r\nR4.200\r\n"), LineTermination::CrLf);
        transport.write("Q2").unwrap();
        assert_eq!(transport.query("C3").unwrap(), "C");
        assert_eq!(transport.query("R1").unwrap(), "R4.200");
        assert_eq!(transport.into_inner().output, b"Q2\rC3\rR1\r");
    }

    #[test]
    fn line_framing_cr() {
        let mut transport = LineTransport::new(Duplex::new("X0A0C3S0H1L0\rT\r"), LineTermination::Cr);
        assert_eq!(transport.query("X").unwrap(), "X0A0C3S0H1L0");
        assert_eq!(transport.query("T10.00").unwrap(), "T");
    }

    #[test]
    fn unterminated_reply_is_an_io_error() {
        let mut transport = LineTransport::new(Duplex::new("R4.2"), LineTermination::CrLf);
        let err = transport.query("R1").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut transport = LineTransport::new(Duplex::new(""), LineTermination::Cr);
        assert_matches!(transport.read(), Err(..));
    }

    #[test]
    fn address_parsing() {
        assert_eq!(
            "/dev/ttyUSB0".parse::<Address>().unwrap(),
            Address::Serial("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            "COM3".parse::<Address>().unwrap(),
            Address::Serial("COM3".to_string())
        );
        assert_eq!(
            "ASRL/dev/ttyUSB0::INSTR".parse::<Address>().unwrap(),
            Address::Serial("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            "ASRLCOM4::INSTR".parse::<Address>().unwrap(),
            Address::Serial("COM4".to_string())
        );
        assert_eq!(
            "192.168.1.20:4001".parse::<Address>().unwrap(),
            Address::Tcp("192.168.1.20:4001".to_string())
        );
        assert_eq!(
            "tcp://moxa.local:4001".parse::<Address>().unwrap(),
            Address::Tcp("moxa.local:4001".to_string())
        );
        assert_eq!(
            "TCPIP0::10.0.0.5::4001::SOCKET".parse::<Address>().unwrap(),
            Address::Tcp("10.0.0.5:4001".to_string())
        );
        let visa_port = if cfg!(windows) { "COM3" } else { "/dev/ttyS2" };
        assert_eq!(
            "ASRL3::INSTR".parse::<Address>().unwrap(),
            Address::Serial(visa_port.to_string())
        );
        for invalid in ["", "  ", "ASRL::INSTR", "TCPIP::host::SOCKET", "tcp://host"] {
            assert_eq!(
                invalid.parse::<Address>().unwrap_err().kind(),
                io::ErrorKind::InvalidInput,
                "{invalid:?}"
            );
        }
    }
}
