use lazy_static::lazy_static;
use log::{debug, info};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use super::MeterError;
#[cfg(feature = "serial")]
use super::structs::{DataBits, Parity, StopBits};
use super::structs::MeterSettings;

/// Byte pipe to a meter. Reads honour the timeout set last and report
/// expiry as `TimedOut` or `WouldBlock`.
pub trait MeterTransport: Read + Write + Send {
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: MeterTransport + ?Sized> MeterTransport for Box<T> {
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        (**self).set_baud_rate(baud)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }
}

lazy_static! {
    static ref OPEN_PORTS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Exclusive claim on a port name inside this process, released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: String,
}

impl PortLease {
    pub fn acquire(port: &str) -> Result<Self, MeterError> {
        let mut ports = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        if !ports.insert(port.to_string()) {
            return Err(MeterError::PortBusy(port.to_string()));
        }
        return Ok(PortLease { port: port.to_string() });
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut ports = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        ports.remove(&self.port);
        debug!("Released port {}", self.port);
    }
}

/// Opens the transport named by `settings.port`.
pub fn open_transport(settings: &MeterSettings) -> Result<Box<dyn MeterTransport>, MeterError> {
    if let Some(address) = settings.port.strip_prefix("tcp://") {
        let lease = PortLease::acquire(&settings.port)?;
        return Ok(Box::new(TcpTransport::connect(address, lease)?));
    }
    open_serial(settings)
}

#[cfg(feature = "serial")]
fn open_serial(settings: &MeterSettings) -> Result<Box<dyn MeterTransport>, MeterError> {
    let lease = PortLease::acquire(&settings.port)?;
    Ok(Box::new(SerialTransport::open(settings, lease)?))
}

#[cfg(not(feature = "serial"))]
fn open_serial(settings: &MeterSettings) -> Result<Box<dyn MeterTransport>, MeterError> {
    Err(MeterError::Transport(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("serial support is not compiled in, cannot open {}", settings.port),
    )))
}

#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    _lease: PortLease,
}

#[cfg(feature = "serial")]
impl SerialTransport {
    pub fn open(settings: &MeterSettings, lease: PortLease) -> Result<Self, MeterError> {
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let data_bits = match settings.data_bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let stop_bits = match settings.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        };

        let port = serialport::new(settings.port.as_str(), settings.initial_baud)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(settings.identify_timeout_ms))
            .open()
            .map_err(|e| {
                if e.description.to_lowercase().contains("busy") {
                    MeterError::PortBusy(settings.port.clone())
                } else {
                    MeterError::Transport(io::Error::from(e))
                }
            })?;

        info!("Opened serial port {} at {} baud", settings.port, settings.initial_baud);
        Ok(SerialTransport { port, _lease: lease })
    }
}

#[cfg(feature = "serial")]
impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

#[cfg(feature = "serial")]
impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

#[cfg(feature = "serial")]
impl MeterTransport for SerialTransport {
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud).map_err(io::Error::from)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(serialport::ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Transparent serial gateway (ser2net and friends). The gateway owns the
/// line settings, so baud switches are only logged.
pub struct TcpTransport {
    stream: TcpStream,
    _lease: PortLease,
}

impl TcpTransport {
    pub fn connect(address: &str, lease: PortLease) -> Result<Self, MeterError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        info!("Connected to meter gateway {}", address);
        Ok(TcpTransport { stream, _lease: lease })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl MeterTransport for TcpTransport {
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        debug!("Gateway link ignores baud switch to {}", baud);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        /* A zero duration would mean blocking forever */
        self.stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
    }
}
