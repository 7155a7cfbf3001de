use log::{debug, info, warn};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::ErrorKind;

pub mod utils;
pub mod structs;
pub mod obis_parser;
pub mod meter_definitions;
pub mod transport;

pub use structs::{DataMode, DataSet, MeterIdentification, MeterSettings, Readout, SessionState};
pub use transport::{MeterTransport, PortLease};

/* Guards against a meter that never sends ETX */
const MAX_BLOCK_LEN: usize = 64 * 1024;
const MAX_IDENT_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Port {0} is busy")]
    PortBusy(String),
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Identification failed: {0}")]
    IdentificationFailed(String),
    #[error("Block checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },
    #[error("Malformed data: {0}")]
    Malformed(String),
    #[error("Unsupported baud rate character {0:?}")]
    UnsupportedBaudRate(char),
    #[error("Unsupported mode {0}")]
    UnsupportedMode(String),
    #[error("Operation not permitted in state {0:?}")]
    InvalidState(SessionState),
}

impl MeterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeterError::PortBusy(_) => ErrorKind::Transport,
            MeterError::Transport(_) => ErrorKind::Transport,
            MeterError::Timeout(_) => ErrorKind::Timeout,
            MeterError::IdentificationFailed(_) => ErrorKind::Protocol,
            MeterError::ChecksumMismatch { .. } => ErrorKind::Protocol,
            MeterError::Malformed(_) => ErrorKind::Protocol,
            MeterError::UnsupportedBaudRate(_) => ErrorKind::Rejected,
            MeterError::UnsupportedMode(_) => ErrorKind::Rejected,
            MeterError::InvalidState(_) => ErrorKind::State,
        }
    }
}

/// One IEC 62056-21 mode C dialogue. The session owns its transport and
/// walks `Open -> SignedOn -> ReadingOut -> Done`; every failure leaves it
/// `Aborted` until `close()`.
pub struct MeterSession<T: MeterTransport> {
    transport: Option<T>,
    state: SessionState,
    device_address: Option<String>,
    identify_timeout: Duration,
    identification: Option<MeterIdentification>,
}

impl MeterSession<Box<dyn MeterTransport>> {
    pub fn open(settings: &MeterSettings) -> Result<Self, MeterError> {
        let transport = transport::open_transport(settings)?;
        let session = MeterSession::with_transport(transport, settings.device_address.clone())
            .with_identify_timeout(Duration::from_millis(settings.identify_timeout_ms));
        Ok(session)
    }
}

impl<T: MeterTransport> MeterSession<T> {
    pub fn with_transport(transport: T, device_address: Option<String>) -> Self {
        return MeterSession {
            transport: Some(transport),
            state: SessionState::Open,
            device_address,
            identify_timeout: Duration::from_millis(1500),
            identification: None,
        };
    }

    pub fn with_identify_timeout(mut self, timeout: Duration) -> Self {
        self.identify_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identification(&self) -> Option<&MeterIdentification> {
        self.identification.as_ref()
    }

    /// Sends the sign-on request and waits for the identification frame.
    pub fn identify(&mut self) -> Result<MeterIdentification, MeterError> {
        self.expect_state(SessionState::Open)?;
        let result = self.sign_on();
        self.finish(result, SessionState::SignedOn)
    }

    /// Selects `mode` at the negotiated baud rate and reads one data block.
    pub fn readout(&mut self, mode: DataMode, timeout: Duration) -> Result<Readout, MeterError> {
        self.expect_state(SessionState::SignedOn)?;
        self.state = SessionState::ReadingOut;
        let result = self.read_data_block(mode, timeout);
        self.finish(result, SessionState::Done)
    }

    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("Meter session closed in state {:?}", self.state);
        }
        self.identification = None;
        self.state = SessionState::Closed;
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), MeterError> {
        if self.state != expected || self.transport.is_none() {
            return Err(MeterError::InvalidState(self.state));
        }
        Ok(())
    }

    fn finish<R>(&mut self, result: Result<R, MeterError>, next: SessionState) -> Result<R, MeterError> {
        match &result {
            Ok(_) => self.state = next,
            Err(e) => {
                warn!("Meter session aborted: {}", e);
                self.state = SessionState::Aborted;
                if let MeterError::Transport(_) = e {
                    self.transport = None;
                }
            }
        }
        result
    }

    fn transport_mut(&mut self) -> Result<&mut T, MeterError> {
        let state = self.state;
        self.transport.as_mut().ok_or(MeterError::InvalidState(state))
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), MeterError> {
        debug!("Sending {:?}", String::from_utf8_lossy(frame));
        let transport = self.transport_mut()?;
        transport.write_all(frame)?;
        transport.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, deadline: Instant, what: &'static str) -> Result<u8, MeterError> {
        let transport = self.transport_mut()?;
        let mut buf = [0u8; 1];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(MeterError::Timeout(what));
            }
            transport.set_timeout(deadline - now)?;
            match transport.read(&mut buf) {
                Ok(1) => return Ok(buf[0]),
                Ok(_) => return Err(MeterError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, "line closed"))),
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
                Err(e) => return Err(MeterError::Transport(e)),
            }
        }
    }

    fn sign_on(&mut self) -> Result<MeterIdentification, MeterError> {
        self.transport_mut()?.clear_input()?;
        let request = utils::build_sign_on(self.device_address.as_deref());
        self.send(&request)?;

        let deadline = Instant::now() + self.identify_timeout;
        loop {
            let line = match self.read_identification_line(deadline) {
                Ok(line) => line,
                Err(MeterError::Timeout(_)) => {
                    return Err(MeterError::IdentificationFailed(format!(
                        "no identification within {} ms", self.identify_timeout.as_millis())));
                }
                Err(e) => return Err(e),
            };

            /* Half duplex heads echo our own request */
            if line.starts_with("/?") {
                debug!("Skipping echoed sign-on {:?}", line);
                continue;
            }

            let ident = utils::parse_identification_line(&line)?;
            info!("Meter identified as {} ({})", ident.full_id(), ident.manufacturer);
            self.identification = Some(ident.clone());
            return Ok(ident);
        }
    }

    fn read_identification_line(&mut self, deadline: Instant) -> Result<String, MeterError> {
        /* Skip noise until the start of a frame */
        while self.read_byte(deadline, "identification")? != b'/' {}

        let mut line = vec![b'/'];
        loop {
            let b = self.read_byte(deadline, "identification")?;
            if b == utils::LF {
                break;
            }
            line.push(b);
            if line.len() > MAX_IDENT_LEN {
                return Err(MeterError::IdentificationFailed("identification frame too long".to_string()));
            }
        }
        Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
    }

    fn read_data_block(&mut self, mode: DataMode, timeout: Duration) -> Result<Readout, MeterError> {
        if mode == DataMode::Programming {
            return Err(MeterError::UnsupportedMode("programming mode has no data block".to_string()));
        }

        let ident = self.identification.clone()
            .ok_or(MeterError::InvalidState(self.state))?;
        let baud = utils::baud_rate_from_char(ident.baud_char)
            .ok_or(MeterError::UnsupportedBaudRate(ident.baud_char))?;

        let select = utils::build_option_select(ident.baud_char, mode)?;
        self.send(&select)?;
        self.transport_mut()?.set_baud_rate(baud)?;
        info!("Switched to {} baud, waiting for data block", baud);

        let deadline = Instant::now() + timeout;
        while self.read_byte(deadline, "start of data block")? != utils::STX {}

        let mut block = Vec::new();
        loop {
            let b = self.read_byte(deadline, "end of data block")?;
            block.push(b);
            if b == utils::ETX {
                break;
            }
            if block.len() > MAX_BLOCK_LEN {
                return Err(MeterError::Malformed("data block exceeds maximum length".to_string()));
            }
        }
        let received = self.read_byte(deadline, "block check character")?;

        let computed = utils::calculate_bcc(&block);
        if computed != received {
            return Err(MeterError::ChecksumMismatch { computed, received });
        }

        let text = std::str::from_utf8(&block[..block.len() - 1])
            .map_err(|_| MeterError::Malformed("data block is not ASCII".to_string()))?;
        let datasets = obis_parser::parse_data_block(text)?;
        debug!("Readout contains {} datasets", datasets.len());

        Ok(Readout { datasets, bcc: received })
    }
}

impl<T: MeterTransport> Drop for MeterSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs a complete dialogue with the meter described by `settings`.
pub fn read_meter(settings: &MeterSettings) -> Result<(MeterIdentification, Readout), MeterError> {
    let mut session = MeterSession::open(settings)?;
    let result = session.identify().and_then(|ident| {
        let readout = session.readout(settings.mode, Duration::from_millis(settings.readout_timeout_ms))?;
        Ok((ident, readout))
    });
    session.close();
    result
}

/// Push telegram (mode D): an identification line followed by data lines
/// and a closing `!` line, without BCC.
#[derive(Debug, Clone)]
pub struct Telegram {
    pub identification: MeterIdentification,
    pub datasets: Vec<DataSet>,
}

pub fn parse_telegram(telegram: &str) -> Result<Telegram, MeterError> {
    let mut lines = telegram.lines().skip_while(|l| l.trim().is_empty());

    let identification_line = lines.next()
        .ok_or_else(|| MeterError::Malformed("empty telegram".to_string()))?;
    let identification = utils::parse_identification_line(identification_line.trim())?;

    let mut datasets = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('!') {
            debug!("End of telegram found");
            break;
        }

        match obis_parser::parse_obis_line(line) {
            Ok(parsed) => datasets.extend(parsed),
            Err(e) => warn!("Failed to parse OBIS line '{}': {}", line, e),
        }
    }

    if datasets.is_empty() {
        warn!("No valid OBIS data found in telegram");
    }

    Ok(Telegram { identification, datasets })
}
