//! Device coordinator: baud-rate auto-detection and DFU-mode negotiation.
//!
//! Mirrors the connect/retry shape of a boot-protocol handshake (probe,
//! sleep, clear buffers, retry) but speaks line-oriented AT commands
//! instead of a binary frame protocol, since that is what the application
//! firmware exposes before it has been told to enter its YMODEM-capable
//! bootloader.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::{NativePort, Port, SerialConfig};

/// Baud rate spoken by the device once it has entered DFU/bootloader mode.
pub const DFU_BAUD: u32 = 115200;

/// Ordered candidate baud rates tried while the device's current
/// application-mode baud rate is unknown. Order matches observed field
/// frequency: the DFU baud itself first, then the common UART defaults.
const BAUD_CANDIDATES: &[u32] = &[
    115200, 9600, 921600, 57600, 38400, 19200, 230400, 460800, 76800, 56000, 31250, 28800, 14400,
    4800, 250000, 1_000_000, 2400, 1200,
];

const BYTE_DELAY: Duration = Duration::from_millis(500);
const PROBE_SETTLE: Duration = Duration::from_secs(2);
const COMMAND_SETTLE: Duration = Duration::from_secs(1);
const ASK_OK_ATTEMPTS: u32 = 10;

/// Drives the AT-command handshake that gets a device from application mode
/// into DFU mode, ready to receive a YMODEM batch.
pub struct DeviceCoordinator {
    port_name: String,
}

impl DeviceCoordinator {
    /// Target a specific serial device by name/path.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
        }
    }

    /// Probe, detect baud, and command the device into DFU mode. After
    /// issuing `at+boot` on a freshly detected baud, re-probes to confirm
    /// the device actually came up in DFU mode before proceeding. Returns a
    /// port opened at [`DFU_BAUD`] with `at+update` already sent, ready for
    /// a YMODEM sender.
    pub fn ensure_dfu(&self) -> Result<NativePort> {
        if self.probe_already_in_dfu()? {
            info!("device already in DFU mode");
        } else {
            self.detect_baud_and_enter_dfu()?;
            thread::sleep(PROBE_SETTLE);
            if !self.probe_already_in_dfu()? {
                return Err(Error::DeviceNotFound);
            }
        }

        let mut port = self.open_at(DFU_BAUD)?;
        port.write_all_bytes(b"at+update\r\n")?;
        drain(&mut port);
        thread::sleep(COMMAND_SETTLE);
        Ok(port)
    }

    /// Check whether the device is already in DFU mode by probing with
    /// `at+`, which only a bootloader answers with "AT not support".
    fn probe_already_in_dfu(&self) -> Result<bool> {
        let mut port = self.open_at(DFU_BAUD)?;
        write_bytes_with_delay(&mut port, b"a")?;
        write_bytes_with_delay(&mut port, b"t")?;
        write_bytes_with_delay(&mut port, b"+")?;
        write_bytes_with_delay(&mut port, b"\r")?;
        write_bytes_with_delay(&mut port, b"\n")?;
        port.write_all_bytes(b"at+\r\n")?;
        thread::sleep(PROBE_SETTLE);

        let response = drain(&mut port);
        Ok(contains(&response, b"AT not support"))
    }

    /// Try each candidate baud rate until the device answers `at\r\n` with
    /// `OK\r\n` or `AT_ERROR`, confirm with [`Self::ask_ok`], then command
    /// it into bootloader mode with `at+boot`.
    fn detect_baud_and_enter_dfu(&self) -> Result<()> {
        for &baud in BAUD_CANDIDATES {
            debug!("probing {} at {baud} baud", self.port_name);
            let mut port = match self.open_at(baud) {
                Ok(p) => p,
                Err(e) => {
                    warn!("failed to open {} at {baud}: {e}", self.port_name);
                    continue;
                }
            };
            port.clear_buffers()?;
            port.write_all_bytes(b"\r\n\r\nat\r\n")?;
            thread::sleep(PROBE_SETTLE);

            let response = drain(&mut port);
            if contains(&response, b"OK\r\n") || contains(&response, b"AT_ERROR") {
                if self.ask_ok(&mut port)? {
                    port.write_all_bytes(b"at+boot\r\n")?;
                    thread::sleep(COMMAND_SETTLE);
                    return Ok(());
                }
                return Err(Error::HandshakeFailed(format!(
                    "{} answered the AT probe at {baud} baud but never confirmed OK",
                    self.port_name
                )));
            }
        }

        Err(Error::BaudDetectFailed)
    }

    /// Confirm application mode by sending `at\r\n` byte-by-byte, up to
    /// [`ASK_OK_ATTEMPTS`] times, until `OK\r\n` is observed.
    fn ask_ok(&self, port: &mut NativePort) -> Result<bool> {
        for attempt in 1..=ASK_OK_ATTEMPTS {
            write_bytes_with_delay(port, b"a")?;
            write_bytes_with_delay(port, b"t")?;
            write_bytes_with_delay(port, b"\r")?;
            write_bytes_with_delay(port, b"\n")?;

            let response = drain(port);
            if contains(&response, b"OK\r\n") {
                trace!("ask_ok confirmed on attempt {attempt}");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn open_at(&self, baud: u32) -> Result<NativePort> {
        let config = SerialConfig::new(self.port_name.clone(), baud)
            .with_timeout(Duration::from_millis(200));
        NativePort::open(&config)
    }
}

fn write_bytes_with_delay(port: &mut NativePort, bytes: &[u8]) -> Result<()> {
    port.write_all_bytes(bytes)?;
    thread::sleep(BYTE_DELAY);
    Ok(())
}

/// Read whatever is currently buffered, without blocking past the port's
/// short per-probe timeout.
fn drain(port: &mut NativePort) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        match port.read_byte(Duration::from_millis(50)) {
            Ok(Some(b)) => out.push(b),
            Ok(None) => break,
            Err(_) => break,
        }
    }
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len().max(1)).any(|w| w == needle)
}
