//! # ymuploader
//!
//! A host-side library for delivering firmware to an embedded device over
//! serial using YMODEM, with AT-command baud auto-detection and DFU-mode
//! negotiation.
//!
//! ## Components
//!
//! - [`port`] — a `Port` trait abstracting a timed-read/write serial link,
//!   backed on native platforms by the `serialport` crate.
//! - [`protocol`] — CRC-16/XMODEM and additive checksum, and the YMODEM
//!   sender state machine itself ([`protocol::YmodemSender`]).
//! - [`device`] — the [`device::DeviceCoordinator`] that probes the AT
//!   command surface, auto-detects the device's current baud rate, and
//!   commands it into DFU mode.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ymuploader::device::DeviceCoordinator;
//! use ymuploader::protocol::{DialectFlags, FileInfo, YmodemSender};
//! use std::fs::File;
//!
//! fn main() -> ymuploader::error::Result<()> {
//!     let coordinator = DeviceCoordinator::new("/dev/ttyUSB0");
//!     let mut port = coordinator.ensure_dfu()?;
//!
//!     let file = File::open("firmware.bin")?;
//!     let len = file.metadata()?.len();
//!     let info = FileInfo::new("firmware.bin", len);
//!
//!     let mut sender = YmodemSender::new(&mut port);
//!     sender.send(file, &info, DialectFlags::default(), |p| {
//!         println!("sent {}/{} bytes", p.sent_bytes, p.total_bytes);
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod port;
pub mod protocol;

pub use device::DeviceCoordinator;
pub use error::{Error, Result};
pub use port::{NativePort, Port, SerialConfig};
pub use protocol::{DialectFlags, FileInfo, PacketProgress, YmodemSender};
