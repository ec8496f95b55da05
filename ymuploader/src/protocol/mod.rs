//! Protocol implementations.

pub mod crc;
pub mod ymodem;

pub use ymodem::{DialectFlags, FileInfo, PacketProgress, YmodemSender};
