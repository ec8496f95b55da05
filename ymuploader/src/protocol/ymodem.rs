//! YMODEM sender state machine.
//!
//! Drives a single outbound YMODEM batch: negotiate a checksum or CRC-16
//! mode, send the info block, stream data blocks padded with SUB (0x1A) at
//! EOF only, send EOT, and finish with the all-zero null block.
//!
//! ```text
//! Block format (STX / 1K variant):
//! +-----+-----+------+----------------+--------+
//! | STX | SEQ | ~SEQ |   DATA (1024)  | CRC/SUM|
//! +-----+-----+------+----------------+--------+
//! | 1   | 1   | 1    |     1024       |  1 or 2|
//! +-----+-----+------+----------------+--------+
//! ```

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::crc::{checksum8, crc16_xmodem};
use log::{debug, trace, warn};
use std::io::Read;
use std::time::Duration;

/// YMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel. Two consecutive CANs from the peer abort the transfer.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Block size for SOH (128-byte) packets.
pub const SOH_BLOCK_SIZE: usize = 128;
/// Block size for STX (1K) packets.
pub const STX_BLOCK_SIZE: usize = 1024;

/// Padding byte for data blocks that end before a full block boundary.
const DATA_PAD: u8 = 0x1A;
/// Padding byte for the info block and the end-of-batch null block.
const INFO_PAD: u8 = 0x00;

/// Trailer / retransmission-mode negotiated with the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrcMode {
    Checksum,
    Crc16,
}

/// Dialect flags selecting which optional info-block fields are emitted and
/// whether 1K blocks are used.
#[derive(Debug, Clone, Copy)]
pub struct DialectFlags {
    /// Emit the decimal length field.
    pub use_length: bool,
    /// Emit the octal mtime field.
    pub use_date: bool,
    /// Emit the octal mode field.
    pub use_mode: bool,
    /// Emit the serial-number field.
    pub use_serial: bool,
    /// Use 1024-byte (STX) data blocks instead of 128-byte (SOH).
    pub allow_1k: bool,
    /// Negotiate YMODEM-g (streaming, no per-block ACK). Not implemented;
    /// always false for this uploader.
    pub allow_ymodem_g: bool,
}

impl Default for DialectFlags {
    /// Fixed dialect used by this uploader: length, date and mode fields
    /// emitted, serial number and YMODEM-g both off.
    fn default() -> Self {
        Self {
            use_length: true,
            use_date: true,
            use_mode: true,
            use_serial: false,
            allow_1k: true,
            allow_ymodem_g: false,
        }
    }
}

/// Metadata describing the file being sent.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Basename as it appears in the info block.
    pub name: String,
    /// Exact byte length of the image.
    pub length: u64,
    /// Modification time (Unix epoch seconds), emitted octal if present.
    pub mtime: Option<u64>,
    /// Unix file mode, emitted octal if present.
    pub mode: Option<u32>,
    /// Serial number / identifier string, emitted verbatim if present.
    pub serial: Option<String>,
}

impl FileInfo {
    /// Build a `FileInfo` with only name and length set.
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length,
            mtime: None,
            mode: None,
            serial: None,
        }
    }
}

/// Per-packet progress reported to the caller's callback.
#[derive(Debug, Clone, Copy)]
pub struct PacketProgress {
    /// 1-based index of the data packet just sent.
    pub packet_index: usize,
    /// Bytes of file content transmitted so far (excludes padding).
    pub sent_bytes: usize,
    /// Total file length, as supplied in `FileInfo`.
    pub total_bytes: usize,
}

/// Tunables for the sender's retry and timeout behavior.
#[derive(Debug, Clone, Copy)]
pub struct YmodemConfig {
    /// How long to wait for a single expected byte before counting an error.
    pub timeout: Duration,
    /// Maximum consecutive errors tolerated at any wait point before the
    /// sender gives up and cancels.
    pub retry: u32,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: 30,
        }
    }
}

/// Drives one YMODEM batch over a [`Port`].
pub struct YmodemSender<'a, P: Port> {
    port: &'a mut P,
    config: YmodemConfig,
}

impl<'a, P: Port> YmodemSender<'a, P> {
    /// Create a sender with default timeout and retry budget.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, YmodemConfig::default())
    }

    /// Create a sender with an explicit configuration.
    pub fn with_config(port: &'a mut P, config: YmodemConfig) -> Self {
        Self { port, config }
    }

    /// Send `stream` as a single YMODEM batch described by `info`.
    ///
    /// `progress` is invoked once per data packet, after it has been ACKed.
    pub fn send<R: Read>(
        &mut self,
        mut stream: R,
        info: &FileInfo,
        dialect: DialectFlags,
        mut progress: impl FnMut(PacketProgress),
    ) -> Result<()> {
        let packet_size = if dialect.allow_1k {
            STX_BLOCK_SIZE
        } else {
            SOH_BLOCK_SIZE
        };
        let header = header_byte(packet_size);

        debug!("negotiating info block mode for {}", info.name);
        let info_mode = self.negotiate_mode()?;
        let info_payload = build_info_payload(info, &dialect, packet_size);
        let info_packet = build_packet(header, 0, &info_payload, info_mode);
        self.send_packet_and_wait_ack(&info_packet)?;

        debug!("negotiating data block mode");
        let data_mode = self.negotiate_mode()?;

        let mut seq: u8 = 1;
        let mut sent_bytes = 0usize;
        let mut packet_index = 0usize;
        let total_bytes = usize::try_from(info.length).unwrap_or(usize::MAX);

        loop {
            let mut buf = vec![0u8; packet_size];
            let n = read_fill(&mut stream, &mut buf)?;
            if n == 0 {
                break;
            }
            if n < packet_size {
                for b in &mut buf[n..] {
                    *b = DATA_PAD;
                }
            }

            let packet = build_packet(header, seq, &buf, data_mode);
            self.send_packet_and_wait_ack(&packet)?;

            sent_bytes += n;
            packet_index += 1;
            progress(PacketProgress {
                packet_index,
                sent_bytes,
                total_bytes,
            });
            seq = seq.wrapping_add(1);

            if n < packet_size {
                break;
            }
        }

        self.send_eot()?;

        let null_payload = vec![INFO_PAD; packet_size];
        let null_packet = build_packet(header, 0, &null_payload, data_mode);
        self.send_packet_and_wait_ack(&null_packet)?;

        debug!("YMODEM transfer of {} complete", info.name);
        Ok(())
    }

    /// Wait for NAK (checksum mode) or 'C' (CRC-16 mode), honoring the
    /// retry budget and the two-consecutive-CAN cancel rule.
    ///
    /// Every iteration that doesn't resolve the mode counts against the
    /// retry budget, including isolated (non-doubled) CAN bytes, so a
    /// receiver that never sends a valid mode byte or a second CAN still
    /// times out instead of looping forever.
    fn negotiate_mode(&mut self) -> Result<CrcMode> {
        let mut error_count = 0u32;
        let mut can_count = 0u32;
        let mut timed_out = false;

        loop {
            match self.port.read_byte(self.config.timeout)? {
                Some(control::NAK) => return Ok(CrcMode::Checksum),
                Some(control::C) => return Ok(CrcMode::Crc16),
                Some(control::EOT) => {
                    return Err(Error::Ymodem("receiver declined the transfer".into()));
                }
                Some(control::CAN) => {
                    can_count += 1;
                    if can_count >= 2 {
                        return Err(Error::Ymodem("transfer cancelled by receiver".into()));
                    }
                    timed_out = false;
                    error_count += 1;
                }
                None => {
                    can_count = 0;
                    timed_out = true;
                    error_count += 1;
                }
                Some(c) => {
                    trace!("unexpected byte while negotiating mode: 0x{c:02X}");
                    can_count = 0;
                    timed_out = false;
                    error_count += 1;
                }
            }

            if error_count > self.config.retry {
                self.send_cancel();
                return Err(if timed_out {
                    Error::Timeout("no response while negotiating transfer mode".into())
                } else {
                    Error::Protocol("no valid mode request from receiver".into())
                });
            }
        }
    }

    /// Write one packet, retrying on NAK/timeout/garbage up to the retry
    /// budget, aborting on two consecutive CANs.
    fn send_packet_and_wait_ack(&mut self, packet: &[u8]) -> Result<()> {
        let mut error_count = 0u32;
        let mut can_count = 0u32;

        loop {
            self.port.write_all_bytes(packet)?;

            match self.port.read_byte(self.config.timeout)? {
                Some(control::ACK) => return Ok(()),
                Some(control::CAN) => {
                    can_count += 1;
                    if can_count >= 2 {
                        return Err(Error::Ymodem("transfer cancelled by receiver".into()));
                    }
                    error_count += 1;
                }
                other => {
                    if let Some(c) = other {
                        trace!("unexpected response: 0x{c:02X}, retrying");
                    }
                    can_count = 0;
                    error_count += 1;
                }
            }

            if error_count > self.config.retry {
                warn!("retry budget exhausted, cancelling transfer");
                self.send_cancel();
                return Err(Error::Ymodem(format!(
                    "block transfer failed after {} retries",
                    self.config.retry
                )));
            }
        }
    }

    /// Send EOT, retrying on non-ACK up to the retry budget.
    fn send_eot(&mut self) -> Result<()> {
        let mut error_count = 0u32;

        loop {
            self.port.write_all_bytes(&[control::EOT])?;

            if self.port.read_byte(self.config.timeout)? == Some(control::ACK) {
                debug!("EOT acked");
                return Ok(());
            }

            error_count += 1;
            if error_count > self.config.retry {
                return Err(Error::Ymodem("no ACK for EOT".into()));
            }
        }
    }

    /// Cancel the transfer by sending two CAN bytes. Best-effort: a failure
    /// writing the cancel is not itself reported, the caller already has a
    /// terminal error to return.
    fn send_cancel(&mut self) {
        let _ = self.port.write_all_bytes(&[control::CAN, control::CAN]);
    }
}

fn header_byte(packet_size: usize) -> u8 {
    if packet_size == STX_BLOCK_SIZE {
        control::STX
    } else {
        control::SOH
    }
}

/// Fill `buf` from `stream`, short only at EOF. Returns the number of bytes
/// actually read, which is `buf.len()` unless the stream ran out.
fn read_fill<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = stream.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn build_info_payload(info: &FileInfo, dialect: &DialectFlags, packet_size: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(packet_size);
    payload.extend_from_slice(info.name.as_bytes());
    payload.push(0x00);

    if dialect.use_length {
        payload.extend_from_slice(info.length.to_string().as_bytes());
    }
    if dialect.use_date {
        if let Some(mtime) = info.mtime {
            payload.push(b' ');
            payload.extend_from_slice(format!("{mtime:o}").as_bytes());
        }
    }
    if dialect.use_mode {
        if let Some(mode) = info.mode {
            payload.push(b' ');
            payload.extend_from_slice(format!("{mode:o}").as_bytes());
        }
    }
    if dialect.use_serial {
        if let Some(serial) = &info.serial {
            payload.push(b' ');
            payload.extend_from_slice(serial.as_bytes());
        }
    }

    payload.resize(packet_size, INFO_PAD);
    payload
}

fn build_packet(header: u8, seq: u8, payload: &[u8], mode: CrcMode) -> Vec<u8> {
    let mut packet = Vec::with_capacity(3 + payload.len() + 2);
    packet.push(header);
    packet.push(seq);
    packet.push(!seq);
    packet.extend_from_slice(payload);

    match mode {
        CrcMode::Checksum => packet.push(checksum8(payload)),
        CrcMode::Crc16 => {
            let crc = crc16_xmodem(payload);
            packet.push((crc >> 8) as u8);
            packet.push((crc & 0xFF) as u8);
        }
    }

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Mock serial port with independent read/write buffers, matching a
    /// real duplex link more closely than a shared `Cursor`.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
        timeout: Duration,
        baud_rate: u32,
    }

    impl MockSerial {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                write_buf: Vec::new(),
                timeout: Duration::from_millis(100),
                baud_rate: 115200,
            }
        }
    }

    impl std::io::Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl std::io::Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockSerial {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }
        fn timeout(&self) -> Duration {
            self.timeout
        }
        fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
            self.baud_rate = baud_rate;
            Ok(())
        }
        fn baud_rate(&self) -> u32 {
            self.baud_rate
        }
        fn clear_buffers(&mut self) -> Result<()> {
            self.read_buf.clear();
            Ok(())
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    fn fast_config() -> YmodemConfig {
        YmodemConfig {
            timeout: Duration::from_millis(50),
            retry: 2,
        }
    }

    #[test]
    fn test_build_packet_soh_checksum() {
        let packet = build_packet(control::SOH, 1, &[0x01, 0x02, 0x03], CrcMode::Checksum);
        assert_eq!(packet[0], control::SOH);
        assert_eq!(packet[1], 1);
        assert_eq!(packet[2], 0xFE);
        assert_eq!(packet.len(), 3 + 3 + 1);
        assert_eq!(*packet.last().unwrap(), 6);
    }

    #[test]
    fn test_build_packet_stx_crc16() {
        let data = vec![0xAAu8; STX_BLOCK_SIZE];
        let packet = build_packet(control::STX, 5, &data, CrcMode::Crc16);
        assert_eq!(packet[0], control::STX);
        assert_eq!(packet[1], 5);
        assert_eq!(packet[2], 0xFA);
        assert_eq!(packet.len(), 3 + STX_BLOCK_SIZE + 2);
    }

    #[test]
    fn test_info_payload_padded_with_zero() {
        let info = FileInfo::new("firmware.bin", 42);
        let payload = build_info_payload(&info, &DialectFlags::default(), SOH_BLOCK_SIZE);
        assert_eq!(payload.len(), SOH_BLOCK_SIZE);
        assert!(payload.starts_with(b"firmware.bin\x0042"));
        assert_eq!(*payload.last().unwrap(), 0x00);
    }

    #[test]
    fn test_info_payload_respects_dialect_flags() {
        let mut info = FileInfo::new("a.bin", 1);
        info.mtime = Some(8);
        info.mode = Some(0o644);
        let dialect = DialectFlags {
            use_date: false,
            use_mode: false,
            ..DialectFlags::default()
        };
        let payload = build_info_payload(&info, &dialect, SOH_BLOCK_SIZE);
        // Neither octal field should appear since both flags are off.
        assert!(!payload.windows(3).any(|w| w == b" 10"));
    }

    #[test]
    fn test_ymodem_happy_path_crc_mode() {
        let response = vec![
            control::C,   // negotiate info block
            control::ACK, // info block ack
            control::C,   // negotiate data blocks
            control::ACK, // data block 1
            control::ACK, // EOT
            control::ACK, // null block
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("test.bin", 100);
        let data = vec![0x42u8; 100];

        let result = sender.send(std::io::Cursor::new(data), &info, DialectFlags::default(), |_| {});
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn test_ymodem_checksum_fallback() {
        let response = vec![
            control::NAK, // checksum mode for info block
            control::ACK,
            control::NAK, // checksum mode for data blocks
            control::ACK,
            control::ACK, // EOT
            control::ACK, // null block
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("test.bin", 10);
        let data = vec![0x01u8; 10];

        let result = sender.send(std::io::Cursor::new(data), &info, DialectFlags::default(), |_| {});
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn test_ymodem_zero_length_file() {
        let response = vec![
            control::C,
            control::ACK, // info block ack
            control::C,   // data mode negotiated even though there is no data
            control::ACK, // EOT
            control::ACK, // null block
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("empty.bin", 0);

        let mut calls = 0;
        let result = sender.send(std::io::Cursor::new(Vec::new()), &info, DialectFlags::default(), |_| {
            calls += 1;
        });
        assert!(result.is_ok(), "{:?}", result.err());
        assert_eq!(calls, 0, "no data packets should be sent for an empty file");
    }

    #[test]
    fn test_ymodem_exact_multiple_of_block_size() {
        let response = vec![
            control::C,
            control::ACK, // info
            control::C,
            control::ACK, // single full data block
            control::ACK, // EOT
            control::ACK, // null
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("exact.bin", STX_BLOCK_SIZE as u64);
        let data = vec![0xCCu8; STX_BLOCK_SIZE];

        let mut calls = 0;
        let result = sender.send(std::io::Cursor::new(data), &info, DialectFlags::default(), |p| {
            calls += 1;
            assert_eq!(p.sent_bytes, STX_BLOCK_SIZE);
        });
        assert!(result.is_ok(), "{:?}", result.err());
        assert_eq!(calls, 1, "an exact multiple must not emit a trailing empty block");
    }

    #[test]
    fn test_ymodem_off_by_one_pads_with_sub() {
        let response = vec![
            control::C,
            control::ACK,
            control::C,
            control::ACK, // single short data block
            control::ACK, // EOT
            control::ACK, // null
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let len = STX_BLOCK_SIZE - 1;
        let info = FileInfo::new("short.bin", len as u64);
        let data = vec![0xDDu8; len];

        let result = sender.send(std::io::Cursor::new(data), &info, DialectFlags::default(), |_| {});
        assert!(result.is_ok(), "{:?}", result.err());

        // Find the data block (third packet written: info, then the single data block).
        let written = &port.write_buf;
        let info_len = 3 + STX_BLOCK_SIZE + 2;
        let data_block = &written[info_len..info_len + 3 + STX_BLOCK_SIZE + 2];
        assert_eq!(data_block[3 + len], DATA_PAD, "last real byte followed by one SUB pad byte");
    }

    #[test]
    fn test_ymodem_sequence_wraps_across_256_blocks() {
        let num_blocks = 257; // forces seq 1..=255, then wraps to 0, then 1
        let mut response = vec![control::C, control::ACK, control::C];
        response.extend(std::iter::repeat_n(control::ACK, num_blocks));
        response.push(control::ACK); // EOT
        response.push(control::ACK); // null
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());

        let total = STX_BLOCK_SIZE * num_blocks;
        let info = FileInfo::new("big.bin", total as u64);
        let data = vec![0xEEu8; total];

        let mut seen_seqs = Vec::new();
        let result = sender.send(std::io::Cursor::new(data), &info, DialectFlags::default(), |p| {
            seen_seqs.push(p.packet_index);
        });
        assert!(result.is_ok(), "{:?}", result.err());
        assert_eq!(seen_seqs.len(), num_blocks);
    }

    #[test]
    fn test_ymodem_receiver_cancel_aborts() {
        let response = vec![
            control::C,
            control::ACK, // info
            control::C,
            control::CAN,
            control::CAN, // two consecutive CANs during the one data block
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("cancel.bin", 10);
        let data = vec![0x11u8; 10];

        let result = sender.send(std::io::Cursor::new(data), &info, DialectFlags::default(), |_| {});
        assert!(result.is_err());
    }

    #[test]
    fn test_ymodem_retry_exhaustion_fails() {
        // Info block negotiation never arrives; with retry=2, the third
        // timeout tips over the budget.
        let response: Vec<u8> = Vec::new();
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("nope.bin", 1);

        let result = sender.send(std::io::Cursor::new(vec![0u8; 1]), &info, DialectFlags::default(), |_| {});
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_ymodem_negotiate_mode_counts_isolated_can_against_retry() {
        // Lone CAN bytes, alternated with garbage so none ever doubles up
        // or resolves the mode, must still exhaust the retry budget
        // instead of looping forever.
        let response = vec![
            control::CAN,
            0x99,
            control::CAN,
            0x99,
            control::CAN,
            0x99,
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("nope.bin", 1);

        let result = sender.send(std::io::Cursor::new(vec![0u8; 1]), &info, DialectFlags::default(), |_| {});
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_ymodem_send_from_real_file_on_disk() {
        use std::io::Write as _;

        let mut tmp = tempfile::NamedTempFile::new().expect("create tempfile");
        let payload = vec![0x5Au8; 10];
        tmp.write_all(&payload).expect("write tempfile");
        tmp.flush().expect("flush tempfile");

        let response = vec![
            control::C,
            control::ACK, // info
            control::C,
            control::ACK, // data block
            control::ACK, // EOT
            control::ACK, // null
        ];
        let mut port = MockSerial::new(&response);
        let mut sender = YmodemSender::with_config(&mut port, fast_config());
        let info = FileInfo::new("ondisk.bin", payload.len() as u64);

        let file = std::fs::File::open(tmp.path()).expect("reopen tempfile");
        let result = sender.send(file, &info, DialectFlags::default(), |_| {});
        assert!(result.is_ok(), "{:?}", result.err());
    }
}
