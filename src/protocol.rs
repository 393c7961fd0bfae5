//! Report framing protocol for hardware signing devices
//!
//! Command payloads of arbitrary length are carried over fixed 64-byte HID
//! reports. Every report starts with a 5-byte header (protocol tag, channel
//! byte, big-endian sequence number); the first report of a payload carries
//! an additional big-endian total-length field. Remaining bytes are payload,
//! zero-padded to the full report size.
//!
//! ```text
//! report 0:  [01 01] [05] [00 00] [len_hi len_lo] [payload…    pad]
//! report n:  [01 01] [05] [nn nn] [payload…                    pad]
//! ```
//!
//! No I/O happens here; [`encode_payload`] and [`ReportAssembler`] are the
//! pure halves of one exchange. Exactly one payload is ever in assembly per
//! device — interleaving is prevented by the session's command queue.

use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::TransportError;

/// Size of one framed report, excluding the transport's report-id byte.
pub const REPORT_SIZE: usize = 64;

/// Size of one raw HID transfer: report-id byte plus the framed report.
pub const RAW_REPORT_SIZE: usize = REPORT_SIZE + 1;

/// Report-id byte prepended by the write path (the device class uses
/// unnumbered reports, so this is always zero).
pub const REPORT_ID: u8 = 0x00;

/// Fixed protocol tag carried by every report.
pub const PROTOCOL_TAG: u16 = 0x0101;

/// Fixed logical-channel byte carried by every report.
pub const CHANNEL_TAG: u8 = 0x05;

/// Header length of the first report of a payload (tag + channel +
/// sequence + total length).
pub const FIRST_HEADER_LEN: usize = 7;

/// Header length of continuation reports (tag + channel + sequence).
pub const CONT_HEADER_LEN: usize = 5;

/// Payload capacity of the first report.
pub const FIRST_CHUNK_CAPACITY: usize = REPORT_SIZE - FIRST_HEADER_LEN;

/// Payload capacity of each continuation report.
pub const CONT_CHUNK_CAPACITY: usize = REPORT_SIZE - CONT_HEADER_LEN;

/// One framed report, always exactly [`REPORT_SIZE`] bytes.
pub type Report = [u8; REPORT_SIZE];

/// Device identification constants for the hardware signing device class
pub mod device {
    /// Signing device vendor ID
    pub const VENDOR_ID: u16 = 0x2C97;
    /// Vendor-specific usage page of the transport interface. Composite
    /// firmware exposes other interfaces (keyboard emulation, U2F) under
    /// different usage pages; only this one speaks the framing protocol.
    pub const USAGE_PAGE: u16 = 0xFFA0;
}

/// Header of the first report of a payload.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FirstReportHeader {
    tag: U16,
    channel: u8,
    sequence: U16,
    total_len: U16,
}

/// Header of every continuation report.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ContReportHeader {
    tag: U16,
    channel: u8,
    sequence: U16,
}

/// Split a payload into framed reports.
///
/// Chunk 0 gets [`FIRST_CHUNK_CAPACITY`] bytes, every later chunk
/// [`CONT_CHUNK_CAPACITY`]. Each report is zero-padded to [`REPORT_SIZE`].
/// An empty payload produces no reports.
pub fn encode_payload(payload: &[u8]) -> Result<Vec<Report>, TransportError> {
    if payload.len() > u16::MAX as usize {
        return Err(TransportError::PayloadTooLarge(payload.len()));
    }

    let mut reports = Vec::new();
    let mut offset = 0usize;
    while offset < payload.len() {
        let mut report: Report = [0u8; REPORT_SIZE];
        let sequence = reports.len() as u16;
        let body = if sequence == 0 {
            let header = FirstReportHeader {
                tag: U16::new(PROTOCOL_TAG),
                channel: CHANNEL_TAG,
                sequence: U16::new(sequence),
                total_len: U16::new(payload.len() as u16),
            };
            report[..FIRST_HEADER_LEN].copy_from_slice(header.as_bytes());
            &mut report[FIRST_HEADER_LEN..]
        } else {
            let header = ContReportHeader {
                tag: U16::new(PROTOCOL_TAG),
                channel: CHANNEL_TAG,
                sequence: U16::new(sequence),
            };
            report[..CONT_HEADER_LEN].copy_from_slice(header.as_bytes());
            &mut report[CONT_HEADER_LEN..]
        };
        let take = body.len().min(payload.len() - offset);
        body[..take].copy_from_slice(&payload[offset..offset + take]);
        offset += take;
        reports.push(report);
    }
    Ok(reports)
}

/// Number of reports [`encode_payload`] produces for a payload length.
pub fn report_count(payload_len: usize) -> usize {
    if payload_len == 0 {
        0
    } else if payload_len <= FIRST_CHUNK_CAPACITY {
        1
    } else {
        1 + (payload_len - FIRST_CHUNK_CAPACITY).div_ceil(CONT_CHUNK_CAPACITY)
    }
}

/// Incremental reassembly of one fragmented response payload.
///
/// Feed report fragments in arrival order with [`push`](Self::push); the
/// expected total length comes from the first fragment's header and the
/// final fragment's payload share is derived from remaining-length
/// bookkeeping, not from any terminator byte.
#[derive(Debug, Default)]
pub struct ReportAssembler {
    buf: Vec<u8>,
    expected_len: Option<usize>,
    next_sequence: u16,
}

impl ReportAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one report fragment (without the report-id byte).
    ///
    /// Returns `Ok(Some(payload))` once the declared total length has been
    /// accumulated, `Ok(None)` while more fragments are expected.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let expected = match self.expected_len {
            None => self.push_first(fragment)?,
            Some(expected) => {
                self.push_continuation(fragment)?;
                expected
            }
        };

        if self.buf.len() >= expected {
            self.buf.truncate(expected);
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }

    fn push_first(&mut self, fragment: &[u8]) -> Result<usize, TransportError> {
        let (header, body) = FirstReportHeader::read_from_prefix(fragment)
            .map_err(|_| TransportError::MalformedReport("first fragment too short".into()))?;
        Self::check_envelope(header.tag.get(), header.channel)?;
        if header.sequence.get() != 0 {
            return Err(TransportError::MalformedReport(format!(
                "expected sequence 0, got {}",
                header.sequence.get()
            )));
        }

        let expected = header.total_len.get() as usize;
        self.expected_len = Some(expected);
        self.next_sequence = 1;
        let take = body.len().min(expected);
        self.buf.extend_from_slice(&body[..take]);
        Ok(expected)
    }

    fn push_continuation(&mut self, fragment: &[u8]) -> Result<(), TransportError> {
        let (header, body) = ContReportHeader::read_from_prefix(fragment)
            .map_err(|_| TransportError::MalformedReport("fragment too short".into()))?;
        Self::check_envelope(header.tag.get(), header.channel)?;
        if header.sequence.get() != self.next_sequence {
            return Err(TransportError::MalformedReport(format!(
                "expected sequence {}, got {}",
                self.next_sequence,
                header.sequence.get()
            )));
        }
        self.next_sequence += 1;

        // expected_len is set whenever this path is taken
        let remaining = self
            .expected_len
            .unwrap_or(0)
            .saturating_sub(self.buf.len());
        let take = body.len().min(remaining);
        self.buf.extend_from_slice(&body[..take]);
        Ok(())
    }

    fn check_envelope(tag: u16, channel: u8) -> Result<(), TransportError> {
        if tag != PROTOCOL_TAG {
            return Err(TransportError::MalformedReport(format!(
                "bad protocol tag 0x{tag:04X}"
            )));
        }
        if channel != CHANNEL_TAG {
            return Err(TransportError::MalformedReport(format!(
                "bad channel byte 0x{channel:02X}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn decode(reports: &[Report]) -> Vec<u8> {
        let mut assembler = ReportAssembler::new();
        for (i, report) in reports.iter().enumerate() {
            match assembler.push(report).unwrap() {
                Some(payload) => {
                    assert_eq!(i, reports.len() - 1, "payload completed early");
                    return payload;
                }
                None => assert_ne!(i, reports.len() - 1, "payload never completed"),
            }
        }
        Vec::new()
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        for len in 0..=4096usize {
            let payload = payload_of(len);
            let reports = encode_payload(&payload).unwrap();
            assert_eq!(reports.len(), report_count(len), "count for len {len}");
            assert_eq!(decode(&reports), payload, "roundtrip for len {len}");
        }
    }

    #[test]
    fn test_report_count_boundaries() {
        assert_eq!(report_count(0), 0);
        assert_eq!(report_count(1), 1);
        assert_eq!(report_count(FIRST_CHUNK_CAPACITY), 1);
        assert_eq!(report_count(FIRST_CHUNK_CAPACITY + 1), 2);
        assert_eq!(report_count(FIRST_CHUNK_CAPACITY + CONT_CHUNK_CAPACITY), 2);
        assert_eq!(
            report_count(FIRST_CHUNK_CAPACITY + CONT_CHUNK_CAPACITY + 1),
            3
        );
    }

    #[test]
    fn test_first_report_header_layout() {
        let payload = payload_of(300);
        let reports = encode_payload(&payload).unwrap();
        let first = &reports[0];

        assert_eq!(&first[0..2], &[0x01, 0x01]); // protocol tag, big-endian
        assert_eq!(first[2], 0x05); // channel
        assert_eq!(&first[3..5], &[0x00, 0x00]); // sequence 0
        assert_eq!(&first[5..7], &[0x01, 0x2C]); // total length 300
        assert_eq!(&first[7..], &payload[..FIRST_CHUNK_CAPACITY]);
    }

    #[test]
    fn test_continuation_header_layout() {
        let payload = payload_of(300);
        let reports = encode_payload(&payload).unwrap();

        for (n, report) in reports.iter().enumerate().skip(1) {
            assert_eq!(&report[0..2], &[0x01, 0x01]);
            assert_eq!(report[2], 0x05);
            let seq = u16::from_be_bytes([report[3], report[4]]);
            assert_eq!(seq as usize, n);
        }
    }

    #[test]
    fn test_final_report_zero_padded() {
        let reports = encode_payload(&payload_of(10)).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0][FIRST_HEADER_LEN + 10..].iter().all(|&b| b == 0));
        assert!(reports.iter().all(|r| r.len() == REPORT_SIZE));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            encode_payload(&payload),
            Err(TransportError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_assembler_rejects_bad_tag() {
        let mut reports = encode_payload(&payload_of(10)).unwrap();
        reports[0][0] = 0xFF;
        let mut assembler = ReportAssembler::new();
        assert!(matches!(
            assembler.push(&reports[0]),
            Err(TransportError::MalformedReport(_))
        ));
    }

    #[test]
    fn test_assembler_rejects_sequence_gap() {
        let reports = encode_payload(&payload_of(200)).unwrap();
        assert!(reports.len() >= 3);
        let mut assembler = ReportAssembler::new();
        assert!(assembler.push(&reports[0]).unwrap().is_none());
        // skip reports[1]
        assert!(matches!(
            assembler.push(&reports[2]),
            Err(TransportError::MalformedReport(_))
        ));
    }

    #[test]
    fn test_assembler_ignores_padding_past_declared_length() {
        // Declared length shorter than the physical payload area: the
        // padding bytes must not leak into the reassembled payload.
        let payload = payload_of(5);
        let mut reports = encode_payload(&payload).unwrap();
        reports[0][FIRST_HEADER_LEN + 5] = 0xAB; // garbage in the pad area
        let mut assembler = ReportAssembler::new();
        assert_eq!(assembler.push(&reports[0]).unwrap().unwrap(), payload);
    }
}
