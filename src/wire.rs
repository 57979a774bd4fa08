//! Fixed-width flow record wire format: network byte order, 56 bytes per
//! record (a 40-byte flow spec plus four 32-bit counters). A short read at
//! a record boundary ends the stream cleanly (the format carries no
//! resync marker); a malformed `ip_version` within an otherwise intact
//! record is logged and the record skipped, since the record's length is
//! still known and the next offset is recoverable.

use std::io::{self, Read};

use tracing::warn;

use crate::prefix::MAXLEN;

/// `flow_spec`: src_addr[16] + dst_addr[16] + src_port(2) + dst_port(2) +
/// ip_version(1) + protocol(1) + pad(2).
const FLOW_SPEC_LEN: usize = MAXLEN + MAXLEN + 2 + 2 + 1 + 1 + 2;
/// Flow spec plus packets(4) + bytes(4) + first_ts(4) + last_ts(4).
pub const RECORD_LEN: usize = FLOW_SPEC_LEN + 4 + 4 + 4 + 4;

#[derive(Debug, Clone)]
pub struct RawFlowRecord {
    pub ip_version: u8,
    pub protocol: u8,
    pub src_addr: [u8; MAXLEN],
    pub dst_addr: [u8; MAXLEN],
    pub src_port: u16,
    pub dst_port: u16,
    pub byte: u64,
    pub packet: u64,
    /// Flow start time, unix seconds.
    pub first_ts: i64,
    /// Flow end time, unix seconds; used as the record's timestamp for
    /// interval bookkeeping, matching the reference reader.
    pub timestamp: i64,
}

/// Result of attempting to read one record.
pub enum ReadOutcome {
    Record(RawFlowRecord),
    /// Record's `ip_version` was unrecognized; caller should log and
    /// continue reading from the next record boundary.
    Malformed,
    /// Clean end of stream: zero bytes read at a record boundary.
    Eof,
}

/// Reads one fixed-width record from `r`. A partial read mid-record (more
/// than zero but fewer than `RECORD_LEN` bytes) is reported as an I/O
/// error rather than `Eof`, since it indicates a truncated capture rather
/// than a clean stop.
pub fn read_record<R: Read>(r: &mut R) -> io::Result<ReadOutcome> {
    let mut buf = [0u8; RECORD_LEN];
    let mut total = 0;
    loop {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if total == RECORD_LEN {
            break;
        }
    }

    if total == 0 {
        return Ok(ReadOutcome::Eof);
    }
    if total != RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("truncated flow record: got {total} of {RECORD_LEN} bytes"),
        ));
    }

    let mut off = 0;
    let mut src_addr = [0u8; MAXLEN];
    src_addr.copy_from_slice(&buf[off..off + MAXLEN]);
    off += MAXLEN;
    let mut dst_addr = [0u8; MAXLEN];
    dst_addr.copy_from_slice(&buf[off..off + MAXLEN]);
    off += MAXLEN;
    let src_port = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;
    let dst_port = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;
    let ip_version = buf[off];
    off += 1;
    let protocol = buf[off];
    off += 1;
    off += 2; // pad

    if ip_version != 4 && ip_version != 6 {
        warn!(ip_version, "malformed flow record, skipping");
        return Ok(ReadOutcome::Malformed);
    }

    let packet = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as u64;
    off += 4;
    let byte = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as u64;
    off += 4;
    let first_ts = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as i64;
    off += 4;
    let last_ts = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as i64;

    Ok(ReadOutcome::Record(RawFlowRecord {
        ip_version,
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        byte,
        packet,
        first_ts,
        timestamp: last_ts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(ip_version: u8, byte: u32, packet: u32, last_ts: u32) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_LEN];
        buf[0] = 10; // src_addr[0]
        buf[MAXLEN] = 10; // dst_addr[0]
        let mut off = 2 * MAXLEN;
        buf[off] = 0x01;
        buf[off + 1] = 0xbb; // src_port = 0x01bb
        off += 2;
        buf[off + 1] = 0x50; // dst_port low byte
        off += 2;
        buf[off] = ip_version;
        off += 1;
        buf[off] = 6; // protocol
        off += 1;
        off += 2; // pad
        buf[off..off + 4].copy_from_slice(&packet.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&byte.to_be_bytes());
        off += 4;
        off += 4; // first_ts left at 0
        buf[off..off + 4].copy_from_slice(&last_ts.to_be_bytes());
        buf
    }

    #[test]
    fn decodes_one_record() {
        let data = encode(4, 1500, 1, 1_700_000_000);
        let mut cur = Cursor::new(data);
        match read_record(&mut cur).unwrap() {
            ReadOutcome::Record(rec) => {
                assert_eq!(rec.ip_version, 4);
                assert_eq!(rec.byte, 1500);
                assert_eq!(rec.src_port, 0x01bb);
                assert_eq!(rec.timestamp, 1_700_000_000);
            }
            _ => panic!("expected a record"),
        }
    }

    #[test]
    fn clean_eof_at_boundary() {
        let mut cur = Cursor::new(Vec::new());
        assert!(matches!(read_record(&mut cur).unwrap(), ReadOutcome::Eof));
    }

    #[test]
    fn truncated_mid_record_is_an_error() {
        let mut data = encode(4, 1, 1, 0);
        data.truncate(RECORD_LEN - 5);
        let mut cur = Cursor::new(data);
        assert!(read_record(&mut cur).is_err());
    }

    #[test]
    fn bad_ip_version_is_skipped_not_fatal() {
        let data = encode(9, 1, 1, 0);
        let mut cur = Cursor::new(data);
        assert!(matches!(read_record(&mut cur).unwrap(), ReadOutcome::Malformed));
    }
}
