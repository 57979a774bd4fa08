//! Normalizes wire-format flow records into odflow insertions, and tracks
//! timestamp bookkeeping (`check_flowtime`) that drives interval rotation.

use tracing::{debug, warn};

use crate::odflow::{AddressFamily, Odflow, OdflowHash};
use crate::prefix::{OdflowSpec, MAXLEN};
use crate::wire::RawFlowRecord;

/// A flow record after address-family dispatch and prefix-spec
/// construction, ready to be folded into the address and protocol hashes.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub af: AddressFamily,
    pub addr_spec: OdflowSpec,
    pub proto_spec: OdflowSpec,
    pub byte: u64,
    pub packet: u64,
    pub timestamp: i64,
}

impl FlowRecord {
    pub fn from_raw(raw: &RawFlowRecord) -> Option<Self> {
        let af = match raw.ip_version {
            4 => AddressFamily::V4,
            6 => AddressFamily::V6,
            other => {
                warn!(ip_version = other, "unrecognized ip_version, dropping record");
                return None;
            }
        };

        let bitlen = if af == AddressFamily::V4 { 32 } else { 128 };
        let mut src = [0u8; MAXLEN];
        let mut dst = [0u8; MAXLEN];
        src.copy_from_slice(&raw.src_addr);
        dst.copy_from_slice(&raw.dst_addr);
        let addr_spec = OdflowSpec::new(src, bitlen, dst, bitlen);

        // protocol/port domain: [protocol(8)][src port(16)][dst port(16)]
        let mut psrc = [0u8; MAXLEN];
        psrc[0] = raw.protocol;
        psrc[1] = (raw.src_port >> 8) as u8;
        psrc[2] = raw.src_port as u8;
        let mut pdst = [0u8; MAXLEN];
        pdst[0] = raw.protocol;
        pdst[1] = (raw.dst_port >> 8) as u8;
        pdst[2] = raw.dst_port as u8;
        let proto_spec = OdflowSpec::new(psrc, 24, pdst, 24);

        Some(FlowRecord {
            af,
            addr_spec,
            proto_spec,
            byte: raw.byte,
            packet: raw.packet,
            timestamp: raw.timestamp,
        })
    }
}

/// Folds one flow record into the address hash and its protocol sub-queue.
pub fn ingest(hash: &mut OdflowHash, record: &FlowRecord, heuristics_enabled: bool) {
    hash.byte += record.byte;
    hash.packet += record.packet;
    let odfp: &mut Odflow = hash.lookup(&record.addr_spec, record.af);
    odfp.af = record.af;
    odfp.byte += record.byte;
    odfp.packet += record.packet;

    let proto = crate::odflow::odproto_lookup(odfp, &record.proto_spec, record.af, heuristics_enabled);
    proto.byte += record.byte;
    proto.packet += record.packet;
}

/// Outcome of a timestamp check against the current interval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTimeAction {
    /// Record belongs to the current interval; keep reading.
    Continue,
    /// The current interval has elapsed; rotate buffers before processing
    /// this record.
    Rotate,
    /// `end_time`/`duration` has been reached; stop reading.
    Stop,
}

/// Tracks interval boundaries across a stream of timestamps, mirroring the
/// reference implementation's `ts_max` clamping and alignment behavior.
#[derive(Debug, Clone)]
pub struct FlowTimeTracker {
    pub start_time: i64,
    pub end_time: i64,
    pub interval: i64,
    pub current_boundary: i64,
    pub ts_max: i64,
    aligned: bool,
}

impl FlowTimeTracker {
    pub fn new(start_time: i64, end_time: i64, interval: i64) -> Self {
        FlowTimeTracker {
            start_time,
            end_time,
            interval,
            current_boundary: start_time,
            ts_max: start_time,
            aligned: start_time == 0,
        }
    }

    /// Checks `ts` against the tracked boundary, aligning the first
    /// observed timestamp up to the next interval boundary if `start_time`
    /// was not explicitly configured. Timestamps are clamped to be
    /// non-decreasing against the highest one seen so far.
    pub fn check(&mut self, ts: i64) -> FlowTimeAction {
        let ts = ts.max(self.ts_max);
        self.ts_max = ts;

        if !self.aligned {
            self.start_time = (ts + self.interval - 1) / self.interval * self.interval;
            self.current_boundary = self.start_time;
            self.aligned = true;
            debug!(aligned_start = self.start_time, "aligned interval start");
        }

        if self.end_time > 0 && ts >= self.end_time {
            return FlowTimeAction::Stop;
        }

        if ts >= self.current_boundary + self.interval {
            self.current_boundary += self.interval;
            return FlowTimeAction::Rotate;
        }

        FlowTimeAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RawFlowRecord;

    fn raw_v4(ts: i64, byte: u64, packet: u64) -> RawFlowRecord {
        RawFlowRecord {
            ip_version: 4,
            protocol: 6,
            src_addr: {
                let mut a = [0u8; MAXLEN];
                a[0..4].copy_from_slice(&[10, 0, 0, 1]);
                a
            },
            dst_addr: {
                let mut a = [0u8; MAXLEN];
                a[0..4].copy_from_slice(&[10, 0, 0, 2]);
                a
            },
            src_port: 443,
            dst_port: 51234,
            byte,
            packet,
            first_ts: ts,
            timestamp: ts,
        }
    }

    #[test]
    fn from_raw_rejects_unknown_version() {
        let mut raw = raw_v4(0, 1, 1);
        raw.ip_version = 5;
        assert!(FlowRecord::from_raw(&raw).is_none());
    }

    #[test]
    fn ingest_updates_both_address_and_protocol_counters() {
        let mut hash = OdflowHash::new(1024);
        let raw = raw_v4(0, 1500, 1);
        let record = FlowRecord::from_raw(&raw).unwrap();
        ingest(&mut hash, &record, true);

        assert_eq!(hash.byte, 1500);
        let odfp = hash.lookup(&record.addr_spec, AddressFamily::V4);
        assert_eq!(odfp.byte, 1500);
        assert_eq!(odfp.sub_queue.len(), 1);
        assert_eq!(odfp.sub_queue[0].byte, 1500);
    }

    #[test]
    fn flowtime_rotates_on_boundary_crossing() {
        let mut tracker = FlowTimeTracker::new(0, 0, 60);
        // first ts is already a multiple of the interval, so alignment is a no-op.
        assert_eq!(tracker.check(60), FlowTimeAction::Continue);
        assert_eq!(tracker.check(119), FlowTimeAction::Continue);
        assert_eq!(tracker.check(121), FlowTimeAction::Rotate);
    }

    #[test]
    fn flowtime_clamps_out_of_order_timestamps() {
        let mut tracker = FlowTimeTracker::new(0, 0, 60);
        tracker.check(120);
        assert_eq!(tracker.check(30), FlowTimeAction::Continue);
        assert_eq!(tracker.ts_max, 120);
    }

    #[test]
    fn flowtime_stops_at_end_time() {
        let mut tracker = FlowTimeTracker::new(0, 100, 60);
        assert_eq!(tracker.check(50), FlowTimeAction::Continue);
        assert_eq!(tracker.check(150), FlowTimeAction::Stop);
    }

    #[test]
    fn flowtime_aligns_unset_start_to_interval_boundary() {
        let mut tracker = FlowTimeTracker::new(0, 0, 60);
        tracker.check(125);
        assert_eq!(tracker.start_time, 180);
        assert_eq!(tracker.current_boundary, 180);
    }
}
