//! Per-interval aggregation state (`Response`) and the read-only run
//! configuration derived from [`crate::config::Config`] (`Query`).

use std::collections::VecDeque;

use crate::cache_list::CacheList;
use crate::config::{Config, Criteria, OutFormat};
use crate::odflow::{Odflow, OdflowHash};

/// Bucket-count defaults from the data model: 1,024 for address hashes,
/// 512 for the flat protocol hash used in protocol view.
pub const IP_HASH_BUCKETS: usize = 1024;
pub const PROTO_HASH_BUCKETS: usize = 512;

#[derive(Debug)]
pub struct Response {
    pub interval: u32,
    pub threshold: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub ip_hash: OdflowHash,
    pub ip6_hash: OdflowHash,
    pub proto_hash: Option<OdflowHash>,
    pub odfq: VecDeque<Odflow>,
    pub plot_timestamps: Vec<i64>,
    pub plot_slot: usize,
    /// Wall-clock time the HHH pass took, for the Aguri text preamble.
    pub aggregated_ms: Option<u64>,
}

impl Response {
    pub fn new(interval: u32, threshold: u32, protocol_view: bool) -> Self {
        Response {
            interval,
            threshold,
            start_time: 0,
            end_time: 0,
            ip_hash: OdflowHash::new(IP_HASH_BUCKETS),
            ip6_hash: OdflowHash::new(IP_HASH_BUCKETS),
            proto_hash: protocol_view.then(|| OdflowHash::new(PROTO_HASH_BUCKETS)),
            odfq: VecDeque::new(),
            plot_timestamps: Vec::new(),
            plot_slot: 0,
            aggregated_ms: None,
        }
    }

    pub fn total_byte(&self) -> u64 {
        self.ip_hash.byte
            + self.ip6_hash.byte
            + self.proto_hash.as_ref().map_or(0, |h| h.byte)
    }

    pub fn total_packet(&self) -> u64 {
        self.ip_hash.packet
            + self.ip6_hash.packet
            + self.proto_hash.as_ref().map_or(0, |h| h.packet)
    }

    /// Clears the hashes and result queue for reuse by the next interval,
    /// keeping the allocated bucket vectors.
    pub fn reset(&mut self) {
        self.ip_hash.reset();
        self.ip6_hash.reset();
        if let Some(h) = self.proto_hash.as_mut() {
            h.reset();
        }
        self.odfq.clear();
        self.plot_timestamps.clear();
        self.plot_slot = 0;
        self.aggregated_ms = None;
    }

    /// Allocates `idx_cache` plot-slot storage (sized to `timeslots`) on
    /// every result odflow, ready for [`crate::plot::plot_addupinterval`].
    pub fn init_plot_slots(&mut self, timeslots: usize) {
        for odfp in self.odfq.iter_mut() {
            odfp.idx_cache = CacheList::with_len(timeslots);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub criteria: Criteria,
    pub interval: u32,
    pub output_interval: Option<u32>,
    pub threshold: u32,
    pub nflows: Option<usize>,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub max_hashentries: u64,
    pub heuristics_enabled: bool,
    pub strict_sub_attr: bool,
    pub outfmt: OutFormat,
    pub protocol_view: bool,
}

impl Query {
    pub fn from_config(config: &Config, protocol_view: bool) -> Self {
        Query {
            criteria: config.criteria,
            interval: config.interval,
            output_interval: config.output_interval,
            threshold: config.threshold,
            nflows: config.nflows,
            start_time: config.start_time,
            end_time: config.end_time,
            duration: config.duration,
            max_hashentries: config.max_hashentries,
            heuristics_enabled: config.heuristics.heuristics_enabled(),
            strict_sub_attr: config.heuristics.strict_sub_attr(),
            outfmt: config.outfmt,
            protocol_view,
        }
    }

    pub fn two_stage(&self) -> bool {
        matches!(self.output_interval, Some(out) if out > self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_totals_sum_hashes() {
        let mut r = Response::new(60, 1, false);
        r.ip_hash.byte = 100;
        r.ip6_hash.byte = 50;
        assert_eq!(r.total_byte(), 150);
    }

    #[test]
    fn reset_clears_result_queue() {
        let mut r = Response::new(60, 1, false);
        r.odfq.push_back(Odflow::new(crate::prefix::OdflowSpec::ZERO, crate::odflow::AddressFamily::V4));
        r.reset();
        assert!(r.odfq.is_empty());
    }

    #[test]
    fn query_from_config_carries_heuristic_flags() {
        let config = Config::default();
        let query = Query::from_config(&config, false);
        assert!(query.heuristics_enabled);
        assert!(query.strict_sub_attr);
    }
}
