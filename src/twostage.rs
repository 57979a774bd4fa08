//! Two-stage carry-over: when `output_interval > interval`, short
//! per-interval HHH results are saved and merged forward until an
//! `output_interval` boundary is reached, so summaries are not emitted
//! more often than configured.

use crate::hhh::aggregate_response;
use crate::odflow::AddressFamily;
use crate::response::{Query, Response};

#[derive(Debug)]
pub struct CarryOver {
    pub odfq: std::collections::VecDeque<crate::odflow::Odflow>,
    pub start_time: i64,
    pub end_time: i64,
}

/// Saves `response`'s result queue and time range into a side buffer
/// instead of emitting it.
pub fn save(response: &mut Response) -> CarryOver {
    CarryOver {
        odfq: std::mem::take(&mut response.odfq),
        start_time: response.start_time,
        end_time: response.end_time,
    }
}

/// Outcome of folding a carry-over into the freshly closed `response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The buffer is still short of an output boundary; keep carrying.
    Carried,
    /// The merged result lies within 2s of an `output_interval` boundary;
    /// emit now.
    EmitAfterMerge,
    /// The carry-over aged out (idle for more than `output_interval + 2`
    /// seconds) and was discarded without merging.
    Discarded,
}

const BOUNDARY_SLOP_SECS: i64 = 2;

/// Restores `carry` into `response`: merges its odflows into the address
/// hashes and re-runs HHH when still within the idle window, or discards
/// it when too much time has passed.
pub fn restore(carry: CarryOver, response: &mut Response, query: &Query, output_interval: u32) -> RestoreOutcome {
    let idle = response.start_time - carry.end_time;
    if idle > output_interval as i64 + BOUNDARY_SLOP_SECS {
        return RestoreOutcome::Discarded;
    }

    for odfp in carry.odfq {
        let hash = match odfp.af {
            AddressFamily::V4 => &mut response.ip_hash,
            AddressFamily::V6 => &mut response.ip6_hash,
            AddressFamily::Local => response
                .proto_hash
                .as_mut()
                .unwrap_or(&mut response.ip_hash),
        };
        hash.addcount(&odfp.spec, odfp.af, odfp.byte, odfp.packet);
        let merged = hash.lookup(&odfp.spec, odfp.af);
        merged.sub_queue.extend(odfp.sub_queue);
    }
    response.start_time = response.start_time.min(carry.start_time);

    aggregate_response(response, query);

    let distance_to_boundary = output_interval as i64
        - ((response.end_time - response.start_time).rem_euclid(output_interval as i64));
    if distance_to_boundary.abs() <= BOUNDARY_SLOP_SECS
        || distance_to_boundary >= output_interval as i64 - BOUNDARY_SLOP_SECS
    {
        RestoreOutcome::EmitAfterMerge
    } else {
        RestoreOutcome::Carried
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::odflow::Odflow;
    use crate::prefix::OdflowSpec;

    fn test_query() -> Query {
        Query::from_config(&Config::default(), false)
    }

    #[test]
    fn save_empties_the_response_queue() {
        let mut response = Response::new(60, 1, false);
        response
            .odfq
            .push_back(Odflow::new(OdflowSpec::ZERO, AddressFamily::V4));
        let carry = save(&mut response);
        assert!(response.odfq.is_empty());
        assert_eq!(carry.odfq.len(), 1);
    }

    #[test]
    fn restore_discards_after_long_idle() {
        let carry = CarryOver {
            odfq: Default::default(),
            start_time: 0,
            end_time: 0,
        };
        let mut response = Response::new(60, 1, false);
        response.start_time = 1000;
        let query = test_query();
        let outcome = restore(carry, &mut response, &query, 300);
        assert_eq!(outcome, RestoreOutcome::Discarded);
    }

    #[test]
    fn restore_merges_within_idle_window() {
        let mut carried = Odflow::new(
            OdflowSpec::new([10, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 32, [0; 16], 0),
            AddressFamily::V4,
        );
        carried.byte = 500;
        carried.packet = 5;
        let carry = CarryOver {
            odfq: std::collections::VecDeque::from([carried]),
            start_time: 0,
            end_time: 60,
        };
        let mut response = Response::new(60, 1, false);
        response.start_time = 60;
        response.end_time = 120;
        let query = test_query();
        let outcome = restore(carry, &mut response, &query, 300);
        assert_ne!(outcome, RestoreOutcome::Discarded);
        assert_eq!(response.start_time, 0);
    }
}
