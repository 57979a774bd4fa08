//! Time-slot plotting backend: bins per-interval aggregate counts into a
//! fixed number of plot slots carried on each surviving result odflow.

use std::collections::VecDeque;

use crate::config::Criteria;
use crate::odflow::{Odflow, OdflowHash};
use crate::prefix::odflowspec_is_overlapped;

/// Derives a plotting interval from the captured duration, per the
/// reference implementation's tiered step table, then doubles it until it
/// is at least three quarters of `max_interval` (the largest observed
/// input-record interval).
pub fn calc_interval(duration: i64, max_interval: i64) -> i64 {
    let d = duration.max(1);
    let ceil_div = |n: i64, unit: i64| (n + unit - 1) / unit;

    let mut interval = if ceil_div(d, 3600) <= 24 {
        (ceil_div(d, 3600) * 30).min(600)
    } else if ceil_div(d, 86400) <= 7 {
        (ceil_div(d, 86400) * 600).min(3600)
    } else if ceil_div(d, 86400) <= 31 {
        14400
    } else if ceil_div(d, 86400 * 31) <= 12 {
        (ceil_div(d, 86400 * 31) * 14400).min(86400)
    } else {
        86400
    };

    while max_interval > 0 && interval < max_interval * 3 / 4 {
        interval *= 2;
    }
    interval
}

/// Number of plot slots needed to cover `duration` at `interval`
/// resolution, plus one for the trailing partial slot.
pub fn timeslot_count(duration: i64, interval: i64) -> usize {
    if interval <= 0 {
        return 1;
    }
    ((duration + interval - 1) / interval) as usize + 1
}

/// Walks `hash`'s entries, adding each one's count (selected by
/// `criteria`) into the plot slot of the first result odflow in `odfq`
/// whose spec overlaps it.
pub fn plot_addupinterval(odfq: &mut VecDeque<Odflow>, hash: &OdflowHash, criteria: Criteria, time_slot: usize) {
    for entry in hash.iter() {
        let count = match criteria {
            Criteria::Packet => entry.packet,
            Criteria::Byte | Criteria::Combination => entry.byte,
        };
        if count == 0 {
            continue;
        }
        if let Some(odfp) = odfq
            .iter_mut()
            .find(|o| odflowspec_is_overlapped(&o.spec, &entry.spec))
        {
            let _ = odfp.idx_cache.add(time_slot, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_day_duration_uses_30s_per_hour_tier() {
        // 2 hours -> ceil(7200/3600)=2 -> min(2*30,600) = 60
        assert_eq!(calc_interval(7200, 0), 60);
    }

    #[test]
    fn one_day_boundary_caps_at_600() {
        assert_eq!(calc_interval(86400, 0), 600);
    }

    #[test]
    fn multi_week_duration_uses_flat_14400() {
        // 20 days: ceil(20*86400/86400)=20 <= 31
        assert_eq!(calc_interval(20 * 86400, 0), 14400);
    }

    #[test]
    fn interval_grows_to_cover_observed_max_interval() {
        let interval = calc_interval(7200, 1000);
        assert!(interval * 4 >= 1000 * 3);
    }

    #[test]
    fn timeslot_count_covers_trailing_partial_slot() {
        assert_eq!(timeslot_count(125, 60), 3);
    }

    #[test]
    fn addupinterval_adds_into_overlapping_result() {
        use crate::odflow::AddressFamily;
        use crate::prefix::OdflowSpec;

        let mut hash = OdflowHash::new(16);
        let spec = OdflowSpec::new([10, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 32, [0; 16], 0);
        hash.addcount(&spec, AddressFamily::V4, 1000, 10);

        let general = OdflowSpec::new([10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 24, [0; 16], 0);
        let mut odfp = Odflow::new(general, AddressFamily::V4);
        odfp.idx_cache = crate::cache_list::CacheList::with_len(1);
        let mut odfq = VecDeque::new();
        odfq.push_back(odfp);

        plot_addupinterval(&mut odfq, &hash, Criteria::Byte, 0);
        assert_eq!(odfq[0].idx_cache.get(0), 1000);
    }
}
