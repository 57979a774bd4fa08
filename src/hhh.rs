//! The Hierarchical Heavy-Hitters (HHH) engine: a recursive lattice search
//! that extracts nodes whose traffic exceeds a threshold out of an odflow
//! hash (or an odflow's protocol sub-queue) into a ranked result queue,
//! subtracting extracted counts from ancestors so totals are conserved.

use std::collections::VecDeque;

use crate::config::Criteria;
use crate::odflow::{AddressFamily, Odflow, OdflowHash};
use crate::prefix::{odflowspec_is_overlapped, OdflowSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pos {
    Lower,
    Left,
    Right,
    Upper,
}

const SUBPOS_ORDER: [Pos; 4] = [Pos::Lower, Pos::Left, Pos::Right, Pos::Upper];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnEdge {
    None,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy)]
pub struct HhhParams {
    pub thresh: u64,
    pub thresh2: u64,
    pub minsize: u32,
    pub maxsize: u32,
    pub cutoff: u32,
    pub cutoffres: u32,
    pub heuristics_enabled: bool,
    pub criteria: Criteria,
}

impl HhhParams {
    /// Parameters for a top-level run over a 32-bit (IPv4), 128-bit
    /// (IPv6), or 24-bit (protocol/port) label space.
    pub fn for_bitlen(
        bitlen: u32,
        thresh: u64,
        thresh2: u64,
        heuristics_enabled: bool,
        criteria: Criteria,
    ) -> Self {
        let mut p = HhhParams {
            thresh,
            thresh2,
            minsize: 1,
            maxsize: bitlen,
            cutoff: 0,
            cutoffres: 1,
            heuristics_enabled,
            criteria,
        };
        if heuristics_enabled {
            match bitlen {
                32 => {
                    p.cutoff = 16;
                    p.cutoffres = 8;
                }
                128 => {
                    p.cutoff = 32;
                    p.cutoffres = 16;
                }
                24 => {
                    p.minsize = 16;
                }
                _ => {}
            }
        }
        p
    }
}

fn thresh_check(odfp: &Odflow, params: &HhhParams) -> bool {
    let meets = match params.criteria {
        Criteria::Packet => odfp.packet >= params.thresh2,
        Criteria::Byte => odfp.byte >= params.thresh,
        Criteria::Combination => odfp.packet >= params.thresh2 || odfp.byte >= params.thresh,
    };
    meets || odfp.spec.is_wildcard()
}

/// Builds new odflows in `odfh`, one per distinct spec masked to
/// `(pl0, pl1)`, by walking `parent.idx_cache` into `flow_list`. Returns
/// the number of original flows aggregated.
fn odflow_aggregate(
    odfh: &mut OdflowHash,
    parent: &Odflow,
    flow_list: &[Option<Odflow>],
    pl0: u8,
    pl1: u8,
) -> usize {
    let mut n = 0;
    for i in 0..parent.idx_cache.size() {
        let index = parent.idx_cache.get(i) as usize;
        let f = match flow_list.get(index).and_then(|o| o.as_ref()) {
            Some(f) => f,
            None => continue,
        };
        if f.spec.srclen < pl0 || f.spec.dstlen < pl1 {
            continue;
        }
        let masked = OdflowSpec::new(f.spec.src, pl0, f.spec.dst, pl1);
        let byte = f.byte;
        let packet = f.packet;
        let af = f.af;
        let odfp = odfh.lookup(&masked, af);
        odfp.byte += byte;
        odfp.packet += packet;
        odfp.af = af;
        odfp.idx_cache.append(index as u64);
        n += 1;
    }
    n
}

/// Drains `odfh`, keeping every entry above threshold: subtracts its
/// counts from `parent`, moves covered children's sub-queues up, frees the
/// covered `flow_list` slots, and appends the survivor to `result_queue`.
fn odflow_extract(
    odfh: &mut OdflowHash,
    parent: &mut Odflow,
    flow_list: &mut [Option<Odflow>],
    params: &HhhParams,
    result_queue: &mut VecDeque<Odflow>,
) -> usize {
    let mut nflows = 0;
    for mut odfp in odfh.drain() {
        if !thresh_check(&odfp, params) {
            continue;
        }
        parent.packet -= odfp.packet;
        parent.byte -= odfp.byte;

        for j in 0..odfp.idx_cache.size() {
            let idx = odfp.idx_cache.get(j) as usize;
            if let Some(mut covered) = flow_list[idx].take() {
                if !covered.sub_queue.is_empty() {
                    odfp.sub_queue.extend(covered.sub_queue.drain(..));
                }
            }
        }
        odfp.idx_cache.clear();

        result_queue.push_back(odfp);
        nflows += 1;
    }
    nflows
}

#[allow(clippy::too_many_arguments)]
fn subarea_pass(
    flow_list: &mut Vec<Option<Odflow>>,
    odfp: &mut Odflow,
    pl0: u32,
    pl1: u32,
    delta: u32,
    subsize: u32,
    on_edge: OnEdge,
    params: &HhhParams,
    result_queue: &mut VecDeque<Odflow>,
    mut propagate_into: Option<&mut Odflow>,
) -> usize {
    let mut nflows = 0;
    for subpos in SUBPOS_ORDER {
        if on_edge != OnEdge::None && (subpos == Pos::Left || subpos == Pos::Right) {
            continue;
        }
        if !thresh_check(odfp, params) {
            break;
        }

        let (mut subpl0, mut subpl1) = (pl0, pl1);
        match subpos {
            Pos::Lower => match on_edge {
                OnEdge::Left => subpl1 += delta,
                OnEdge::Right => subpl0 += delta,
                OnEdge::None => {
                    subpl0 += delta;
                    subpl1 += delta;
                }
            },
            Pos::Left => subpl0 += delta,
            Pos::Right => subpl1 += delta,
            Pos::Upper => {}
        }

        if params.heuristics_enabled {
            let subpl_min = subpl0.min(subpl1);
            if subpl_min < params.cutoff && (subpl_min & params.cutoffres.saturating_sub(1)) != 0 {
                continue;
            }
        }

        let packet_before = odfp.packet;
        let byte_before = odfp.byte;
        let n = lattice_search(flow_list, odfp, subpl0, subpl1, subsize, subpos, params, result_queue);
        nflows += n;
        if n > 0 {
            if let Some(p) = propagate_into.as_deref_mut() {
                p.packet -= packet_before - odfp.packet;
                p.byte -= byte_before - odfp.byte;
            }
        }
    }
    nflows
}

/// Recursively visits the lattice area rooted at `(pl0, pl1)` of side
/// `size`, extracting heavy-hitter nodes into `result_queue`. See
/// module docs for the edge/heuristic rules this implements.
pub fn lattice_search(
    flow_list: &mut Vec<Option<Odflow>>,
    parent: &mut Odflow,
    pl0: u32,
    pl1: u32,
    size: u32,
    pos: Pos,
    params: &HhhParams,
    result_queue: &mut VecDeque<Odflow>,
) -> usize {
    let on_edge = if pl0 == params.maxsize {
        OnEdge::Left
    } else if pl1 == params.maxsize {
        OnEdge::Right
    } else {
        OnEdge::None
    };

    let mut do_recurse = true;
    if size <= params.minsize {
        do_recurse = false;
        if on_edge == OnEdge::Left && size != 0 {
            do_recurse = true;
        }
    }
    let do_aggregate = pos != Pos::Upper;

    if params.heuristics_enabled {
        let pl_max = pl0.max(pl1);
        if pl_max < params.cutoff && size == params.cutoffres {
            do_recurse = false;
        }
    }

    if !do_aggregate && !do_recurse {
        return 0;
    }

    let mut my_hash = if do_aggregate {
        let hint = (parent.idx_cache.size() / 8).max(1);
        let mut hash = OdflowHash::new(hint);
        let n = odflow_aggregate(&mut hash, parent, &flow_list[..], pl0 as u8, pl1 as u8);
        if n == 0 {
            return 0;
        }
        Some(hash)
    } else {
        None
    };

    let mut nflows = 0;

    if do_recurse {
        let (delta, subsize) = if size == params.minsize {
            (size, 0)
        } else {
            (size / 2, size / 2)
        };

        if let Some(hash) = my_hash.as_mut() {
            for bucket_idx in 0..hash.nbuckets() {
                let len = hash.bucket_len(bucket_idx);
                for i in 0..len {
                    let odfp = hash.bucket_entry_mut(bucket_idx, i);
                    nflows += subarea_pass(
                        flow_list,
                        odfp,
                        pl0,
                        pl1,
                        delta,
                        subsize,
                        on_edge,
                        params,
                        result_queue,
                        Some(parent),
                    );
                }
            }
        } else {
            nflows += subarea_pass(
                flow_list, parent, pl0, pl1, delta, subsize, on_edge, params, result_queue, None,
            );
        }
    }

    if let Some(mut hash) = my_hash {
        if thresh_check(parent, params) {
            nflows += odflow_extract(&mut hash, parent, flow_list, params, result_queue);
        }
    }

    nflows
}

fn af_for_bitlen(bitlen: u32) -> AddressFamily {
    match bitlen {
        32 => AddressFamily::V4,
        128 => AddressFamily::V6,
        _ => AddressFamily::Local,
    }
}

fn run_lattice(
    flow_list: &mut Vec<Option<Odflow>>,
    root: &mut Odflow,
    bitlen: u32,
    params: &HhhParams,
    result_queue: &mut VecDeque<Odflow>,
) -> usize {
    let mut nflows = 0;
    match bitlen {
        32 => {
            nflows += lattice_search(flow_list, root, 32, 0, 32, Pos::Lower, params, result_queue);
            nflows += lattice_search(flow_list, root, 0, 32, 32, Pos::Lower, params, result_queue);
            nflows += lattice_search(flow_list, root, 0, 0, 32, Pos::Lower, params, result_queue);
        }
        128 => {
            nflows += lattice_search(flow_list, root, 128, 0, 128, Pos::Lower, params, result_queue);
            nflows += lattice_search(flow_list, root, 0, 128, 128, Pos::Lower, params, result_queue);
            // the /64-and-below sub-lattice has its own edges, so it runs
            // under a params view with maxsize lowered to 64.
            let sub_params = HhhParams {
                maxsize: 64,
                ..*params
            };
            nflows += lattice_search(flow_list, root, 64, 0, 64, Pos::Lower, &sub_params, result_queue);
            nflows += lattice_search(flow_list, root, 0, 64, 64, Pos::Lower, &sub_params, result_queue);
            nflows += lattice_search(flow_list, root, 0, 0, 64, Pos::Lower, &sub_params, result_queue);
        }
        24 => {
            nflows += lattice_search(flow_list, root, 24, 8, 16, Pos::Lower, params, result_queue);
            nflows += lattice_search(flow_list, root, 8, 24, 16, Pos::Lower, params, result_queue);
            nflows += lattice_search(flow_list, root, 8, 8, 16, Pos::Lower, params, result_queue);
        }
        _ => unreachable!("bitlen must be 32, 128, or 24"),
    }
    nflows
}

/// Runs HHH over the entries currently in `hash`, draining it, appending
/// extracted odflows to `result_queue`.
pub fn find_hhh(hash: &mut OdflowHash, bitlen: u32, params: &HhhParams, result_queue: &mut VecDeque<Odflow>) -> usize {
    let mut flow_list: Vec<Option<Odflow>> = hash.drain().map(Some).collect();
    let mut root = Odflow::new(OdflowSpec::ZERO, af_for_bitlen(bitlen));
    for f in flow_list.iter().flatten() {
        root.byte += f.byte;
        root.packet += f.packet;
    }
    for i in 0..flow_list.len() {
        root.idx_cache.append(i as u64);
    }
    run_lattice(&mut flow_list, &mut root, bitlen, params, result_queue)
}

/// Runs HHH over the subset of `queue` matching `af`, leaving non-matching
/// entries untouched and appending survivors back into the same queue.
/// Used for per-parent sub-attribute recursion (protocol-in-address-view or
/// address-in-protocol-view).
pub fn find_hhh_in_subqueue(
    queue: &mut VecDeque<Odflow>,
    af: AddressFamily,
    bitlen: u32,
    params: &HhhParams,
) -> usize {
    let mut flow_list: Vec<Option<Odflow>> = Vec::new();
    let mut remaining = VecDeque::with_capacity(queue.len());
    while let Some(entry) = queue.pop_front() {
        if entry.af == af {
            flow_list.push(Some(entry));
        } else {
            remaining.push_back(entry);
        }
    }

    let mut root = Odflow::new(OdflowSpec::ZERO, af);
    for f in flow_list.iter().flatten() {
        root.byte += f.byte;
        root.packet += f.packet;
    }
    for i in 0..flow_list.len() {
        root.idx_cache.append(i as u64);
    }

    let mut extracted = VecDeque::new();
    let nflows = run_lattice(&mut flow_list, &mut root, bitlen, params, &mut extracted);

    remaining.extend(extracted);
    *queue = remaining;
    nflows
}

/// Runs the full HHH pass over a closed [`crate::response::Response`]:
/// top-level extraction into `odfq`, an `nflows` cap if configured, and
/// per-survivor sub-attribute recursion on the complementary dimension.
pub fn aggregate_response(response: &mut crate::response::Response, query: &crate::response::Query) {
    let criteria = query.criteria;
    let heuristics_enabled = query.heuristics_enabled;
    let total_byte = response.total_byte();
    let total_packet = response.total_packet();
    let thresh_byte = total_byte * query.threshold as u64 / 100;
    let thresh_packet = total_packet * query.threshold as u64 / 100;

    if let Some(proto_hash) = response.proto_hash.as_mut() {
        let params = HhhParams::for_bitlen(24, thresh_byte, thresh_packet, heuristics_enabled, criteria);
        find_hhh(proto_hash, 24, &params, &mut response.odfq);
    } else {
        let v4_params = HhhParams::for_bitlen(32, thresh_byte, thresh_packet, heuristics_enabled, criteria);
        find_hhh(&mut response.ip_hash, 32, &v4_params, &mut response.odfq);
        let v6_params = HhhParams::for_bitlen(128, thresh_byte, thresh_packet, heuristics_enabled, criteria);
        find_hhh(&mut response.ip6_hash, 128, &v6_params, &mut response.odfq);
    }

    if let Some(nflows) = query.nflows {
        if response.odfq.len() > nflows {
            odfq_countsort(&mut response.odfq, criteria, total_byte, total_packet);
            odfq_listreduce(&mut response.odfq, nflows);
            odfq_areasort(&mut response.odfq);
        }
    }

    let protocol_view = response.proto_hash.is_some();
    for odfp in response.odfq.iter_mut() {
        let mut sub_thresh_byte = odfp.byte * query.threshold as u64 / 100;
        let mut sub_thresh_packet = odfp.packet * query.threshold as u64 / 100;
        if query.strict_sub_attr {
            sub_thresh_byte *= 4;
            sub_thresh_packet *= 4;
        }

        if protocol_view {
            let v4_params = HhhParams::for_bitlen(32, sub_thresh_byte, sub_thresh_packet, heuristics_enabled, criteria);
            find_hhh_in_subqueue(&mut odfp.sub_queue, AddressFamily::V4, 32, &v4_params);
            let v6_params = HhhParams::for_bitlen(128, sub_thresh_byte, sub_thresh_packet, heuristics_enabled, criteria);
            find_hhh_in_subqueue(&mut odfp.sub_queue, AddressFamily::V6, 128, &v6_params);
        } else {
            let params = HhhParams::for_bitlen(24, sub_thresh_byte, sub_thresh_packet, heuristics_enabled, criteria);
            find_hhh_in_subqueue(&mut odfp.sub_queue, AddressFamily::Local, 24, &params);
        }

        if let Some(nflows) = query.nflows {
            if odfp.sub_queue.len() > nflows {
                odfq_countsort(&mut odfp.sub_queue, criteria, odfp.byte, odfp.packet);
                odfq_listreduce(&mut odfp.sub_queue, nflows);
                odfq_areasort(&mut odfp.sub_queue);
            }
        }
    }
}

/// Stable sort of `queue` by the active ranking criterion: raw counter for
/// BYTE/PACKET, or `max(byte, bpr*packet)` (equivalently
/// `max(byte/total_byte, packet/total_packet)`) for COMBINATION.
pub fn odfq_countsort(
    queue: &mut VecDeque<Odflow>,
    criteria: Criteria,
    total_byte: u64,
    total_packet: u64,
) {
    let bpr = if total_packet > 0 {
        total_byte as f64 / total_packet as f64
    } else {
        0.0
    };
    let mut entries: Vec<Odflow> = queue.drain(..).collect();
    entries.sort_by(|a, b| {
        let ka = count_key(a, criteria, bpr);
        let kb = count_key(b, criteria, bpr);
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    });
    queue.extend(entries);
}

fn count_key(odfp: &Odflow, criteria: Criteria, bpr: f64) -> f64 {
    match criteria {
        Criteria::Byte => odfp.byte as f64,
        Criteria::Packet => odfp.packet as f64,
        Criteria::Combination => (odfp.byte as f64).max(bpr * odfp.packet as f64),
    }
}

/// Sorts `queue` by `srclen + dstlen` descending (most specific first).
pub fn odfq_areasort(queue: &mut VecDeque<Odflow>) {
    let mut entries: Vec<Odflow> = queue.drain(..).collect();
    entries.sort_by(|a, b| {
        let la = a.spec.srclen as u32 + a.spec.dstlen as u32;
        let lb = b.spec.srclen as u32 + b.spec.dstlen as u32;
        lb.cmp(&la)
    });
    queue.extend(entries);
}

/// Repeatedly folds the tail entry of `queue` into its least-general
/// surviving ancestor until `queue.len() == n`.
pub fn odfq_listreduce(queue: &mut VecDeque<Odflow>, n: usize) {
    while queue.len() > n {
        let tail = match queue.pop_back() {
            Some(t) => t,
            None => break,
        };
        if tail.is_wildcard() {
            queue.push_back(tail);
            break;
        }
        let parent_pos = queue
            .iter()
            .enumerate()
            .filter(|(_, o)| odflowspec_is_overlapped(&o.spec, &tail.spec))
            .min_by_key(|(_, o)| {
                // least-general surviving ancestor = the one with the
                // largest (most specific) combined prefix length
                u32::MAX - (o.spec.srclen as u32 + o.spec.dstlen as u32)
            })
            .map(|(i, _)| i);

        match parent_pos {
            Some(pos) => {
                let mut parent = queue.remove(pos).expect("position came from iteration");
                parent.byte += tail.byte;
                parent.packet += tail.packet;
                parent.sub_queue.extend(tail.sub_queue);
                reinsert_sorted(queue, parent);
            }
            None => {
                // no generalization present; nothing to fold into, drop silently
            }
        }
    }
}

fn reinsert_sorted(queue: &mut VecDeque<Odflow>, entry: Odflow) {
    let len = entry.spec.srclen as u32 + entry.spec.dstlen as u32;
    let pos = queue
        .iter()
        .position(|o| (o.spec.srclen as u32 + o.spec.dstlen as u32) < len)
        .unwrap_or(queue.len());
    queue.insert(pos, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix::MAXLEN;

    fn addr_spec(a: u8, b: u8, c: u8, d: u8, len: u8) -> OdflowSpec {
        let mut src = [0u8; MAXLEN];
        src[0] = a;
        src[1] = b;
        src[2] = c;
        src[3] = d;
        OdflowSpec::new(src, len, [0u8; MAXLEN], 0)
    }

    fn insert(hash: &mut OdflowHash, a: u8, b: u8, c: u8, d: u8, byte: u64, packet: u64) {
        let spec = addr_spec(a, b, c, d, 32);
        hash.addcount(&spec, AddressFamily::V4, byte, packet);
    }

    #[test]
    fn single_heavy_flow_survives_as_one_entry() {
        let mut hash = OdflowHash::new(1024);
        insert(&mut hash, 10, 0, 0, 1, 100_000, 100);

        let params = HhhParams::for_bitlen(32, 1, 1, true, Criteria::Byte);
        let mut result = VecDeque::new();
        find_hhh(&mut hash, 32, &params, &mut result);

        assert_eq!(result.len(), 1);
        let odfp = &result[0];
        assert_eq!(odfp.byte, 100_000);
        assert_eq!(odfp.spec.srclen, 32);
    }

    #[test]
    fn below_threshold_flows_collapse_into_wildcard() {
        let mut hash = OdflowHash::new(1024);
        // total traffic is 100_000 bytes; these two entries are each well
        // below the 1% threshold and should only survive as the wildcard.
        insert(&mut hash, 1, 1, 1, 1, 500, 1);
        insert(&mut hash, 2, 2, 2, 2, 499, 1);
        // a third large entry keeps the total above the wildcard's own floor
        insert(&mut hash, 3, 3, 3, 3, 99_001, 1);

        let total_byte = hash.byte;
        let thresh = total_byte / 100; // 1%
        let params = HhhParams::for_bitlen(32, thresh, thresh, true, Criteria::Byte);
        let mut result = VecDeque::new();
        find_hhh(&mut hash, 32, &params, &mut result);

        let total_extracted: u64 = result.iter().map(|o| o.byte).sum();
        assert_eq!(total_extracted, total_byte);
        assert!(result.iter().any(|o| o.is_wildcard()));
    }

    #[test]
    fn count_conservation_across_many_flows() {
        let mut hash = OdflowHash::new(1024);
        let mut expected_total = 0u64;
        for i in 0..255u8 {
            insert(&mut hash, 10, 0, 0, i, 1000, 1);
            expected_total += 1000;
        }
        let thresh = expected_total / 100;
        let params = HhhParams::for_bitlen(32, thresh, 0, true, Criteria::Byte);
        let mut result = VecDeque::new();
        find_hhh(&mut hash, 32, &params, &mut result);

        let total_extracted: u64 = result.iter().map(|o| o.byte).sum();
        assert_eq!(total_extracted, expected_total);
    }

    #[test]
    fn areasort_orders_by_combined_prefix_length_desc() {
        let mut queue = VecDeque::new();
        queue.push_back(Odflow::new(addr_spec(10, 0, 0, 0, 8), AddressFamily::V4));
        queue.push_back(Odflow::new(addr_spec(10, 0, 0, 1, 32), AddressFamily::V4));
        queue.push_back(Odflow::new(OdflowSpec::ZERO, AddressFamily::V4));

        odfq_areasort(&mut queue);

        let lens: Vec<u32> = queue
            .iter()
            .map(|o| o.spec.srclen as u32 + o.spec.dstlen as u32)
            .collect();
        assert_eq!(lens, vec![32, 8, 0]);
    }

    #[test]
    fn listreduce_folds_tail_into_generalization() {
        let mut queue = VecDeque::new();
        let mut general = Odflow::new(addr_spec(10, 0, 0, 0, 8), AddressFamily::V4);
        general.byte = 100;
        let mut specific = Odflow::new(addr_spec(10, 0, 0, 1, 32), AddressFamily::V4);
        specific.byte = 50;
        queue.push_back(general);
        queue.push_back(specific);

        odfq_listreduce(&mut queue, 1);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].byte, 150);
    }

    #[test]
    fn aggregate_response_extracts_address_and_protocol_layers() {
        use crate::config::Config;
        use crate::response::{Query, Response};

        let mut response = Response::new(60, 1, false);
        let proto_spec = {
            let mut s = [0u8; MAXLEN];
            s[0] = 6;
            s[1] = 0x01;
            s[2] = 0xbb;
            OdflowSpec::new(s, 24, s, 24)
        };
        for i in 0..10u8 {
            let a = addr_spec(10, 0, 0, i, 32);
            response.ip_hash.addcount(&a, AddressFamily::V4, 10_000, 10);
            let odfp = response.ip_hash.lookup(&a, AddressFamily::V4);
            let proto = crate::odflow::odproto_lookup(odfp, &proto_spec, AddressFamily::Local, true);
            proto.byte += 10_000;
            proto.packet += 10;
        }

        let config = Config::default();
        let query = Query::from_config(&config, false);
        aggregate_response(&mut response, &query);

        assert!(!response.odfq.is_empty());
        let total_extracted: u64 = response.odfq.iter().map(|o| o.byte).sum();
        assert_eq!(total_extracted, 100_000);
    }
}
