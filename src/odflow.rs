//! The odflow accounting model: traffic aggregates kept in open-chained
//! hash tables keyed by [`OdflowSpec`], plus the protocol sub-queue and its
//! quick-merge port-scan protection.

use std::collections::VecDeque;

use crate::cache_list::CacheList;
use crate::prefix::{odflowspec_is_overlapped, OdflowSpec, MAXLEN};

/// Entries in a protocol sub-queue are merged into a wildcard once they
/// reach this many, to bound memory under a port scan.
pub const ODPQ_MAXENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
    Local,
}

/// A traffic aggregate keyed by an [`OdflowSpec`].
#[derive(Debug, Clone)]
pub struct Odflow {
    pub spec: OdflowSpec,
    pub af: AddressFamily,
    pub byte: u64,
    pub packet: u64,
    /// Children of the complementary dimension (protocol children for an
    /// address odflow; address children for a protocol odflow in protocol
    /// view), FIFO-ordered.
    pub sub_queue: VecDeque<Odflow>,
    /// Dual-purpose scratch: HHH index cache during aggregation, per-slot
    /// plot counters during plotting.
    pub idx_cache: CacheList,
}

impl Odflow {
    pub fn new(spec: OdflowSpec, af: AddressFamily) -> Self {
        Odflow {
            spec,
            af,
            byte: 0,
            packet: 0,
            sub_queue: VecDeque::new(),
            idx_cache: CacheList::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.spec.is_wildcard()
    }
}

/// An open-chained hash table of odflows, bucketed by a Jenkins-style mix
/// of the spec's leading address/port bytes.
#[derive(Debug)]
pub struct OdflowHash {
    buckets: Vec<VecDeque<Odflow>>,
    pub byte: u64,
    pub packet: u64,
    pub nrecord: usize,
}

/// Rounds `hint` up to the next power of two, capped at 4,096 and floored
/// at 1.
pub fn bucket_count_for(hint: usize) -> usize {
    let mut n = 1usize;
    while n < hint && n < 4096 {
        n <<= 1;
    }
    n.max(1)
}

const MIX_SEED: u32 = 0x9e3779b9;

fn mix_step(acc: u32, byte: u8) -> u32 {
    let acc = acc.wrapping_add(byte as u32);
    let acc = acc.wrapping_add(acc << 10);
    acc ^ (acc >> 6)
}

fn mix_finalize(acc: u32) -> u32 {
    let acc = acc.wrapping_add(acc << 3);
    let acc = acc ^ (acc >> 11);
    acc.wrapping_add(acc << 15)
}

/// Bucket index for `spec` in a table of `nbuckets` (a power of two).
pub fn slot_fetch(spec: &OdflowSpec, nbuckets: usize) -> usize {
    let mut acc = MIX_SEED;
    for &b in &spec.src[..4.min(MAXLEN)] {
        acc = mix_step(acc, b);
    }
    for &b in &spec.dst[..4.min(MAXLEN)] {
        acc = mix_step(acc, b);
    }
    acc = mix_step(acc, spec.srclen);
    acc = mix_step(acc, spec.dstlen);
    let acc = mix_finalize(acc);
    (acc as usize) & (nbuckets - 1)
}

impl OdflowHash {
    pub fn new(nbuckets: usize) -> Self {
        let nbuckets = bucket_count_for(nbuckets);
        OdflowHash {
            buckets: (0..nbuckets).map(|_| VecDeque::new()).collect(),
            byte: 0,
            packet: 0,
            nrecord: 0,
        }
    }

    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    /// Finds the odflow matching `spec`, allocating one at the bucket head
    /// if absent. Counters are untouched; see [`OdflowHash::addcount`].
    pub fn lookup(&mut self, spec: &OdflowSpec, af: AddressFamily) -> &mut Odflow {
        let slot = slot_fetch(spec, self.buckets.len());
        let bucket = &mut self.buckets[slot];
        if let Some(pos) = bucket.iter().position(|o| &o.spec == spec) {
            return &mut bucket[pos];
        }
        bucket.push_front(Odflow::new(*spec, af));
        self.nrecord += 1;
        &mut bucket[0]
    }

    pub fn addcount(&mut self, spec: &OdflowSpec, af: AddressFamily, byte: u64, packet: u64) {
        self.byte += byte;
        self.packet += packet;
        let odfp = self.lookup(spec, af);
        odfp.af = af;
        odfp.byte += byte;
        odfp.packet += packet;
    }

    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.byte = 0;
        self.packet = 0;
        self.nrecord = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Odflow> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Odflow> {
        self.buckets.iter_mut().flat_map(|b| b.iter_mut())
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Odflow> + '_ {
        self.buckets.iter_mut().flat_map(|b| b.drain(..))
    }

    pub fn bucket_len(&self, bucket_idx: usize) -> usize {
        self.buckets[bucket_idx].len()
    }

    pub fn bucket_entry_mut(&mut self, bucket_idx: usize, i: usize) -> &mut Odflow {
        &mut self.buckets[bucket_idx][i]
    }
}

/// Looks up (or allocates) the protocol sub-odflow of `parent` matching
/// `spec`, applying quick-merge when the sub-queue has grown past
/// [`ODPQ_MAXENTRIES`] and heuristics are enabled.
pub fn odproto_lookup<'a>(
    parent: &'a mut Odflow,
    spec: &OdflowSpec,
    af: AddressFamily,
    heuristics_enabled: bool,
) -> &'a mut Odflow {
    let found = parent.sub_queue.iter().position(|o| {
        if o.af != af {
            false
        } else if o.spec.srclen == spec.srclen && o.spec.dstlen == spec.dstlen {
            &o.spec == spec
        } else {
            odflowspec_is_overlapped(&o.spec, spec)
        }
    });

    if let Some(pos) = found {
        return &mut parent.sub_queue[pos];
    }

    if parent.sub_queue.len() >= ODPQ_MAXENTRIES && heuristics_enabled {
        odproto_quickmerge(&mut parent.sub_queue, spec);
        // the merge either created a covering wildcard or left the queue
        // untouched; either way, re-scan once more for a match.
        if let Some(pos) = parent.sub_queue.iter().position(|o| {
            o.af == af && odflowspec_is_overlapped(&o.spec, spec)
        }) {
            return &mut parent.sub_queue[pos];
        }
    }

    parent.sub_queue.push_front(Odflow::new(*spec, af));
    &mut parent.sub_queue[0]
}

/// Builds the masked spec for wildcard candidate `i` (0: proto:sport:*,
/// 1: proto:*:dport, 2: proto:*:*) derived from `spec`.
fn wildcard_spec(i: usize, spec: &OdflowSpec) -> OdflowSpec {
    let (srclen, dstlen) = match i {
        0 => (24, 8),
        1 => (8, 24),
        _ => (8, 8),
    };
    OdflowSpec::new(spec.src, srclen, spec.dst, dstlen)
}

/// Port-scan protection: collapses `queue` into the single wildcard that
/// covers the most packets, removing every entry it subsumes.
fn odproto_quickmerge(queue: &mut VecDeque<Odflow>, spec: &OdflowSpec) {
    let mut wildcard: [Odflow; 3] = [
        Odflow::new(wildcard_spec(0, spec), AddressFamily::Local),
        Odflow::new(wildcard_spec(1, spec), AddressFamily::Local),
        Odflow::new(wildcard_spec(2, spec), AddressFamily::Local),
    ];
    let mut covered = [Vec::new(), Vec::new(), Vec::new()];

    for (i, entry) in queue.iter().enumerate() {
        for (w, cov) in wildcard.iter_mut().zip(covered.iter_mut()) {
            if odflowspec_is_overlapped(&w.spec, &entry.spec) {
                w.byte += entry.byte;
                w.packet += entry.packet;
                cov.push(i);
            }
        }
    }

    let mut idx = 0;
    if wildcard[0].packet < wildcard[1].packet {
        idx = 1;
    }
    if wildcard[idx].packet < wildcard[2].packet / 2 {
        idx = 2;
    }

    let to_remove: std::collections::HashSet<usize> = covered[idx].iter().copied().collect();
    let mut kept = VecDeque::with_capacity(queue.len().saturating_sub(to_remove.len()));
    for (i, entry) in queue.drain(..).enumerate() {
        if !to_remove.contains(&i) {
            kept.push_back(entry);
        }
    }
    *queue = kept;

    let winner = wildcard
        .into_iter()
        .nth(idx)
        .expect("idx is always 0, 1, or 2");
    insert_by_descending_length(queue, winner);
}

/// Inserts `entry` at the position preserving descending
/// `srclen + dstlen` order (used by quick-merge).
fn insert_by_descending_length(queue: &mut VecDeque<Odflow>, entry: Odflow) {
    let len = entry.spec.srclen as u32 + entry.spec.dstlen as u32;
    let pos = queue
        .iter()
        .position(|o| (o.spec.srclen as u32 + o.spec.dstlen as u32) < len)
        .unwrap_or(queue.len());
    queue.insert(pos, entry);
}
