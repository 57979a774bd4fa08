//! Two-buffer producer/consumer driver: a producer (ingest) thread fills
//! one of two response buffers while a consumer (aggregator) thread drains
//! the other, trading ownership at interval boundaries via a pair of
//! mutexes and an epoch counter.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use tracing::{info, warn};

use crate::config::OutFormat;
use crate::error::{ProfilerError, Result};
use crate::ingest::{ingest, FlowRecord, FlowTimeAction, FlowTimeTracker};
use crate::odflow::AddressFamily;
use crate::plot::{calc_interval, plot_addupinterval, timeslot_count};
use crate::response::{Query, Response};
use crate::twostage::{restore, save, CarryOver, RestoreOutcome};
use crate::wire::{read_record, ReadOutcome};

/// Cooperative cancellation and log-rotation signal flags, shared between
/// the producer and consumer threads.
#[derive(Debug, Default)]
pub struct Flags {
    pub close: AtomicBool,
    pub hup: AtomicBool,
    pub exiting: AtomicBool,
}

/// The pair of response buffers, their mutexes, and the epoch counter
/// that hands buffer ownership between the producer and consumer.
pub struct Pipeline {
    buffers: [Arc<Mutex<Response>>; 2],
    epoch: AtomicUsize,
    pub flags: Arc<Flags>,
}

impl Pipeline {
    pub fn new(interval: u32, threshold: u32, protocol_view: bool) -> Self {
        Pipeline {
            buffers: [
                Arc::new(Mutex::new(Response::new(interval, threshold, protocol_view))),
                Arc::new(Mutex::new(Response::new(interval, threshold, protocol_view))),
            ],
            epoch: AtomicUsize::new(0),
            flags: Arc::new(Flags::default()),
        }
    }

    fn buffer(&self, epoch: usize) -> Arc<Mutex<Response>> {
        Arc::clone(&self.buffers[epoch & 1])
    }
}

/// Runs the producer loop: reads wire records from `reader`, folds them
/// into the buffer for the current epoch, and rotates to the next buffer
/// whenever [`FlowTimeTracker`] reports an interval boundary.
pub fn run_producer<R: Read>(
    pipeline: &Pipeline,
    mut reader: R,
    query: &Query,
) -> Result<usize> {
    let mut epoch = 0usize;
    let mut current = pipeline.buffer(epoch);
    let mut guard = current
        .lock()
        .map_err(|e| ProfilerError::SyncAnomaly(e.to_string()))?;
    let mut tracker = FlowTimeTracker::new(query.start_time, query.end_time, query.interval as i64);
    let mut nrecords = 0usize;

    loop {
        if pipeline.flags.close.load(Ordering::Acquire) {
            break;
        }

        let raw = match read_record(&mut reader)? {
            ReadOutcome::Eof => break,
            ReadOutcome::Malformed => continue,
            ReadOutcome::Record(raw) => raw,
        };
        let record = match FlowRecord::from_raw(&raw) {
            Some(r) => r,
            None => continue,
        };

        let action = tracker.check(record.timestamp);
        if action == FlowTimeAction::Stop {
            break;
        }

        let hash_full = query.heuristics_enabled
            && (guard.ip_hash.nrecord as u64 > query.max_hashentries
                || guard.ip6_hash.nrecord as u64 > query.max_hashentries);

        if action == FlowTimeAction::Rotate || hash_full {
            if hash_full && action != FlowTimeAction::Rotate {
                warn!(epoch, max_hashentries = query.max_hashentries, "hash table full, forcing early rotation");
            }
            drop(guard);
            epoch += 1;
            current = pipeline.buffer(epoch);
            guard = match current.try_lock() {
                Ok(g) => g,
                Err(TryLockError::WouldBlock) => {
                    warn!(epoch, "consumer still holds next buffer, blocking producer");
                    current
                        .lock()
                        .map_err(|e| ProfilerError::SyncAnomaly(e.to_string()))?
                }
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
            };
            pipeline.epoch.store(epoch, Ordering::Release);
            guard.start_time = if action == FlowTimeAction::Rotate {
                tracker.current_boundary - query.interval as i64
            } else {
                record.timestamp
            };
        }

        fold_record(&mut guard, &record, query.heuristics_enabled);
        guard.end_time = record.timestamp;
        nrecords += 1;
    }

    info!(nrecords, "producer finished reading input");
    pipeline.flags.exiting.store(true, Ordering::Release);
    drop(guard);
    Ok(nrecords)
}

fn fold_record(response: &mut Response, record: &FlowRecord, heuristics_enabled: bool) {
    match record.af {
        AddressFamily::V4 => ingest(&mut response.ip_hash, record, heuristics_enabled),
        AddressFamily::V6 => ingest(&mut response.ip6_hash, record, heuristics_enabled),
        AddressFamily::Local => {
            if let Some(proto_hash) = response.proto_hash.as_mut() {
                ingest(proto_hash, record, heuristics_enabled);
            }
        }
    }
}

/// Derives the plot interval from the response's captured duration, sizes
/// `idx_cache` on every result odflow accordingly, and bins this interval's
/// totals into slot zero. The consumer only ever holds one fully-aggregated
/// interval at a time, so slots beyond zero stay at their zeroed default;
/// there is no finer-grained history to populate them with.
fn bin_plot_slots(response: &mut Response, query: &Query) {
    let duration = (response.end_time - response.start_time).max(1);
    let interval = calc_interval(duration, query.interval as i64);
    response.interval = interval as u32;

    let timeslots = timeslot_count(duration, interval);
    response.init_plot_slots(timeslots);
    response.plot_timestamps = (0..timeslots as i64).map(|i| response.start_time + i * interval).collect();

    plot_addupinterval(&mut response.odfq, &response.ip_hash, query.criteria, 0);
    plot_addupinterval(&mut response.odfq, &response.ip6_hash, query.criteria, 0);
    if let Some(ref proto_hash) = response.proto_hash {
        plot_addupinterval(&mut response.odfq, proto_hash, query.criteria, 0);
    }
}

/// Runs the consumer loop: for each epoch in order, locks its buffer
/// (blocking until the producer rotates away from it), runs HHH, folds in
/// any two-stage carry-over, and emits via `emit` unless the result is
/// still being carried forward. Terminates once the producer has set
/// `exiting` and released the final epoch's buffer.
pub fn run_consumer<F>(pipeline: &Pipeline, query: &Query, output_interval: Option<u32>, mut emit: F) -> Result<()>
where
    F: FnMut(&mut Response),
{
    let mut my_epoch = 0usize;
    let mut carry: Option<CarryOver> = None;

    loop {
        let buffer = pipeline.buffer(my_epoch);
        let mut response = buffer
            .lock()
            .map_err(|e| ProfilerError::SyncAnomaly(e.to_string()))?;

        let exiting_here =
            pipeline.flags.exiting.load(Ordering::Acquire) && pipeline.epoch.load(Ordering::Acquire) == my_epoch;

        let started = std::time::Instant::now();
        crate::hhh::aggregate_response(&mut response, query);
        response.aggregated_ms = Some(started.elapsed().as_millis() as u64);

        let should_emit = match (output_interval, carry.take()) {
            (Some(out), Some(c)) => match restore(c, &mut response, query, out) {
                RestoreOutcome::EmitAfterMerge => true,
                RestoreOutcome::Carried => {
                    carry = Some(save(&mut response));
                    false
                }
                RestoreOutcome::Discarded => true,
            },
            (Some(_), None) => {
                carry = Some(save(&mut response));
                false
            }
            (None, _) => true,
        };

        if should_emit {
            if query.outfmt == OutFormat::Json {
                bin_plot_slots(&mut response, query);
            }
            emit(&mut response);
        }

        if pipeline.flags.hup.swap(false, Ordering::AcqRel) {
            info!("log rotation requested, reopening output");
        }

        response.reset();
        drop(response);

        if exiting_here {
            break;
        }
        my_epoch += 1;
    }

    Ok(())
}
