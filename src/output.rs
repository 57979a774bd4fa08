//! Output emitters: Aguri text, JSON, and a terse debug rendering. Each
//! takes a finalized [`Response`] and a writer; no I/O happens inside the
//! engine or the hash.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Criteria;
use crate::error::{ProfilerError, Result};
use crate::odflow::Odflow;
use crate::prefix::MAXLEN;
use crate::response::{Query, Response};

fn fmt_addr(bytes: &[u8; MAXLEN], len: u8, is_v6: bool) -> String {
    if len == 0 {
        return if is_v6 { "*::".to_string() } else { "*".to_string() };
    }
    if is_v6 {
        let groups: Vec<String> = bytes.chunks(2).map(|c| format!("{:02x}{:02x}", c[0], c[1])).collect();
        format!("{}/{}", groups.join(":"), len)
    } else {
        format!("{}.{}.{}.{}/{}", bytes[0], bytes[1], bytes[2], bytes[3], len)
    }
}

fn fmt_proto_label(spec: &crate::prefix::OdflowSpec) -> String {
    let proto = if spec.srclen == 0 {
        "*".to_string()
    } else {
        spec.src[0].to_string()
    };
    let port_label = |bytes: &[u8; MAXLEN], len: u8| -> String {
        if len <= 8 {
            "*".to_string()
        } else if len < 24 {
            let start = u16::from_be_bytes([bytes[1], bytes[2]]);
            let span = 1u32 << (24 - len as u32);
            let end = (start as u32 + span - 1).min(u16::MAX as u32) as u16;
            format!("{start}-{end}")
        } else {
            u16::from_be_bytes([bytes[1], bytes[2]]).to_string()
        }
    };
    format!(
        "{}:{}:{}",
        proto,
        port_label(&spec.src, spec.srclen),
        port_label(&spec.dst, spec.dstlen)
    )
}

fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn fmt_rate(total_byte: u64, duration_secs: i64) -> Option<String> {
    if duration_secs <= 0 {
        return None;
    }
    let mut bps = (total_byte as f64 * 8.0) / duration_secs as f64;
    let units = ["bps", "Kbps", "Mbps", "Gbps"];
    let mut i = 0;
    while bps >= 1000.0 && i < units.len() - 1 {
        bps /= 1000.0;
        i += 1;
    }
    Some(format!("{bps:.2}{}", units[i]))
}

fn ctime_like(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_default()
}

fn iso_like(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format("%Y/%m/%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Writes the Aguri re-aggregation text format described in the wire
/// interfaces contract.
pub fn write_aguri_text<W: Write>(w: &mut W, response: &Response, query: &Query) -> Result<()> {
    let total_byte = response.total_byte();
    let total_packet = response.total_packet();
    let duration = response.end_time - response.start_time;

    writeln!(w, "%!AGURI-2.0")?;
    writeln!(
        w,
        "%%StartTime: {} ({})",
        ctime_like(response.start_time),
        iso_like(response.start_time)
    )?;
    writeln!(
        w,
        "%%EndTime:   {} ({})",
        ctime_like(response.end_time),
        iso_like(response.end_time)
    )?;
    if let Some(rate) = fmt_rate(total_byte, duration) {
        let pps = if duration > 0 { total_packet as f64 / duration as f64 } else { 0.0 };
        writeln!(w, "%AvgRate: {rate} {pps:.2}pps")?;
    }
    let criteria_name = match query.criteria {
        Criteria::Byte => "byte",
        Criteria::Packet => "pkt",
        Criteria::Combination => "combination",
    };
    writeln!(
        w,
        "% criteria: {criteria_name} counter (threshold {}% for addresses, {}% for protocol)",
        query.threshold, query.threshold
    )?;
    writeln!(
        w,
        "%input odflows: IPv4:{} IPv6:{}",
        response.ip_hash.nrecord, response.ip6_hash.nrecord
    )?;
    if let Some(ms) = response.aggregated_ms {
        writeln!(w, "%aggregated in {ms} ms")?;
    }

    for odfp in response.odfq.iter() {
        write_aguri_odflow(w, odfp, total_byte, total_packet)?;
    }
    Ok(())
}

fn write_aguri_odflow<W: Write>(w: &mut W, odfp: &Odflow, total_byte: u64, total_packet: u64) -> Result<()> {
    let is_v6 = odfp.af == crate::odflow::AddressFamily::V6;
    writeln!(
        w,
        "[ R] {} {}: {} ({:.2}%)  {} ({:.2}%)",
        fmt_addr(&odfp.spec.src, odfp.spec.srclen, is_v6),
        fmt_addr(&odfp.spec.dst, odfp.spec.dstlen, is_v6),
        odfp.byte,
        pct(odfp.byte, total_byte),
        odfp.packet,
        pct(odfp.packet, total_packet),
    )?;

    if odfp.sub_queue.is_empty() {
        writeln!(w, "        [*:*:*] 100.00% 100.00%")?;
    } else {
        for sub in odfp.sub_queue.iter() {
            writeln!(
                w,
                "        [{}] {:.2}% {:.2}%",
                fmt_proto_label(&sub.spec),
                pct(sub.byte, odfp.byte),
                pct(sub.packet, odfp.packet),
            )?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonReport {
    criteria: &'static str,
    duration: i64,
    start_time: i64,
    end_time: i64,
    nflows: usize,
    interval: u32,
    labels: Vec<String>,
    data: Vec<Vec<u64>>,
}

/// Writes the plotting JSON format: one label per surviving odflow plus a
/// trailing "TOTAL" column, and one data row per plot time slot.
pub fn write_json<W: Write>(w: &mut W, response: &Response, query: &Query) -> Result<()> {
    let criteria = match query.criteria {
        Criteria::Byte => "byte",
        Criteria::Packet => "packet",
        Criteria::Combination => "combination",
    };

    let mut labels: Vec<String> = response
        .odfq
        .iter()
        .map(|o| format!("{} {}", fmt_addr(&o.spec.src, o.spec.srclen, o.af == crate::odflow::AddressFamily::V6), fmt_addr(&o.spec.dst, o.spec.dstlen, o.af == crate::odflow::AddressFamily::V6)))
        .collect();
    labels.push("TOTAL".to_string());

    let timeslots = response.plot_timestamps.len().max(1);
    let mut data = Vec::with_capacity(timeslots);
    for slot in 0..timeslots {
        let mut row = Vec::with_capacity(labels.len());
        let mut total = 0u64;
        for odfp in response.odfq.iter() {
            let v = odfp.idx_cache.get(slot);
            row.push(v);
            total += v;
        }
        row.push(total);
        data.push(row);
    }

    let report = JsonReport {
        criteria,
        duration: response.end_time - response.start_time,
        start_time: response.start_time,
        end_time: response.end_time,
        nflows: response.odfq.len(),
        interval: response.interval,
        labels,
        data,
    };

    serde_json::to_writer_pretty(&mut *w, &report).map_err(|e| ProfilerError::OutputWrite(io::Error::new(io::ErrorKind::Other, e)))?;
    writeln!(w)?;
    Ok(())
}

/// Terse, unit-free rendering for diffing two runs byte-for-byte.
pub fn write_debug<W: Write>(w: &mut W, response: &Response) -> Result<()> {
    writeln!(
        w,
        "start={} end={} byte={} packet={} nflows={}",
        response.start_time,
        response.end_time,
        response.total_byte(),
        response.total_packet(),
        response.odfq.len()
    )?;
    for odfp in response.odfq.iter() {
        let is_v6 = odfp.af == crate::odflow::AddressFamily::V6;
        writeln!(
            w,
            "{} {} byte={} packet={} subqueue={}",
            fmt_addr(&odfp.spec.src, odfp.spec.srclen, is_v6),
            fmt_addr(&odfp.spec.dst, odfp.spec.dstlen, is_v6),
            odfp.byte,
            odfp.packet,
            odfp.sub_queue.len(),
        )?;
        for sub in odfp.sub_queue.iter() {
            writeln!(w, "  {} byte={} packet={}", fmt_proto_label(&sub.spec), sub.byte, sub.packet)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::odflow::AddressFamily;
    use crate::prefix::OdflowSpec;

    fn sample_response() -> Response {
        let mut response = Response::new(60, 1, false);
        response.start_time = 0;
        response.end_time = 60;
        let mut src = [0u8; MAXLEN];
        src[0..4].copy_from_slice(&[10, 0, 0, 1]);
        let mut dst = [0u8; MAXLEN];
        dst[0..4].copy_from_slice(&[10, 0, 0, 2]);
        let mut odfp = Odflow::new(OdflowSpec::new(src, 32, dst, 32), AddressFamily::V4);
        odfp.byte = 100_000;
        odfp.packet = 100;
        response.odfq.push_back(odfp);
        response.ip_hash.byte = 100_000;
        response.ip_hash.packet = 100;
        response
    }

    #[test]
    fn aguri_text_includes_synthetic_wildcard_when_subqueue_empty() {
        let response = sample_response();
        let query = Query::from_config(&Config::default(), false);
        let mut buf = Vec::new();
        write_aguri_text(&mut buf, &response, &query).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("[*:*:*] 100.00% 100.00%"));
    }

    #[test]
    fn aguri_text_reports_aggregation_time_when_known() {
        let mut response = sample_response();
        response.aggregated_ms = Some(7);
        let query = Query::from_config(&Config::default(), false);
        let mut buf = Vec::new();
        write_aguri_text(&mut buf, &response, &query).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("%aggregated in 7 ms"));
    }

    #[test]
    fn json_output_has_total_column() {
        let mut response = sample_response();
        response.plot_timestamps = vec![0];
        response.init_plot_slots(1);
        response.odfq[0].idx_cache.set(0, 100_000).unwrap();
        let query = Query::from_config(&Config::default(), false);
        let mut buf = Vec::new();
        write_json(&mut buf, &response, &query).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["labels"].as_array().unwrap().last().unwrap(), "TOTAL");
        assert_eq!(v["data"][0].as_array().unwrap().last().unwrap(), 100_000);
    }

    #[test]
    fn debug_output_is_deterministic_and_unit_free() {
        let response = sample_response();
        let mut buf = Vec::new();
        write_debug(&mut buf, &response).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("byte=100000"));
        assert!(!text.contains('%'));
    }
}
