//! Turning a client log into per-session series.
//!
//! The largest RTT receive tic closes the run window. Every non-RTT record
//! with a later tic is dropped, and with no RTT samples at all nothing but
//! the (empty) RTT series survives. Delivery and RTprop lines that carry no
//! session id go to the last session first seen among the RTT samples.

use std::collections::BTreeMap;

use tracing::debug;

use crate::parse::{
    parse_cwnd, parse_delivery, parse_inflight, parse_loss, parse_rtprop, parse_rtt, CwndSample,
    DeliverySample, EventKind, InflightSample, LossEvent, ParseError, RtPropSample, RttSample,
    SessionId, Tic,
};
use crate::series::SessionSeries;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub rtt: SessionSeries<i64>,
    pub srtt: SessionSeries<i64>,
    pub loss: SessionSeries<u32>,
    pub inflight: SessionSeries<u32>,
    pub cwnd: SessionSeries<i64>,
    pub delivery_rate: SessionSeries<f64>,
    pub btl_bw: SessionSeries<f64>,
    pub rtprop: SessionSeries<f64>,
    /// Window end: the largest RTT receive tic.
    pub max_tic: Option<Tic>,
    /// `seq` count over every parsed loss line, windowed or not.
    pub loss_total: u64,
    /// Malformed lines per event kind.
    pub skipped: BTreeMap<EventKind, usize>,
    /// Records past the window end per event kind.
    pub discarded: BTreeMap<EventKind, usize>,
}

impl Extraction {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn discarded_total(&self) -> usize {
        self.discarded.values().sum()
    }
}

#[derive(Default)]
struct Records {
    rtt: Vec<RttSample>,
    loss: Vec<LossEvent>,
    inflight: Vec<InflightSample>,
    cwnd: Vec<CwndSample>,
    delivery: Vec<DeliverySample>,
    rtprop: Vec<RtPropSample>,
}

fn keep<T>(
    result: Result<T, ParseError>,
    line_no: usize,
    out: &mut Vec<T>,
    skipped: &mut BTreeMap<EventKind, usize>,
) {
    match result {
        Ok(record) => out.push(record),
        Err(err) => {
            debug!(line = line_no, error = %err, "skipping malformed line");
            *skipped.entry(err.kind()).or_default() += 1;
        }
    }
}

/// Extracts every series from the log `text`. Pure: the same text always
/// yields the same result.
pub fn extract(text: &str) -> Extraction {
    let mut out = Extraction::default();
    let mut rec = Records::default();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        for kind in EventKind::ALL {
            if !line.contains(kind.marker()) {
                continue;
            }
            let skipped = &mut out.skipped;
            match kind {
                EventKind::Rtt => keep(parse_rtt(line), line_no, &mut rec.rtt, skipped),
                EventKind::Loss => keep(parse_loss(line), line_no, &mut rec.loss, skipped),
                EventKind::Inflight => {
                    keep(parse_inflight(line), line_no, &mut rec.inflight, skipped)
                }
                EventKind::Cwnd => keep(parse_cwnd(line), line_no, &mut rec.cwnd, skipped),
                EventKind::Delivery => {
                    keep(parse_delivery(line), line_no, &mut rec.delivery, skipped)
                }
                EventKind::RtProp => keep(parse_rtprop(line), line_no, &mut rec.rtprop, skipped),
            }
        }
    }

    let mut first_seen: Vec<SessionId> = Vec::new();
    for s in &rec.rtt {
        out.rtt.push(s.session, s.tic, s.rtt);
        out.srtt.push(s.session, s.tic, s.srtt);
        out.max_tic = Some(out.max_tic.map_or(s.tic, |m| m.max(s.tic)));
        if !first_seen.contains(&s.session) {
            first_seen.push(s.session);
        }
    }
    let fallback = first_seen.last().copied().unwrap_or(0);
    let max_tic = out.max_tic;
    let mut discarded = BTreeMap::new();
    let mut in_window = |kind: EventKind, tic: Tic| {
        let inside = max_tic.is_some_and(|m| tic <= m);
        if !inside {
            *discarded.entry(kind).or_insert(0usize) += 1;
        }
        inside
    };

    for e in &rec.loss {
        out.loss_total += u64::from(e.count);
        if in_window(EventKind::Loss, e.tic) {
            out.loss.push(e.session, e.tic, e.count);
        }
    }
    for s in &rec.inflight {
        if in_window(EventKind::Inflight, s.tic) {
            out.inflight.push(s.session, s.tic, s.count);
        }
    }
    for s in &rec.cwnd {
        if in_window(EventKind::Cwnd, s.tic) {
            out.cwnd.push(s.session, s.tic, s.cwnd);
        }
    }
    for s in &rec.delivery {
        if in_window(EventKind::Delivery, s.tic) {
            let session = s.session.unwrap_or(fallback);
            out.delivery_rate.push(session, s.tic, s.rate);
            out.btl_bw.push(session, s.tic, s.btl_bw);
        }
    }
    for s in &rec.rtprop {
        if in_window(EventKind::RtProp, s.tic) {
            out.rtprop.push(s.session.unwrap_or(fallback), s.tic, s.rtprop);
        }
    }
    out.discarded = discarded;

    debug!(
        rtt = out.rtt.total_len(),
        loss = out.loss.total_len(),
        skipped = out.skipped_total(),
        discarded = out.discarded_total(),
        "extraction done"
    );
    out
}
