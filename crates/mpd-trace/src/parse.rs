//! Line parsers for the client log.
//!
//! Each event kind has a fixed marker substring and a parser that is only
//! applied to lines containing it. Tokens are whitespace separated with a
//! trailing `,` dropped; tokens ending in `:` are labels, everything else is
//! a value. Durations are normalized to microseconds: `ms` multiplies by
//! 1000 and `us` is stripped.

use std::fmt;

use thiserror::Error;

pub type SessionId = u64;
pub type Tic = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Rtt,
    Loss,
    Inflight,
    Cwnd,
    Delivery,
    RtProp,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Rtt,
        EventKind::Loss,
        EventKind::Inflight,
        EventKind::Cwnd,
        EventKind::Delivery,
        EventKind::RtProp,
    ];

    pub fn marker(self) -> &'static str {
        match self {
            EventKind::Rtt => "[custom] latest_rtt",
            EventKind::Loss => "losses: valid:",
            EventKind::Inflight => "DetectLoss()] inflight",
            EventKind::Cwnd => "[custom] session_id",
            EventKind::Delivery => "OnDataRecv()] deliveryRate:",
            EventKind::RtProp => "OnDataRecv()] RTprop:",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Rtt => "rtt",
            EventKind::Loss => "loss",
            EventKind::Inflight => "inflight",
            EventKind::Cwnd => "cwnd",
            EventKind::Delivery => "delivery",
            EventKind::RtProp => "rtprop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{kind}: marker not found")]
    MissingMarker { kind: EventKind },
    #[error("{kind}: missing field '{field}'")]
    MissingField {
        kind: EventKind,
        field: &'static str,
    },
    #[error("{kind}: field '{field}' is not a number: '{token}'")]
    InvalidNumber {
        kind: EventKind,
        field: &'static str,
        token: String,
    },
}

impl ParseError {
    pub fn kind(&self) -> EventKind {
        match self {
            ParseError::MissingMarker { kind }
            | ParseError::MissingField { kind, .. }
            | ParseError::InvalidNumber { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub rtt: i64,
    pub srtt: i64,
    pub tic: Tic,
    pub session: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossEvent {
    pub tic: Tic,
    pub session: SessionId,
    /// Occurrences of `seq` after the valid flag.
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightSample {
    pub tic: Tic,
    pub session: SessionId,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CwndSample {
    pub session: SessionId,
    pub tic: Tic,
    pub cwnd: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliverySample {
    pub rate: f64,
    pub btl_bw: f64,
    pub tic: Tic,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtPropSample {
    pub rtprop: f64,
    pub tic: Tic,
    pub session: Option<SessionId>,
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|t| t.trim_end_matches(','))
        .filter(|t| !t.is_empty())
}

fn values(text: &str) -> Vec<&str> {
    tokens(text).filter(|t| !t.ends_with(':')).collect()
}

/// Token following the `label` token.
fn labeled<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let mut it = tokens(text);
    while let Some(t) = it.next() {
        if t == label {
            return it.next();
        }
    }
    None
}

fn after<'a>(line: &'a str, kind: EventKind) -> Result<&'a str, ParseError> {
    let marker = kind.marker();
    line.find(marker)
        .map(|at| &line[at + marker.len()..])
        .ok_or(ParseError::MissingMarker { kind })
}

fn required<'a>(
    kind: EventKind,
    field: &'static str,
    token: Option<&'a str>,
) -> Result<&'a str, ParseError> {
    token.ok_or(ParseError::MissingField { kind, field })
}

fn parse_int(kind: EventKind, field: &'static str, token: &str) -> Result<i64, ParseError> {
    let invalid = || ParseError::InvalidNumber {
        kind,
        field,
        token: token.to_string(),
    };
    if let Some(ms) = token.strip_suffix("ms") {
        return ms
            .parse::<i64>()
            .ok()
            .and_then(|v| v.checked_mul(1000))
            .ok_or_else(invalid);
    }
    token
        .strip_suffix("us")
        .unwrap_or(token)
        .parse()
        .map_err(|_| invalid())
}

fn parse_float(kind: EventKind, field: &'static str, token: &str) -> Result<f64, ParseError> {
    let invalid = || ParseError::InvalidNumber {
        kind,
        field,
        token: token.to_string(),
    };
    if let Some(ms) = token.strip_suffix("ms") {
        return ms.parse::<f64>().map(|v| v * 1000.0).map_err(|_| invalid());
    }
    token
        .strip_suffix("us")
        .unwrap_or(token)
        .parse()
        .map_err(|_| invalid())
}

fn parse_session(kind: EventKind, token: &str) -> Result<SessionId, ParseError> {
    token.parse().map_err(|_| ParseError::InvalidNumber {
        kind,
        field: "session_id",
        token: token.to_string(),
    })
}

fn optional_session(kind: EventKind, text: &str) -> Result<Option<SessionId>, ParseError> {
    labeled(text, "session_id:")
        .map(|t| parse_session(kind, t))
        .transpose()
}

fn count_seq(text: &str) -> u32 {
    text.matches("seq").count() as u32
}

/// `[custom] latest_rtt <rtt> <srtt> <recv tic> <session>`, labels allowed.
pub fn parse_rtt(line: &str) -> Result<RttSample, ParseError> {
    let kind = EventKind::Rtt;
    let v = values(after(line, kind)?);
    Ok(RttSample {
        rtt: parse_int(kind, "rtt", required(kind, "rtt", v.first().copied())?)?,
        srtt: parse_int(kind, "srtt", required(kind, "srtt", v.get(1).copied())?)?,
        tic: parse_int(kind, "recv_tic", required(kind, "recv_tic", v.get(2).copied())?)?,
        session: parse_session(kind, required(kind, "session_id", v.get(3).copied())?)?,
    })
}

/// `losses: valid: <flag> ... losttic: <tic> ... session_id: <id> seq ...`
pub fn parse_loss(line: &str) -> Result<LossEvent, ParseError> {
    let kind = EventKind::Loss;
    let rest = after(line, kind)?.trim_start();
    let flag_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let body = &rest[flag_end..];

    let tic = required(kind, "losttic", labeled(body, "losttic:"))?;
    let session = required(kind, "session_id", labeled(body, "session_id:"))?;
    Ok(LossEvent {
        tic: parse_int(kind, "losttic", tic)?,
        session: parse_session(kind, session)?,
        count: count_seq(body),
    })
}

/// `DetectLoss()] inflight: seq ... eventtime: <tic> ... session_id: <id>`
pub fn parse_inflight(line: &str) -> Result<InflightSample, ParseError> {
    let kind = EventKind::Inflight;
    let rest = after(line, kind)?;
    let listed = rest.strip_prefix(':').unwrap_or(rest);
    let end = listed
        .find("eventtime")
        .ok_or(ParseError::MissingField {
            kind,
            field: "eventtime",
        })?;

    let tic = required(kind, "eventtime", labeled(&listed[end..], "eventtime:"))?;
    let session = required(kind, "session_id", labeled(rest, "session_id:"))?;
    Ok(InflightSample {
        tic: parse_int(kind, "eventtime", tic)?,
        session: parse_session(kind, session)?,
        count: count_seq(&listed[..end]),
    })
}

/// `[custom] session_id ...`; the last three values are session, send tic
/// and cwnd.
pub fn parse_cwnd(line: &str) -> Result<CwndSample, ParseError> {
    let kind = EventKind::Cwnd;
    let marker_at = line.find(kind.marker()).ok_or(ParseError::MissingMarker { kind })?;
    let text = &line[marker_at + "[custom] ".len()..];
    let v = values(text);
    let [session, tic, cwnd] = v.len().checked_sub(3).map(|at| [v[at], v[at + 1], v[at + 2]]).ok_or(
        ParseError::MissingField {
            kind,
            field: "cwnd",
        },
    )?;
    Ok(CwndSample {
        session: parse_session(kind, session)?,
        tic: parse_int(kind, "send_tic", tic)?,
        cwnd: parse_int(kind, "cwnd", cwnd)?,
    })
}

/// `OnDataRecv()] deliveryRate: <rate> btlBw: <bw> <label> <recv tic>`
pub fn parse_delivery(line: &str) -> Result<DeliverySample, ParseError> {
    let kind = EventKind::Delivery;
    let rest = after(line, kind)?;
    let v = values(rest);
    Ok(DeliverySample {
        rate: parse_float(kind, "deliveryRate", required(kind, "deliveryRate", v.first().copied())?)?,
        btl_bw: parse_float(kind, "btlBw", required(kind, "btlBw", v.get(1).copied())?)?,
        tic: parse_int(kind, "recv_tic", required(kind, "recv_tic", v.get(2).copied())?)?,
        session: optional_session(kind, rest)?,
    })
}

/// `OnDataRecv()] RTprop: <rtprop> <label> <recv tic>`
pub fn parse_rtprop(line: &str) -> Result<RtPropSample, ParseError> {
    let kind = EventKind::RtProp;
    let rest = after(line, kind)?;
    let v = values(rest);
    Ok(RtPropSample {
        rtprop: parse_float(kind, "RTprop", required(kind, "RTprop", v.first().copied())?)?,
        tic: parse_int(kind, "recv_tic", required(kind, "recv_tic", v.get(1).copied())?)?,
        session: optional_session(kind, rest)?,
    })
}
