//! Client log analysis for the MPD transport.
//!
//! [`extract`] turns the client's stdout into per-session time series
//! (RTT, loss, in-flight, cwnd, delivery rate, RTprop) bounded by the last
//! RTT sample. [`Summary`] reduces them to a few figures and
//! [`plot::render_all`] draws them as SVG charts.

pub mod extract;
pub mod parse;
pub mod plot;
pub mod series;
pub mod summary;

pub use extract::{extract, Extraction};
pub use parse::{EventKind, ParseError, SessionId, Tic};
pub use series::{Series, SessionSeries};
pub use summary::Summary;
