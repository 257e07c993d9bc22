use std::fmt;

use crate::extract::Extraction;
use crate::parse::{SessionId, Tic};

#[derive(Debug, Clone, PartialEq)]
pub struct RttStats {
    pub session: SessionId,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub first_tic: Tic,
    pub last_tic: Tic,
}

impl RttStats {
    pub fn tic_span(&self) -> Tic {
        self.last_tic - self.first_tic
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryStats {
    pub session: SessionId,
    pub max_btl_bw: f64,
    pub mean_rate: f64,
    /// Mean rate from the first sample above `mean_rate` onwards.
    pub ramped_mean_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub max_tic: Option<Tic>,
    pub rtt: Vec<RttStats>,
    pub loss_total: u64,
    pub delivery: Vec<DeliveryStats>,
    pub skipped: usize,
    pub discarded: usize,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

impl Summary {
    pub fn new(x: &Extraction) -> Self {
        let rtt = x
            .rtt
            .iter()
            .filter_map(|(session, series)| {
                let (first_tic, last_tic) = series.tic_range()?;
                let values: Vec<f64> = series.values.iter().map(|&v| v as f64).collect();
                Some(RttStats {
                    session,
                    min: series.values.iter().copied().min()?,
                    max: series.values.iter().copied().max()?,
                    mean: mean(&values)?,
                    first_tic,
                    last_tic,
                })
            })
            .collect();

        let delivery = x
            .delivery_rate
            .iter()
            .filter_map(|(session, rates)| {
                let mean_rate = mean(&rates.values)?;
                let ramped_mean_rate = rates
                    .values
                    .iter()
                    .position(|&r| r > mean_rate)
                    .and_then(|at| mean(&rates.values[at..]));
                let max_btl_bw = x
                    .btl_bw
                    .get(session)
                    .map(|s| s.values.iter().copied().fold(f64::MIN, f64::max))?;
                Some(DeliveryStats {
                    session,
                    max_btl_bw,
                    mean_rate,
                    ramped_mean_rate,
                })
            })
            .collect();

        Self {
            max_tic: x.max_tic,
            rtt,
            loss_total: x.loss_total,
            delivery,
            skipped: x.skipped_total(),
            discarded: x.discarded_total(),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_tic {
            Some(tic) => writeln!(f, "window end: {tic}")?,
            None => writeln!(f, "window end: none (no rtt samples)")?,
        }
        for r in &self.rtt {
            writeln!(
                f,
                "session {}: rtt min {} max {} mean {:.1} over {} tics ({}..{})",
                r.session,
                r.min,
                r.max,
                r.mean,
                r.tic_span(),
                r.first_tic,
                r.last_tic
            )?;
        }
        writeln!(f, "loss total: {}", self.loss_total)?;
        for d in &self.delivery {
            write!(
                f,
                "session {}: btlBw max {:.3} delivery rate mean {:.3}",
                d.session, d.max_btl_bw, d.mean_rate
            )?;
            match d.ramped_mean_rate {
                Some(m) => writeln!(f, " after ramp {m:.3}")?,
                None => writeln!(f)?,
            }
        }
        write!(
            f,
            "skipped {} malformed lines, discarded {} records past window end",
            self.skipped, self.discarded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;

    #[test]
    fn rtt_stats_per_session() {
        let x = extract(
            "[custom] latest_rtt 100 50 2000 1\n\
             [custom] latest_rtt 120 55 2500 1\n\
             [custom] latest_rtt 300 60 2200 2\n",
        );
        let s = Summary::new(&x);
        assert_eq!(s.max_tic, Some(2500));
        assert_eq!(s.rtt.len(), 2);
        let one = &s.rtt[0];
        assert_eq!((one.session, one.min, one.max), (1, 100, 120));
        assert_eq!(one.mean, 110.0);
        assert_eq!(one.tic_span(), 500);
        assert_eq!(s.rtt[1].tic_span(), 0);
    }

    #[test]
    fn delivery_ramp_mean_starts_above_mean() {
        let x = extract(
            "[custom] latest_rtt 1 1 100 1\n\
             OnDataRecv()] deliveryRate: 1 btlBw: 2 recv_tic: 10\n\
             OnDataRecv()] deliveryRate: 2 btlBw: 5 recv_tic: 20\n\
             OnDataRecv()] deliveryRate: 6 btlBw: 4 recv_tic: 30\n\
             OnDataRecv()] deliveryRate: 3 btlBw: 3 recv_tic: 40\n",
        );
        let s = Summary::new(&x);
        let d = &s.delivery[0];
        assert_eq!(d.session, 1);
        assert_eq!(d.max_btl_bw, 5.0);
        assert_eq!(d.mean_rate, 3.0);
        // first sample above 3.0 is the 6
        assert_eq!(d.ramped_mean_rate, Some(4.5));
    }

    #[test]
    fn flat_rates_have_no_ramp() {
        let x = extract(
            "[custom] latest_rtt 1 1 100 1\n\
             OnDataRecv()] deliveryRate: 2 btlBw: 2 recv_tic: 10\n\
             OnDataRecv()] deliveryRate: 2 btlBw: 2 recv_tic: 20\n",
        );
        assert_eq!(Summary::new(&x).delivery[0].ramped_mean_rate, None);
    }

    #[test]
    fn display_mentions_every_section() {
        let x = extract(
            "[custom] latest_rtt 100 50 3000 1\n\
             losses: valid: 0 ... losttic: 3000 ... session_id: 1 seq seq\n",
        );
        let text = Summary::new(&x).to_string();
        assert!(text.contains("window end: 3000"), "{text}");
        assert!(text.contains("session 1: rtt min 100 max 100"), "{text}");
        assert!(text.contains("loss total: 2"), "{text}");
    }
}
