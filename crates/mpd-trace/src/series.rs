use std::collections::BTreeMap;

use crate::parse::{SessionId, Tic};

/// Sample values that can be plotted.
pub trait Numeric: Copy {
    fn to_f64(self) -> f64;
}

impl Numeric for i64 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Numeric for u32 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Numeric for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

/// Values with a parallel vector of tics, in log order.
#[derive(Debug, Clone, PartialEq)]
pub struct Series<T> {
    pub tics: Vec<Tic>,
    pub values: Vec<T>,
}

impl<T> Default for Series<T> {
    fn default() -> Self {
        Self {
            tics: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T: Copy> Series<T> {
    pub fn push(&mut self, tic: Tic, value: T) {
        self.tics.push(tic);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = (Tic, T)> + '_ {
        self.tics.iter().copied().zip(self.values.iter().copied())
    }

    pub fn tic_range(&self) -> Option<(Tic, Tic)> {
        let min = self.tics.iter().copied().min()?;
        let max = self.tics.iter().copied().max()?;
        Some((min, max))
    }
}

/// One [`Series`] per session, iterated in session order.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSeries<T>(BTreeMap<SessionId, Series<T>>);

impl<T> Default for SessionSeries<T> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<T: Copy> SessionSeries<T> {
    pub fn push(&mut self, session: SessionId, tic: Tic, value: T) {
        self.0.entry(session).or_default().push(tic, value);
    }

    pub fn get(&self, session: SessionId) -> Option<&Series<T>> {
        self.0.get(&session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &Series<T>)> {
        self.0.iter().map(|(s, series)| (*s, series))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Samples across all sessions.
    pub fn total_len(&self) -> usize {
        self.0.values().map(Series::len).sum()
    }

    /// Overall tic range across sessions.
    pub fn tic_range(&self) -> Option<(Tic, Tic)> {
        self.0
            .values()
            .filter_map(Series::tic_range)
            .reduce(|(a0, a1), (b0, b1)| (a0.min(b0), a1.max(b1)))
    }
}

impl<T: Numeric> SessionSeries<T> {
    /// Overall value range across sessions, as `f64`.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.0
            .values()
            .flat_map(|s| s.values.iter().map(|v| v.to_f64()))
            .fold(None, |acc: Option<(f64, f64)>, v: f64| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}
