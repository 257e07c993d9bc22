use serde::Deserialize;

/// Delay used on both halves of a shaped link when the record leaves it unset.
pub const DEFAULT_DELAY_MS: u32 = 2;

/// Egress shaping for one interface, realized as a single `tc netem` qdisc.
///
/// `None` fields are not passed to `tc`. An all-`None` value leaves the
/// interface unshaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntfParams {
    pub bw_mbit: Option<f64>,
    pub delay_ms: Option<u32>,
    pub loss_percent: Option<f32>,
    /// netem queue `limit`, in packets.
    pub max_queue_size: Option<u32>,
}

impl IntfParams {
    pub fn is_empty(&self) -> bool {
        self.bw_mbit.is_none()
            && self.delay_ms.is_none()
            && self.loss_percent.is_none()
            && self.max_queue_size.is_none()
    }

    pub fn bandwidth(bw_mbit: f64) -> Self {
        Self {
            bw_mbit: Some(bw_mbit),
            ..Default::default()
        }
    }

    pub fn with_bandwidth(mut self, bw_mbit: f64) -> Self {
        self.bw_mbit = Some(bw_mbit);
        self
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

/// Option record for one shaped logical link.
///
/// `loss1` applies in the `a -> b` direction, `loss2` in the `b -> a`
/// direction. Values are not validated; whatever is set reaches `tc`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkOptions {
    pub bw_mbit: Option<f64>,
    pub delay_ms: Option<u32>,
    pub loss1: Option<f32>,
    pub loss2: Option<f32>,
    pub max_queue_size: Option<u32>,
}

impl LinkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bw(mut self, mbit: f64) -> Self {
        self.bw_mbit = Some(mbit);
        self
    }

    pub fn delay(mut self, ms: u32) -> Self {
        self.delay_ms = Some(ms);
        self
    }

    /// Sets both directions' loss.
    pub fn loss(mut self, loss1: f32, loss2: f32) -> Self {
        self.loss1 = Some(loss1);
        self.loss2 = Some(loss2);
        self
    }

    pub fn queue(mut self, packets: u32) -> Self {
        self.max_queue_size = Some(packets);
        self
    }

    pub fn effective_delay_ms(&self) -> u32 {
        self.delay_ms.unwrap_or(DEFAULT_DELAY_MS)
    }

    /// Fields set in `other` replace the ones in `self`.
    pub fn merged(&self, other: &LinkOptions) -> LinkOptions {
        LinkOptions {
            bw_mbit: other.bw_mbit.or(self.bw_mbit),
            delay_ms: other.delay_ms.or(self.delay_ms),
            loss1: other.loss1.or(self.loss1),
            loss2: other.loss2.or(self.loss2),
            max_queue_size: other.max_queue_size.or(self.max_queue_size),
        }
    }

    /// Shaping for the four interfaces of `a -- bridge -- b`, in order:
    /// `a` side, bridge side towards `a`, bridge side towards `b`, `b` side.
    ///
    /// Bandwidth is enforced where traffic enters the bridge; delay, loss and
    /// queue limit where it leaves, so each direction carries its own loss.
    pub fn split(&self) -> [IntfParams; 4] {
        let delay = Some(self.effective_delay_ms());
        let ingress = IntfParams {
            bw_mbit: self.bw_mbit,
            ..Default::default()
        };
        let towards_a = IntfParams {
            delay_ms: delay,
            loss_percent: self.loss2,
            max_queue_size: self.max_queue_size,
            ..Default::default()
        };
        let towards_b = IntfParams {
            delay_ms: delay,
            loss_percent: self.loss1,
            max_queue_size: self.max_queue_size,
            ..Default::default()
        };
        [ingress.clone(), towards_a, towards_b, ingress]
    }
}
