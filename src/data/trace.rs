use std::fmt;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Serialize, Deserialize};

/// Identifies one channel of a chromatographic trace.
///
/// # Description
///
/// A channel is either a single recorded ion beam, labeled by its m/z value,
/// or the combined `Total` channel. Ions sort before `Total`, so the first
/// key of a channel map is always the leading ion when one exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelId {
    Ion(OrderedFloat<f64>),
    Total,
}

impl ChannelId {
    /// Constructs an ion channel from a plain m/z value.
    pub fn ion(mz: f64) -> ChannelId {
        ChannelId::Ion(OrderedFloat(mz))
    }

    /// Returns the m/z label of an ion channel, `None` for the total channel.
    pub fn mz(&self) -> Option<f64> {
        match self {
            ChannelId::Ion(mz) => Some(mz.into_inner()),
            ChannelId::Total => None,
        }
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Ion(mz) => write!(f, "{}", mz),
            ChannelId::Total => write!(f, "TIC"),
        }
    }
}

// Manual bincode implementation, OrderedFloat carries no bincode support
impl Encode for ChannelId {
    fn encode<E: bincode::enc::Encoder>(&self, encoder: &mut E) -> Result<(), bincode::error::EncodeError> {
        match self {
            ChannelId::Ion(mz) => {
                bincode::Encode::encode(&0u8, encoder)?;
                bincode::Encode::encode(&mz.into_inner(), encoder)
            }
            ChannelId::Total => bincode::Encode::encode(&1u8, encoder),
        }
    }
}

impl<Context> Decode<Context> for ChannelId {
    fn decode<D: bincode::de::Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let tag: u8 = bincode::Decode::decode(decoder)?;
        match tag {
            0 => {
                let mz: f64 = bincode::Decode::decode(decoder)?;
                Ok(ChannelId::ion(mz))
            }
            1 => Ok(ChannelId::Total),
            other => Err(bincode::error::DecodeError::OtherString(format!("invalid channel tag {}", other))),
        }
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for ChannelId {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(decoder: &mut D) -> Result<Self, bincode::error::DecodeError> {
        let tag: u8 = bincode::BorrowDecode::borrow_decode(decoder)?;
        match tag {
            0 => {
                let mz: f64 = bincode::BorrowDecode::borrow_decode(decoder)?;
                Ok(ChannelId::ion(mz))
            }
            1 => Ok(ChannelId::Total),
            other => Err(bincode::error::DecodeError::OtherString(format!("invalid channel tag {}", other))),
        }
    }
}

/// A time-indexed, possibly ion-resolved chromatographic signal.
///
/// # Description
///
/// `times` is strictly increasing and every channel holds exactly one
/// intensity per timestamp. Traces are immutable values; slicing returns a
/// new `Trace` restricted to the requested window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Trace {
    pub times: Vec<f64>,
    pub channels: BTreeMap<ChannelId, Vec<f64>>,
}

impl Trace {
    /// Constructs a new `Trace`.
    ///
    /// # Arguments
    ///
    /// * `times` - A vector of timestamps in seconds, strictly increasing.
    /// * `channels` - A mapping from channel identifier to intensity values,
    ///   each the same length as `times`.
    pub fn new(times: Vec<f64>, channels: BTreeMap<ChannelId, Vec<f64>>) -> Self {
        debug_assert!(channels.values().all(|data| data.len() == times.len()));
        Trace { times, channels }
    }

    /// Constructs a trace with a single channel.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chromcore::data::trace::{ChannelId, Trace};
    /// let trace = Trace::single(ChannelId::ion(44.0), vec![0.0, 1.0], vec![10.0, 20.0]);
    /// assert_eq!(trace.len(), 2);
    /// ```
    pub fn single(channel: ChannelId, times: Vec<f64>, data: Vec<f64>) -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(channel, data);
        Trace::new(times, channels)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// The covered time range, `None` for an empty trace.
    pub fn span(&self) -> Option<(f64, f64)> {
        match (self.times.first(), self.times.last()) {
            (Some(&first), Some(&last)) => Some((first, last)),
            _ => None,
        }
    }

    /// Intensity values of one channel.
    pub fn channel(&self, id: &ChannelId) -> Option<&[f64]> {
        self.channels.get(id).map(|data| data.as_slice())
    }

    /// The first channel in label order, ions before the total channel.
    pub fn leading_channel(&self) -> Option<&ChannelId> {
        self.channels.keys().next()
    }

    /// Restricts the trace to the closed time window `[t0, t1]`.
    ///
    /// An inverted window slices to an empty trace.
    pub fn slice(&self, t0: f64, t1: f64) -> Trace {
        let lo = self.times.partition_point(|&t| t < t0);
        let hi = self.times.partition_point(|&t| t <= t1).max(lo);

        let times = self.times[lo..hi].to_vec();
        let channels = self.channels.iter()
            .map(|(id, data)| (*id, data[lo..hi].to_vec()))
            .collect();
        Trace { times, channels }
    }

    /// The combined intensity across all channels.
    ///
    /// A stored `Total` channel takes precedence; otherwise the channels are
    /// summed element-wise.
    pub fn total_intensity(&self) -> Vec<f64> {
        if let Some(total) = self.channels.get(&ChannelId::Total) {
            return total.clone();
        }
        let mut total = vec![0.0; self.len()];
        for data in self.channels.values() {
            for (acc, value) in total.iter_mut().zip(data.iter()) {
                *acc += value;
            }
        }
        total
    }

    /// Reduces the trace to a single combined channel.
    ///
    /// A trace that already has exactly one channel is returned as-is, so a
    /// single-ion trace keeps its ion identity through integration.
    pub fn combined(&self) -> Trace {
        if self.channels.len() == 1 {
            return self.clone();
        }
        Trace::single(ChannelId::Total, self.times.clone(), self.total_intensity())
    }

    /// Closes the trace with explicit trapezoid anchor samples at both ends.
    pub fn with_baseline_endpoints(&self, t0: f64, y0: f64, t1: f64, y1: f64) -> Trace {
        let mut times = Vec::with_capacity(self.len() + 2);
        times.push(t0);
        times.extend_from_slice(&self.times);
        times.push(t1);

        let channels = self.channels.iter()
            .map(|(id, data)| {
                let mut closed = Vec::with_capacity(data.len() + 2);
                closed.push(y0);
                closed.extend_from_slice(data);
                closed.push(y1);
                (*id, closed)
            })
            .collect();
        Trace { times, channels }
    }

    /// Trapezoidal area under one channel.
    ///
    /// A lone sample is treated as a stick intensity.
    pub fn area(&self, id: &ChannelId) -> Option<f64> {
        let data = self.channels.get(id)?;
        match data.len() {
            0 => Some(0.0),
            1 => Some(data[0]),
            _ => {
                let mut acc = 0.0;
                for i in 1..data.len() {
                    acc += 0.5 * (data[i] + data[i - 1]) * (self.times[i] - self.times[i - 1]);
                }
                Some(acc)
            }
        }
    }

    /// Time of the highest combined-signal sample.
    pub fn apex_time(&self) -> Option<f64> {
        let total = self.total_intensity();
        let index = total.iter().position_max_by_key(|value| OrderedFloat(**value))?;
        self.times.get(index).copied()
    }
}

/// Formats the `Trace` for display.
impl Display for Trace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.span() {
            Some((first, last)) => write!(
                f,
                "Trace(points: {}, channels: {}, span: {:.2}-{:.2})",
                self.len(),
                self.channels.len(),
                first,
                last
            ),
            None => write!(f, "Trace(empty, channels: {})", self.channels.len()),
        }
    }
}
