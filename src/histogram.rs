//! Per-channel histograms of photon times.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::photon::{Channel, HistogramBin};
use crate::ConfigError;

/// Spacing of the bin edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scale {
    Linear,
    /// Logarithmic spacing, values at or below zero are dropped
    Log,
    /// Logarithmic spacing, but zero is counted in the first bin
    LogZero,
}

impl Default for Scale {
    fn default() -> Self {
        Scale::Linear
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scale::Linear => "linear",
            Scale::Log => "log",
            Scale::LogZero => "log-zero",
        };
        f.write_str(name)
    }
}

impl FromStr for Scale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Scale::Linear),
            "log" => Ok(Scale::Log),
            "log-zero" | "log_zero" => Ok(Scale::LogZero),
            other => Err(format!("Unknown histogram scale {:?}", other)),
        }
    }
}

/// Bin edges spanning `[lower, upper)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Edges {
    scale: Scale,
    lower: f64,
    upper: f64,
    edges: Vec<f64>,
}

impl Edges {
    pub fn new(scale: Scale, lower: f64, upper: f64, bins: usize) -> Result<Self, ConfigError> {
        if bins == 0 {
            return Err(ConfigError::NoBins);
        }
        if lower.partial_cmp(&upper) != Some(std::cmp::Ordering::Less) {
            return Err(ConfigError::InvalidLimits { lower, upper });
        }
        if scale != Scale::Linear && lower <= 0.0 {
            return Err(ConfigError::NonPositiveLogLimit(lower));
        }

        let edges = (0..=bins)
            .map(|i| {
                let fraction = i as f64 / bins as f64;
                match scale {
                    Scale::Linear => lower + (upper - lower) * fraction,
                    Scale::Log | Scale::LogZero => {
                        (lower.ln() + (upper.ln() - lower.ln()) * fraction).exp()
                    }
                }
            })
            .collect();
        Ok(Edges {
            scale,
            lower,
            upper,
            edges,
        })
    }

    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn scale(&self) -> Scale {
        self.scale
    }

    /// Left and right edge of bin `i`.
    pub fn bounds(&self, i: usize) -> (f64, f64) {
        (self.edges[i], self.edges[i + 1])
    }

    /// The bin `value` falls into, if any.
    pub fn index(&self, value: f64) -> Option<usize> {
        let position = match self.scale {
            Scale::Linear => (value - self.lower) / (self.upper - self.lower),
            Scale::LogZero if value == 0.0 => return Some(0),
            Scale::Log | Scale::LogZero => {
                if value <= 0.0 {
                    return None;
                }
                (value.ln() - self.lower.ln()) / (self.upper.ln() - self.lower.ln())
            }
        };
        let index = (position * self.bins() as f64).floor();
        if index >= 0.0 && index < self.bins() as f64 {
            Some(index as usize)
        } else {
            None
        }
    }
}

/// Counts per channel and bin.
#[derive(Clone, Debug)]
pub struct Histogram {
    edges: Edges,
    counts: Vec<Vec<u64>>,
    /// Values outside the edges or on channels without a histogram
    dropped: u64,
}

impl Histogram {
    pub fn new(edges: Edges, channels: usize) -> Self {
        let counts = vec![vec![0; edges.bins()]; channels];
        Histogram {
            edges,
            counts,
            dropped: 0,
        }
    }

    /// Counts `value` on `channel`. Returns whether it landed in a bin.
    pub fn add(&mut self, channel: Channel, value: f64) -> bool {
        let bin = self.edges.index(value);
        match (self.counts.get_mut(channel as usize), bin) {
            (Some(counts), Some(bin)) => {
                counts[bin] += 1;
                true
            }
            _ => {
                self.dropped += 1;
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn channels(&self) -> usize {
        self.counts.len()
    }

    /// All bins, channel after channel.
    pub fn bins(&self) -> impl Iterator<Item = HistogramBin> + '_ {
        self.counts.iter().enumerate().flat_map(move |(channel, counts)| {
            counts.iter().enumerate().map(move |(i, &count)| {
                let (left, right) = self.edges.bounds(i);
                HistogramBin {
                    curve: channel as u32,
                    left,
                    right,
                    counts: count,
                }
            })
        })
    }
}
