//! Sampling policies and the reweighting applied to sampled allocations.
//!
//! The allocation hook decides *whether* an allocation is sampled; this module
//! owns the rate and turns each sampled event back into an estimate of the
//! allocations it stands for, so that aggregated totals stay unbiased.

use crate::error::{Error, Result};
use allocprof_hook::SampleMode;
use std::fmt;
use std::str::FromStr;

/// Default byte interval: on average one sample per MiB allocated
pub const DEFAULT_BYTE_RATE: u64 = 1024 * 1024;

/// Default ratio for fixed-ratio sampling: one in 1024 allocations
pub const DEFAULT_FIXED_RATIO: u64 = 1024;

/// Environment variable read by [`SamplingPolicy::from_env`]
pub const SAMPLING_ENV: &str = "ALLOCPROF_SAMPLING";

/// How allocations are selected and reweighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// An allocation of `size` bytes is sampled with probability
    /// `min(1, size / rate)`.
    ByteInterval { rate: u64 },
    /// One in every `ratio` allocations is sampled, regardless of size.
    FixedRatio { ratio: u64 },
}

/// Estimated allocations represented by one sampled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Weight {
    pub count: u64,
    pub bytes: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::ByteInterval {
            rate: DEFAULT_BYTE_RATE,
        }
    }
}

impl SamplingPolicy {
    pub fn byte_interval(rate: u64) -> Self {
        SamplingPolicy::ByteInterval { rate }.normalized()
    }

    pub fn fixed_ratio(ratio: u64) -> Self {
        SamplingPolicy::FixedRatio { ratio }.normalized()
    }

    /// Replace a zero rate with the policy's default
    pub fn normalized(self) -> Self {
        match self {
            SamplingPolicy::ByteInterval { rate: 0 } => SamplingPolicy::ByteInterval {
                rate: DEFAULT_BYTE_RATE,
            },
            SamplingPolicy::FixedRatio { ratio: 0 } => SamplingPolicy::FixedRatio {
                ratio: DEFAULT_FIXED_RATIO,
            },
            policy => policy,
        }
    }

    /// Effective rate (bytes for byte-interval, events for fixed-ratio)
    pub fn rate(&self) -> u64 {
        match self.normalized() {
            SamplingPolicy::ByteInterval { rate } => rate,
            SamplingPolicy::FixedRatio { ratio } => ratio,
        }
    }

    /// The matching selection mode for the allocation hook
    pub fn mode(&self) -> SampleMode {
        match self {
            SamplingPolicy::ByteInterval { .. } => SampleMode::ByteInterval,
            SamplingPolicy::FixedRatio { .. } => SampleMode::FixedRatio,
        }
    }

    /// Estimated (count, bytes) represented by one sampled allocation of `size` bytes.
    pub fn reweight(&self, size: u64) -> Weight {
        match self.normalized() {
            SamplingPolicy::ByteInterval { rate } => {
                if size == 0 {
                    // Never selected by a byte-interval sampler
                    Weight { count: 1, bytes: 0 }
                } else if size < rate {
                    // Sampled with probability size/rate, so it stands for
                    // rate/size similar allocations totalling `rate` bytes
                    Weight {
                        count: rate.saturating_add(size / 2) / size,
                        bytes: rate,
                    }
                } else {
                    Weight {
                        count: 1,
                        bytes: size,
                    }
                }
            }
            SamplingPolicy::FixedRatio { ratio } => Weight {
                count: ratio,
                bytes: size.saturating_mul(ratio),
            },
        }
    }

    /// Read a policy from `ALLOCPROF_SAMPLING`, if set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(SAMPLING_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse().map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingPolicy::ByteInterval { rate } => write!(f, "bytes:{}", rate),
            SamplingPolicy::FixedRatio { ratio } => write!(f, "ratio:{}", ratio),
        }
    }
}

impl FromStr for SamplingPolicy {
    type Err = Error;

    /// Parse `bytes:<N>`, `ratio:<N>` or a bare `<N>` (bytes)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, value) = s.split_once(':').unwrap_or(("bytes", s));
        let value: u64 = value.trim().parse().map_err(|_| {
            Error::InvalidArgument(format!(
                "Invalid sampling rate '{}'. Examples: bytes:1048576, ratio:1024, 524288",
                s
            ))
        })?;

        match kind.trim() {
            "bytes" | "byte" => Ok(SamplingPolicy::byte_interval(value)),
            "ratio" => Ok(SamplingPolicy::fixed_ratio(value)),
            other => Err(Error::InvalidArgument(format!(
                "Unknown sampling policy '{}'. Use 'bytes' or 'ratio'",
                other
            ))),
        }
    }
}
