//! Sampling profiler for native allocations.
//!
//! Install the allocation hook with [`allocprof_hook::profiler!`], then wrap
//! the interesting part of the program in a [`Profile`] session. Sampled
//! allocations are merged per call stack, reweighted into estimated totals
//! and written out as a gzipped pprof profile on [`Profile::stop`].

pub mod aggregate;
pub mod cli;
pub mod collector;
pub mod commands;
pub mod error;
pub mod pprof;
pub mod sampling;
pub mod source;
pub mod symbols;

pub use aggregate::{StackAggregator, stack_hash};
pub use collector::{Profile, State, Stats};
pub use error::{Error, Result};
pub use sampling::SamplingPolicy;
pub use source::{HookSource, SampleSource};

pub use allocprof_hook::{ProfilingAllocator, profiler};
