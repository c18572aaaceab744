//! Where sampled allocation events come from.

use crate::sampling::SamplingPolicy;
use allocprof_hook::{GLOBAL_BUFFER, SampleBuffer};

pub use allocprof_hook::RawSample;

/// Producer side of a profiling session.
///
/// `next_sample` blocks until an event is available. It returns `None` once
/// the source has been stopped and has nothing left to hand out, which ends
/// the collector loop.
pub trait SampleSource: Send + Sync + 'static {
    /// Apply the session's sampling policy
    fn configure(&self, policy: SamplingPolicy);

    /// Begin producing samples
    fn start(&self);

    /// Stop producing samples and wake any blocked reader
    fn stop(&self);

    /// Copy the next sampled stack into `stack`
    fn next_sample(&self, stack: &mut [u64]) -> Option<RawSample>;

    /// Samples lost because the consumer fell behind
    fn dropped(&self) -> u64 {
        0
    }
}

/// The process-wide allocation hook installed with `allocprof_hook::profiler!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HookSource;

impl SampleSource for HookSource {
    fn configure(&self, policy: SamplingPolicy) {
        let policy = policy.normalized();
        allocprof_hook::set_sampling(policy.mode(), policy.rate());
    }

    fn start(&self) {
        GLOBAL_BUFFER.start();
    }

    fn stop(&self) {
        allocprof_hook::disable_sampling();
        GLOBAL_BUFFER.stop();
    }

    fn next_sample(&self, stack: &mut [u64]) -> Option<RawSample> {
        GLOBAL_BUFFER.pop(stack)
    }

    fn dropped(&self) -> u64 {
        GLOBAL_BUFFER.dropped()
    }
}

/// A standalone buffer is a source too: whoever owns it pushes samples and
/// the sampling policy only affects reweighting.
impl SampleSource for SampleBuffer {
    fn configure(&self, _policy: SamplingPolicy) {}

    fn start(&self) {
        SampleBuffer::start(self);
    }

    fn stop(&self) {
        SampleBuffer::stop(self);
    }

    fn next_sample(&self, stack: &mut [u64]) -> Option<RawSample> {
        self.pop(stack)
    }

    fn dropped(&self) -> u64 {
        SampleBuffer::dropped(self)
    }
}
