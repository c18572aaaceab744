//! Profiling session: lifecycle state machine and background collector.

use crate::aggregate::{MAX_STACK_DEPTH, StackAggregator};
use crate::error::{Error, Result};
use crate::pprof::{SessionInfo, build_profile, write_profile};
use crate::sampling::SamplingPolicy;
use crate::source::{HookSource, SampleSource};
use crate::symbols;
use chrono::Utc;
use log::{debug, warn};
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopping,
}

impl State {
    fn from_raw(raw: u8) -> Self {
        match raw {
            RUNNING => State::Running,
            STOPPING => State::Stopping,
            _ => State::Idle,
        }
    }
}

/// Counters of the running session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Sampled events collected so far
    pub samples: u64,
    /// Distinct stacks among them
    pub stacks: usize,
}

struct Session {
    aggregator: Arc<Mutex<StackAggregator>>,
    done: Receiver<Result<()>>,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An allocation profiling session.
///
/// `start` launches a collector thread that drains sampled allocations from
/// the source into a [`StackAggregator`]. `stop` ends collection, builds the
/// pprof profile and writes it to the sink given to `start`.
///
/// ```no_run
/// use allocprof::Profile;
///
/// let profile = Profile::new();
/// profile.start(std::fs::File::create("heap.pb.gz")?)?;
/// // ... run the workload ...
/// profile.stop()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Profile<S: SampleSource = HookSource> {
    policy: SamplingPolicy,
    source: Arc<S>,
    state: AtomicU8,
    session: Mutex<Option<Session>>,
}

impl Profile<HookSource> {
    /// Session over the process-wide allocation hook, with the sampling
    /// policy from `ALLOCPROF_SAMPLING` or the default.
    pub fn new() -> Self {
        let policy = match SamplingPolicy::from_env() {
            Ok(policy) => policy.unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring {}: {}", crate::sampling::SAMPLING_ENV, e);
                SamplingPolicy::default()
            }
        };
        Self::with_policy(policy)
    }

    pub fn with_policy(policy: SamplingPolicy) -> Self {
        Self::with_source(policy, Arc::new(HookSource))
    }
}

impl Default for Profile<HookSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SampleSource> Profile<S> {
    pub fn with_source(policy: SamplingPolicy, source: Arc<S>) -> Self {
        Profile {
            policy: policy.normalized(),
            source,
            state: AtomicU8::new(IDLE),
            session: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    pub fn state(&self) -> State {
        State::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Counters of the current session, `None` when idle
    pub fn stats(&self) -> Option<Stats> {
        let session = lock(&self.session);
        let aggregator = lock(&session.as_ref()?.aggregator);
        Some(Stats {
            samples: aggregator.samples(),
            stacks: aggregator.len(),
        })
    }

    /// Begin collecting. The profile is written to `sink` on [`stop`].
    ///
    /// Does nothing (and drops `sink`) if a session is already running. Fails
    /// with [`Error::Stopping`] while a `stop` is still writing the previous
    /// profile, leaving the caller free to retry once it returns.
    ///
    /// [`stop`]: Profile::stop
    pub fn start<W: Write + Send + 'static>(&self, sink: W) -> Result<()> {
        // Held across the transition so `stop` sees the session once it sees Running
        let mut session = lock(&self.session);
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(STOPPING) => return Err(Error::Stopping),
            Err(_) => {
                debug!("Profiling already started");
                return Ok(());
            }
        }

        let aggregator = Arc::new(Mutex::new(StackAggregator::new(self.policy)));
        let (tx, done) = sync_channel(1);

        self.source.configure(self.policy);
        self.source.start();
        debug!("Profiling started ({})", self.policy);

        let collector = Collector {
            source: Arc::clone(&self.source),
            aggregator: Arc::clone(&aggregator),
            sink,
        };
        let spawned = thread::Builder::new()
            .name("allocprof-collector".to_string())
            .spawn(move || {
                allocprof_hook::ignore_current_thread();
                // Receiver only goes away if `stop` itself panicked
                let _ = tx.send(collector.run());
            });

        match spawned {
            Ok(handle) => {
                *session = Some(Session {
                    aggregator,
                    done,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                self.source.stop();
                self.state.store(IDLE, Ordering::Release);
                Err(Error::Thread(format!("failed to spawn collector: {}", e)))
            }
        }
    }

    /// End the session, then build, validate and write the profile.
    ///
    /// Blocks until the profile is written. Fails with [`Error::NotRunning`]
    /// when no session is running; the session is back to idle afterwards
    /// in every other case.
    pub fn stop(&self) -> Result<()> {
        self.state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::NotRunning)?;

        let session = lock(&self.session).take();
        self.source.stop();

        let result = match session {
            Some(session) => {
                let result = session
                    .done
                    .recv()
                    .unwrap_or_else(|_| Err(Error::Thread("collector exited without a result".into())));
                if session.handle.join().is_err() {
                    warn!("Collector thread panicked");
                }
                result
            }
            None => Err(Error::Thread("no collector for the running session".into())),
        };

        self.state.store(IDLE, Ordering::Release);
        debug!("Profiling stopped");
        result
    }
}

impl<S: SampleSource> Drop for Profile<S> {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("Profile dropped while running: {}", e);
            }
        }
    }
}

/// Background half of a session
struct Collector<S, W> {
    source: Arc<S>,
    aggregator: Arc<Mutex<StackAggregator>>,
    sink: W,
}

impl<S: SampleSource, W: Write> Collector<S, W> {
    fn run(mut self) -> Result<()> {
        let started = Utc::now();
        let clock = Instant::now();
        let mut stack = [0u64; MAX_STACK_DEPTH];

        while let Some(sample) = self.source.next_sample(&mut stack) {
            let depth = sample.depth.min(MAX_STACK_DEPTH);
            lock(&self.aggregator).insert(&stack[..depth], sample.size as u64);
        }

        let session = SessionInfo {
            started,
            duration: clock.elapsed(),
            dropped: self.source.dropped(),
        };
        if session.dropped > 0 {
            warn!("{} samples dropped, collector fell behind", session.dropped);
        }

        let aggregator = lock(&self.aggregator);
        debug!(
            "Collected {} samples over {} stacks in {:?}",
            aggregator.samples(),
            aggregator.len(),
            session.duration
        );
        let profile = build_profile(&aggregator, symbols::global(), &session);
        drop(aggregator);

        write_profile(&profile, &mut self.sink)
    }
}
