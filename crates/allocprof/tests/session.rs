use allocprof::pprof::{self, SAMPLE_TYPES};
use allocprof::{Error, Profile, SamplingPolicy, State};
use allocprof_hook::SampleBuffer;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn session(policy: SamplingPolicy) -> (Profile<SampleBuffer>, Arc<SampleBuffer>) {
    let buffer = Arc::new(SampleBuffer::new());
    (Profile::with_source(policy, Arc::clone(&buffer)), buffer)
}

fn read_back(path: &std::path::Path) -> pprof::proto::Profile {
    pprof::read_profile(File::open(path).unwrap()).unwrap()
}

fn column_names(profile: &pprof::proto::Profile) -> Vec<(String, String)> {
    profile
        .sample_type
        .iter()
        .map(|vt| {
            (
                profile.string_table[vt.r#type as usize].clone(),
                profile.string_table[vt.unit as usize].clone(),
            )
        })
        .collect()
}

#[test]
fn byte_interval_session_reweights_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heap.pb.gz");
    let (profile, buffer) = session(SamplingPolicy::byte_interval(1024));

    profile.start(File::create(&path).unwrap()).unwrap();
    assert!(buffer.push(&[0x1000, 0x2000], 512));
    assert!(buffer.push(&[0x1000, 0x2000], 2048));
    profile.stop().unwrap();

    let written = read_back(&path);
    pprof::validate(&written).unwrap();
    assert_eq!(written.sample.len(), 1);
    assert_eq!(written.sample[0].value, vec![3, 3072, 0, 0]);
    assert_eq!(written.period, 1024);

    let addresses: Vec<u64> = written.sample[0]
        .location_id
        .iter()
        .map(|id| written.location[*id as usize - 1].address)
        .collect();
    assert_eq!(addresses, vec![0x1000, 0x2000]);
}

#[test]
fn fixed_ratio_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heap.pb.gz");
    let (profile, buffer) = session(SamplingPolicy::fixed_ratio(16));

    profile.start(File::create(&path).unwrap()).unwrap();
    buffer.push(&[0x1000], 100);
    buffer.push(&[0x3000, 0x1000], 8);
    profile.stop().unwrap();

    let written = read_back(&path);
    let mut values: Vec<Vec<i64>> = written.sample.iter().map(|s| s.value.clone()).collect();
    values.sort();
    assert_eq!(values, vec![vec![16, 128, 0, 0], vec![16, 1600, 0, 0]]);
    assert_eq!(written.period, 16);
    // Shared address, shared location
    assert_eq!(written.location.len(), 2);
}

#[test]
fn columns_are_stable() {
    let dir = tempfile::tempdir().unwrap();
    let expected: Vec<(String, String)> = SAMPLE_TYPES
        .iter()
        .map(|(t, u)| (t.to_string(), u.to_string()))
        .collect();

    for (i, policy) in [
        SamplingPolicy::byte_interval(1),
        SamplingPolicy::fixed_ratio(3),
        SamplingPolicy::default(),
    ]
    .into_iter()
    .enumerate()
    {
        let path = dir.path().join(format!("p{}.pb.gz", i));
        let (profile, buffer) = session(policy);
        profile.start(File::create(&path).unwrap()).unwrap();
        if i > 0 {
            buffer.push(&[0xabc0], 64);
        }
        profile.stop().unwrap();
        assert_eq!(column_names(&read_back(&path)), expected);
    }
}

#[test]
fn stop_without_start_errors() {
    let (profile, _buffer) = session(SamplingPolicy::default());
    let err = profile.stop().unwrap_err();
    assert!(matches!(err, Error::NotRunning));
    assert_eq!(err.to_string(), "profiling isn't started");
    assert_eq!(profile.state(), State::Idle);
    assert!(profile.stats().is_none());
}

#[test]
fn second_start_keeps_the_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.pb.gz");
    let second = dir.path().join("second.pb.gz");
    let (profile, buffer) = session(SamplingPolicy::byte_interval(1));

    profile.start(File::create(&first).unwrap()).unwrap();
    buffer.push(&[0x10], 8);
    wait_for_samples(&profile, 1);

    profile.start(File::create(&second).unwrap()).unwrap();
    assert!(profile.is_running());
    // Collected state survives the second start
    assert_eq!(profile.stats().unwrap().samples, 1);

    buffer.push(&[0x10], 8);
    profile.stop().unwrap();

    let written = read_back(&first);
    assert_eq!(written.sample[0].value[..2], [2, 16]);
    assert_eq!(std::fs::metadata(&second).unwrap().len(), 0);
}

#[test]
fn unknown_addresses_still_produce_a_profile() {
    let mut out = tempfile::tempfile().unwrap();
    let (profile, buffer) = session(SamplingPolicy::byte_interval(1));

    profile.start(out.try_clone().unwrap()).unwrap();
    buffer.push(&[1, 2, u64::MAX - 1], 8);
    profile.stop().unwrap();

    use std::io::Seek;
    out.rewind().unwrap();
    let written = pprof::read_profile(&mut out).unwrap();
    pprof::validate(&written).unwrap();
    assert_eq!(written.location.len(), 3);
    assert!(written.location.iter().all(|l| l.line.is_empty()));
}

struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn write_failure_is_reported_and_session_resets() {
    let (profile, buffer) = session(SamplingPolicy::default());

    profile.start(BrokenSink).unwrap();
    buffer.push(&[0x1000], 64);
    let err = profile.stop().unwrap_err();
    assert!(matches!(err, Error::WriteProfile(_)));
    assert_eq!(profile.state(), State::Idle);

    // The next session starts cleanly
    profile.start(io::sink()).unwrap();
    profile.stop().unwrap();
}

#[test]
fn concurrent_starts_launch_one_session() {
    let (profile, buffer) = session(SamplingPolicy::byte_interval(1));
    let profile = Arc::new(profile);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let profile = Arc::clone(&profile);
            std::thread::spawn(move || profile.start(io::sink()))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(profile.is_running());
    buffer.push(&[0x10], 1);
    profile.stop().unwrap();
    assert!(matches!(profile.stop(), Err(Error::NotRunning)));
}

fn wait_for_samples(profile: &Profile<SampleBuffer>, samples: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while profile.stats().map_or(0, |s| s.samples) < samples {
        assert!(Instant::now() < deadline, "collector did not drain the buffer");
        std::thread::sleep(Duration::from_millis(5));
    }
}
