//! Allocation-heavy demo workload profiled in-process.
//!
//! Build: RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release --example workload -p allocprof
//! Run:   ./target/release/examples/workload heap.pb.gz
//! View:  allocprof top heap.pb.gz

use allocprof::{Profile, SamplingPolicy};
use std::collections::HashMap;
use std::fs::File;
use std::time::{Duration, Instant};

allocprof::profiler!();

/// Builds many small strings
fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Few large buffers
fn render_report(counts: &HashMap<String, usize>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 * 1024);
    for (word, count) in counts {
        out.extend_from_slice(format!("{word}: {count}\n").as_bytes());
    }
    out
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let output = std::env::args().nth(1).unwrap_or_else(|| "heap.pb.gz".to_string());

    let profile = Profile::with_policy(SamplingPolicy::byte_interval(64 * 1024));
    profile.start(File::create(&output)?)?;

    let text = "the quick brown fox jumps over the lazy dog ".repeat(200);
    let start = Instant::now();
    let mut reports = 0usize;
    while start.elapsed() < Duration::from_secs(2) {
        let mut counts = HashMap::new();
        for word in tokenize(&text) {
            *counts.entry(word).or_insert(0) += 1;
        }
        reports += render_report(&counts).len();
    }

    profile.stop()?;
    println!("rendered {} bytes, profile written to {}", reports, output);
    Ok(())
}
