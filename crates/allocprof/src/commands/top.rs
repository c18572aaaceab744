use crate::cli::TopMetric;
use crate::error::{Error, Result};
use crate::pprof::proto::Profile;
use crate::pprof::read_profile;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Allocation weight attributed to one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopEntry {
    pub function: String,
    pub file: String,
    /// Weight of samples where the function is the leaf
    pub flat: i64,
    /// Weight of samples where the function appears anywhere
    pub cum: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub total: i64,
    pub samples: usize,
    pub duration: Duration,
    pub comments: Vec<String>,
    pub entries: Vec<TopEntry>,
}

impl TopMetric {
    fn sample_type(self) -> &'static str {
        match self {
            TopMetric::Objects => "alloc_objects",
            TopMetric::Bytes => "alloc_space",
        }
    }
}

pub fn run(file: &Path, metric: TopMetric, limit: usize, csv: bool) -> Result<()> {
    let profile = read_profile(BufReader::new(File::open(file)?))?;
    let summary = summarize(&profile, metric)?;

    if csv {
        print_csv(&summary, limit);
    } else {
        print_table(file, &summary, metric, limit);
    }
    Ok(())
}

fn string(profile: &Profile, idx: i64) -> &str {
    usize::try_from(idx)
        .ok()
        .and_then(|i| profile.string_table.get(i))
        .map_or("", String::as_str)
}

/// Flat and cumulative weight per function, heaviest flat first
pub fn summarize(profile: &Profile, metric: TopMetric) -> Result<Summary> {
    let column = profile
        .sample_type
        .iter()
        .position(|vt| string(profile, vt.r#type) == metric.sample_type())
        .ok_or_else(|| {
            Error::InvalidProfile(format!("no {} column", metric.sample_type()))
        })?;

    let functions: HashMap<u64, (&str, &str)> = profile
        .function
        .iter()
        .map(|f| (f.id, (string(profile, f.name), string(profile, f.filename))))
        .collect();
    let locations: HashMap<u64, _> = profile.location.iter().map(|l| (l.id, l)).collect();

    // Name of the frame at a location, the raw address when unsymbolized
    let frame_key = |id: &u64| -> (String, String) {
        let Some(location) = locations.get(id) else {
            return (format!("[location {}]", id), String::new());
        };
        match location
            .line
            .first()
            .and_then(|line| functions.get(&line.function_id))
        {
            Some((name, file)) => (name.to_string(), file.to_string()),
            None => (format!("{:#x}", location.address), String::new()),
        }
    };

    let mut totals: HashMap<(String, String), (i64, i64)> = HashMap::new();
    let mut total = 0i64;
    for sample in &profile.sample {
        let value = sample.value.get(column).copied().unwrap_or(0);
        total = total.saturating_add(value);

        let mut seen = HashSet::new();
        for (depth, id) in sample.location_id.iter().enumerate() {
            let key = frame_key(id);
            if !seen.insert(key.clone()) {
                continue;
            }
            let (flat, cum) = totals.entry(key).or_default();
            if depth == 0 {
                *flat = flat.saturating_add(value);
            }
            *cum = cum.saturating_add(value);
        }
    }

    let mut entries: Vec<TopEntry> = totals
        .into_iter()
        .map(|((function, file), (flat, cum))| TopEntry {
            function,
            file,
            flat,
            cum,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.flat
            .cmp(&a.flat)
            .then(b.cum.cmp(&a.cum))
            .then_with(|| a.function.cmp(&b.function))
    });

    Ok(Summary {
        total,
        samples: profile.sample.len(),
        duration: Duration::from_nanos(profile.duration_nanos.max(0) as u64),
        comments: profile
            .comment
            .iter()
            .map(|&c| string(profile, c).to_string())
            .collect(),
        entries,
    })
}

fn format_value(value: i64, metric: TopMetric) -> String {
    match metric {
        TopMetric::Bytes => format_bytes(value),
        TopMetric::Objects => format_count(value.max(0) as u64),
    }
}

fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn print_table(file: &Path, summary: &Summary, metric: TopMetric, limit: usize) {
    println!("# {}", file.display());
    println!(
        "# Duration: {} | Samples: {} | Total: {}",
        humantime::format_duration(Duration::from_millis(summary.duration.as_millis() as u64)),
        summary.samples,
        format_value(summary.total, metric)
    );
    for comment in &summary.comments {
        println!("# {}", comment);
    }
    println!();

    println!(
        "{:>10}  {:>6}  {:>10}  {:>6}  {:<30}  FUNCTION",
        "FLAT", "FLAT%", "CUM", "CUM%", "LOCATION"
    );
    println!("{}", "-".repeat(96));

    for entry in summary.entries.iter().take(limit) {
        println!(
            "{:>10}  {:>5.1}%  {:>10}  {:>5.1}%  {:<30}  {}",
            format_value(entry.flat, metric),
            percent(entry.flat, summary.total),
            format_value(entry.cum, metric),
            percent(entry.cum, summary.total),
            simplify_path(&entry.file),
            format_function(&entry.function)
        );
    }
}

fn print_csv(summary: &Summary, limit: usize) {
    println!("flat,flat_pct,cum,cum_pct,file,function");
    for entry in summary.entries.iter().take(limit) {
        println!(
            "{},{:.1},{},{:.1},{},\"{}\"",
            entry.flat,
            percent(entry.flat, summary.total),
            entry.cum,
            percent(entry.cum, summary.total),
            entry.file,
            entry.function.replace('"', "\"\"")
        );
    }
}

/// Shorten a source path to the part worth reading
fn simplify_path(path: &str) -> String {
    if path.is_empty() {
        return "[unknown]".to_string();
    }

    if (path.contains("/rust/library/") || path.contains("/rustc/"))
        && let Some(filename) = path.rsplit('/').next()
    {
        return format!("<std>/{}", filename);
    }

    // Cargo dependencies: <crate>/file
    if path.contains("/.cargo/")
        && let Some(idx) = path.rfind("/src/")
        && let Some(crate_start) = path[..idx].rfind('/')
    {
        return format!("<{}>/{}", &path[crate_start + 1..idx], &path[idx + 5..]);
    }

    if let Some(idx) = path.find("/src/") {
        return path[idx + 1..].to_string();
    }

    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Drop the legacy symbol hash and long generic arguments
fn format_function(func: &str) -> String {
    let mut result = func.to_string();

    if let Some(idx) = result.rfind("::h") {
        let suffix = &result[idx + 3..];
        if suffix.len() == 16 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            result.truncate(idx);
        }
    }

    if let (Some(start), Some(end)) = (result.find('<'), result.rfind('>'))
        && start > 0
        && start < end
        && end - start > 20
    {
        result = format!("{}<_>{}", &result[..start], &result[end + 1..]);
    }

    result
}

fn format_bytes(bytes: i64) -> String {
    let abs = bytes.unsigned_abs() as f64;
    let sign = if bytes < 0 { "-" } else { "" };
    if abs >= 1024.0 * 1024.0 * 1024.0 {
        format!("{}{:.2}G", sign, abs / (1024.0 * 1024.0 * 1024.0))
    } else if abs >= 1024.0 * 1024.0 {
        format!("{}{:.2}M", sign, abs / (1024.0 * 1024.0))
    } else if abs >= 1024.0 {
        format!("{}{:.1}K", sign, abs / 1024.0)
    } else {
        format!("{}{}B", sign, bytes.unsigned_abs())
    }
}

/// Thousands separators
fn format_count(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
