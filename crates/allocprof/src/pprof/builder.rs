use super::proto;
use crate::aggregate::StackAggregator;
use crate::sampling::SamplingPolicy;
use crate::symbols::{Frame, Symbolizer};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Value columns of every sample, in order: `(type, unit)`.
///
/// Same layout as a Go heap profile so the two can be merged; the in-use
/// columns are always zero because frees are not tracked.
pub const SAMPLE_TYPES: [(&str, &str); 4] = [
    ("alloc_objects", "count"),
    ("alloc_space", "bytes"),
    ("inuse_objects", "count"),
    ("inuse_space", "bytes"),
];

/// Column shown by default
pub const DEFAULT_SAMPLE_TYPE: &str = "alloc_space";

/// Functions whose frames sit between the allocation site and the sampler
const ALLOCATOR_FRAMES: &[&str] = &[
    "allocprof_hook::",
    "<allocprof_hook::",
    "__rust_alloc",
    "__rust_realloc",
    "__rust_alloc_zeroed",
    "__rg_alloc",
    "__rg_realloc",
    "__rg_alloc_zeroed",
    "__rdl_alloc",
    "__rdl_realloc",
    "__rdl_alloc_zeroed",
];

/// Namespace newer compilers put the allocator shims under
const SHIM_NAMESPACE: &str = "__rustc::";

fn is_allocator_frame(frame: &Frame) -> bool {
    frame.function.as_deref().is_some_and(|name| {
        let name = name.strip_prefix(SHIM_NAMESPACE).unwrap_or(name);
        ALLOCATOR_FRAMES.iter().any(|p| name.starts_with(p))
    })
}

/// Interns strings into the profile's string table; index 0 is "".
#[derive(Debug)]
pub struct StringTable {
    index: HashMap<String, i64>,
    table: Vec<String>,
}

impl StringTable {
    pub fn new() -> Self {
        let mut table = StringTable {
            index: HashMap::new(),
            table: Vec::new(),
        };
        table.intern("");
        table
    }

    /// Index of `s`, adding it if unseen
    pub fn intern(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.table.len() as i64;
        self.table.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }

    pub fn finish(self) -> Vec<String> {
        self.table
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Session facts recorded alongside the samples
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub started: DateTime<Utc>,
    pub duration: Duration,
    /// Samples the hook could not queue
    pub dropped: u64,
}

impl Default for SessionInfo {
    fn default() -> Self {
        SessionInfo {
            started: Utc::now(),
            duration: Duration::ZERO,
            dropped: 0,
        }
    }
}

const MAPPING_ID: u64 = 1;

/// Turns aggregated stacks into a pprof profile.
///
/// Locations are shared per distinct address and functions per distinct
/// name and file.
pub struct ProfileBuilder<'a> {
    symbolizer: &'a Symbolizer,
    strings: StringTable,
    locations: HashMap<u64, u64>,
    functions: HashMap<(Arc<str>, Option<Arc<str>>), u64>,
    profile: proto::Profile,
}

impl<'a> ProfileBuilder<'a> {
    pub fn new(symbolizer: &'a Symbolizer) -> Self {
        ProfileBuilder {
            symbolizer,
            strings: StringTable::new(),
            locations: HashMap::new(),
            functions: HashMap::new(),
            profile: proto::Profile::default(),
        }
    }

    pub fn build(
        mut self,
        aggregator: &StackAggregator,
        session: &SessionInfo,
    ) -> proto::Profile {
        self.write_header(aggregator.policy(), session);

        let mut stacks: Vec<_> = aggregator.entries().filter(|e| !e.stack.is_empty()).collect();
        // Stable output for identical input
        stacks.sort_by(|a, b| a.stack.cmp(&b.stack));

        for entry in stacks {
            let frames: Vec<Frame> = entry
                .stack
                .iter()
                .map(|&addr| self.symbolizer.resolve(addr))
                .collect();
            let skip = frames.iter().take_while(|f| is_allocator_frame(f)).count();
            let frames = if skip < frames.len() {
                &frames[skip..]
            } else {
                &frames[..]
            };

            let location_id = frames.iter().map(|f| self.location(f)).collect();
            let count = saturating_i64(entry.count);
            let bytes = saturating_i64(entry.bytes);
            self.profile.sample.push(proto::Sample {
                location_id,
                value: vec![count, bytes, 0, 0],
                label: Vec::new(),
            });
        }

        self.profile.string_table = self.strings.finish();
        self.profile
    }

    fn write_header(&mut self, policy: SamplingPolicy, session: &SessionInfo) {
        let strings = &mut self.strings;
        self.profile.sample_type = SAMPLE_TYPES
            .iter()
            .map(|(ty, unit)| proto::ValueType {
                r#type: strings.intern(ty),
                unit: strings.intern(unit),
            })
            .collect();
        self.profile.default_sample_type = strings.intern(DEFAULT_SAMPLE_TYPE);
        self.profile.period_type = Some(proto::ValueType {
            r#type: strings.intern("space"),
            unit: strings.intern("bytes"),
        });
        self.profile.period = saturating_i64(policy.rate());
        self.profile.time_nanos = session.started.timestamp_nanos_opt().unwrap_or(0);
        self.profile.duration_nanos = i64::try_from(session.duration.as_nanos()).unwrap_or(i64::MAX);

        self.profile.comment.push(strings.intern(&format!("sampling: {}", policy)));
        if session.dropped > 0 {
            self.profile
                .comment
                .push(strings.intern(&format!("dropped samples: {}", session.dropped)));
        }

        let image = self.symbolizer.image();
        let filename = image
            .path
            .as_ref()
            .map_or(0, |p| strings.intern(&p.to_string_lossy()));
        let build_id = image.build_id.as_ref().map_or(0, |id| {
            let hex: String = id.iter().map(|b| format!("{:02x}", b)).collect();
            strings.intern(&hex)
        });
        self.profile.mapping.push(proto::Mapping {
            id: MAPPING_ID,
            memory_start: image.memory_start,
            memory_limit: image.memory_limit,
            file_offset: image.file_offset,
            filename,
            build_id,
            has_functions: self.symbolizer.has_functions(),
            has_filenames: self.symbolizer.has_lines(),
            has_line_numbers: self.symbolizer.has_lines(),
            has_inline_frames: false,
        });
    }

    fn mapping_for(&self, address: u64) -> u64 {
        let image = self.symbolizer.image();
        // An unknown range means we could not read the process maps
        if image.memory_limit == 0 || (image.memory_start..image.memory_limit).contains(&address) {
            MAPPING_ID
        } else {
            0
        }
    }

    fn location(&mut self, frame: &Frame) -> u64 {
        if let Some(&id) = self.locations.get(&frame.address) {
            return id;
        }

        let line = match &frame.function {
            Some(name) => vec![proto::Line {
                function_id: self.function(name, frame.file.as_ref()),
                line: i64::from(frame.line),
            }],
            None => Vec::new(),
        };

        let id = self.profile.location.len() as u64 + 1;
        self.profile.location.push(proto::Location {
            id,
            mapping_id: self.mapping_for(frame.address),
            address: frame.address,
            line,
            is_folded: false,
        });
        self.locations.insert(frame.address, id);
        id
    }

    fn function(&mut self, name: &Arc<str>, file: Option<&Arc<str>>) -> u64 {
        let key = (name.clone(), file.cloned());
        if let Some(&id) = self.functions.get(&key) {
            return id;
        }

        let id = self.profile.function.len() as u64 + 1;
        let name_idx = self.strings.intern(name);
        let filename = file.map_or(0, |f| self.strings.intern(f));
        self.profile.function.push(proto::Function {
            id,
            name: name_idx,
            system_name: name_idx,
            filename,
            start_line: 0,
        });
        self.functions.insert(key, id);
        id
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Build a profile from `aggregator`, resolving addresses with `symbolizer`
pub fn build_profile(
    aggregator: &StackAggregator,
    symbolizer: &Symbolizer,
    session: &SessionInfo,
) -> proto::Profile {
    ProfileBuilder::new(symbolizer).build(aggregator, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pprof::writer::validate;
    use crate::symbols::{LineTable, SymbolEntry, SymbolTable};

    fn symbolizer() -> Symbolizer {
        let entry = |low, high, name: &str| SymbolEntry {
            low,
            high,
            name: Arc::from(name),
        };
        let symbols = SymbolTable::new(vec![
            entry(0x1000, 0x1100, "app::leaf"),
            entry(0x2000, 0x2100, "app::main"),
            entry(0x3000, 0x3100, "__rust_alloc"),
            entry(0x4000, 0x4100, "allocprof_hook::profiling::record_alloc"),
            entry(0x5000, 0x5100, "__rustc::__rust_alloc_zeroed"),
            entry(0x6000, 0x6100, "__rustc::__rust_realloc"),
        ]);
        let mut lines = LineTable::builder();
        lines.push(0x1000, 0x1100, "/src/leaf.rs", 7);
        lines.push(0x2000, 0x2100, "/src/main.rs", 3);
        Symbolizer::from_tables(symbols, lines.build(), 0)
    }

    fn strings(profile: &proto::Profile) -> Vec<(&str, &str)> {
        profile
            .sample_type
            .iter()
            .map(|vt| {
                (
                    profile.string_table[vt.r#type as usize].as_str(),
                    profile.string_table[vt.unit as usize].as_str(),
                )
            })
            .collect()
    }

    #[test]
    fn test_string_table() {
        let mut st = StringTable::new();
        assert_eq!(st.intern(""), 0);
        assert_eq!(st.intern("a"), 1);
        assert_eq!(st.intern("b"), 2);
        assert_eq!(st.intern("a"), 1);
        assert_eq!(st.finish(), vec!["", "a", "b"]);
    }

    #[test]
    fn test_schema_is_fixed() {
        let agg = StackAggregator::new(SamplingPolicy::byte_interval(1024));
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());

        assert_eq!(strings(&profile), SAMPLE_TYPES.to_vec());
        assert_eq!(
            profile.string_table[profile.default_sample_type as usize],
            DEFAULT_SAMPLE_TYPE
        );
        assert_eq!(profile.period, 1024);
        assert!(profile.sample.is_empty());
        validate(&profile).unwrap();
    }

    #[test]
    fn test_locations_and_functions_are_shared() {
        let mut agg = StackAggregator::new(SamplingPolicy::byte_interval(1));
        agg.insert(&[0x1010, 0x2010], 64);
        agg.insert(&[0x1020, 0x2010], 32);
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());

        assert_eq!(profile.sample.len(), 2);
        // Three distinct addresses, two distinct functions
        assert_eq!(profile.location.len(), 3);
        assert_eq!(profile.function.len(), 2);
        for sample in &profile.sample {
            assert_eq!(sample.value.len(), SAMPLE_TYPES.len());
            assert_eq!(&sample.value[2..], &[0, 0]);
        }
        validate(&profile).unwrap();
    }

    #[test]
    fn test_sample_values() {
        let mut agg = StackAggregator::new(SamplingPolicy::byte_interval(1024));
        agg.insert(&[0x1010, 0x2010], 512);
        agg.insert(&[0x1010, 0x2010], 2048);
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());

        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value, vec![3, 3072, 0, 0]);
        let leaf = &profile.location[profile.sample[0].location_id[0] as usize - 1];
        assert_eq!(leaf.address, 0x1010);
        assert_eq!(leaf.line[0].line, 7);
    }

    #[test]
    fn test_unknown_addresses_have_no_lines() {
        let mut agg = StackAggregator::new(SamplingPolicy::byte_interval(1));
        agg.insert(&[0xdead_0000, 0x2010], 8);
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());

        let unknown = profile
            .location
            .iter()
            .find(|l| l.address == 0xdead_0000)
            .unwrap();
        assert!(unknown.line.is_empty());
        validate(&profile).unwrap();
    }

    #[test]
    fn test_allocator_frames_are_trimmed() {
        let mut agg = StackAggregator::new(SamplingPolicy::byte_interval(1));
        agg.insert(&[0x4010, 0x3010, 0x1010, 0x2010], 8);
        // Nothing but allocator frames: keep them rather than emit an empty stack
        agg.insert(&[0x4010, 0x3010], 8);
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());

        assert_eq!(profile.sample.len(), 2);
        let leaf = |sample: &proto::Sample| profile.location[sample.location_id[0] as usize - 1].address;
        let trimmed = profile.sample.iter().find(|s| leaf(*s) == 0x1010).unwrap();
        assert_eq!(trimmed.location_id.len(), 2);
        let kept = profile.sample.iter().find(|s| leaf(*s) == 0x4010).unwrap();
        assert_eq!(kept.location_id.len(), 2);
    }

    #[test]
    fn test_namespaced_shims_are_trimmed() {
        let mut agg = StackAggregator::new(SamplingPolicy::byte_interval(1));
        agg.insert(&[0x4010, 0x5010, 0x1010, 0x2010], 8);
        agg.insert(&[0x6010, 0x2010], 8);
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());

        let mut leaves: Vec<u64> = profile
            .sample
            .iter()
            .map(|s| profile.location[s.location_id[0] as usize - 1].address)
            .collect();
        leaves.sort();
        assert_eq!(leaves, vec![0x1010, 0x2010]);
    }

    #[test]
    fn test_empty_stacks_are_dropped() {
        let mut agg = StackAggregator::new(SamplingPolicy::byte_interval(1));
        agg.insert(&[], 8);
        agg.insert(&[0x1010], 8);
        let profile = build_profile(&agg, &symbolizer(), &SessionInfo::default());
        assert_eq!(profile.sample.len(), 1);
    }

    #[test]
    fn test_comments() {
        let agg = StackAggregator::new(SamplingPolicy::fixed_ratio(64));
        let session = SessionInfo {
            dropped: 5,
            ..SessionInfo::default()
        };
        let profile = build_profile(&agg, &symbolizer(), &session);
        let comments: Vec<&str> = profile
            .comment
            .iter()
            .map(|&i| profile.string_table[i as usize].as_str())
            .collect();
        assert_eq!(comments, vec!["sampling: ratio:64", "dropped samples: 5"]);
    }
}
