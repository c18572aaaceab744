use super::proto::Profile;
use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use prost::Message;
use std::collections::HashSet;
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidProfile(msg.into())
}

/// Check that every reference inside `profile` points at something that
/// exists: samples to locations, locations to mappings, lines to functions,
/// and every string index into the string table.
pub fn validate(profile: &Profile) -> Result<()> {
    if profile.string_table.first().map(String::as_str) != Some("") {
        return Err(invalid("string table must start with the empty string"));
    }
    let strings = profile.string_table.len() as i64;
    let check_str = |idx: i64, what: &str| -> Result<()> {
        if (0..strings).contains(&idx) {
            Ok(())
        } else {
            Err(invalid(format!("{} refers to missing string {}", what, idx)))
        }
    };

    for vt in profile.sample_type.iter().chain(profile.period_type.as_ref()) {
        check_str(vt.r#type, "value type")?;
        check_str(vt.unit, "value unit")?;
    }
    check_str(profile.default_sample_type, "default sample type")?;
    for &c in &profile.comment {
        check_str(c, "comment")?;
    }

    let mut mappings = HashSet::new();
    for m in &profile.mapping {
        if m.id == 0 || !mappings.insert(m.id) {
            return Err(invalid(format!("mapping id {} is zero or repeated", m.id)));
        }
        check_str(m.filename, "mapping filename")?;
        check_str(m.build_id, "mapping build id")?;
    }

    let mut functions = HashSet::new();
    for f in &profile.function {
        if f.id == 0 || !functions.insert(f.id) {
            return Err(invalid(format!("function id {} is zero or repeated", f.id)));
        }
        check_str(f.name, "function name")?;
        check_str(f.system_name, "function system name")?;
        check_str(f.filename, "function filename")?;
    }

    let mut locations = HashSet::new();
    for loc in &profile.location {
        if loc.id == 0 || !locations.insert(loc.id) {
            return Err(invalid(format!("location id {} is zero or repeated", loc.id)));
        }
        if loc.mapping_id != 0 && !mappings.contains(&loc.mapping_id) {
            return Err(invalid(format!(
                "location {} refers to missing mapping {}",
                loc.id, loc.mapping_id
            )));
        }
        if let Some(line) = loc.line.iter().find(|l| !functions.contains(&l.function_id)) {
            return Err(invalid(format!(
                "location {} refers to missing function {}",
                loc.id, line.function_id
            )));
        }
    }

    for (i, sample) in profile.sample.iter().enumerate() {
        if sample.value.len() != profile.sample_type.len() {
            return Err(invalid(format!(
                "sample {} has {} values, expected {}",
                i,
                sample.value.len(),
                profile.sample_type.len()
            )));
        }
        if let Some(id) = sample.location_id.iter().find(|id| !locations.contains(*id)) {
            return Err(invalid(format!("sample {} refers to missing location {}", i, id)));
        }
    }

    Ok(())
}

/// Validate `profile` and write it gzip-compressed to `sink`.
///
/// Nothing is written when validation fails.
pub fn write_profile<W: Write>(profile: &Profile, sink: W) -> Result<()> {
    validate(profile)?;

    let encoded = profile.encode_to_vec();
    let mut encoder = GzEncoder::new(sink, Compression::default());
    encoder.write_all(&encoded).map_err(Error::WriteProfile)?;
    let mut sink = encoder.finish().map_err(Error::WriteProfile)?;
    sink.flush().map_err(Error::WriteProfile)?;
    Ok(())
}

/// Decode a profile, gzip-compressed or not
pub fn read_profile<R: Read>(mut reader: R) -> Result<Profile> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    if data.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(data.as_slice()).read_to_end(&mut decoded)?;
        data = decoded;
    }
    Ok(Profile::decode(data.as_slice())?)
}
