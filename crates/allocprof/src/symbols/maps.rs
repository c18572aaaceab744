use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// A parsed memory mapping from /proc/self/maps
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

/// Collection of memory mappings for a process
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    /// Parse /proc/self/maps
    pub fn current() -> Result<Self> {
        let content = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mappings = content.lines().filter_map(Self::parse_line).collect();
        MemoryMaps { mappings }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        // Pathname is the last field (if present)
        let pathname = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    /// First mapping of the given file (lowest file offset comes first in /proc)
    pub fn first_mapping_of(&self, path: &Path) -> Option<&MemoryMapping> {
        let path_str = path.to_string_lossy();
        self.mappings.iter().find(|m| {
            m.pathname
                .as_deref()
                .is_some_and(|p| p == path_str.as_ref() || p.strip_suffix(" (deleted)") == Some(&*path_str))
        })
    }

    /// Address range covered by all mappings of the given file
    pub fn range_of(&self, path: &Path) -> Option<(u64, u64)> {
        let path_str = path.to_string_lossy();
        self.mappings
            .iter()
            .filter(|m| m.pathname.as_deref() == Some(path_str.as_ref()))
            .fold(None, |range, m| match range {
                None => Some((m.start, m.end)),
                Some((lo, hi)) => Some((lo.min(m.start), hi.max(m.end))),
            })
    }

    /// Load bias of an executable: runtime address minus link-time address.
    ///
    /// `image_base` is the link-time address corresponding to file offset 0.
    pub fn load_bias(&self, exe_path: &Path, image_base: u64) -> Result<u64> {
        let mapping = self.first_mapping_of(exe_path).ok_or_else(|| {
            Error::SymbolResolution(format!(
                "No mapping found for {} in /proc/self/maps",
                exe_path.display()
            ))
        })?;
        // For PIE binaries image_base is 0 and this is the load address
        Ok(mapping
            .start
            .wrapping_sub(mapping.offset)
            .wrapping_sub(image_base))
    }
}

/// Load bias of the running executable.
#[cfg(target_os = "linux")]
pub fn current_load_bias(exe_path: &Path, image_base: u64) -> Result<u64> {
    MemoryMaps::current()?.load_bias(exe_path, image_base)
}

/// Load bias of the running executable (dyld slide of the main image).
#[cfg(target_os = "macos")]
pub fn current_load_bias(_exe_path: &Path, _image_base: u64) -> Result<u64> {
    let slide = unsafe { libc::_dyld_get_image_vmaddr_slide(0) };
    Ok(slide as u64)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn current_load_bias(_exe_path: &Path, _image_base: u64) -> Result<u64> {
    Ok(0)
}
