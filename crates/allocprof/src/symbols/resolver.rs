use super::dwarf::{DebugInfo, LineTable, SymbolTable};
use super::maps;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// A resolved return address.
///
/// `function` and `file` are `None` when the address is not covered by the
/// debug info; the address itself is always kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u64,
    pub function: Option<Arc<str>>,
    pub file: Option<Arc<str>>,
    pub line: u32,
}

impl Frame {
    pub fn unknown(address: u64) -> Self {
        Frame {
            address,
            function: None,
            file: None,
            line: 0,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.function.is_some()
    }
}

/// The executable image the symbolizer was built from
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub path: Option<PathBuf>,
    pub build_id: Option<Vec<u8>>,
    /// Runtime address range of the image, when known
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
}

/// Address to function/file/line lookup for one executable image
#[derive(Debug, Default)]
pub struct Symbolizer {
    symbols: SymbolTable,
    lines: LineTable,
    /// Runtime address minus link-time address
    bias: u64,
    image: Image,
}

impl Symbolizer {
    /// Symbolizer for the running executable.
    ///
    /// Never fails: missing or unreadable debug info yields a symbolizer that
    /// resolves nothing.
    pub fn for_current_exe() -> Self {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                warn!("Cannot locate the running executable: {}", e);
                return Symbolizer::default();
            }
        };

        match Self::load(&exe) {
            Ok(symbolizer) => symbolizer,
            Err(e) => {
                warn!(
                    "No symbols for {}: {}; profile will carry raw addresses",
                    exe.display(),
                    e
                );
                Symbolizer {
                    image: Image {
                        path: Some(exe),
                        ..Image::default()
                    },
                    ..Symbolizer::default()
                }
            }
        }
    }

    /// Symbolizer for the executable at `path`, assumed to be the running image
    pub fn load(path: &Path) -> crate::Result<Self> {
        let info = DebugInfo::load(path)?;
        let bias = match maps::current_load_bias(path, info.image_base) {
            Ok(bias) => bias,
            Err(e) => {
                debug!("Assuming zero load bias: {}", e);
                0
            }
        };
        let (memory_start, memory_limit, file_offset) = image_range(path);

        debug!(
            "Loaded {} symbols and {} line ranges from {} ({:?}, bias {:#x})",
            info.symbols.len(),
            info.lines.len(),
            path.display(),
            info.container,
            bias
        );

        Ok(Symbolizer {
            symbols: info.symbols,
            lines: info.lines,
            bias,
            image: Image {
                path: Some(path.to_path_buf()),
                build_id: info.build_id,
                memory_start,
                memory_limit,
                file_offset,
            },
        })
    }

    /// Symbolizer over prebuilt tables
    pub fn from_tables(symbols: SymbolTable, lines: LineTable, bias: u64) -> Self {
        Symbolizer {
            symbols,
            lines,
            bias,
            image: Image::default(),
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    pub fn has_functions(&self) -> bool {
        !self.symbols.is_empty()
    }

    pub fn has_lines(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Resolve a return address.
    ///
    /// The lookup uses `address - 1` so that file and line name the call
    /// instruction rather than the one after it.
    pub fn resolve(&self, address: u64) -> Frame {
        if address == 0 {
            return Frame::unknown(address);
        }
        let pc = address.wrapping_sub(self.bias).wrapping_sub(1);

        let Some(symbol) = self.symbols.lookup(pc) else {
            return Frame::unknown(address);
        };
        let (file, line) = match self.lines.lookup(pc) {
            Some((file, line)) => (Some(file.clone()), line),
            None => (None, 0),
        };

        Frame {
            address,
            function: Some(symbol.name.clone()),
            file,
            line,
        }
    }
}

#[cfg(target_os = "linux")]
fn image_range(path: &Path) -> (u64, u64, u64) {
    let Ok(maps) = maps::MemoryMaps::current() else {
        return (0, 0, 0);
    };
    let offset = maps.first_mapping_of(path).map_or(0, |m| m.offset);
    match maps.range_of(path) {
        Some((start, end)) => (start, end, offset),
        None => (0, 0, 0),
    }
}

#[cfg(not(target_os = "linux"))]
fn image_range(_path: &Path) -> (u64, u64, u64) {
    (0, 0, 0)
}

static SYMBOLIZER: OnceLock<Symbolizer> = OnceLock::new();

/// The process-wide symbolizer, built on first use.
///
/// Concurrent first callers block until the single build finishes.
pub fn global() -> &'static Symbolizer {
    SYMBOLIZER.get_or_init(Symbolizer::for_current_exe)
}

/// Resolve `address` with the process-wide symbolizer
pub fn resolve(address: u64) -> Frame {
    global().resolve(address)
}
