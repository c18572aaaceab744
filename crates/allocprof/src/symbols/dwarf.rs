use crate::error::{Error, Result};
use gimli::{EndianRcSlice, Reader as _, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

type Reader = EndianRcSlice<RunTimeEndian>;

/// Executable container formats we know how to read debug info from,
/// tried in [`Container::PROBE_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Elf,
    MachO,
}

impl Container {
    pub const PROBE_ORDER: [Container; 2] = [Container::Elf, Container::MachO];

    fn format(self) -> object::BinaryFormat {
        match self {
            Container::Elf => object::BinaryFormat::Elf,
            Container::MachO => object::BinaryFormat::MachO,
        }
    }

    /// Parse `data` as this container, failing if it is something else
    fn open(self, data: &[u8]) -> Result<object::File<'_>> {
        let file = object::File::parse(data)
            .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
        if file.format() != self.format() {
            return Err(Error::UnsupportedFormat(format!(
                "expected {:?}, found {:?}",
                self,
                file.format()
            )));
        }
        Ok(file)
    }

    /// Files that may carry DWARF for `exe`, in lookup order
    fn debug_files(self, exe: &Path) -> Vec<PathBuf> {
        match self {
            Container::Elf => Vec::new(),
            Container::MachO => {
                let Some(name) = exe.file_name() else {
                    return Vec::new();
                };
                let mut bundle = exe.as_os_str().to_owned();
                bundle.push(".dSYM");
                vec![
                    PathBuf::from(bundle)
                        .join("Contents/Resources/DWARF")
                        .join(name),
                ]
            }
        }
    }
}

/// One contiguous code range of a function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub low: u64,
    /// Exclusive
    pub high: u64,
    pub name: Arc<str>,
}

/// Function ranges sorted by low address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    pub fn new(mut entries: Vec<SymbolEntry>) -> Self {
        entries.sort_by_key(|e| e.low);
        SymbolTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the function whose range contains `pc`.
    ///
    /// Finds the first entry whose (exclusive) high bound lies above `pc` and
    /// accepts it only if its low bound is at or below `pc`.
    pub fn lookup(&self, pc: u64) -> Option<&SymbolEntry> {
        let idx = self.entries.partition_point(|e| e.high <= pc);
        let entry = self.entries.get(idx)?;
        (entry.low <= pc).then_some(entry)
    }
}

/// An address range mapped to a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
    pub file: u32,
    pub line: u32,
}

/// Line-table rows flattened into sorted address ranges.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    ranges: Vec<AddressRange>,
    files: Vec<Arc<str>>,
}

impl LineTable {
    pub fn builder() -> LineTableBuilder {
        LineTableBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Source file and line for `addr`
    pub fn lookup(&self, addr: u64) -> Option<(&Arc<str>, u32)> {
        let idx = self
            .ranges
            .binary_search_by(|r| {
                if addr < r.start {
                    std::cmp::Ordering::Greater
                } else if addr >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        let range = &self.ranges[idx];
        Some((self.files.get(range.file as usize)?, range.line))
    }
}

#[derive(Debug, Default)]
pub struct LineTableBuilder {
    ranges: Vec<AddressRange>,
    files: Vec<Arc<str>>,
    file_ids: HashMap<String, u32>,
}

impl LineTableBuilder {
    pub fn push(&mut self, start: u64, end: u64, file: &str, line: u32) {
        if end <= start || file.is_empty() {
            return;
        }
        let file = match self.file_ids.get(file) {
            Some(&id) => id,
            None => {
                let id = self.files.len() as u32;
                self.files.push(Arc::from(file));
                self.file_ids.insert(file.to_string(), id);
                id
            }
        };
        self.ranges.push(AddressRange {
            start,
            end,
            file,
            line,
        });
    }

    pub fn build(mut self) -> LineTable {
        // Sort by start address for binary search
        self.ranges.sort_by_key(|r| r.start);
        LineTable {
            ranges: self.ranges,
            files: self.files,
        }
    }
}

/// Debug information extracted from an executable
pub struct DebugInfo {
    pub container: Container,
    pub symbols: SymbolTable,
    pub lines: LineTable,
    /// Link-time address of file offset 0
    pub image_base: u64,
    pub build_id: Option<Vec<u8>>,
}

impl DebugInfo {
    /// Parse debug info from an executable, trying each container format
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        let mut last_err = Error::UnsupportedFormat(path.display().to_string());
        for container in Container::PROBE_ORDER {
            match container.open(&mmap) {
                Ok(object) => return Self::from_object(container, path, &object),
                Err(e) => {
                    debug!("{} is not {:?}: {}", path.display(), container, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn from_object(container: Container, path: &Path, object: &object::File<'_>) -> Result<Self> {
        let image_base = image_base(object);
        let build_id = object.build_id().ok().flatten().map(<[u8]>::to_vec);

        let (mut symbols, lines) = if has_dwarf(object) {
            parse_dwarf(object)?
        } else {
            match Self::external_dwarf(container, path)? {
                Some(tables) => tables,
                None => {
                    debug!("{} carries no DWARF, using the symbol table", path.display());
                    (Vec::new(), LineTable::default())
                }
            }
        };

        if symbols.is_empty() {
            symbols = parse_symbols(object);
        }
        if symbols.is_empty() && lines.is_empty() {
            return Err(Error::MissingDebugInfo {
                path: path.display().to_string(),
            });
        }

        Ok(DebugInfo {
            container,
            symbols: SymbolTable::new(symbols),
            lines,
            image_base,
            build_id,
        })
    }

    /// DWARF kept next to the executable (e.g. a dSYM bundle)
    fn external_dwarf(
        container: Container,
        exe: &Path,
    ) -> Result<Option<(Vec<SymbolEntry>, LineTable)>> {
        for candidate in container.debug_files(exe) {
            let Ok(file) = File::open(&candidate) else {
                continue;
            };
            let mmap = unsafe { memmap2::Mmap::map(&file) }?;
            let object = container.open(&mmap)?;
            if has_dwarf(&object) {
                debug!("Using debug info from {}", candidate.display());
                return parse_dwarf(&object).map(Some);
            }
        }
        Ok(None)
    }
}

fn has_dwarf(object: &object::File<'_>) -> bool {
    object.section_by_name(".debug_info").is_some()
}

fn image_base(object: &object::File<'_>) -> u64 {
    object
        .segments()
        .filter(|s| s.file_range().1 > 0)
        .map(|s| s.address().wrapping_sub(s.file_range().0))
        .min()
        .unwrap_or(0)
}

fn demangle(name: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(name))
}

fn parse_dwarf(object: &object::File<'_>) -> Result<(Vec<SymbolEntry>, LineTable)> {
    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section)
        .map_err(|e| Error::SymbolResolution(format!("Failed to load DWARF: {}", e)))?;

    let mut symbols = Vec::new();
    let mut lines = LineTable::builder();
    let mut names: HashMap<String, Arc<str>> = HashMap::new();

    let mut units = dwarf.units();
    while let Ok(Some(header)) = units.next() {
        let unit = match dwarf.unit(header) {
            Ok(unit) => unit,
            Err(e) => {
                debug!("Skipping unparsable compilation unit: {}", e);
                continue;
            }
        };

        parse_subprograms(&dwarf, &unit, &mut names, &mut symbols);
        parse_line_program(&dwarf, &unit, &mut lines);
    }

    Ok((symbols, lines.build()))
}

fn parse_subprograms(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    names: &mut HashMap<String, Arc<str>>,
    symbols: &mut Vec<SymbolEntry>,
) {
    let mut entries = unit.entries();
    while let Ok(Some((_, entry))) = entries.next_dfs() {
        if entry.tag() != gimli::DW_TAG_subprogram {
            continue;
        }
        let Some(name) = die_name(dwarf, unit, entry, 2) else {
            continue;
        };
        let Ok(mut ranges) = dwarf.die_ranges(unit, entry) else {
            continue;
        };

        let name = names
            .entry(name)
            .or_insert_with_key(|name| Arc::from(name.as_str()))
            .clone();
        while let Ok(Some(range)) = ranges.next() {
            // Functions dropped by the linker keep a zero start address
            if range.begin != 0 && range.begin < range.end {
                symbols.push(SymbolEntry {
                    low: range.begin,
                    high: range.end,
                    name: name.clone(),
                });
            }
        }
    }
}

/// Linkage name (demangled), plain name, or the name of the abstract
/// origin / specification this entry refers to.
fn die_name(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, Reader>,
    depth: u8,
) -> Option<String> {
    let attr_string = |attr: gimli::DwAt| -> Option<String> {
        let value = entry.attr_value(attr).ok()??;
        let s = dwarf.attr_string(unit, value).ok()?;
        s.to_string_lossy().ok().map(Cow::into_owned)
    };

    if let Some(name) = attr_string(gimli::DW_AT_linkage_name)
        .or_else(|| attr_string(gimli::DW_AT_MIPS_linkage_name))
    {
        return Some(demangle(&name));
    }
    if let Some(name) = attr_string(gimli::DW_AT_name) {
        return Some(name);
    }
    if depth == 0 {
        return None;
    }

    [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification]
        .into_iter()
        .find_map(|attr| match entry.attr_value(attr) {
            Ok(Some(gimli::AttributeValue::UnitRef(offset))) => {
                let origin = unit.entry(offset).ok()?;
                die_name(dwarf, unit, &origin, depth - 1)
            }
            _ => None,
        })
}

fn parse_line_program(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    lines: &mut LineTableBuilder,
) {
    let Some(program) = unit.line_program.clone() else {
        return;
    };
    let comp_dir = unit
        .comp_dir
        .as_ref()
        .and_then(|dir| dir.to_string_lossy().ok())
        .map(Cow::into_owned);

    let mut rows = program.rows();
    let mut prev_row: Option<(u64, String, u32)> = None;

    while let Ok(Some((header, row))) = rows.next_row() {
        let addr = row.address();

        let file = row
            .file(header)
            .map(|f| {
                let mut path = String::new();

                if let Some(dir) = f.directory(header) {
                    if let Ok(dir_str) = dwarf.attr_string(unit, dir) {
                        if let Ok(s) = dir_str.to_string_lossy() {
                            path.push_str(&s);
                            if !path.is_empty() && !path.ends_with('/') {
                                path.push('/');
                            }
                        }
                    }
                }

                if let Ok(name) = dwarf.attr_string(unit, f.path_name()) {
                    if let Ok(s) = name.to_string_lossy() {
                        if s.starts_with('/') {
                            path.clear();
                        }
                        path.push_str(&s);
                    }
                }

                if !path.starts_with('/') {
                    if let Some(comp_dir) = &comp_dir {
                        path = format!("{}/{}", comp_dir.trim_end_matches('/'), path);
                    }
                }
                path
            })
            .unwrap_or_default();
        let line = row.line().map(|l| l.get() as u32).unwrap_or(0);

        // Create range from previous row to this one
        if let Some((prev_addr, prev_file, prev_line)) = prev_row.take() {
            if addr > prev_addr {
                lines.push(prev_addr, addr, &prev_file, prev_line);
            }
        }

        if !row.end_sequence() {
            prev_row = Some((addr, file, line));
        }
    }
}

/// Function ranges from the object's symbol table
fn parse_symbols(object: &object::File<'_>) -> Vec<SymbolEntry> {
    object
        .symbols()
        .filter(|symbol| symbol.kind() == object::SymbolKind::Text && symbol.size() > 0)
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            Some(SymbolEntry {
                low: symbol.address(),
                high: symbol.address() + symbol.size(),
                name: Arc::from(demangle(name)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(low: u64, high: u64, name: &str) -> SymbolEntry {
        SymbolEntry {
            low,
            high,
            name: Arc::from(name),
        }
    }

    #[test]
    fn test_symbol_table_sorts_and_finds() {
        let table = SymbolTable::new(vec![
            entry(0x3000, 0x3100, "c"),
            entry(0x1000, 0x1100, "a"),
            entry(0x2000, 0x2400, "b"),
        ]);
        assert_eq!(table.len(), 3);
        assert_eq!(&*table.lookup(0x1000).unwrap().name, "a");
        assert_eq!(&*table.lookup(0x2200).unwrap().name, "b");
        assert_eq!(&*table.lookup(0x30ff).unwrap().name, "c");
    }

    #[test]
    fn test_symbol_table_gaps() {
        let table = SymbolTable::new(vec![entry(0x1000, 0x1100, "a"), entry(0x2000, 0x2100, "b")]);
        assert!(table.lookup(0x0fff).is_none());
        assert!(table.lookup(0x1800).is_none());
        assert!(table.lookup(0x9000).is_none());
        assert!(SymbolTable::default().lookup(0x1000).is_none());
    }

    #[test]
    fn test_symbol_table_adjacent_ranges() {
        let table = SymbolTable::new(vec![entry(0x1000, 0x1100, "a"), entry(0x1100, 0x1200, "b")]);
        assert_eq!(&*table.lookup(0x10ff).unwrap().name, "a");
        assert_eq!(&*table.lookup(0x1100).unwrap().name, "b");
        assert!(table.lookup(0x1200).is_none());
    }

    #[test]
    fn test_line_table_lookup() {
        let mut builder = LineTable::builder();
        builder.push(0x1010, 0x1020, "/src/b.c", 20);
        builder.push(0x1000, 0x1010, "/src/a.c", 10);
        builder.push(0x1020, 0x1020, "/src/empty.c", 1);
        let table = builder.build();

        assert_eq!(table.len(), 2);
        let (file, line) = table.lookup(0x1004).unwrap();
        assert_eq!((&**file, line), ("/src/a.c", 10));
        let (file, line) = table.lookup(0x1010).unwrap();
        assert_eq!((&**file, line), ("/src/b.c", 20));
        assert!(table.lookup(0x1020).is_none());
    }

    #[test]
    fn test_line_table_interns_files() {
        let mut builder = LineTable::builder();
        builder.push(0x0, 0x4, "/src/a.c", 1);
        builder.push(0x4, 0x8, "/src/a.c", 2);
        let table = builder.build();
        assert_eq!(table.files.len(), 1);
    }

    #[test]
    fn test_dsym_path() {
        let files = Container::MachO.debug_files(Path::new("/tmp/bin/app"));
        assert_eq!(
            files,
            vec![PathBuf::from("/tmp/bin/app.dSYM/Contents/Resources/DWARF/app")]
        );
        assert!(Container::Elf.debug_files(Path::new("/tmp/bin/app")).is_empty());
    }

    #[test]
    fn test_load_rejects_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-exe");
        std::fs::write(&path, b"plain text, no headers").unwrap();
        assert!(DebugInfo::load(&path).is_err());
    }

    #[test]
    fn test_load_current_exe() {
        let exe = std::env::current_exe().unwrap();
        let info = DebugInfo::load(&exe).unwrap();
        assert!(!info.symbols.is_empty());
    }

    #[test]
    fn test_current_exe_names_and_files() {
        let exe = std::env::current_exe().unwrap();
        let info = DebugInfo::load(&exe).unwrap();

        // DWARF strings come through as demangled function names and full paths
        assert!(!info.lines.is_empty());
        assert!(
            info.symbols
                .entries
                .iter()
                .any(|e| e.name.ends_with("test_current_exe_names_and_files"))
        );
        assert!(info.lines.files.iter().any(|f| f.ends_with("symbols/dwarf.rs")));
    }
}
