pub mod dwarf;
pub mod maps;
pub mod resolver;

pub use dwarf::{Container, DebugInfo, LineTable, SymbolEntry, SymbolTable};
pub use resolver::{Frame, Image, Symbolizer, global, resolve};
