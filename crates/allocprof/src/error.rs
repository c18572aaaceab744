use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("profiling isn't started")]
    NotRunning,

    #[error("profiling is stopping")]
    Stopping,

    #[error("bad profile: {0}")]
    InvalidProfile(String),

    #[error("writing profile: {0}")]
    WriteProfile(#[source] std::io::Error),

    #[error("Failed to decode profile: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing debug info in {path}. Recompile with `debug = true` in Cargo.toml")]
    MissingDebugInfo { path: String },

    #[error("Unsupported executable format: {0}")]
    UnsupportedFormat(String),

    #[error("Symbol resolution error: {0}")]
    SymbolResolution(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Collector thread error: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const INVALID_PROFILE: i32 = 3;
    pub const IO_ERROR: i32 = 4;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            Error::InvalidProfile(_) | Error::Decode(_) => exit_code::INVALID_PROFILE,
            Error::Io(_) | Error::WriteProfile(_) => exit_code::IO_ERROR,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
