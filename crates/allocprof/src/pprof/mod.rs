//! pprof profile construction and serialization.

pub mod builder;
pub mod proto;
pub mod writer;

pub use builder::{
    DEFAULT_SAMPLE_TYPE, ProfileBuilder, SAMPLE_TYPES, SessionInfo, StringTable, build_profile,
};
pub use writer::{read_profile, validate, write_profile};
