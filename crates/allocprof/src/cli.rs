use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "allocprof")]
#[command(about = "Inspect sampled native allocation profiles")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the functions that allocate the most
    Top {
        /// Profile file (pprof, optionally gzipped)
        file: PathBuf,

        /// Which weight to rank by
        #[arg(long, short = 'm', value_enum, default_value = "bytes")]
        metric: TopMetric,

        /// Number of entries to display
        #[arg(long, short = 'n', default_value = "20")]
        top: usize,

        /// Output as CSV
        #[arg(long)]
        csv: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopMetric {
    /// Estimated allocation count
    Objects,
    /// Estimated allocated bytes
    Bytes,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Top { top: 0, .. } = self.command {
            return Err("--top must be at least 1".to_string());
        }
        Ok(())
    }
}
