use allocprof::cli::{Cli, Command};
use allocprof::error::exit_code;
use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<allocprof::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.validate() {
        return Err(allocprof::Error::InvalidArgument(e)).context("Invalid arguments");
    }

    match cli.command {
        Command::Top {
            file,
            metric,
            top,
            csv,
        } => {
            allocprof::commands::top::run(&file, metric, top, csv)
                .with_context(|| format!("Failed to read {}", file.display()))?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "allocprof", &mut std::io::stdout());
        }
    }

    Ok(())
}
