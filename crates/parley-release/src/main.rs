//! parley-release CLI entry point

use clap::Parser;
use parley_release::{Cli, ExitCode};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.execute() {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::Failure.to_exit_code()
        }
    }
}
