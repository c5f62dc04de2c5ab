use std::process::ExitCode;

use clap::Parser;
use parley::ErrorNotice;
use parley::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.verbose);

    match cli::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::debug!(error = ?error, "command failed");
            eprintln!("{}", ErrorNotice::from_error(&error));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    // Logs go to stderr so streamed replies on stdout stay clean.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "parley={level},parley_llm={level},parley_storage={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
