//! This file defines the tilestack binary entry point.

use tilestack::app;
use tilestack::cli;
use tilestack::error::Failure;
use tilestack::tracing;

use std::process::ExitCode;

/// Application entry point
fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing();
    match app::run(&args) {
        Ok(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(error) => {
            let failure = Failure::from(error);
            match serde_json::to_string(&failure) {
                Ok(failure) => eprintln!("{}", failure),
                Err(_) => eprintln!("{}: {}", failure.kind, failure.message),
            }
            ExitCode::FAILURE
        }
    }
}
