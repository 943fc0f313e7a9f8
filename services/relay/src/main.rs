//! tap-proxy - observing TCP relay.
//!
//! Waits for A, connects to B and prints a hexdump of everything relayed
//! between them.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tap_relay::cli::Cli;
use tap_relay::error::print_error;
use tap_relay::{logging, CancelToken, RelayConfig, RelayError, VERSION};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = logging::init(&cli.log_level, cli.log_format, !cli.no_color) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<RelayError>() {
            Some(relay_err) if relay_err.is_interrupted() => {
                info!(reason = %relay_err, "session cancelled");
                println!("\nUser cancelled.");
                ExitCode::from(relay_err.exit_code())
            }
            _ => {
                print_error(&e);
                ExitCode::FAILURE
            }
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = RelayConfig::from_cli(cli)?;
    let cancel = CancelToken::install()?;

    info!(version = VERSION, "tap-proxy starting");

    let report = tap_relay::run(&config, &cancel)?;
    info!(
        a_to_b = %report.a_to_b.status,
        b_to_a = %report.b_to_a.status,
        "tap-proxy exiting normally"
    );

    Ok(())
}
