//! Observing TCP relay.
//!
//! Accepts a connection from endpoint A, connects to endpoint B and relays
//! bytes both ways on a single thread, reporting every byte that crosses
//! each direction to a [`Recorder`]. Half-closes propagate from one side to
//! the other, and a caught termination signal interrupts any blocking wait.

use std::io;

use tracing::info;

use crate::endpoint::Endpoint;

pub mod cli;
pub mod config;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod logging;
pub mod recorder;
pub mod relay;
pub mod signal;

pub use config::RelayConfig;
pub use error::RelayError;
pub use flow::{Direction, PipeStatus};
pub use recorder::{Hexdump, Recorder};
pub use relay::{Relay, SessionReport};
pub use signal::CancelToken;

/// Crate version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run one session, recording to a hexdump on stdout.
///
/// Dump files are opened only once both peers are connected, so a failed
/// setup leaves earlier dumps untouched.
pub fn run(config: &RelayConfig, cancel: &CancelToken) -> Result<SessionReport, RelayError> {
    let (a, b) = connect_peers(config, cancel)?;
    let recorder = Hexdump::new(io::stdout(), config.color, config.dump.as_ref())?;
    Relay::new(a, b, config.buffer_sizes, recorder)?.run(cancel)
}

/// Run one session with a caller-supplied recorder.
pub fn run_with<R: Recorder>(
    config: &RelayConfig,
    recorder: R,
    cancel: &CancelToken,
) -> Result<SessionReport, RelayError> {
    let (a, b) = connect_peers(config, cancel)?;
    Relay::new(a, b, config.buffer_sizes, recorder)?.run(cancel)
}

/// Connect to B, then wait for A. Returns `(a, b)`.
pub fn connect_peers(
    config: &RelayConfig,
    cancel: &CancelToken,
) -> Result<(Endpoint, Endpoint), RelayError> {
    info!(addr = %config.b, "connecting to B");
    let b = connector::connect(&config.b, &config.socket_tuning, cancel)?;

    info!(addr = %config.a, "waiting for a connection from A");
    let a = connector::listen_and_accept(&config.a, &config.socket_tuning, cancel)?;

    Ok((a, b))
}
