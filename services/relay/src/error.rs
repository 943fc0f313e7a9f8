//! Error types for the relay.

use std::io;
use std::path::PathBuf;

use colored::Colorize;
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::endpoint::EndpointAddr;
use crate::flow::Direction;

/// Relay errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Address lookup failed; no connection exists yet.
    #[error("address resolution failed for {addr}: {detail}")]
    Resolution { addr: EndpointAddr, detail: String },

    /// socket/bind/listen/connect/setsockopt failed on every candidate.
    #[error("socket setup failed for {addr}: {source}")]
    SocketSetup {
        addr: EndpointAddr,
        #[source]
        source: io::Error,
    },

    /// A termination signal was caught while blocked.
    #[error("interrupted by {0}")]
    Interrupted(Signal),

    /// Read or write failed mid-session.
    #[error("{direction} relay failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// The multiplexed readiness wait itself failed.
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    /// A dump file could not be created or written.
    #[error("recording to {} failed: {source}", path.display())]
    Recording {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration or buffer allocation failure.
    #[error("{0}")]
    Config(String),

    /// Signal handling could not be installed.
    #[error("signal setup failed: {0}")]
    SignalSetup(#[from] nix::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Resolution { .. } => "resolution_failed",
            RelayError::SocketSetup { .. } => "socket_setup_failed",
            RelayError::Interrupted(_) => "interrupted",
            RelayError::Io { .. } => "io_error",
            RelayError::Wait(_) => "wait_failed",
            RelayError::Recording { .. } => "recording_failed",
            RelayError::Config(_) => "config_invalid",
            RelayError::SignalSetup(_) => "signal_setup_failed",
        }
    }

    /// True when the session ended because of a caught signal.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RelayError::Interrupted(_))
    }

    /// Process exit status for this error: `128 + signal` when interrupted,
    /// 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            RelayError::Interrupted(signal) => 128u8.saturating_add(*signal as i32 as u8),
            _ => 1,
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let hint = match err.downcast_ref::<RelayError>() {
        Some(RelayError::Resolution { .. }) => {
            Some("Hint: Check the host name, and that the service name is listed in /etc/services.")
        }
        Some(RelayError::SocketSetup { .. }) => {
            Some("Hint: Check that B is listening and that the address of A is free to bind.")
        }
        Some(RelayError::Io { .. }) => {
            Some("Hint: One of the peers reset the connection.")
        }
        Some(RelayError::Recording { .. }) => {
            Some("Hint: Check that the dump file directory exists and is writable.")
        }
        Some(RelayError::Config(_)) => Some("Hint: Run `tap-proxy --help` for usage."),
        _ => None,
    };

    if let Some(hint) = hint {
        eprintln!("\n{}", hint.yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_exit_code() {
        let err = RelayError::Interrupted(Signal::SIGTERM);
        assert!(err.is_interrupted());
        assert_eq!(err.exit_code(), 128 + 15);
        assert_eq!(err.reason_code(), "interrupted");

        assert_eq!(RelayError::Interrupted(Signal::SIGINT).exit_code(), 130);
    }

    #[test]
    fn test_failures_exit_with_one() {
        let err = RelayError::Io {
            direction: Direction::AtoB,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(!err.is_interrupted());
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().starts_with("A -> B relay failed"));
    }
}
