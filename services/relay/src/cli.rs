//! Command line interface.

use clap::{Parser, ValueEnum};

use crate::endpoint::EndpointAddr;

/// Observing TCP relay: waits for a connection from A, connects to B and
/// prints every byte crossing each direction as a hexdump.
///
/// Addresses take the form host:serv, :serv or serv (host defaults to
/// localhost); serv is a port number or a service name.
#[derive(Debug, Parser)]
#[command(name = "tap-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to accept the connection from A on.
    #[arg(short = 'A', value_name = "ADDR")]
    pub a: EndpointAddr,

    /// Address of B to connect to.
    #[arg(short = 'B', value_name = "ADDR")]
    pub b: EndpointAddr,

    /// Relay buffer sizes in bytes: one value for both directions, or
    /// A->B:B->A.
    #[arg(
        short = 'b',
        value_name = "BSZ[:BSZ]",
        value_parser = parse_size_pair,
        default_value = "2048"
    )]
    pub buffer_sizes: SizePair,

    /// Socket buffer sizes in bytes: one value for both, or SND:RCV.
    /// Left at the system default when omitted.
    #[arg(short = 'z', value_name = "BSZ[:BSZ]", value_parser = parse_size_pair)]
    pub socket_buffer_sizes: Option<SizePair>,

    /// Save the raw bytes of each direction to AtoB.dump and BtoA.dump
    /// (recover with `xxd -p -r`).
    #[arg(short = 'o', conflicts_with = "dump_prefix")]
    pub dump: bool,

    /// Like -o, prefixing both dump file names with PREFIX.
    #[arg(short = 'f', value_name = "PREFIX")]
    pub dump_prefix: Option<String>,

    /// Disable colors.
    #[arg(short = 'c')]
    pub no_color: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format for stderr.
    #[arg(long, value_enum, env = "TAP_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Diagnostic log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable, one line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Two sizes given as `n` or `n:m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePair {
    pub first: usize,
    pub second: usize,
}

/// Parse `n` (both values) or `n:m`.
pub fn parse_size_pair(s: &str) -> Result<SizePair, String> {
    match s.rsplit_once(':') {
        Some((first, second)) => Ok(SizePair {
            first: parse_size(first)?,
            second: parse_size(second)?,
        }),
        None => {
            let size = parse_size(s)?;
            Ok(SizePair {
                first: size,
                second: size,
            })
        }
    }
}

/// Parse a positive size: decimal, `0x` hexadecimal or leading-zero octal.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let trimmed = s.trim();

    let (digits, radix) = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        (hex, 16)
    } else if trimmed.len() > 1 && trimmed.starts_with('0') {
        (&trimmed[1..], 8)
    } else {
        (trimmed, 10)
    };

    let value =
        usize::from_str_radix(digits, radix).map_err(|e| format!("invalid size '{s}': {e}"))?;
    if value == 0 {
        return Err(format!("invalid size '{s}': must be greater than zero"));
    }
    Ok(value)
}
