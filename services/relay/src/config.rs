//! Validated relay configuration.

use crate::cli::{Cli, SizePair};
use crate::connector::SocketTuning;
use crate::endpoint::EndpointAddr;
use crate::error::RelayError;
use crate::recorder::DumpTarget;
use crate::relay::BufferSizes;

/// Everything a relay session needs, checked and ready to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Where to accept A.
    pub a: EndpointAddr,

    /// Where to connect to B.
    pub b: EndpointAddr,

    /// Ring buffer capacity per direction.
    pub buffer_sizes: BufferSizes,

    /// Kernel socket buffer sizes for both endpoints.
    pub socket_tuning: SocketTuning,

    /// Raw dump files, when enabled.
    pub dump: Option<DumpTarget>,

    /// Colored console output.
    pub color: bool,
}

impl RelayConfig {
    /// Build the configuration from parsed command line arguments.
    pub fn from_cli(cli: &Cli) -> Result<Self, RelayError> {
        let buffer_sizes = BufferSizes {
            a_to_b: cli.buffer_sizes.first,
            b_to_a: cli.buffer_sizes.second,
        };

        let socket_tuning = match cli.socket_buffer_sizes {
            Some(SizePair { first, second }) => SocketTuning {
                send_buffer: Some(socket_buffer_size(first)?),
                recv_buffer: Some(socket_buffer_size(second)?),
            },
            None => SocketTuning::default(),
        };

        let dump = match (&cli.dump_prefix, cli.dump) {
            (Some(prefix), _) => Some(DumpTarget::new(prefix.as_str())),
            (None, true) => Some(DumpTarget::default()),
            (None, false) => None,
        };

        Ok(Self {
            a: cli.a.clone(),
            b: cli.b.clone(),
            buffer_sizes,
            socket_tuning,
            dump,
            color: !cli.no_color,
        })
    }
}

/// Socket options take a C `int`.
fn socket_buffer_size(size: usize) -> Result<usize, RelayError> {
    if size > i32::MAX as usize {
        return Err(RelayError::Config(format!(
            "socket buffer size {size} exceeds {}",
            i32::MAX
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn config(args: &[&str]) -> Result<RelayConfig, RelayError> {
        let cli = Cli::try_parse_from(std::iter::once("tap-proxy").chain(args.iter().copied()))
            .unwrap();
        RelayConfig::from_cli(&cli)
    }

    #[test]
    fn test_default_config() {
        let config = config(&["-A", "7000", "-B", "7001"]).unwrap();

        assert_eq!(config.buffer_sizes, BufferSizes::default());
        assert_eq!(config.socket_tuning, SocketTuning::default());
        assert_eq!(config.dump, None);
        assert!(config.color);
    }

    #[test]
    fn test_dump_targets() {
        let plain = config(&["-A", "1", "-B", "2", "-o"]).unwrap();
        assert_eq!(plain.dump, Some(DumpTarget::default()));

        let prefixed = config(&["-A", "1", "-B", "2", "-f", "out/"]).unwrap();
        let target = prefixed.dump.unwrap();
        assert_eq!(
            target.path(crate::flow::Direction::BtoA).to_str(),
            Some("out/BtoA.dump")
        );
    }

    #[test]
    fn test_socket_tuning_split() {
        let args = ["-A", "1", "-B", "2", "-z", "1024:2048", "-b", "8:16", "-c"];
        let config = config(&args).unwrap();

        assert_eq!(config.socket_tuning.send_buffer, Some(1024));
        assert_eq!(config.socket_tuning.recv_buffer, Some(2048));
        assert_eq!(
            config.buffer_sizes,
            BufferSizes {
                a_to_b: 8,
                b_to_a: 16
            }
        );
        assert!(!config.color);
    }

    #[test]
    fn test_socket_buffer_must_fit_int() {
        let err = config(&["-A", "1", "-B", "2", "-z", "0x80000000"]).unwrap_err();
        assert_eq!(err.reason_code(), "config_invalid");
    }
}
