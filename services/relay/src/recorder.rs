//! Recording of the bytes crossing each direction.
//!
//! The relay core reports three events per direction through [`Recorder`]:
//! bytes read from the producer, progress of the consumer, and half-close.
//! [`Hexdump`] renders them as a colored hexdump on a console writer and
//! optionally appends the raw bytes, hex encoded, to one dump file per
//! direction.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use colored::{Color, Colorize};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::flow::Direction;

/// Bytes per hexdump line, and per line of a raw dump file.
pub const BYTES_PER_LINE: usize = 16;

const HALF_LINE: usize = BYTES_PER_LINE / 2;

/// Observer of relay progress.
pub trait Recorder {
    /// `bytes` were read from the producer, starting at stream `offset`.
    fn on_sent(&mut self, direction: Direction, bytes: &[u8], offset: u64)
        -> Result<(), RelayError>;

    /// The consumer accepted `consumed` more bytes (possibly zero).
    fn on_remaining(&mut self, direction: Direction, consumed: usize) -> Result<(), RelayError>;

    /// One side of the direction was half-closed.
    fn on_shutdown(&mut self, direction: Direction) -> Result<(), RelayError>;
}

impl<R: Recorder + ?Sized> Recorder for &mut R {
    fn on_sent(
        &mut self,
        direction: Direction,
        bytes: &[u8],
        offset: u64,
    ) -> Result<(), RelayError> {
        (**self).on_sent(direction, bytes, offset)
    }

    fn on_remaining(&mut self, direction: Direction, consumed: usize) -> Result<(), RelayError> {
        (**self).on_remaining(direction, consumed)
    }

    fn on_shutdown(&mut self, direction: Direction) -> Result<(), RelayError> {
        (**self).on_shutdown(direction)
    }
}

/// Where raw dump files go: `<prefix>AtoB.dump` and `<prefix>BtoA.dump`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DumpTarget {
    pub prefix: String,
}

impl DumpTarget {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn path(&self, direction: Direction) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, direction.dump_file_name()))
    }
}

/// Raw hex dump of one direction, readable back with `xxd -p -r`.
#[derive(Debug)]
struct DumpFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DumpFile {
    fn create(path: PathBuf) -> Result<Self, RelayError> {
        let file = File::create(&path).map_err(|source| RelayError::Recording {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "recording raw dump");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, bytes: &[u8], offset: u64) -> Result<(), RelayError> {
        let encoded = raw_hex(bytes, offset);
        self.writer
            .write_all(encoded.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|source| RelayError::Recording {
                path: self.path.clone(),
                source,
            })
    }
}

/// Lowercase hex of `bytes` with a newline after every 16th stream byte.
pub fn raw_hex(bytes: &[u8], offset: u64) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + bytes.len() / BYTES_PER_LINE + 1);
    let mut rest = bytes;
    let mut column = (offset % BYTES_PER_LINE as u64) as usize;

    while !rest.is_empty() {
        let take = rest.len().min(BYTES_PER_LINE - column);
        let (chunk, tail) = rest.split_at(take);

        out.push_str(&hex::encode(chunk));
        column += take;
        if column == BYTES_PER_LINE {
            out.push('\n');
            column = 0;
        }
        rest = tail;
    }

    out
}

/// Hexdump lines for `bytes` starting at stream `offset`.
///
/// Each line covers one 16-byte aligned window of the stream, so a span
/// that starts mid-window leaves the leading columns blank. The line
/// prefix is the offset of its first byte.
pub fn hex_lines(bytes: &[u8], offset: u64) -> Vec<String> {
    let mut lines = Vec::with_capacity(bytes.len() / BYTES_PER_LINE + 2);
    let mut rest = bytes;
    let mut offset = offset;

    while !rest.is_empty() {
        let lead = (offset % BYTES_PER_LINE as u64) as usize;
        let take = rest.len().min(BYTES_PER_LINE - lead);
        let (chunk, tail) = rest.split_at(take);

        let mut line = format!("{offset:08x}  ");
        let mut ascii = String::with_capacity(BYTES_PER_LINE);

        for column in 0..BYTES_PER_LINE {
            if column == HALF_LINE {
                line.push(' ');
            }
            match column.checked_sub(lead).and_then(|i| chunk.get(i)) {
                Some(byte) => {
                    line.push_str(&format!("{byte:02x} "));
                    ascii.push(printable(*byte));
                }
                None => {
                    line.push_str("   ");
                    ascii.push(' ');
                }
            }
        }

        line.push_str(" |");
        line.push_str(&ascii);
        line.push('|');
        lines.push(line);

        offset += take as u64;
        rest = tail;
    }

    lines
}

fn printable(byte: u8) -> char {
    if byte == b' ' || byte.is_ascii_graphic() {
        char::from(byte)
    } else {
        '.'
    }
}

/// Per-direction recorder state.
#[derive(Debug, Default)]
struct Lane {
    /// Stream offset just past the last byte read.
    sent: u64,
    /// Bytes the consumer has accepted.
    consumed: u64,
    dump: Option<DumpFile>,
}

/// Console hexdump recorder with optional raw dump files.
///
/// Console write failures are ignored; dump file failures end the session.
#[derive(Debug)]
pub struct Hexdump<W: Write> {
    out: W,
    color: bool,
    lanes: [Lane; 2],
}

impl<W: Write> Hexdump<W> {
    /// Create the recorder, opening the dump files when `dump` is set.
    pub fn new(out: W, color: bool, dump: Option<&DumpTarget>) -> Result<Self, RelayError> {
        let mut lanes: [Lane; 2] = Default::default();

        if let Some(target) = dump {
            for direction in Direction::ALL {
                let file = DumpFile::create(target.path(direction))?;
                lanes[direction.index()].dump = Some(file);
            }
        }

        Ok(Self { out, color, lanes })
    }

    /// Paths of the dump files being written, if any.
    pub fn dump_paths(&self) -> Vec<&Path> {
        self.lanes
            .iter()
            .filter_map(|lane| lane.dump.as_ref().map(|d| d.path.as_path()))
            .collect()
    }

    /// Consume the recorder, returning the console writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn paint(&self, direction: Direction, text: &str, bold: bool) -> String {
        if !self.color {
            return text.to_string();
        }

        let color = match direction {
            Direction::AtoB => Color::BrightRed,
            Direction::BtoA => Color::BrightBlue,
        };
        let painted = text.color(color);
        if bold {
            painted.bold().to_string()
        } else {
            painted.to_string()
        }
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self
            .out
            .write_all(text.as_bytes())
            .and_then(|()| self.out.flush())
        {
            debug!(error = %e, "console write failed");
        }
    }
}

impl<W: Write> Recorder for Hexdump<W> {
    fn on_sent(
        &mut self,
        direction: Direction,
        bytes: &[u8],
        offset: u64,
    ) -> Result<(), RelayError> {
        if bytes.is_empty() {
            return Ok(());
        }

        if let Some(dump) = self.lanes[direction.index()].dump.as_mut() {
            dump.append(bytes, offset)?;
        }

        let mut text = self.paint(
            direction,
            &format!("{direction} sent {} bytes", bytes.len()),
            false,
        );
        text.push('\n');
        for line in hex_lines(bytes, offset) {
            text.push_str(&self.paint(direction, &line, true));
            text.push('\n');
        }
        self.emit(&text);

        self.lanes[direction.index()].sent = offset + bytes.len() as u64;
        Ok(())
    }

    fn on_remaining(&mut self, direction: Direction, consumed: usize) -> Result<(), RelayError> {
        let lane = &mut self.lanes[direction.index()];
        lane.consumed += consumed as u64;

        let message = if lane.consumed >= lane.sent {
            format!("{} is in sync", direction.sink())
        } else {
            format!(
                "{} is {} bytes behind",
                direction.sink(),
                lane.sent - lane.consumed
            )
        };

        let mut text = self.paint(direction, &message, false);
        text.push('\n');
        self.emit(&text);
        Ok(())
    }

    fn on_shutdown(&mut self, direction: Direction) -> Result<(), RelayError> {
        let mut text = self.paint(direction, &format!("{direction} flow shutdown"), false);
        text.push('\n');
        self.emit(&text);
        Ok(())
    }
}
