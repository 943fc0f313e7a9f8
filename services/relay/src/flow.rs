//! Per-direction half-duplex flow state.
//!
//! A flow moves bytes from a producer endpoint to a consumer endpoint
//! through its own ring buffer. [`evaluate`] decides, from the half-close
//! state of both endpoints and the buffer fill, whether the flow is still
//! alive and what readiness it wants next.

use std::fmt;

use tap_ringbuf::RingBuffer;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::RelayError;

/// Which way bytes travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    AtoB,
    BtoA,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::AtoB, Direction::BtoA];

    /// Label of the endpoint bytes come from.
    pub fn source(self) -> &'static str {
        match self {
            Direction::AtoB => "A",
            Direction::BtoA => "B",
        }
    }

    /// Label of the endpoint bytes go to.
    pub fn sink(self) -> &'static str {
        match self {
            Direction::AtoB => "B",
            Direction::BtoA => "A",
        }
    }

    /// File name of the raw dump for this direction.
    pub fn dump_file_name(self) -> &'static str {
        match self {
            Direction::AtoB => "AtoB.dump",
            Direction::BtoA => "BtoA.dump",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::AtoB => 0,
            Direction::BtoA => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.sink())
    }
}

/// Liveness of a flow. Never returns to `Open` once it leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    /// Bytes may still move.
    Open,
    /// Finished cleanly: everything read was delivered.
    Closed,
    /// The consumer went away with undelivered bytes in the buffer.
    Broken,
}

impl PipeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PipeStatus::Open)
    }
}

impl fmt::Display for PipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipeStatus::Open => "open",
            PipeStatus::Closed => "closed",
            PipeStatus::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// Readiness a flow asks for in the next wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    /// Producer readable.
    pub read: bool,
    /// Consumer writable.
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
}

fn drained_status(buffer: &RingBuffer) -> PipeStatus {
    if buffer.is_empty() {
        PipeStatus::Closed
    } else {
        PipeStatus::Broken
    }
}

/// Decide the status of one flow and the readiness it needs.
///
/// Half-closes follow the flow: a consumer that stopped accepting bytes
/// shuts the producer's read side, and a producer that finished with an
/// empty buffer shuts the consumer's write side. A producer that finished
/// while bytes are still buffered keeps the flow open until they drain.
pub fn evaluate(
    producer: &mut Endpoint,
    consumer: &mut Endpoint,
    buffer: &RingBuffer,
) -> (Interest, PipeStatus) {
    if consumer.is_write_closed() && producer.is_read_closed() {
        return (Interest::NONE, drained_status(buffer));
    }

    if consumer.is_write_closed() {
        producer.shutdown_read();
        return (Interest::NONE, drained_status(buffer));
    }

    if producer.is_read_closed() && buffer.is_empty() {
        consumer.shutdown_write();
        return (Interest::NONE, PipeStatus::Closed);
    }

    let interest = Interest {
        read: buffer.free() > 0 && !producer.is_read_closed(),
        write: buffer.ready() > 0,
    };
    (interest, PipeStatus::Open)
}

/// One direction of a relay session.
#[derive(Debug)]
pub struct Flow {
    direction: Direction,
    pub(crate) buffer: RingBuffer,
    status: PipeStatus,
    /// Bytes read from the producer; also the stream offset of the next one.
    pub(crate) received: u64,
    /// Bytes written to the consumer.
    pub(crate) delivered: u64,
}

impl Flow {
    pub fn new(direction: Direction, capacity: usize) -> Result<Self, RelayError> {
        let buffer = RingBuffer::new(capacity)
            .map_err(|e| RelayError::Config(format!("{direction} buffer: {e}")))?;

        Ok(Self {
            direction,
            buffer,
            status: PipeStatus::Open,
            received: 0,
            delivered: 0,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> PipeStatus {
        self.status
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Re-evaluate an open flow; a terminal flow stays as it is and wants
    /// nothing.
    pub fn refresh(&mut self, producer: &mut Endpoint, consumer: &mut Endpoint) -> Interest {
        if self.status.is_terminal() {
            return Interest::NONE;
        }

        let (interest, status) = evaluate(producer, consumer, &self.buffer);
        if status.is_terminal() {
            debug!(
                direction = %self.direction,
                status = %status,
                received = self.received,
                delivered = self.delivered,
                "flow finished"
            );
        }
        self.status = status;
        interest
    }
}
