//! The single-threaded relay loop.
//!
//! Each iteration re-evaluates both flows, blocks once in the signal-masked
//! wait on the union of their interests, then runs at most one read and one
//! write per direction (A to B first) against that single readiness result.

use std::io;
use std::os::fd::AsFd;

use nix::poll::{PollFd, PollFlags};
use tracing::{debug, info};

use crate::endpoint::{Endpoint, HalfDuplex};
use crate::error::RelayError;
use crate::flow::{Direction, Flow, Interest, PipeStatus};
use crate::recorder::Recorder;
use crate::signal::{self, CancelToken};

/// Default ring buffer capacity per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Ring buffer capacity per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub a_to_b: usize,
    pub b_to_a: usize,
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self {
            a_to_b: DEFAULT_BUFFER_SIZE,
            b_to_a: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Outcome of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowReport {
    pub status: PipeStatus,
    /// Bytes read from the producer.
    pub received: u64,
    /// Bytes written to the consumer.
    pub delivered: u64,
}

impl From<&Flow> for FlowReport {
    fn from(flow: &Flow) -> Self {
        Self {
            status: flow.status(),
            received: flow.received(),
            delivered: flow.delivered(),
        }
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub a_to_b: FlowReport,
    pub b_to_a: FlowReport,
}

impl SessionReport {
    pub fn flow(&self, direction: Direction) -> &FlowReport {
        match direction {
            Direction::AtoB => &self.a_to_b,
            Direction::BtoA => &self.b_to_a,
        }
    }
}

/// What a single step may do for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Readiness {
    read: bool,
    write: bool,
}

impl Readiness {
    /// Mask reported events by the interest that was asked for.
    fn gate(interest: Interest, producer: PollFlags, consumer: PollFlags) -> Self {
        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
        Self {
            read: interest.read && producer.intersects(PollFlags::POLLIN | hangup),
            write: interest.write && consumer.intersects(PollFlags::POLLOUT | hangup),
        }
    }
}

fn poll_events(read: bool, write: bool) -> PollFlags {
    let mut events = PollFlags::empty();
    if read {
        events |= PollFlags::POLLIN;
    }
    if write {
        events |= PollFlags::POLLOUT;
    }
    events
}

/// A relay session between an accepted endpoint A and a connected
/// endpoint B.
///
/// Fields drop in declaration order: the recorder first, then the buffers,
/// then both endpoints.
pub struct Relay<R: Recorder> {
    recorder: R,
    a_to_b: Flow,
    b_to_a: Flow,
    a: Endpoint,
    b: Endpoint,
}

impl<R: Recorder> Relay<R> {
    pub fn new(
        a: Endpoint,
        b: Endpoint,
        sizes: BufferSizes,
        recorder: R,
    ) -> Result<Self, RelayError> {
        debug!(
            a_to_b = sizes.a_to_b,
            b_to_a = sizes.b_to_a,
            "allocating relay buffers"
        );
        let a_to_b = Flow::new(Direction::AtoB, sizes.a_to_b)?;
        let b_to_a = Flow::new(Direction::BtoA, sizes.b_to_a)?;

        Ok(Self {
            recorder,
            a_to_b,
            b_to_a,
            a,
            b,
        })
    }

    /// Relay until both directions are finished.
    ///
    /// Every endpoint is shut down and closed when this returns, whatever
    /// the outcome.
    pub fn run(mut self, cancel: &CancelToken) -> Result<SessionReport, RelayError> {
        info!(a = ?self.a.peer_addr(), b = ?self.b.peer_addr(), "relay session started");

        loop {
            let a_to_b = self.a_to_b.refresh(&mut self.a, &mut self.b);
            let b_to_a = self.b_to_a.refresh(&mut self.b, &mut self.a);

            if self.a_to_b.status().is_terminal() && self.b_to_a.status().is_terminal() {
                break;
            }

            let (a_revents, b_revents) = self.wait(a_to_b, b_to_a, cancel)?;

            relay_step(
                &mut self.a_to_b,
                &mut self.a,
                &mut self.b,
                Readiness::gate(a_to_b, a_revents, b_revents),
                &mut self.recorder,
                cancel,
            )?;
            relay_step(
                &mut self.b_to_a,
                &mut self.b,
                &mut self.a,
                Readiness::gate(b_to_a, b_revents, a_revents),
                &mut self.recorder,
                cancel,
            )?;
        }

        let report = SessionReport {
            a_to_b: FlowReport::from(&self.a_to_b),
            b_to_a: FlowReport::from(&self.b_to_a),
        };
        info!(
            a_to_b = %report.a_to_b.status,
            a_to_b_bytes = report.a_to_b.delivered,
            b_to_a = %report.b_to_a.status,
            b_to_a_bytes = report.b_to_a.delivered,
            "relay session finished"
        );
        Ok(report)
    }

    /// Block until an endpoint is ready; returns the reported events of A
    /// and B.
    ///
    /// An endpoint with nothing to wait for is left out of the poll set, so
    /// a hung-up peer cannot keep waking the loop.
    fn wait(
        &self,
        a_to_b: Interest,
        b_to_a: Interest,
        cancel: &CancelToken,
    ) -> Result<(PollFlags, PollFlags), RelayError> {
        let a_events = poll_events(a_to_b.read, b_to_a.write);
        let b_events = poll_events(b_to_a.read, a_to_b.write);

        let mut fds = Vec::with_capacity(2);
        let mut slots = [None, None];
        for (slot, (endpoint, events)) in [(&self.a, a_events), (&self.b, b_events)]
            .into_iter()
            .enumerate()
        {
            if !events.is_empty() {
                slots[slot] = Some(fds.len());
                fds.push(PollFd::new(endpoint.as_fd(), events));
            }
        }

        signal::wait(&mut fds, None, cancel).map_err(|e| e.into_relay(RelayError::Wait))?;

        let revents =
            |slot: Option<usize>| slot.and_then(|i| fds[i].revents()).unwrap_or(PollFlags::empty());
        Ok((revents(slots[0]), revents(slots[1])))
    }
}

/// At most one read from the producer and one write to the consumer.
fn relay_step<P, C, R>(
    flow: &mut Flow,
    producer: &mut P,
    consumer: &mut C,
    ready: Readiness,
    recorder: &mut R,
    cancel: &CancelToken,
) -> Result<(), RelayError>
where
    P: HalfDuplex,
    C: HalfDuplex,
    R: Recorder,
{
    let direction = flow.direction();
    let io_error = |source: io::Error| RelayError::Io { direction, source };
    let mut produced = false;

    if ready.read {
        let read = signal::retry_eintr(cancel, || producer.read(flow.buffer.free_span_mut()));
        match read {
            Err(e) if e.is_would_block() => {}
            Err(e) => return Err(e.into_relay(io_error)),
            Ok(0) => {
                produced = true;
                debug!(direction = %direction, "producer finished");
                producer.shutdown_read();
                recorder.on_shutdown(direction)?;
            }
            Ok(n) => {
                produced = true;
                recorder.on_sent(direction, &flow.buffer.free_span_mut()[..n], flow.received)?;
                flow.buffer.advance_head(n);
                flow.received += n as u64;
            }
        }
    }

    if ready.write {
        let written = signal::retry_eintr(cancel, || consumer.write(flow.buffer.ready_span()));
        match written {
            Err(e) if e.is_would_block() => {}
            Err(e) => return Err(e.into_relay(io_error)),
            // a send of a non-empty span returning 0 is taken as the
            // consumer going away
            Ok(0) => {
                debug!(direction = %direction, "consumer accepted nothing");
                consumer.shutdown_write();
                recorder.on_shutdown(direction)?;
            }
            Ok(n) => {
                flow.buffer.advance_tail(n);
                flow.delivered += n as u64;
                recorder.on_remaining(direction, n)?;
            }
        }
    } else if produced {
        recorder.on_remaining(direction, 0)?;
    }

    Ok(())
}
