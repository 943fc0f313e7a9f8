//! Cooperative cancellation driven by termination signals.
//!
//! Termination signals stay blocked everywhere except inside [`wait`], which
//! hands the unblocking mask to `ppoll(2)` so unmasking and blocking happen
//! atomically. A signal that arrives between "am I cancelled?" and the wait
//! stays pending and interrupts the wait instead of being lost.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{ppoll, PollFd};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::time::TimeSpec;
use thiserror::Error;
use tracing::debug;

use crate::error::RelayError;

/// Signals that cancel the session.
const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// Synchronous faults (undefined behavior when blocked) and job control.
const NEVER_BLOCKED: [Signal; 8] = [
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGCONT,
];

/// Flag the process-wide handler writes into.
static HANDLER_FLAG: OnceLock<Arc<AtomicI32>> = OnceLock::new();

extern "C" fn on_termination(signum: libc::c_int) {
    if let Some(flag) = HANDLER_FLAG.get() {
        // keep the first signal only
        let _ = flag.compare_exchange(0, signum, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Cancellation token threaded through every blocking call.
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// 0, or the number of the first caught signal.
    flag: Arc<AtomicI32>,
    /// Mask applied for the duration of each wait.
    wait_mask: Option<SigSet>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token not tied to any signal handler.
    ///
    /// Waits run with the caller's signal mask; cancellation only happens
    /// through [`CancelToken::cancel`].
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicI32::new(0)),
            wait_mask: None,
        }
    }

    /// Block signals, install the termination handlers and return the
    /// process-wide token.
    ///
    /// SIGINT, SIGTERM and SIGQUIT record themselves in the token; SIGPIPE
    /// is ignored. All of them are only deliverable while blocked in
    /// [`wait`]. Must be called once, before any other thread is spawned.
    pub fn install() -> Result<Self, RelayError> {
        let flag = Arc::new(AtomicI32::new(0));
        if HANDLER_FLAG.set(Arc::clone(&flag)).is_err() {
            return Err(RelayError::SignalSetup(Errno::EBUSY));
        }

        let mut blocked = SigSet::all();
        for sig in NEVER_BLOCKED {
            blocked.remove(sig);
        }
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), None)?;

        // no SA_RESTART: blocking calls must see EINTR
        let handler = SigAction::new(
            SigHandler::Handler(on_termination),
            SaFlags::empty(),
            SigSet::all(),
        );
        for sig in TERMINATION_SIGNALS {
            // SAFETY: the handler only performs an atomic compare-exchange.
            unsafe { signal::sigaction(sig, &handler)? };
        }

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: SIG_IGN installs no code.
        unsafe { signal::sigaction(Signal::SIGPIPE, &ignore)? };

        let mut wait_mask = blocked;
        for sig in TERMINATION_SIGNALS {
            wait_mask.remove(sig);
        }
        wait_mask.remove(Signal::SIGPIPE);

        debug!("termination signal handlers installed");

        Ok(Self {
            flag,
            wait_mask: Some(wait_mask),
        })
    }

    /// Request cancellation as if `signal` had been caught.
    pub fn cancel(&self, signal: Signal) {
        let _ = self
            .flag
            .compare_exchange(0, signal as i32, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The signal that cancelled the session, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self.flag.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Signal::try_from(raw).unwrap_or(Signal::SIGTERM)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal().is_some()
    }
}

/// Failure of a blocking call run under [`retry_eintr`].
#[derive(Debug, Error)]
pub enum WaitError {
    /// The cancellation flag was set when the call got EINTR.
    #[error("interrupted by {0}")]
    Interrupted(Signal),

    /// Any other failure, EINTR excluded.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WaitError {
    /// Convert into a [`RelayError`], classifying I/O failures with `io`.
    pub fn into_relay(self, io: impl FnOnce(io::Error) -> RelayError) -> RelayError {
        match self {
            WaitError::Interrupted(signal) => RelayError::Interrupted(signal),
            WaitError::Io(source) => io(source),
        }
    }

    /// True for `EAGAIN`/`EWOULDBLOCK`.
    pub fn is_would_block(&self) -> bool {
        matches!(self, WaitError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Run `op`, retrying it on EINTR unless `cancel` has been triggered.
pub fn retry_eintr<T, F>(cancel: &CancelToken, mut op: F) -> Result<T, WaitError>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if let Some(signal) = cancel.signal() {
                    return Err(WaitError::Interrupted(signal));
                }
            }
            result => return result.map_err(WaitError::Io),
        }
    }
}

/// Block until one of `fds` is ready or `timeout` elapses.
///
/// Termination signals are unblocked only for the duration of the call.
/// Returns the number of ready descriptors (0 on timeout).
pub fn wait(
    fds: &mut [PollFd<'_>],
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<usize, WaitError> {
    if let Some(signal) = cancel.signal() {
        return Err(WaitError::Interrupted(signal));
    }

    let timeout = timeout.map(TimeSpec::from_duration);
    retry_eintr(cancel, || {
        ppoll(&mut *fds, timeout, cancel.wait_mask)
            .map(|ready| ready as usize)
            .map_err(io::Error::from)
    })
}

/// Sleep for `duration`, waking early only on cancellation.
pub fn sleep(duration: Duration, cancel: &CancelToken) -> Result<(), WaitError> {
    wait(&mut [], Some(duration), cancel).map(|_| ())
}
