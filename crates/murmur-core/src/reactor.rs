use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, Waker, event::Source};
use tracing::{debug, error, trace};

/// Token of the listening socket. Session tokens are allocated from 1.
pub const LISTENER: Token = Token(0);
const WAKER: Token = Token(usize::MAX);

/// Bounded demultiplexer wait so a stop request is observed promptly even
/// without the waker.
const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// One decoded readiness notification.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error, hang-up or peer half-close. Takes priority over the others.
    pub closed: bool,
}

/// Single-threaded readiness demultiplexer. `run` blocks on the owning
/// thread; registration and stop are driven through cloneable [`Handle`]s.
/// mio delivers edge-triggered semantics, so consumers must drain sockets
/// until `WouldBlock`.
pub struct Reactor {
    poll: Poll,
    events: Events,
    handle: Handle,
}

#[derive(Clone)]
pub struct Handle {
    registry: Arc<Registry>,
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let registry = poll.registry().try_clone()?;
        let handle = Handle {
            registry: Arc::new(registry),
            waker: Arc::new(waker),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        Ok(Self { poll, events: Events::with_capacity(1024), handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Polls and dispatches until [`Handle::stop`] is called. Events of one
    /// wakeup are dispatched in arrival order. `dispatch` runs on the
    /// reactor thread and must only schedule work, never block on it.
    pub fn run(&mut self, mut dispatch: impl FnMut(Readiness)) {
        debug!("reactor: running");
        while !self.handle.is_stopped() {
            match self.poll.poll(&mut self.events, Some(WAIT_TIMEOUT)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Losing the demultiplexer is not recoverable; treat it
                    // as a stop so the process can tear down.
                    error!(?err, "reactor: poll failed, stopping");
                    self.handle.stop();
                    break;
                }
            }

            for event in self.events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                trace!(token = ?event.token(), "reactor: event");
                dispatch(Readiness {
                    token: event.token(),
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    closed: event.is_error() || event.is_read_closed(),
                });
            }
        }
        debug!("reactor: stopped");
    }
}

impl Handle {
    pub fn register(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)
    }

    pub fn reregister(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    /// Safe to call for a source that was already deregistered.
    pub fn deregister(&self, source: &mut impl Source) {
        if let Err(err) = self.registry.deregister(source) {
            debug!(?err, "reactor: deregister");
        }
    }

    /// Idempotent; callable from any thread. Wakes the reactor so the stop
    /// flag is observed without waiting out the poll timeout.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.waker.wake() {
                debug!(?err, "reactor: wake on stop");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
