//! Cancellation tokens.
//!
//! A [`Cancellable`] flips from not-cancelled to cancelled exactly once
//! per arming (it can be [`reset`]), notifies listeners, and optionally
//! exposes a pollable fd so event loops and foreign poll sets can wait
//! on cancellation.
//!
//! [`reset`]: Cancellable::reset

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};

use log::warn;
use nix::poll::PollFlags;

use crate::error::Error;
use crate::poll::Wakeup;
use crate::source::{dispatch_or_remove, Callback, Dispatch, Source, SourceFuncs};

/// Identifies a connected listener. The zero id is returned when the
/// listener fired immediately because the token was already cancelled;
/// disconnecting it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

impl HandlerId {
    /// True when [`Cancellable::connect`] ran the listener on the spot
    /// instead of storing it.
    pub fn is_immediate(self) -> bool {
        self.0 == 0
    }
}

type ListenerFn = Arc<Mutex<Box<dyn FnMut() + Send>>>;

struct CancState {
    cancelled: bool,
    /// Listener notification in progress; disconnect and reset wait on it.
    cancelled_running: bool,
    listeners: Vec<(u64, ListenerFn)>,
    next_handler: u64,
    fd_refcount: usize,
    wakeup: Option<Wakeup>,
}

struct CancInner {
    state: Mutex<CancState>,
    cond: Condvar,
}

/// Handle to a cancellation token. Clones share the token.
#[derive(Clone)]
pub struct Cancellable {
    inner: Arc<CancInner>,
}

impl Default for Cancellable {
    fn default() -> Cancellable {
        Cancellable::new()
    }
}

impl Cancellable {
    pub fn new() -> Cancellable {
        Cancellable {
            inner: Arc::new(CancInner {
                state: Mutex::new(CancState {
                    cancelled: false,
                    cancelled_running: false,
                    listeners: Vec::new(),
                    next_handler: 1,
                    fd_refcount: 0,
                    wakeup: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().unwrap().cancelled
    }

    /// `Err(Cancelled)` when the token has been cancelled.
    pub fn set_error_if_cancelled(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancel the token. Idempotent: the first call per arming notifies
    /// every listener exactly once, later calls do nothing.
    ///
    /// Listeners run on the calling thread with no token lock held, so
    /// they may inspect the token freely; disconnecting or resetting from
    /// inside a listener deadlocks.
    pub fn cancel(&self) {
        let listeners: Vec<ListenerFn> = {
            let mut st = self.inner.state.lock().unwrap();
            if st.cancelled {
                return;
            }
            st.cancelled = true;
            st.cancelled_running = true;
            if let Some(wakeup) = &st.wakeup {
                wakeup.signal();
            }
            st.listeners.iter().map(|(_, f)| f.clone()).collect()
        };

        for listener in listeners {
            (listener.lock().unwrap())();
        }

        let mut st = self.inner.state.lock().unwrap();
        st.cancelled_running = false;
        drop(st);
        self.inner.cond.notify_all();
    }

    /// Register `f` to run when the token is cancelled. If it already is,
    /// `f` runs right here and the returned id is immediate.
    ///
    /// Listeners survive [`reset`](Cancellable::reset) and fire again on
    /// the next cancel.
    pub fn connect(&self, f: impl FnMut() + Send + 'static) -> HandlerId {
        let mut f: Box<dyn FnMut() + Send> = Box::new(f);
        {
            let mut st = self.inner.state.lock().unwrap();
            if !st.cancelled {
                let id = st.next_handler;
                st.next_handler += 1;
                st.listeners.push((id, Arc::new(Mutex::new(f))));
                return HandlerId(id);
            }
        }
        f();
        HandlerId(0)
    }

    /// Remove a listener. Blocks while a cancel notification is in
    /// flight, so after this returns the listener is guaranteed not to be
    /// running and never to run again.
    pub fn disconnect(&self, id: HandlerId) {
        if id.is_immediate() {
            return;
        }
        let mut st = self.inner.state.lock().unwrap();
        while st.cancelled_running {
            st = self.inner.cond.wait(st).unwrap();
        }
        st.listeners.retain(|(i, _)| *i != id.0);
    }

    /// Remove a listener without waiting for an in-flight notification.
    /// Used where the caller tolerates one final spurious callback.
    pub(crate) fn disconnect_unnotified(&self, id: HandlerId) {
        if id.is_immediate() {
            return;
        }
        self.inner
            .state
            .lock()
            .unwrap()
            .listeners
            .retain(|(i, _)| *i != id.0);
    }

    /// Re-arm a cancelled token for reuse. Waits for an in-flight
    /// notification to finish and drains the pollable fd. Listeners stay
    /// connected.
    pub fn reset(&self) {
        let mut st = self.inner.state.lock().unwrap();
        while st.cancelled_running {
            st = self.inner.cond.wait(st).unwrap();
        }
        if st.cancelled {
            st.cancelled = false;
            if let Some(wakeup) = &st.wakeup {
                wakeup.acknowledge();
            }
        }
    }

    /// A pollable fd that becomes readable when the token is cancelled.
    /// `None` when the eventfd cannot be created (fd exhaustion); callers
    /// must degrade to flag polling. Balance with
    /// [`release_fd`](Cancellable::release_fd).
    pub fn get_fd(&self) -> Option<RawFd> {
        let mut st = self.inner.state.lock().unwrap();
        if st.wakeup.is_none() {
            match Wakeup::new() {
                Ok(wakeup) => {
                    if st.cancelled {
                        wakeup.signal();
                    }
                    st.wakeup = Some(wakeup);
                }
                Err(err) => {
                    warn!("cancellable fd unavailable: {}", err);
                    return None;
                }
            }
        }
        st.fd_refcount += 1;
        st.wakeup.as_ref().map(|w| w.raw_fd())
    }

    /// Release one [`get_fd`](Cancellable::get_fd) reference; the fd is
    /// closed when the count drops to zero.
    pub fn release_fd(&self) {
        let mut st = self.inner.state.lock().unwrap();
        assert!(st.fd_refcount > 0, "release_fd without a matching get_fd");
        st.fd_refcount -= 1;
        if st.fd_refcount == 0 {
            st.wakeup = None;
        }
    }

    /// A source that dispatches when the token is cancelled, meant to be
    /// added as a child source of an operation's main source. Polls the
    /// token's fd, so a blocked iteration wakes on a cross-thread cancel;
    /// without an fd it degrades to checking the flag each iteration.
    pub fn source(&self) -> Source {
        let fd = self.get_fd();
        let source = Source::new(CancellableFuncs {
            cancellable: self.clone(),
            got_fd: fd.is_some(),
        });
        source.set_name("cancellable");
        if let Some(fd) = fd {
            source.add_unix_fd(fd, PollFlags::POLLIN);
        }
        source
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("Cancellable")
            .field("cancelled", &st.cancelled)
            .field("listeners", &st.listeners.len())
            .finish()
    }
}

struct CancellableFuncs {
    cancellable: Cancellable,
    got_fd: bool,
}

impl SourceFuncs for CancellableFuncs {
    fn prepare(&mut self, _source: &Source) -> (bool, Option<std::time::Duration>) {
        (self.cancellable.is_cancelled(), None)
    }

    fn check(&mut self, _source: &Source) -> bool {
        self.cancellable.is_cancelled()
    }

    fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
        dispatch_or_remove(source, &mut callback)
    }
}

impl Drop for CancellableFuncs {
    fn drop(&mut self) {
        if self.got_fd {
            self.cancellable.release_fd();
        }
    }
}
