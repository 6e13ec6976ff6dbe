//! Event sources.
//!
//! A [`Source`] is a cheap cloneable handle; every clone refers to the
//! same underlying source. Sources carry a priority, an optional ready
//! time, optional fd watches, and optional child sources, and become
//! dispatchable once attached to a [`MainContext`].
//!
//! [`MainContext`]: crate::MainContext

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::warn;
use mainstay_utils::Spinlock;
use nix::poll::PollFlags;

use crate::context::{ContextInner, MainContext};

/// Sources at this priority run before anything else.
pub const PRIORITY_HIGH: i32 = -100;
/// Default priority for timeouts, fd watches, and tasks.
pub const PRIORITY_DEFAULT: i32 = 0;
/// High-priority idle work.
pub const PRIORITY_HIGH_IDLE: i32 = 100;
/// Default priority for idle sources.
pub const PRIORITY_DEFAULT_IDLE: i32 = 200;
/// Lowest built-in priority.
pub const PRIORITY_LOW: i32 = 300;

/// Identifier of a source within its context. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) u32);

impl SourceId {
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

/// Identifier of an fd watch within its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdWatchId(u64);

/// What a dispatched source wants to happen to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the source attached.
    Continue,
    /// Destroy the source.
    Remove,
}

pub(crate) type CallbackFn = Box<dyn FnMut() -> Dispatch + Send + 'static>;
pub(crate) type CallbackSlot = Option<CallbackFn>;

/// Borrow of a source's callback slot, handed to [`SourceFuncs::dispatch`].
///
/// The callback is taken out of the slot while it runs, so it may itself
/// attach sources, destroy its own source, or replace the callback.
pub struct Callback<'a> {
    slot: &'a Mutex<CallbackSlot>,
}

impl Callback<'_> {
    /// Run the user callback, if one is set.
    pub fn invoke(&mut self) -> Option<Dispatch> {
        let cb = self.slot.lock().unwrap().take();
        match cb {
            Some(mut f) => {
                let disposition = f();
                let mut slot = self.slot.lock().unwrap();
                // the callback may have installed a replacement
                if slot.is_none() {
                    *slot = Some(f);
                }
                Some(disposition)
            }
            None => None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

/// Behavior of a source, the three phases the context engine drives.
///
/// `prepare` and `check` default to "not ready, no timeout"; sources
/// driven purely by their ready time or fd watches only implement
/// `dispatch`.
pub trait SourceFuncs: Send + 'static {
    /// Called before polling. Returns readiness and, when not ready, an
    /// optional upper bound on how long the context may sleep.
    fn prepare(&mut self, source: &Source) -> (bool, Option<Duration>) {
        let _ = source;
        (false, None)
    }

    /// Called after polling, before fd results and the ready time are
    /// consulted.
    fn check(&mut self, source: &Source) -> bool {
        let _ = source;
        false
    }

    /// Called when the source is ready. `callback` is the user callback
    /// slot; the return value decides whether the source stays attached.
    fn dispatch(&mut self, source: &Source, callback: Callback<'_>) -> Dispatch;
}

/// One fd registered on a source.
#[derive(Debug)]
pub(crate) struct FdWatch {
    pub token: u64,
    pub fd: RawFd,
    pub events: PollFlags,
    pub revents: PollFlags,
    /// Set by the query phase, consumed by the check phase.
    pub polled: bool,
}

pub(crate) struct SourceState {
    pub id: u32,
    pub seq: u64,
    pub priority: i32,
    pub ready_time: Option<Instant>,
    pub name: Option<String>,
    pub can_recurse: bool,
    pub destroyed: bool,
    pub running: bool,
    pub ready: bool,
    /// Last context this source was attached to; kept after destroy so a
    /// surviving handle can still report it. Never owning.
    pub context: Weak<ContextInner>,
    pub parent: Weak<SourceInner>,
    pub children: Vec<Source>,
    pub fds: Vec<FdWatch>,
    pub next_watch: u64,
}

pub(crate) struct SourceInner {
    pub(crate) state: Spinlock<SourceState>,
    /// Taken out of the mutex for the duration of a phase call, so a
    /// callback re-entering the engine never deadlocks here.
    pub(crate) funcs: Mutex<Option<Box<dyn SourceFuncs>>>,
    pub(crate) callback: Mutex<CallbackSlot>,
}

/// Handle to an event source. Clones share the source.
#[derive(Clone)]
pub struct Source {
    pub(crate) inner: Arc<SourceInner>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Source {}

impl Source {
    /// A new detached source driven by `funcs`, at [`PRIORITY_DEFAULT`].
    pub fn new(funcs: impl SourceFuncs) -> Source {
        Source {
            inner: Arc::new(SourceInner {
                state: Spinlock::new(SourceState {
                    id: 0,
                    seq: 0,
                    priority: PRIORITY_DEFAULT,
                    ready_time: None,
                    name: None,
                    can_recurse: false,
                    destroyed: false,
                    running: false,
                    ready: false,
                    context: Weak::new(),
                    parent: Weak::new(),
                    children: Vec::new(),
                    fds: Vec::new(),
                    next_watch: 1,
                }),
                funcs: Mutex::new(Some(Box::new(funcs))),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Set the callback invoked when the source dispatches.
    pub fn set_callback(&self, f: impl FnMut() -> Dispatch + Send + 'static) {
        *self.inner.callback.lock().unwrap() = Some(Box::new(f));
    }

    /// Attach to `context`, making the source live. Fails on a destroyed
    /// or already attached source.
    pub fn attach(&self, context: &MainContext) -> crate::Result<SourceId> {
        context.attach_source(self)
    }

    /// Mark destroyed: the source will never dispatch again and is
    /// removed from its context. Idempotent. Child sources are destroyed
    /// along with it.
    pub fn destroy(&self) {
        let (ctx, parent, children, id) = {
            let mut st = self.inner.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.ready = false;
            let children = std::mem::take(&mut st.children);
            (st.context.upgrade(), st.parent.upgrade(), children, st.id)
        };

        if let Some(parent) = parent {
            parent
                .state
                .lock()
                .children
                .retain(|c| !Arc::ptr_eq(&c.inner, &self.inner));
        }

        for child in &children {
            child.inner.state.lock().parent = Weak::new();
            child.destroy();
        }

        if let Some(ctx) = ctx {
            ctx.detach_source(id);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Id within the attached context, `None` while detached.
    pub fn id(&self) -> Option<SourceId> {
        let st = self.inner.state.lock();
        if st.id == 0 {
            None
        } else {
            Some(SourceId(st.id))
        }
    }

    /// The context this source is (or was last) attached to.
    pub fn context(&self) -> Option<MainContext> {
        self.inner
            .state
            .lock()
            .context
            .upgrade()
            .map(MainContext::from_inner)
    }

    pub fn priority(&self) -> i32 {
        self.inner.state.lock().priority
    }

    /// Set the priority; lower values dispatch first. Cascades to child
    /// sources, which always share their parent's priority.
    pub fn set_priority(&self, priority: i32) {
        let (children, ctx) = {
            let mut st = self.inner.state.lock();
            st.priority = priority;
            (st.children.clone(), st.context.upgrade())
        };
        for child in &children {
            child.set_priority(priority);
        }
        if let Some(ctx) = ctx {
            ctx.wakeup.signal();
        }
    }

    /// The instant at which the source becomes ready regardless of fds,
    /// `None` meaning never.
    pub fn ready_time(&self) -> Option<Instant> {
        self.inner.state.lock().ready_time
    }

    /// Arm (or with `None`, disarm) the ready time. Wakes the context so
    /// a blocked iteration recomputes its poll timeout.
    pub fn set_ready_time(&self, ready_time: Option<Instant>) {
        let ctx = {
            let mut st = self.inner.state.lock();
            if st.ready_time == ready_time {
                return;
            }
            st.ready_time = ready_time;
            st.context.upgrade()
        };
        if let Some(ctx) = ctx {
            ctx.wakeup.signal();
        }
    }

    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.state.lock().name = Some(name.into());
    }

    pub fn can_recurse(&self) -> bool {
        self.inner.state.lock().can_recurse
    }

    /// Allow the source to be prepared and dispatched again while one of
    /// its dispatches is still on the stack.
    pub fn set_can_recurse(&self, can_recurse: bool) {
        self.inner.state.lock().can_recurse = can_recurse;
    }

    /// Add `child` as a child source: it adopts this source's priority,
    /// attaches wherever this source is attached, and its readiness also
    /// marks this source ready.
    ///
    /// Panics if either source is destroyed, or if `child` already has a
    /// parent or a context.
    pub fn add_child_source(&self, child: &Source) {
        assert!(
            !self.is_destroyed() && !child.is_destroyed(),
            "cannot add a child source to or from a destroyed source"
        );

        let (priority, ctx) = {
            let st = self.inner.state.lock();
            (st.priority, st.context.upgrade())
        };

        {
            let mut cst = child.inner.state.lock();
            assert!(
                cst.parent.upgrade().is_none(),
                "child source already has a parent"
            );
            assert!(
                cst.context.upgrade().is_none(),
                "child source is already attached to a context"
            );
            cst.parent = Arc::downgrade(&self.inner);
        }
        // children (and their own children) share the parent's priority
        child.set_priority(priority);

        self.inner.state.lock().children.push(child.clone());

        if let Some(ctx) = ctx {
            // cannot fail: the child was just verified detached
            let _ = MainContext::from_inner(ctx).attach_source(child);
        }
    }

    /// Detach `child` from this source and destroy it.
    ///
    /// Panics if `child` is not a child of this source.
    pub fn remove_child_source(&self, child: &Source) {
        let removed = {
            let mut st = self.inner.state.lock();
            let before = st.children.len();
            st.children.retain(|c| !Arc::ptr_eq(&c.inner, &child.inner));
            before != st.children.len()
        };
        assert!(removed, "source is not a child of this source");
        child.inner.state.lock().parent = Weak::new();
        child.destroy();
    }

    /// Watch `fd` for `events` while the source is attached. The source
    /// becomes ready whenever any of its watches reports activity.
    pub fn add_unix_fd(&self, fd: RawFd, events: PollFlags) -> FdWatchId {
        let (token, ctx) = {
            let mut st = self.inner.state.lock();
            assert!(!st.destroyed, "cannot add an fd watch to a destroyed source");
            let token = st.next_watch;
            st.next_watch += 1;
            st.fds.push(FdWatch {
                token,
                fd,
                events,
                revents: PollFlags::empty(),
                polled: false,
            });
            (token, st.context.upgrade())
        };
        if let Some(ctx) = ctx {
            ctx.wakeup.signal();
        }
        FdWatchId(token)
    }

    /// Change the interest mask of a watch. Panics on an unknown id.
    pub fn modify_unix_fd(&self, id: FdWatchId, events: PollFlags) {
        let ctx = {
            let mut st = self.inner.state.lock();
            let watch = st
                .fds
                .iter_mut()
                .find(|w| w.token == id.0)
                .expect("unknown fd watch id");
            watch.events = events;
            watch.revents = PollFlags::empty();
            st.context.upgrade()
        };
        if let Some(ctx) = ctx {
            ctx.wakeup.signal();
        }
    }

    /// Stop watching. Panics on an unknown id.
    pub fn remove_unix_fd(&self, id: FdWatchId) {
        let ctx = {
            let mut st = self.inner.state.lock();
            let before = st.fds.len();
            st.fds.retain(|w| w.token != id.0);
            assert!(st.fds.len() != before, "unknown fd watch id");
            st.context.upgrade()
        };
        if let Some(ctx) = ctx {
            ctx.wakeup.signal();
        }
    }

    /// Events reported for a watch by the most recent poll.
    pub fn query_unix_fd(&self, id: FdWatchId) -> PollFlags {
        self.inner
            .state
            .lock()
            .fds
            .iter()
            .find(|w| w.token == id.0)
            .expect("unknown fd watch id")
            .revents
    }

    /// The context's time, latched once per iteration. Timeout handlers
    /// use this instead of the wall clock so every source dispatched in
    /// one iteration observes the same instant.
    pub fn time(&self) -> Instant {
        match self.context() {
            Some(ctx) => ctx.time(),
            None => Instant::now(),
        }
    }

    /// True when this source or any ancestor is currently dispatching
    /// and does not allow recursion.
    pub(crate) fn is_blocked(&self) -> bool {
        let mut cur = self.inner.clone();
        loop {
            let parent = {
                let st = cur.state.lock();
                if st.running && !st.can_recurse {
                    return true;
                }
                st.parent.upgrade()
            };
            match parent {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// Latch readiness on this source and every ancestor. An ancestor
    /// made ready here dispatches on a later iteration even if its own
    /// phases never report readiness.
    pub(crate) fn mark_ready_propagate(&self) {
        let mut cur = self.inner.clone();
        loop {
            let parent = {
                let mut st = cur.state.lock();
                if st.destroyed {
                    return;
                }
                st.ready = true;
                st.parent.upgrade()
            };
            match parent {
                Some(p) => cur = p,
                None => return,
            }
        }
    }

    pub(crate) fn callback_ref(&self) -> Callback<'_> {
        Callback {
            slot: &self.inner.callback,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.state.try_lock() {
            Some(st) => f
                .debug_struct("Source")
                .field("id", &st.id)
                .field("name", &st.name)
                .field("priority", &st.priority)
                .field("destroyed", &st.destroyed)
                .finish(),
            None => f.write_str("Source(<locked>)"),
        }
    }
}

/// Invoke the user callback, removing sources nobody will ever hear from.
pub(crate) fn dispatch_or_remove(source: &Source, callback: &mut Callback<'_>) -> Dispatch {
    match callback.invoke() {
        Some(disposition) => disposition,
        None => {
            warn!(
                "source {:?} (id {:?}) dispatched without a callback; removing it",
                source.name(),
                source.id()
            );
            Dispatch::Remove
        }
    }
}

struct IdleFuncs;

impl SourceFuncs for IdleFuncs {
    fn prepare(&mut self, _source: &Source) -> (bool, Option<Duration>) {
        (true, Some(Duration::ZERO))
    }

    fn check(&mut self, _source: &Source) -> bool {
        true
    }

    fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
        dispatch_or_remove(source, &mut callback)
    }
}

/// A source that is ready on every iteration, at [`PRIORITY_DEFAULT_IDLE`].
pub fn idle_source_new() -> Source {
    let source = Source::new(IdleFuncs);
    source.set_priority(PRIORITY_DEFAULT_IDLE);
    source.set_name("idle");
    source
}

struct TimeoutFuncs {
    interval: Duration,
}

impl SourceFuncs for TimeoutFuncs {
    fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
        let disposition = dispatch_or_remove(source, &mut callback);
        if disposition == Dispatch::Continue {
            // Re-arm from the latched iteration time: a timeout that was
            // held up waits its full interval again instead of firing in
            // a catch-up burst.
            source.set_ready_time(Some(source.time() + self.interval));
        }
        disposition
    }
}

/// A source that becomes ready every `interval`, at [`PRIORITY_DEFAULT`].
///
/// The engine disarms the ready time before each dispatch; the timeout
/// re-arms itself only when its callback returns [`Dispatch::Continue`].
pub fn timeout_source_new(interval: Duration) -> Source {
    let source = Source::new(TimeoutFuncs { interval });
    source.set_name("timeout");
    source.set_ready_time(Some(Instant::now() + interval));
    source
}

struct UnixFdFuncs;

impl SourceFuncs for UnixFdFuncs {
    fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
        dispatch_or_remove(source, &mut callback)
    }
}

/// A source that becomes ready when `fd` reports any of `events` (or
/// HUP/ERR/NVAL), at [`PRIORITY_DEFAULT`]. Inspect the result with
/// [`Source::query_unix_fd`].
pub fn unix_fd_source_new(fd: RawFd, events: PollFlags) -> (Source, FdWatchId) {
    let source = Source::new(UnixFdFuncs);
    source.set_name("unix-fd");
    let watch = source.add_unix_fd(fd, events);
    (source, watch)
}
