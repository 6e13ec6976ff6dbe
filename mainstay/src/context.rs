//! The main context: where sources are attached and iterated.
//!
//! An iteration runs in phases. Prepare latches the iteration time, asks
//! every source whether it is ready, and computes the poll timeout; query
//! collects the fd set; poll sleeps; check distributes poll results and
//! collects the pending list; dispatch runs the callbacks. No context or
//! source lock is held while user code runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use log::trace;
use mainstay_utils::defer;
use nix::poll::PollFlags;
use once_cell::sync::Lazy;

use crate::error::Error;
use crate::poll::{self, PollRec, Wakeup};
use crate::source::{Dispatch, Source, SourceFuncs, SourceId, PRIORITY_DEFAULT};

static GLOBAL: Lazy<MainContext> = Lazy::new(MainContext::new);

thread_local! {
    static THREAD_DEFAULT: RefCell<Vec<MainContext>> = const { RefCell::new(Vec::new()) };
    static CURRENT_SOURCE: RefCell<Vec<Source>> = const { RefCell::new(Vec::new()) };
}

/// The source being dispatched on the calling thread, if any.
pub fn main_current_source() -> Option<Source> {
    CURRENT_SOURCE.with(|stack| stack.borrow().last().cloned())
}

pub(crate) struct ContextState {
    sources: HashMap<u32, Source>,
    next_id: u32,
    next_seq: u64,
    owner: Option<ThreadId>,
    owner_count: usize,
    /// Iteration time, latched once per prepare.
    time: Option<Instant>,
    pending: Vec<Source>,
}

pub(crate) struct ContextInner {
    pub(crate) state: Mutex<ContextState>,
    owner_cond: Condvar,
    pub(crate) wakeup: Wakeup,
}

impl ContextInner {
    /// Remove a destroyed source from the attach table.
    pub(crate) fn detach_source(&self, id: u32) {
        self.state.lock().unwrap().sources.remove(&id);
        self.wakeup.signal();
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap();
        let sources: Vec<Source> = st.sources.drain().map(|(_, s)| s).collect();
        st.pending.clear();
        for source in sources {
            source.destroy();
        }
    }
}

/// Handle to a main context. Clones share the context.
#[derive(Clone)]
pub struct MainContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl PartialEq for MainContext {
    fn eq(&self, other: &MainContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MainContext {}

impl Default for MainContext {
    fn default() -> MainContext {
        MainContext::new()
    }
}

impl MainContext {
    pub fn new() -> MainContext {
        MainContext {
            inner: Arc::new(ContextInner {
                state: Mutex::new(ContextState {
                    sources: HashMap::new(),
                    next_id: 1,
                    next_seq: 1,
                    owner: None,
                    owner_count: 0,
                    time: None,
                    pending: Vec::new(),
                }),
                owner_cond: Condvar::new(),
                wakeup: Wakeup::new().expect("failed to create wakeup eventfd"),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> MainContext {
        MainContext { inner }
    }

    /// The process-wide default context.
    pub fn global() -> MainContext {
        GLOBAL.clone()
    }

    /// The calling thread's default context: the top of the thread-default
    /// stack, or the global context when the stack is empty.
    pub fn thread_default() -> MainContext {
        THREAD_DEFAULT.with(|stack| stack.borrow().last().cloned().unwrap_or_else(MainContext::global))
    }

    /// Make this the thread-default context until the matching pop.
    pub fn push_thread_default(&self) {
        THREAD_DEFAULT.with(|stack| stack.borrow_mut().push(self.clone()));
    }

    /// Pops the thread-default stack. Panics when this context is not on
    /// top, pushes and pops must nest.
    pub fn pop_thread_default(&self) {
        THREAD_DEFAULT.with(|stack| {
            let mut stack = stack.borrow_mut();
            let top = stack.pop().expect("thread-default stack is empty");
            assert!(top == *self, "pop_thread_default out of order");
        });
    }

    /// Try to become the owner of this context. Ownership is recursive on
    /// the owning thread; each successful acquire needs a release.
    pub fn acquire(&self) -> bool {
        let me = thread::current().id();
        let mut st = self.inner.state.lock().unwrap();
        match st.owner {
            None => {
                st.owner = Some(me);
                st.owner_count = 1;
                true
            }
            Some(owner) if owner == me => {
                st.owner_count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Block until ownership can be acquired.
    pub(crate) fn acquire_blocking(&self) {
        let me = thread::current().id();
        let mut st = self.inner.state.lock().unwrap();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.owner_count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    st.owner_count += 1;
                    return;
                }
                Some(_) => st = self.inner.owner_cond.wait(st).unwrap(),
            }
        }
    }

    /// Release one level of ownership. Panics when the calling thread is
    /// not the owner.
    pub fn release(&self) {
        let mut st = self.inner.state.lock().unwrap();
        assert_eq!(
            st.owner,
            Some(thread::current().id()),
            "release called by a thread that does not own the context"
        );
        st.owner_count -= 1;
        if st.owner_count == 0 {
            st.owner = None;
            drop(st);
            self.inner.owner_cond.notify_one();
        }
    }

    pub fn is_owner(&self) -> bool {
        self.inner.state.lock().unwrap().owner == Some(thread::current().id())
    }

    /// Interrupt a blocked iteration from any thread. Never lost: a
    /// wakeup sent before the next poll makes that poll return at once.
    pub fn wakeup(&self) {
        self.inner.wakeup.signal();
    }

    /// The iteration time. Latched during prepare so all sources of one
    /// iteration agree on it; fresh when no iteration is in progress.
    pub fn time(&self) -> Instant {
        let mut st = self.inner.state.lock().unwrap();
        match st.time {
            Some(t) => t,
            None => {
                let now = Instant::now();
                st.time = Some(now);
                now
            }
        }
    }

    /// Look up an attached, non-destroyed source by id.
    pub fn find_source_by_id(&self, id: SourceId) -> Option<Source> {
        self.inner.state.lock().unwrap().sources.get(&id.0).cloned()
    }

    /// True when a non-blocking iteration would dispatch something.
    pub fn pending(&self) -> bool {
        self.iterate(false, false)
    }

    /// Run one iteration: maybe poll (blocking when `may_block` and
    /// nothing is ready), then dispatch. Returns whether any source was
    /// pending.
    pub fn iteration(&self, may_block: bool) -> bool {
        self.iterate(may_block, true)
    }

    /// Run `f` on this context: inline when the calling thread can own
    /// the context, otherwise via an idle source at `priority`.
    pub fn invoke_with_priority(&self, priority: i32, f: impl FnOnce() + Send + 'static) {
        if self.acquire() {
            defer! {
                self.release();
            }
            f();
        } else {
            let source = crate::source::idle_source_new();
            source.set_priority(priority);
            source.set_name("invoke");
            let mut f = Some(f);
            source.set_callback(move || {
                if let Some(f) = f.take() {
                    f();
                }
                Dispatch::Remove
            });
            let _ = source.attach(self);
        }
    }

    pub fn invoke(&self, f: impl FnOnce() + Send + 'static) {
        self.invoke_with_priority(PRIORITY_DEFAULT, f);
    }

    pub(crate) fn attach_source(&self, source: &Source) -> crate::Result<SourceId> {
        let id = {
            let mut ctx = self.inner.state.lock().unwrap();
            let mut st = source.inner.state.lock();
            if st.destroyed {
                return Err(Error::SourceDestroyed);
            }
            if st.context.upgrade().is_some() {
                return Err(Error::SourceAttached);
            }
            // ids are never zero and skip values still in use, so they
            // stay valid across wraparound
            let id = loop {
                let candidate = ctx.next_id;
                ctx.next_id = ctx.next_id.wrapping_add(1);
                if candidate != 0 && !ctx.sources.contains_key(&candidate) {
                    break candidate;
                }
            };
            st.id = id;
            st.seq = ctx.next_seq;
            ctx.next_seq += 1;
            st.context = Arc::downgrade(&self.inner);
            drop(st);
            ctx.sources.insert(id, source.clone());
            id
        };

        // child sources follow their parent into the context
        let children = source.inner.state.lock().children.clone();
        for child in &children {
            let detached = child.inner.state.lock().context.upgrade().is_none();
            if detached && !child.is_destroyed() {
                let _ = self.attach_source(child);
            }
        }

        self.inner.wakeup.signal();
        Ok(SourceId(id))
    }

    pub(crate) fn iterate(&self, may_block: bool, dispatch: bool) -> bool {
        if !self.acquire() {
            if !may_block {
                return false;
            }
            self.acquire_blocking();
        }
        defer! {
            self.release();
        }

        let (any_ready, max_priority, timeout) = self.prepare();
        let mut recs = self.query(max_priority);
        let timeout = if any_ready || !may_block {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        poll::poll(&mut recs, timeout);
        let n_pending = self.check(max_priority, &recs);

        #[cfg(feature = "tracing")]
        trace!(
            "iteration: polled {} fds, {} sources pending",
            recs.len(),
            n_pending
        );

        if dispatch && n_pending > 0 {
            self.dispatch_pending();
        }

        n_pending > 0
    }

    /// Attached sources ordered by (priority, attach order).
    fn sources_snapshot(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = {
            let st = self.inner.state.lock().unwrap();
            st.sources.values().cloned().collect()
        };
        sources.sort_by_key(|s| {
            let st = s.inner.state.lock();
            (st.priority, st.seq)
        });
        sources
    }

    /// Phase one: latch the time, collect readiness and the poll timeout.
    /// Returns (any source ready, highest ready priority, poll timeout).
    fn prepare(&self) -> (bool, i32, Option<Duration>) {
        let now = {
            let mut st = self.inner.state.lock().unwrap();
            st.pending.clear();
            let now = Instant::now();
            st.time = Some(now);
            now
        };

        let mut any_ready = false;
        let mut max_priority = i32::MAX;
        let mut timeout: Option<Duration> = None;

        for source in &self.sources_snapshot() {
            let blocked = source.is_blocked();
            let (destroyed, ready, priority, ready_time) = {
                let st = source.inner.state.lock();
                (st.destroyed, st.ready, st.priority, st.ready_time)
            };
            if destroyed || blocked {
                continue;
            }
            // once something is ready, lower-priority sources are starved
            // out of this iteration entirely
            if any_ready && priority > max_priority {
                break;
            }

            let mut result = ready;
            let mut source_timeout = None;
            if !result {
                // bind the taken funcs first: a guard living in the `if let`
                // scrutinee would still hold the lock when put_back re-locks
                let funcs = source.inner.funcs.lock().unwrap().take();
                if let Some(mut funcs) = funcs {
                    let (r, t) = funcs.prepare(source);
                    put_back(&source.inner.funcs, funcs);
                    result = r;
                    source_timeout = t;
                }
                if let Some(ready_at) = ready_time {
                    if ready_at <= now {
                        result = true;
                    } else {
                        source_timeout = min_timeout(source_timeout, Some(ready_at - now));
                    }
                }
            }

            if result {
                source.mark_ready_propagate();
                any_ready = true;
                if priority < max_priority {
                    max_priority = priority;
                }
            } else {
                timeout = min_timeout(timeout, source_timeout);
            }
        }

        (any_ready, max_priority, timeout)
    }

    /// Phase two: build the poll set from watches of sources at or above
    /// `max_priority`, coalescing duplicate fds under a union mask. The
    /// wakeup fd is always the last record.
    fn query(&self, max_priority: i32) -> Vec<PollRec> {
        let mut recs: Vec<PollRec> = Vec::new();
        let mut by_fd: HashMap<RawFd, usize> = HashMap::new();

        for source in &self.sources_snapshot() {
            let blocked = source.is_blocked();
            let mut st = source.inner.state.lock();
            let eligible = !st.destroyed && !blocked && st.priority <= max_priority;
            for watch in st.fds.iter_mut() {
                watch.polled = eligible;
                if !eligible {
                    continue;
                }
                match by_fd.get(&watch.fd) {
                    Some(&i) => recs[i].events |= watch.events,
                    None => {
                        by_fd.insert(watch.fd, recs.len());
                        recs.push(PollRec::new(watch.fd, watch.events));
                    }
                }
            }
        }

        recs.push(PollRec::new(self.inner.wakeup.raw_fd(), PollFlags::POLLIN));
        recs
    }

    /// Phase four: distribute poll results, collect the pending list.
    fn check(&self, max_priority: i32, recs: &[PollRec]) -> usize {
        if let Some(last) = recs.last() {
            if last.fd == self.inner.wakeup.raw_fd() && !last.revents.is_empty() {
                self.inner.wakeup.acknowledge();
            }
        }

        let mut by_fd: HashMap<RawFd, PollFlags> = HashMap::new();
        for rec in recs {
            *by_fd.entry(rec.fd).or_insert_with(PollFlags::empty) |= rec.revents;
        }

        let now = self.time();
        let mut newly_pending: Vec<Source> = Vec::new();

        for source in &self.sources_snapshot() {
            let blocked = source.is_blocked();
            let (destroyed, ready, priority, ready_time) = {
                let st = source.inner.state.lock();
                (st.destroyed, st.ready, st.priority, st.ready_time)
            };
            if destroyed || blocked || priority > max_priority {
                continue;
            }

            // hand each watch its share of the poll results; error
            // conditions are reported regardless of the interest mask
            let mut fd_ready = false;
            {
                let mut st = source.inner.state.lock();
                for watch in st.fds.iter_mut() {
                    if !watch.polled {
                        continue;
                    }
                    watch.polled = false;
                    let raw = by_fd.get(&watch.fd).copied().unwrap_or_else(PollFlags::empty);
                    watch.revents = raw
                        & (watch.events
                            | PollFlags::POLLERR
                            | PollFlags::POLLHUP
                            | PollFlags::POLLNVAL);
                    if !watch.revents.is_empty() {
                        fd_ready = true;
                    }
                }
            }

            let mut result = ready;
            if !result {
                let funcs = source.inner.funcs.lock().unwrap().take();
                if let Some(mut funcs) = funcs {
                    result = funcs.check(source);
                    put_back(&source.inner.funcs, funcs);
                }
            }
            if !result && fd_ready {
                result = true;
            }
            if !result {
                if let Some(ready_at) = ready_time {
                    if ready_at <= now {
                        result = true;
                    }
                }
            }

            if result {
                source.mark_ready_propagate();
                newly_pending.push(source.clone());
            }
        }

        let n = newly_pending.len();
        self.inner.state.lock().unwrap().pending = newly_pending;
        n
    }

    /// Phase five: run the callbacks of everything check collected.
    fn dispatch_pending(&self) -> usize {
        let pending = {
            let mut st = self.inner.state.lock().unwrap();
            std::mem::take(&mut st.pending)
        };
        let now = self.time();
        let mut dispatched = 0;

        for source in pending {
            {
                let mut st = source.inner.state.lock();
                if st.destroyed {
                    continue;
                }
                st.ready = false;
                // a fired ready time is disarmed before dispatch; the
                // handler re-arms it explicitly or not at all
                if let Some(ready_at) = st.ready_time {
                    if ready_at <= now {
                        st.ready_time = None;
                    }
                }
                st.running = true;
            }

            CURRENT_SOURCE.with(|stack| stack.borrow_mut().push(source.clone()));
            let funcs = source.inner.funcs.lock().unwrap().take();
            let disposition = match funcs {
                Some(mut funcs) => {
                    let d = funcs.dispatch(&source, source.callback_ref());
                    put_back(&source.inner.funcs, funcs);
                    Some(d)
                }
                // mid-phase somewhere up the stack; skip this round
                None => None,
            };
            CURRENT_SOURCE.with(|stack| {
                stack.borrow_mut().pop();
            });

            source.inner.state.lock().running = false;
            dispatched += 1;

            if disposition == Some(Dispatch::Remove) {
                source.destroy();
            }
        }

        dispatched
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, next_id: u32) {
        self.inner.state.lock().unwrap().next_id = next_id;
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("MainContext")
            .field("sources", &st.sources.len())
            .field("owner", &st.owner)
            .field("pending", &st.pending.len())
            .finish()
    }
}

fn put_back(slot: &Mutex<Option<Box<dyn SourceFuncs>>>, funcs: Box<dyn SourceFuncs>) {
    *slot.lock().unwrap() = Some(funcs);
}

fn min_timeout(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use std::os::fd::AsRawFd;

    use nix::unistd::{pipe, write};

    use super::*;
    use crate::source::{
        idle_source_new, timeout_source_new, unix_fd_source_new, Callback, PRIORITY_HIGH,
    };

    fn attach_counting_idle(ctx: &MainContext, counter: &Arc<AtomicUsize>) -> Source {
        let source = idle_source_new();
        let counter = counter.clone();
        source.set_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Dispatch::Continue
        });
        source.attach(ctx).unwrap();
        source
    }

    #[test]
    fn empty_context_has_nothing_pending() {
        let ctx = MainContext::new();
        assert!(!ctx.pending());
        assert!(!ctx.iteration(false));
    }

    #[test]
    fn ownership_is_recursive_and_exclusive() {
        let ctx = MainContext::new();
        assert!(!ctx.is_owner());
        assert!(ctx.acquire());
        assert!(ctx.acquire());
        assert!(ctx.is_owner());

        let other = ctx.clone();
        let handle = thread::spawn(move || other.acquire());
        assert!(!handle.join().unwrap());

        ctx.release();
        ctx.release();
        assert!(!ctx.is_owner());

        let other = ctx.clone();
        let handle = thread::spawn(move || {
            let got = other.acquire();
            if got {
                other.release();
            }
            got
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn iteration_on_foreign_owned_context_returns_false() {
        let ctx = MainContext::new();
        assert!(ctx.acquire());

        let counter = Arc::new(AtomicUsize::new(0));
        attach_counting_idle(&ctx, &counter);

        let other = ctx.clone();
        let handle = thread::spawn(move || other.iteration(false));
        assert!(!handle.join().unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        ctx.release();
    }

    #[test]
    fn attach_find_destroy() {
        let ctx = MainContext::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let source = attach_counting_idle(&ctx, &counter);

        let id = source.id().unwrap();
        assert!(ctx.find_source_by_id(id).is_some());
        assert!(ctx.pending());

        assert!(matches!(
            source.attach(&ctx),
            Err(Error::SourceAttached)
        ));

        source.destroy();
        assert!(ctx.find_source_by_id(id).is_none());
        assert!(!ctx.pending());
        // destroyed sources still report their last context
        assert!(source.context() == Some(ctx.clone()));

        assert!(matches!(
            source.attach(&MainContext::new()),
            Err(Error::SourceDestroyed)
        ));
    }

    #[test]
    fn idle_dispatches_until_removed() {
        let ctx = MainContext::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let source = attach_counting_idle(&ctx, &counter);

        assert!(ctx.iteration(false));
        assert!(ctx.iteration(false));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        source.destroy();
        assert!(!ctx.iteration(false));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn higher_priority_starves_lower() {
        let ctx = MainContext::new();
        let high = Arc::new(AtomicUsize::new(0));
        let low = Arc::new(AtomicUsize::new(0));

        let low_source = attach_counting_idle(&ctx, &low);
        let high_source = attach_counting_idle(&ctx, &high);
        high_source.set_priority(PRIORITY_HIGH);

        for _ in 0..3 {
            ctx.iteration(false);
        }
        assert_eq!(high.load(Ordering::SeqCst), 3);
        assert_eq!(low.load(Ordering::SeqCst), 0);

        high_source.destroy();
        ctx.iteration(false);
        assert_eq!(low.load(Ordering::SeqCst), 1);

        low_source.destroy();
    }

    #[test]
    fn callback_removal_by_return_value() {
        let ctx = MainContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let source = idle_source_new();
        let cb_counter = counter.clone();
        source.set_callback(move || {
            cb_counter.fetch_add(1, Ordering::SeqCst);
            Dispatch::Remove
        });
        source.attach(&ctx).unwrap();

        assert!(ctx.iteration(false));
        assert!(!ctx.iteration(false));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(source.is_destroyed());
    }

    #[test]
    fn source_without_callback_is_removed() {
        let ctx = MainContext::new();
        let source = idle_source_new();
        source.attach(&ctx).unwrap();

        assert!(ctx.iteration(false));
        assert!(source.is_destroyed());
        assert!(!ctx.pending());
    }

    #[test]
    fn ready_time_fires_and_disarms() {
        let ctx = MainContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        struct Silent;
        impl SourceFuncs for Silent {
            fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
                crate::source::dispatch_or_remove(source, &mut callback)
            }
        }

        let source = Source::new(Silent);
        let cb_counter = counter.clone();
        source.set_callback(move || {
            cb_counter.fetch_add(1, Ordering::SeqCst);
            Dispatch::Continue
        });
        source.attach(&ctx).unwrap();

        // never ready without a ready time
        assert!(!ctx.iteration(false));

        source.set_ready_time(Some(Instant::now()));
        assert!(ctx.iteration(false));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // the fired ready time was disarmed before dispatch
        assert_eq!(source.ready_time(), None);
        assert!(!ctx.iteration(false));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // a future ready time blocks the iteration only that long
        source.set_ready_time(Some(Instant::now() + Duration::from_millis(50)));
        let start = Instant::now();
        while counter.load(Ordering::SeqCst) < 2 {
            ctx.iteration(true);
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn ready_time_rearmed_by_handler_survives_dispatch() {
        let ctx = MainContext::new();

        struct Silent;
        impl SourceFuncs for Silent {
            fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
                crate::source::dispatch_or_remove(source, &mut callback)
            }
        }

        let source = Source::new(Silent);
        let rearm = source.clone();
        let when = Instant::now() + Duration::from_secs(3600);
        source.set_callback(move || {
            rearm.set_ready_time(Some(when));
            Dispatch::Continue
        });
        source.set_ready_time(Some(Instant::now()));
        source.attach(&ctx).unwrap();

        assert!(ctx.iteration(false));
        assert_eq!(source.ready_time(), Some(when));
    }

    #[test]
    fn cross_thread_ready_time_interrupts_block() {
        let ctx = MainContext::new();

        struct Silent;
        impl SourceFuncs for Silent {
            fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
                crate::source::dispatch_or_remove(source, &mut callback)
            }
        }

        let source = Source::new(Silent);
        let fired = Arc::new(AtomicBool::new(false));
        let cb_fired = fired.clone();
        source.set_callback(move || {
            cb_fired.store(true, Ordering::SeqCst);
            Dispatch::Remove
        });
        source.set_ready_time(Some(Instant::now() + Duration::from_secs(3600)));
        source.attach(&ctx).unwrap();

        let remote = source.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.set_ready_time(Some(Instant::now()));
        });

        // would sleep an hour if the cross-thread re-arm were lost
        while !fired.load(Ordering::SeqCst) {
            ctx.iteration(true);
        }
        handle.join().unwrap();
    }

    #[test]
    fn wakeup_is_never_lost() {
        let ctx = MainContext::new();
        for _ in 0..100 {
            ctx.wakeup();
            // returns instead of blocking forever
            ctx.iteration(true);
        }
    }

    #[test]
    fn source_time_is_latched_per_iteration() {
        let ctx = MainContext::new();
        let times = Arc::new(mainstay_utils::Spinlock::new(Vec::new()));

        for _ in 0..2 {
            let source = idle_source_new();
            let times = times.clone();
            let handle = source.clone();
            source.set_callback(move || {
                times.lock().push(handle.time());
                Dispatch::Continue
            });
            source.attach(&ctx).unwrap();
        }

        ctx.iteration(false);
        thread::sleep(Duration::from_millis(10));
        ctx.iteration(false);

        let times = times.lock();
        assert_eq!(times.len(), 4);
        assert_eq!(times[0], times[1]);
        assert_eq!(times[2], times[3]);
        assert!(times[2] > times[0]);
    }

    #[test]
    fn child_readiness_propagates_to_ancestors() {
        let ctx = MainContext::new();
        let order = Arc::new(mainstay_utils::Spinlock::new(Vec::new()));

        struct Silent;
        impl SourceFuncs for Silent {
            fn dispatch(&mut self, source: &Source, mut callback: Callback<'_>) -> Dispatch {
                crate::source::dispatch_or_remove(source, &mut callback)
            }
        }

        let parent = Source::new(Silent);
        let child = Source::new(Silent);
        let grandchild = idle_source_new();

        for (source, tag) in [(&parent, "parent"), (&child, "child"), (&grandchild, "grandchild")] {
            let order = order.clone();
            source.set_callback(move || {
                order.lock().push(tag);
                Dispatch::Continue
            });
        }

        child.add_child_source(&grandchild);
        parent.add_child_source(&child);
        parent.attach(&ctx).unwrap();

        // the idle grandchild is always ready; its readiness must pull
        // the whole ancestor chain in, parents first
        assert!(ctx.iteration(false));
        assert_eq!(*order.lock(), vec!["parent", "child", "grandchild"]);
    }

    #[test]
    fn swapping_child_sources_mid_dispatch() {
        let ctx = MainContext::new();
        let done = Arc::new(AtomicBool::new(false));

        let parent = idle_source_new();
        let old_child = timeout_source_new(Duration::from_secs(3600));
        old_child.set_callback(|| unreachable!("removed child must never fire"));
        parent.add_child_source(&old_child);

        let swap_parent = parent.clone();
        let swap_done = done.clone();
        let mut swapped = false;
        parent.set_callback(move || {
            if !swapped {
                swapped = true;
                swap_parent.remove_child_source(&old_child);
                let new_child = timeout_source_new(Duration::ZERO);
                let inner_done = swap_done.clone();
                let finished_parent = swap_parent.clone();
                new_child.set_callback(move || {
                    inner_done.store(true, Ordering::SeqCst);
                    finished_parent.destroy();
                    Dispatch::Remove
                });
                swap_parent.add_child_source(&new_child);
            }
            Dispatch::Continue
        });
        parent.attach(&ctx).unwrap();

        while !done.load(Ordering::SeqCst) {
            ctx.iteration(true);
        }
        assert!(parent.is_destroyed());
    }

    #[test]
    fn dispatching_source_blocks_itself_unless_recursive() {
        let ctx = MainContext::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let source = idle_source_new();
        let inner_ctx = ctx.clone();
        let cb_counter = counter.clone();
        source.set_callback(move || {
            let before = cb_counter.fetch_add(1, Ordering::SeqCst);
            if before == 0 {
                // a nested iteration must not re-enter this source
                assert!(!inner_ctx.iteration(false));
            }
            Dispatch::Continue
        });
        source.attach(&ctx).unwrap();

        ctx.iteration(false);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn id_allocation_skips_zero_and_live_ids_on_wraparound() {
        let ctx = MainContext::new();
        ctx.set_next_id(u32::MAX - 1);

        let a = idle_source_new();
        let b = idle_source_new();
        let c = idle_source_new();
        assert_eq!(a.attach(&ctx).unwrap().as_raw(), u32::MAX - 1);
        assert_eq!(b.attach(&ctx).unwrap().as_raw(), u32::MAX);

        let id_c = c.attach(&ctx).unwrap();
        assert_ne!(id_c.as_raw(), 0);
        assert_ne!(id_c.as_raw(), u32::MAX - 1);
        assert_ne!(id_c.as_raw(), u32::MAX);

        let mut seen = vec![a.id().unwrap(), b.id().unwrap(), id_c];
        for _ in 0..50 {
            let s = idle_source_new();
            let id = s.attach(&ctx).unwrap();
            assert_ne!(id.as_raw(), 0);
            assert!(!seen.contains(&id));
            seen.push(id);
        }
    }

    #[test]
    fn duplicate_fd_watchers_get_their_own_revents() {
        let ctx = MainContext::new();
        let (read_end, write_end) = pipe().unwrap();
        let rfd = read_end.as_raw_fd();

        let hits = Arc::new(AtomicUsize::new(0));
        let (reader, read_watch) = unix_fd_source_new(rfd, PollFlags::POLLIN);
        let reader_hits = hits.clone();
        reader.set_callback(move || {
            reader_hits.fetch_add(1, Ordering::SeqCst);
            Dispatch::Continue
        });
        reader.attach(&ctx).unwrap();

        // same fd, write interest only: a pipe's read end never reports
        // POLLOUT, so this source must not dispatch even though the poll
        // set coalesces both watches into one record
        let (out_watcher, out_watch) = unix_fd_source_new(rfd, PollFlags::POLLOUT);
        out_watcher.set_callback(|| unreachable!("write-interest watch on a read end fired"));
        out_watcher.attach(&ctx).unwrap();

        assert!(!ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        write(&write_end, &[1u8]).unwrap();
        assert!(ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // the shared poll result is filtered through each watch's mask
        assert!(reader.query_unix_fd(read_watch).contains(PollFlags::POLLIN));
        assert!(out_watcher.query_unix_fd(out_watch).is_empty());
    }

    #[test]
    fn fd_watch_modify_and_remove() {
        let ctx = MainContext::new();
        let (read_end, write_end) = pipe().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let (source, watch) = unix_fd_source_new(read_end.as_raw_fd(), PollFlags::POLLIN);
        let cb_hits = hits.clone();
        source.set_callback(move || {
            cb_hits.fetch_add(1, Ordering::SeqCst);
            Dispatch::Continue
        });
        source.attach(&ctx).unwrap();

        write(&write_end, &[1u8]).unwrap();
        assert!(ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // dropping the interest mask silences the buffered byte
        source.modify_unix_fd(watch, PollFlags::empty());
        assert!(!ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        source.modify_unix_fd(watch, PollFlags::POLLIN);
        assert!(ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        source.remove_unix_fd(watch);
        assert!(!ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn main_current_source_during_dispatch() {
        let ctx = MainContext::new();
        assert!(main_current_source().is_none());

        let source = idle_source_new();
        let expected = source.clone();
        let checked = Arc::new(AtomicBool::new(false));
        let cb_checked = checked.clone();
        source.set_callback(move || {
            assert!(main_current_source() == Some(expected.clone()));
            cb_checked.store(true, Ordering::SeqCst);
            Dispatch::Remove
        });
        source.attach(&ctx).unwrap();

        ctx.iteration(false);
        assert!(checked.load(Ordering::SeqCst));
        assert!(main_current_source().is_none());
    }

    #[test]
    fn funcs_finalized_when_pending_context_goes_away() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl SourceFuncs for Counted {
            fn prepare(&mut self, _source: &Source) -> (bool, Option<Duration>) {
                (true, None)
            }
            fn dispatch(&mut self, _source: &Source, _callback: Callback<'_>) -> Dispatch {
                unreachable!("never dispatched in this test");
            }
        }
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let ctx = MainContext::new();
        let source = Source::new(Counted);
        source.attach(&ctx).unwrap();

        // leave the source pending but undispatched
        assert!(ctx.pending());

        drop(source);
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        drop(ctx);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_default_stack_nests() {
        assert!(MainContext::thread_default() == MainContext::global());

        let ctx = MainContext::new();
        ctx.push_thread_default();
        assert!(MainContext::thread_default() == ctx);

        let nested = MainContext::new();
        nested.push_thread_default();
        assert!(MainContext::thread_default() == nested);
        nested.pop_thread_default();

        assert!(MainContext::thread_default() == ctx);
        ctx.pop_thread_default();
        assert!(MainContext::thread_default() == MainContext::global());
    }

    #[test]
    fn invoke_runs_inline_when_acquirable() {
        let ctx = MainContext::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        ctx.invoke(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        assert!(!ctx.is_owner());
    }

    #[test]
    fn invoke_defers_when_context_is_owned_elsewhere() {
        let ctx = MainContext::new();
        assert!(ctx.acquire());

        let ran = Arc::new(AtomicBool::new(false));
        let remote = ctx.clone();
        let flag = ran.clone();
        let handle = thread::spawn(move || {
            remote.invoke(move || flag.store(true, Ordering::SeqCst));
        });
        handle.join().unwrap();
        assert!(!ran.load(Ordering::SeqCst));

        while !ran.load(Ordering::SeqCst) {
            ctx.iteration(true);
        }
        ctx.release();
    }
}
