//! Run-until-quit wrapper around a context.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mainstay_utils::defer;

use crate::context::MainContext;

struct LoopInner {
    context: MainContext,
    running: AtomicBool,
    quit: AtomicBool,
}

/// Handle to a main loop. Clones share the loop; any clone may quit it
/// from any thread.
#[derive(Clone)]
pub struct MainLoop {
    inner: Arc<LoopInner>,
}

impl MainLoop {
    pub fn new(context: &MainContext) -> MainLoop {
        MainLoop {
            inner: Arc::new(LoopInner {
                context: context.clone(),
                running: AtomicBool::new(false),
                quit: AtomicBool::new(false),
            }),
        }
    }

    pub fn context(&self) -> &MainContext {
        &self.inner.context
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Iterate the context, blocking between events, until [`quit`].
    ///
    /// The quit flag is sticky: a quit issued before run makes run return
    /// before its first blocking poll instead of being forgotten. The
    /// flag is consumed on exit, so the loop can be run again.
    ///
    /// [`quit`]: MainLoop::quit
    pub fn run(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.context.acquire_blocking();
        defer! {
            self.inner.context.release();
            self.inner.quit.store(false, Ordering::SeqCst);
            self.inner.running.store(false, Ordering::SeqCst);
        }

        while !self.inner.quit.load(Ordering::SeqCst) {
            self.inner.context.iteration(true);
        }
    }

    /// Stop the loop. Safe from any thread, including from a dispatch on
    /// the loop's own context; wakes a blocked iteration.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.context.wakeup();
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::source::{idle_source_new, timeout_source_new, Dispatch};

    #[test]
    fn quit_from_callback_stops_run() {
        let ctx = MainContext::new();
        let main_loop = MainLoop::new(&ctx);

        let source = idle_source_new();
        let stopper = main_loop.clone();
        source.set_callback(move || {
            assert!(stopper.is_running());
            stopper.quit();
            Dispatch::Remove
        });
        source.attach(&ctx).unwrap();

        main_loop.run();
        assert!(!main_loop.is_running());
    }

    #[test]
    fn quit_before_run_prevents_blocking() {
        let ctx = MainContext::new();
        let main_loop = MainLoop::new(&ctx);

        // no sources attached: without the sticky flag this would block
        // in poll forever
        main_loop.quit();
        main_loop.run();
    }

    #[test]
    fn quit_from_another_thread() {
        let ctx = MainContext::new();
        let main_loop = MainLoop::new(&ctx);

        let remote = main_loop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.quit();
        });

        main_loop.run();
        handle.join().unwrap();
    }

    #[test]
    fn loop_is_reusable_after_quit() {
        let ctx = MainContext::new();
        let main_loop = MainLoop::new(&ctx);

        for _ in 0..2 {
            let source = idle_source_new();
            let stopper = main_loop.clone();
            source.set_callback(move || {
                stopper.quit();
                Dispatch::Remove
            });
            source.attach(&ctx).unwrap();
            main_loop.run();
        }
    }

    // End-to-end timing: three repeating timeouts at 100ms, 250ms, and
    // 330ms, stopped after 1050ms. Frequency order must hold, and no
    // timeout may overshoot what the elapsed time allows.
    #[test]
    fn repeating_timeouts_fire_in_proportion() {
        let ctx = MainContext::new();
        let main_loop = MainLoop::new(&ctx);

        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let c = Arc::new(AtomicUsize::new(0));

        for (counter, ms) in [(&a, 100u64), (&b, 250), (&c, 330)] {
            let source = timeout_source_new(Duration::from_millis(ms));
            let counter = counter.clone();
            source.set_callback(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Dispatch::Continue
            });
            source.attach(&ctx).unwrap();
        }

        let stop = timeout_source_new(Duration::from_millis(1050));
        let stopper = main_loop.clone();
        stop.set_callback(move || {
            stopper.quit();
            Dispatch::Remove
        });
        stop.attach(&ctx).unwrap();

        let start = Instant::now();
        main_loop.run();
        assert!(start.elapsed() >= Duration::from_millis(1050));

        let a = a.load(Ordering::SeqCst);
        let b = b.load(Ordering::SeqCst);
        let c = c.load(Ordering::SeqCst);

        assert!(a > 0);
        assert!(a >= b, "100ms fired {} times, 250ms {} times", a, b);
        assert!(b >= c, "250ms fired {} times, 330ms {} times", b, c);
        assert!(a <= 10, "100ms overshot: {}", a);
        assert!(b <= 4, "250ms overshot: {}", b);
        assert!(c <= 3, "330ms overshot: {}", c);
    }
}
