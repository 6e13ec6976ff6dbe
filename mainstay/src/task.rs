//! Asynchronous operations with exactly-once completion.
//!
//! A [`Task`] captures the thread-default context at creation, carries
//! an optional [`Cancellable`], and delivers its completion callback in
//! that context no matter where the result was produced: inline when the
//! result is set from a dispatch on the same context (in a later
//! iteration than the task's creation), otherwise through an idle source
//! at the task's priority.
//!
//! [`run_in_thread`] and [`run_in_thread_sync`] execute a function on
//! the shared worker pool. With return-on-cancel enabled, cancelling the
//! token completes the task immediately while the function keeps running
//! in the background; its eventual result is discarded.
//!
//! [`run_in_thread`]: Task::run_in_thread
//! [`run_in_thread_sync`]: Task::run_in_thread_sync

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::cancellable::{Cancellable, HandlerId};
use crate::context::{main_current_source, MainContext};
use crate::error::Error;
use crate::pool::{in_pool_worker, task_pool};
use crate::source::{idle_source_new, Dispatch, PRIORITY_DEFAULT};

/// Life cycle of the pool-backed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    NotStarted,
    Running,
    /// Cancelled without return-on-cancel: completion waits for the
    /// function to return.
    Cancelled,
    /// Cancelled with return-on-cancel: completion was delivered early;
    /// the function may still be running and its result is discarded.
    CancelledCompleted,
    /// The function returned.
    Finished,
}

type TaskFn<T> = Box<dyn FnOnce(&Task<T>) + Send>;

struct TaskState<T: Send + 'static> {
    priority: i32,
    name: Option<String>,
    check_cancellable: bool,
    return_on_cancel: bool,
    synchronous: bool,
    callback: Option<TaskFn<T>>,
    result: Option<Result<T, Error>>,
    propagated: bool,
    thread: ThreadState,
    pool_serial: Option<u64>,
    cancel_handler: Option<HandlerId>,
}

struct TaskInner<T: Send + 'static> {
    context: MainContext,
    cancellable: Option<Cancellable>,
    creation_time: Instant,
    completed: AtomicBool,
    state: Mutex<TaskState<T>>,
    cond: Condvar,
}

/// Handle to an asynchronous operation. Clones share the task.
pub struct Task<T: Send + 'static> {
    inner: Arc<TaskInner<T>>,
}

impl<T: Send + 'static> Clone for Task<T> {
    fn clone(&self) -> Task<T> {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// A new task completing via `callback` in the calling thread's
    /// default context.
    pub fn new(
        cancellable: Option<&Cancellable>,
        callback: impl FnOnce(&Task<T>) + Send + 'static,
    ) -> Task<T> {
        Task::build(cancellable, Some(Box::new(callback)))
    }

    /// A new task without a completion callback, for use with
    /// [`run_in_thread_sync`] or manual propagation.
    ///
    /// [`run_in_thread_sync`]: Task::run_in_thread_sync
    pub fn without_callback(cancellable: Option<&Cancellable>) -> Task<T> {
        Task::build(cancellable, None)
    }

    fn build(cancellable: Option<&Cancellable>, callback: Option<TaskFn<T>>) -> Task<T> {
        Task {
            inner: Arc::new(TaskInner {
                context: MainContext::thread_default(),
                cancellable: cancellable.cloned(),
                creation_time: Instant::now(),
                completed: AtomicBool::new(false),
                state: Mutex::new(TaskState {
                    priority: PRIORITY_DEFAULT,
                    name: None,
                    check_cancellable: true,
                    return_on_cancel: false,
                    synchronous: false,
                    callback,
                    result: None,
                    propagated: false,
                    thread: ThreadState::NotStarted,
                    pool_serial: None,
                    cancel_handler: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// The context completion is delivered in.
    pub fn context(&self) -> MainContext {
        self.inner.context.clone()
    }

    pub fn cancellable(&self) -> Option<&Cancellable> {
        self.inner.cancellable.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.inner.state.lock().unwrap().priority
    }

    /// Priority of the completion idle source and of the pool queue slot.
    pub fn set_priority(&self, priority: i32) {
        self.inner.state.lock().unwrap().priority = priority;
    }

    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().unwrap().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.state.lock().unwrap().name = Some(name.into());
    }

    /// True once the completion callback has returned (or, for the
    /// synchronous form, once the call has returned).
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn get_check_cancellable(&self) -> bool {
        self.inner.state.lock().unwrap().check_cancellable
    }

    /// Whether propagation reports `Cancelled` when the token was
    /// cancelled, regardless of any stored result. On by default.
    ///
    /// Panics when disabling it while return-on-cancel is set.
    pub fn set_check_cancellable(&self, check: bool) {
        let mut st = self.inner.state.lock().unwrap();
        assert!(
            check || !st.return_on_cancel,
            "cannot disable check_cancellable while return_on_cancel is set"
        );
        st.check_cancellable = check;
    }

    pub fn get_return_on_cancel(&self) -> bool {
        self.inner.state.lock().unwrap().return_on_cancel
    }

    /// Control whether a cancel completes the task immediately instead of
    /// waiting for the pool function to return.
    ///
    /// Returns false, changing nothing, once the function was cancelled
    /// or has already finished. Enabling it on a task whose function was
    /// cancelled mid-run completes the task right here (and still
    /// returns false).
    ///
    /// Panics when enabling it while check_cancellable is unset.
    pub fn set_return_on_cancel(&self, return_on_cancel: bool) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        assert!(
            st.check_cancellable || !return_on_cancel,
            "cannot set return_on_cancel while check_cancellable is unset"
        );
        match st.thread {
            ThreadState::NotStarted | ThreadState::Running => {
                st.return_on_cancel = return_on_cancel;
                true
            }
            ThreadState::Cancelled => {
                if return_on_cancel {
                    st.return_on_cancel = true;
                    st.thread = ThreadState::CancelledCompleted;
                    let synchronous = st.synchronous;
                    drop(st);
                    if synchronous {
                        self.inner.cond.notify_all();
                    } else {
                        self.complete();
                    }
                }
                false
            }
            ThreadState::CancelledCompleted | ThreadState::Finished => false,
        }
    }

    /// Store a success result. The result may be set exactly once;
    /// setting it again panics.
    pub fn return_value(&self, value: T) {
        self.task_return(Ok(value));
    }

    /// Store an error result.
    pub fn return_error(&self, error: Error) {
        self.task_return(Err(error));
    }

    /// When the token is cancelled, store `Cancelled` (unless a result
    /// was already stored) and report true.
    pub fn return_error_if_cancelled(&self) -> bool {
        let cancelled = self
            .inner
            .cancellable
            .as_ref()
            .map_or(false, |c| c.is_cancelled());
        if cancelled {
            let already_set = self.inner.state.lock().unwrap().result.is_some();
            if !already_set {
                self.task_return(Err(Error::Cancelled));
            }
        }
        cancelled
    }

    fn task_return(&self, result: Result<T, Error>) {
        let threaded = {
            let mut st = self.inner.state.lock().unwrap();
            assert!(st.result.is_none(), "task result set twice");
            st.result = Some(result);
            st.thread != ThreadState::NotStarted
        };
        // threaded tasks complete from the thread state machine when the
        // pool function returns (or earlier, on return-on-cancel)
        if !threaded {
            self.complete();
        }
    }

    /// Take the result. `Cancelled` wins over any stored result while
    /// check_cancellable is set.
    ///
    /// Panics when called twice, or before a result exists.
    pub fn propagate(&self) -> Result<T, Error> {
        let mut st = self.inner.state.lock().unwrap();
        assert!(!st.propagated, "task result propagated twice");
        st.propagated = true;
        if st.check_cancellable {
            if let Some(c) = &self.inner.cancellable {
                if c.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }
        }
        st.result
            .take()
            .expect("task result propagated before it was set")
    }

    /// Run `f` on the worker pool; the task completes in its context
    /// once `f` returns (or on cancel, with return-on-cancel).
    pub fn run_in_thread(&self, f: impl FnOnce(&Task<T>) + Send + 'static) {
        self.start_thread(Box::new(f), false);
    }

    /// Run `f` on the worker pool and block until the task completes.
    /// The completion callback is not used; callers propagate the result
    /// themselves when this returns.
    pub fn run_in_thread_sync(&self, f: impl FnOnce(&Task<T>) + Send + 'static) {
        self.start_thread(Box::new(f), true);

        let mut st = self.inner.state.lock().unwrap();
        while !matches!(
            st.thread,
            ThreadState::Finished | ThreadState::CancelledCompleted
        ) {
            st = self.inner.cond.wait(st).unwrap();
        }
        drop(st);

        self.cleanup_cancel_handler();
        self.inner.completed.store(true, Ordering::SeqCst);
    }

    fn start_thread(&self, f: TaskFn<T>, synchronous: bool) {
        let (completed_early, priority, cancelled_probe) = {
            let mut st = self.inner.state.lock().unwrap();
            assert!(
                st.thread == ThreadState::NotStarted,
                "task thread started twice"
            );
            st.synchronous = synchronous;
            st.thread = ThreadState::Running;

            let cancelled = self
                .inner
                .cancellable
                .as_ref()
                .map_or(false, |c| c.is_cancelled());
            let completed_early = cancelled && st.return_on_cancel;
            if completed_early {
                // completes right now; the function still runs for
                // side-effect consistency, its result is discarded
                st.thread = ThreadState::CancelledCompleted;
            }
            (
                completed_early,
                st.priority,
                cancelled && st.check_cancellable,
            )
        };

        // connect before queuing so a cancel can never slip between the
        // two; on an already-cancelled token this runs the listener here
        if !completed_early {
            if let Some(cancellable) = &self.inner.cancellable {
                let weak = Arc::downgrade(&self.inner);
                let handler = cancellable.connect(move || {
                    if let Some(inner) = weak.upgrade() {
                        Task { inner }.thread_cancelled();
                    }
                });
                self.inner.state.lock().unwrap().cancel_handler = Some(handler);
            }
        }

        let task = self.clone();
        let blocking = in_pool_worker();
        let serial = task_pool().push(
            priority,
            blocking,
            cancelled_probe,
            Box::new(move || {
                f(&task);
                task.thread_complete();
            }),
        );
        self.inner.state.lock().unwrap().pool_serial = Some(serial);

        if completed_early && !synchronous {
            self.complete();
        }
    }

    /// Cancel listener: jump the queue, then either complete early or
    /// leave completion to the function's return.
    fn thread_cancelled(&self) {
        let serial = self.inner.state.lock().unwrap().pool_serial;
        if let Some(serial) = serial {
            task_pool().move_to_front(serial);
        }

        let mut st = self.inner.state.lock().unwrap();
        if st.thread != ThreadState::Running {
            return;
        }
        if st.return_on_cancel {
            st.thread = ThreadState::CancelledCompleted;
            let synchronous = st.synchronous;
            drop(st);
            if synchronous {
                self.inner.cond.notify_all();
            } else {
                self.complete();
            }
        } else {
            st.thread = ThreadState::Cancelled;
        }
    }

    /// Pool function returned.
    fn thread_complete(&self) {
        let mut st = self.inner.state.lock().unwrap();
        match st.thread {
            ThreadState::Running | ThreadState::Cancelled => {
                st.thread = ThreadState::Finished;
                let synchronous = st.synchronous;
                drop(st);
                if synchronous {
                    self.inner.cond.notify_all();
                } else {
                    self.complete();
                }
            }
            ThreadState::CancelledCompleted => {
                // completion was already delivered when the cancel hit
                drop(st);
                self.cleanup_cancel_handler();
            }
            ThreadState::NotStarted | ThreadState::Finished => {
                unreachable!("pool function completed in state {:?}", st.thread)
            }
        }
    }

    /// Deliver the completion callback in the task's context.
    fn complete(&self) {
        if let Some(source) = main_current_source() {
            if let Some(ctx) = source.context() {
                if ctx == self.inner.context && source.time() > self.inner.creation_time {
                    // dispatching on the task's own context, at least one
                    // iteration after creation: the caller has returned,
                    // completing inline cannot re-enter it
                    self.invoke_callback();
                    return;
                }
            }
        }

        let source = idle_source_new();
        source.set_name("task-complete");
        source.set_priority(self.priority());
        let task = self.clone();
        source.set_callback(move || {
            task.invoke_callback();
            Dispatch::Remove
        });
        let _ = source.attach(&self.inner.context);
    }

    fn invoke_callback(&self) {
        let callback = self.inner.state.lock().unwrap().callback.take();
        if let Some(callback) = callback {
            callback(self);
        }
        // observable only after the callback has returned
        self.inner.completed.store(true, Ordering::SeqCst);
        self.cleanup_cancel_handler();
    }

    fn cleanup_cancel_handler(&self) {
        let handler = self.inner.state.lock().unwrap().cancel_handler.take();
        if let (Some(handler), Some(cancellable)) = (handler, &self.inner.cancellable) {
            cancellable.disconnect_unnotified(handler);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("Task")
            .field("name", &st.name)
            .field("thread", &st.thread)
            .field("completed", &self.is_completed())
            .finish()
    }
}
