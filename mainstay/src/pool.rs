//! Auto-scaling worker pool backing threaded tasks.
//!
//! The pool runs up to its base size of workers freely. When every
//! worker is busy, a manager thread waits out a grace period before
//! allowing one extra thread; the grace period stretches while the pool
//! stays saturated, so bursts of short jobs share a few threads while
//! long-blocked jobs eventually each get their own.

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
#[cfg(feature = "tracing")]
use log::trace;
use mainstay_utils::abort_on_panic;
use once_cell::sync::Lazy;

/// Pool grows past this many workers only with the manager's consent.
const BASE_POOL_SIZE: usize = 10;

/// First grace period once the pool saturates.
const WAIT_BASE: Duration = Duration::from_millis(100);

/// Grace period growth per job started while saturated.
const WAIT_MULTIPLIER: f64 = 1.03;

/// Grace period cap.
const WAIT_MAX: Duration = Duration::from_secs(30 * 60);

/// Idle workers exit after this long without work.
const IDLE_THRESHOLD: Duration = Duration::from_secs(10);

thread_local! {
    static IN_POOL_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on a thread that is currently running a pool job.
pub(crate) fn in_pool_worker() -> bool {
    IN_POOL_WORKER.with(|flag| flag.get())
}

static POOL: Lazy<Pool> = Lazy::new(|| Pool::new(BASE_POOL_SIZE));

/// The process-wide task pool.
pub(crate) fn task_pool() -> &'static Pool {
    &POOL
}

struct Job {
    serial: u64,
    priority: i32,
    blocking_other_task: bool,
    cancelled: bool,
    run: Box<dyn FnOnce() + Send>,
}

impl Job {
    /// Queue order: jobs another task is blocked on first, cancelled
    /// jobs second (so return-on-cancel work drains fast), priority last.
    fn key(&self) -> (bool, bool, i32) {
        (!self.blocking_other_task, !self.cancelled, self.priority)
    }
}

struct PoolState {
    queue: Vec<Job>,
    base: usize,
    max_threads: usize,
    num_threads: usize,
    idle_threads: usize,
    executing: usize,
    wait_time: Duration,
    deadline: Option<Instant>,
    manager_started: bool,
    next_serial: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_cond: Condvar,
    // buffer size 1 so an arm is never missed while the manager is busy
    manager_tx: Sender<()>,
    manager_rx: Receiver<()>,
}

pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(base: usize) -> Pool {
        let (manager_tx, manager_rx) = bounded(1);
        Pool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: Vec::new(),
                    base,
                    max_threads: base,
                    num_threads: 0,
                    idle_threads: 0,
                    executing: 0,
                    wait_time: WAIT_BASE,
                    deadline: None,
                    manager_started: false,
                    next_serial: 1,
                }),
                work_cond: Condvar::new(),
                manager_tx,
                manager_rx,
            }),
        }
    }

    /// Queue a job. Returns its serial for [`move_to_front`].
    ///
    /// [`move_to_front`]: Pool::move_to_front
    pub fn push(
        &self,
        priority: i32,
        blocking_other_task: bool,
        cancelled: bool,
        run: Box<dyn FnOnce() + Send>,
    ) -> u64 {
        let (serial, spawn_worker, spawn_manager) = {
            let mut st = self.shared.state.lock().unwrap();
            let serial = st.next_serial;
            st.next_serial += 1;
            let job = Job {
                serial,
                priority,
                blocking_other_task,
                cancelled,
                run,
            };
            let at = st.queue.partition_point(|j| j.key() <= job.key());
            st.queue.insert(at, job);

            let spawn_manager = !st.manager_started;
            st.manager_started = true;

            let spawn_worker = st.idle_threads == 0 && st.num_threads < st.max_threads;
            if spawn_worker {
                st.num_threads += 1;
            }
            (serial, spawn_worker, spawn_manager)
        };

        self.shared.work_cond.notify_one();
        if spawn_manager {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("mainstay-pool-manager".into())
                .spawn(move || abort_on_panic(move || manager_main(shared)))
                .expect("failed to spawn pool manager");
        }
        if spawn_worker {
            start_worker(self.shared.clone());
        }
        serial
    }

    /// Mark a queued job cancelled and resort it toward the front of the
    /// queue. No-op when the job already started.
    pub fn move_to_front(&self, serial: u64) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(pos) = st.queue.iter().position(|j| j.serial == serial) {
            let mut job = st.queue.remove(pos);
            job.cancelled = true;
            let at = st.queue.partition_point(|j| j.key() <= job.key());
            st.queue.insert(at, job);
        }
    }
}

fn start_worker(shared: Arc<PoolShared>) {
    thread::Builder::new()
        .name("mainstay-pool-worker".into())
        .spawn(move || abort_on_panic(move || worker_main(shared)))
        .expect("failed to spawn pool worker");
}

fn worker_main(shared: Arc<PoolShared>) {
    #[cfg(feature = "tracing")]
    trace!("pool worker started");

    loop {
        let job = {
            let mut st = shared.state.lock().unwrap();
            loop {
                if st.num_threads > st.max_threads {
                    // the pool shrank underneath us
                    st.num_threads -= 1;
                    return;
                }
                if !st.queue.is_empty() {
                    break st.queue.remove(0);
                }
                st.idle_threads += 1;
                let (guard, timeout) = shared
                    .work_cond
                    .wait_timeout(st, IDLE_THRESHOLD)
                    .unwrap();
                st = guard;
                st.idle_threads -= 1;
                if timeout.timed_out() && st.queue.is_empty() {
                    st.num_threads -= 1;
                    #[cfg(feature = "tracing")]
                    trace!("pool worker exiting after idle threshold");
                    return;
                }
            }
        };

        run_job(&shared, job);
    }
}

fn run_job(shared: &Arc<PoolShared>, job: Job) {
    {
        let mut st = shared.state.lock().unwrap();
        st.executing += 1;
        if st.executing == st.base {
            st.wait_time = WAIT_BASE;
        } else if st.executing > st.base && st.wait_time < WAIT_MAX {
            let stretched = st.wait_time.as_secs_f64() * WAIT_MULTIPLIER;
            st.wait_time = Duration::from_secs_f64(stretched.min(WAIT_MAX.as_secs_f64()));
        }
        if st.executing >= st.base {
            st.deadline = Some(Instant::now() + st.wait_time);
            let _ = shared.manager_tx.try_send(());
        }
    }

    IN_POOL_WORKER.with(|flag| flag.set(true));
    (job.run)();
    IN_POOL_WORKER.with(|flag| flag.set(false));

    {
        let mut st = shared.state.lock().unwrap();
        if st.executing > st.base {
            // give back the extra thread the manager granted
            st.max_threads = st.executing - 1;
        } else if st.executing + st.queue.len() < st.base {
            st.deadline = None;
            let _ = shared.manager_tx.try_send(());
        }
        st.executing -= 1;
    }
}

fn manager_main(shared: Arc<PoolShared>) {
    loop {
        let deadline = shared.state.lock().unwrap().deadline;
        match deadline {
            None => {
                let _ = shared.manager_rx.recv();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let _ = shared.manager_rx.recv_timeout(deadline - now);
                    continue;
                }

                // saturated for a full grace period: allow one more thread
                let spawn = {
                    let mut st = shared.state.lock().unwrap();
                    match st.deadline {
                        Some(d) if Instant::now() >= d => {
                            st.max_threads = st.executing + 1;
                            st.deadline = None;
                            #[cfg(feature = "tracing")]
                            trace!("pool grown to {} threads", st.max_threads);
                            let spawn =
                                !st.queue.is_empty() && st.idle_threads == 0 && st.num_threads < st.max_threads;
                            if spawn {
                                st.num_threads += 1;
                            }
                            spawn
                        }
                        _ => false,
                    }
                };
                if spawn {
                    start_worker(shared.clone());
                }
            }
        }
    }
}
