//! An event loop core: prioritized event sources multiplexed over
//! `poll(2)`, per-thread main contexts, cancellation tokens, and
//! pool-backed asynchronous tasks.
//!
//! The model is phase-based. Each context iteration prepares every
//! attached [`Source`], polls the file descriptors they registered plus
//! an internal wakeup, checks which sources became ready, and dispatches
//! their callbacks in `(priority, attach order)` order. Sources are
//! cheap handles; custom ones implement [`SourceFuncs`].
//!
//! ```no_run
//! use mainstay::{idle_source_new, Dispatch, MainContext, MainLoop};
//!
//! let ctx = MainContext::new();
//! let main_loop = MainLoop::new(&ctx);
//!
//! let source = idle_source_new();
//! let stopper = main_loop.clone();
//! source.set_callback(move || {
//!     println!("dispatched once, then quit");
//!     stopper.quit();
//!     Dispatch::Remove
//! });
//! source.attach(&ctx).unwrap();
//!
//! main_loop.run();
//! ```

mod cancellable;
mod context;
mod error;
mod main_loop;
mod poll;
mod pool;
mod source;
mod task;

pub use cancellable::{Cancellable, HandlerId};
pub use context::{main_current_source, MainContext};
pub use error::{Error, Result};
pub use main_loop::MainLoop;
pub use source::{
    idle_source_new, timeout_source_new, unix_fd_source_new, Callback, Dispatch, FdWatchId,
    Source, SourceFuncs, SourceId, PRIORITY_DEFAULT, PRIORITY_DEFAULT_IDLE, PRIORITY_HIGH,
    PRIORITY_HIGH_IDLE, PRIORITY_LOW,
};
pub use task::Task;

// fd watch event masks use the poll(2) flag type directly
pub use nix::poll::PollFlags;
