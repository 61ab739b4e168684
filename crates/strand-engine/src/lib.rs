//! Strand coroutine kernel
//!
//! This crate lets sequential code suspend at an asynchronous result and
//! resume later without blocking the single logical thread of control:
//! - **Futures**: one-shot settlement cells with continuation handlers (`future` module)
//! - **Fibers**: stackful coroutines with synchronous control transfer (`fiber` module)
//! - **Reactor**: event loop with deferred, timed, recurring and signal callbacks (`reactor` module)
//! - **Coroutines**: the registry and the coroutine/future bridge (`coroutine` module)
//! - **Kernel**: the entry point that drives the loop and survives a fork (`kernel` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_engine::{Kernel, KernelConfig};
//! use std::time::Duration;
//!
//! let kernel = Kernel::new(KernelConfig::default());
//! let k = kernel.clone();
//! let answer = kernel.spawn(move |_, _| {
//!     k.sleep(Duration::from_millis(50))?;
//!     Ok(42)
//! })?;
//!
//! kernel.run_default()?;
//! assert_eq!(kernel.await_future(&answer)?, 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Kernel configuration and escape policy
pub mod config;

/// Coroutine registry and the coroutine/future bridge
pub mod coroutine;

/// Default configuration constants
pub mod defaults;

/// Error taxonomy and the diagnostics sink
pub mod error;

/// Stackful coroutine primitive
pub mod fiber;

/// One-shot futures
pub mod future;

/// Kernel entry point
pub mod kernel;

/// Signal and fork bookkeeping
pub mod process;

/// Event loop, drivers and suspension handles
pub mod reactor;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{EscapePolicy, KernelConfig};
pub use coroutine::{Bridge, Registry};
pub use error::{report_failure, Error, Result};
pub use fiber::{Fiber, FiberId, FiberState, Payload, Resume};
pub use future::{Future, Rejecter, Resolution, Resolver, Settled, Status};
pub use kernel::{Canceller, Kernel, RootAction};
pub use process::Process;
pub use reactor::{CallbackId, CallbackType, Driver, DriverFactory, EventLoop, Suspension, TimerDriver};
