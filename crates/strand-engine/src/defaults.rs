//! Default constants for kernel configuration.

use std::time::Duration;

/// Default coroutine stack size in bytes (256 KiB).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack the kernel will hand to a coroutine (32 KiB).
pub const MIN_STACK_SIZE: usize = 32 * 1024;

/// Default cap on a single blocking wait of the event loop.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_micros(100_000);

/// Thread name prefix for coroutine stacks.
pub const DEFAULT_THREAD_NAME: &str = "strand-fiber";

/// Environment variable overriding the coroutine stack size (bytes).
pub const ENV_STACK_SIZE: &str = "STRAND_STACK_SIZE";

/// Environment variable overriding the idle cap (microseconds).
pub const ENV_MAX_IDLE_US: &str = "STRAND_MAX_IDLE_US";

/// Environment variable selecting the escape policy (`exit` or `halt`).
pub const ENV_ESCAPE: &str = "STRAND_ESCAPE";
