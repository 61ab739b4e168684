//! Kernel configuration

use crate::defaults::{
    DEFAULT_MAX_IDLE, DEFAULT_STACK_SIZE, DEFAULT_THREAD_NAME, ENV_ESCAPE, ENV_MAX_IDLE_US,
    ENV_STACK_SIZE, MIN_STACK_SIZE,
};
use std::time::Duration;

/// What happens when an escape signal reaches a boundary
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum EscapePolicy {
    /// Terminate the process with exit status 0
    #[default]
    Exit,
    /// Mark the kernel halted and hand `Error::Escape` back to the root caller
    Halt,
}

impl EscapePolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exit" => Some(EscapePolicy::Exit),
            "halt" => Some(EscapePolicy::Halt),
            _ => None,
        }
    }
}

/// Options for building a [`Kernel`](crate::Kernel)
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Escape handling at a boundary
    pub escape_policy: EscapePolicy,

    /// Stack size in bytes for each coroutine
    pub stack_size: usize,

    /// Thread name prefix for coroutine stacks
    pub thread_name: String,

    /// Idle cap used by `Kernel::run_default`
    pub max_idle: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            escape_policy: EscapePolicy::default(),
            stack_size: DEFAULT_STACK_SIZE,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

impl KernelConfig {
    /// Configuration for tests: escapes halt instead of exiting
    pub fn halting() -> Self {
        Self {
            escape_policy: EscapePolicy::Halt,
            ..Self::default()
        }
    }

    /// Defaults overridden by `STRAND_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `STRAND_*` keys.
    /// Unparsable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_STACK_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) => config.stack_size = bytes,
                Err(_) => tracing::warn!(key = ENV_STACK_SIZE, value = %raw, "ignoring invalid value"),
            }
        }

        if let Some(raw) = lookup(ENV_MAX_IDLE_US) {
            match raw.trim().parse::<u64>() {
                Ok(us) => config.max_idle = Duration::from_micros(us),
                Err(_) => tracing::warn!(key = ENV_MAX_IDLE_US, value = %raw, "ignoring invalid value"),
            }
        }

        if let Some(raw) = lookup(ENV_ESCAPE) {
            match EscapePolicy::parse(&raw) {
                Some(policy) => config.escape_policy = policy,
                None => tracing::warn!(key = ENV_ESCAPE, value = %raw, "ignoring invalid value"),
            }
        }

        config
    }

    /// Stack size actually requested from the OS
    pub fn effective_stack_size(&self) -> usize {
        self.stack_size.max(MIN_STACK_SIZE)
    }
}
