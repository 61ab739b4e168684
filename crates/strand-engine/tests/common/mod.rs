//! Shared helpers for integration tests

#![allow(dead_code)]

use proptest::prelude::ProptestConfig;
use std::sync::Once;
use std::time::Duration;
use strand_engine::{Kernel, KernelConfig};

static INIT_LOGGING: Once = Once::new();

/// Idle cap used by kernels under test
pub const TEST_IDLE: Duration = Duration::from_millis(10);

/// Install a test-writer subscriber once per test binary
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Fresh kernel whose escapes halt instead of exiting
pub fn halting_kernel() -> Kernel {
    init_test_logging();
    Kernel::new(KernelConfig::halting())
}

/// Proptest configuration with a fixed case count
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}
