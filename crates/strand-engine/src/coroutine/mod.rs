//! Managed coroutines
//!
//! - [`Registry`]: records of coroutines whose own future is still unsettled
//! - [`Bridge`]: spawn, await, sleep and escape dispatch

mod bridge;
mod registry;

pub use bridge::Bridge;
pub use registry::{Record, Registry, ResolveFn};
