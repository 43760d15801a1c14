//! Process-global tracing setup for conveyor binaries.

mod common;

pub use self::common::ObservabilityOptions;

#[cfg_attr(feature = "trace", path = "impl.rs")]
#[cfg_attr(not(feature = "trace"), path = "mock.rs")]
mod r#impl;

pub use self::r#impl::*;
