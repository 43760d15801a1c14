//! Shared fixtures for engine integration tests.

mod engine;

pub use engine::{EngineHarness, environment, test_config};
