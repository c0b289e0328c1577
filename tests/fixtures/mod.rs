//! Reusable multi-stack test setups

mod two_stack;

pub use two_stack::{TwoStackFixture, wait_for};
