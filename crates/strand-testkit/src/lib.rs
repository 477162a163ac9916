// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Strand crates.
//!
//! Reduces duplication across the test suites: change-blob builders that
//! speak the codec's encoding without each test hand-rolling parents and
//! sequence numbers, and an engine harness that commits values through a
//! real space writer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod changes;
pub mod harness;

pub use changes::ChangeBuilder;
pub use harness::{commit_value, engine_router, latest_heads, write_tx};
