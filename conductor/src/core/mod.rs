//! Deterministic, pure logic shared by the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod availability;
pub mod events;
pub mod graph;
pub mod invariants;
pub mod session;
pub mod status;
pub mod steps;
pub mod types;
